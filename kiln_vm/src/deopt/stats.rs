//! Deoptimization statistics.
//!
//! Counts deoptimizations globally, per reason, per method version and per
//! site. The global count is what `number_of_deoptimizations` reports.

use super::state::{DeoptReason, REASON_COUNT};
use kiln_core::CodeId;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// =============================================================================
// Deopt Site
// =============================================================================

/// Key identifying a deoptimization site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeoptSiteKey {
    /// Method version.
    pub code_id: CodeId,
    /// Bytecode pc of the deopt point.
    pub pc: u32,
}

impl DeoptSiteKey {
    /// Create a new site key.
    #[inline]
    pub const fn new(code_id: CodeId, pc: u32) -> Self {
        Self { code_id, pc }
    }
}

/// Counters of one site.
#[derive(Debug, Default)]
pub struct DeoptSite {
    count: AtomicU32,
    by_reason: [AtomicU32; REASON_COUNT],
}

impl DeoptSite {
    #[inline]
    fn record(&self, reason: DeoptReason) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Total deopts here.
    #[inline]
    pub fn total_count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// The most frequent reason here.
    pub fn dominant_reason(&self) -> Option<DeoptReason> {
        let mut best = None;
        let mut best_count = 0;
        for (index, counter) in self.by_reason.iter().enumerate() {
            let count = counter.load(Ordering::Relaxed);
            if count > best_count {
                best_count = count;
                best = DeoptReason::from_u8(index as u8);
            }
        }
        best
    }
}

/// Copy of one site's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteSnapshot {
    /// Total deopts here.
    pub total_count: u32,
    /// The most frequent reason.
    pub dominant_reason: Option<DeoptReason>,
}

// =============================================================================
// Deopt Stats
// =============================================================================

/// Global deoptimization statistics.
#[derive(Debug, Default)]
pub struct DeoptStats {
    sites: RwLock<FxHashMap<DeoptSiteKey, DeoptSite>>,
    total: AtomicU64,
    by_reason: [AtomicU64; REASON_COUNT],
}

impl DeoptStats {
    /// Empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deoptimization of `code_id` at `pc`.
    pub fn record(&self, code_id: CodeId, pc: u32, reason: DeoptReason) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);

        let key = DeoptSiteKey::new(code_id, pc);
        if let Some(site) = self.sites.read().get(&key) {
            site.record(reason);
            return;
        }
        self.sites.write().entry(key).or_default().record(reason);
    }

    /// Deoptimizations so far.
    #[inline]
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Deoptimizations for `reason`.
    #[inline]
    pub fn count_for_reason(&self, reason: DeoptReason) -> u64 {
        self.by_reason[reason as usize].load(Ordering::Relaxed)
    }

    /// Deoptimizations of method version `code_id`, all sites.
    pub fn count_for_method(&self, code_id: CodeId) -> u64 {
        self.sites
            .read()
            .iter()
            .filter(|(key, _)| key.code_id == code_id)
            .map(|(_, site)| u64::from(site.total_count()))
            .sum()
    }

    /// Counters of one site.
    pub fn site(&self, code_id: CodeId, pc: u32) -> Option<SiteSnapshot> {
        self.sites
            .read()
            .get(&DeoptSiteKey::new(code_id, pc))
            .map(|site| SiteSnapshot {
                total_count: site.total_count(),
                dominant_reason: site.dominant_reason(),
            })
    }

    /// Number of distinct sites.
    pub fn site_count(&self) -> usize {
        self.sites.read().len()
    }

    /// Forget everything.
    pub fn reset(&self) {
        self.sites.write().clear();
        self.total.store(0, Ordering::Relaxed);
        for counter in &self.by_reason {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODE: CodeId = CodeId(7);

    #[test]
    fn test_record() {
        let stats = DeoptStats::new();
        stats.record(CODE, 10, DeoptReason::InlineCacheMiss);
        stats.record(CODE, 10, DeoptReason::InlineCacheMiss);
        stats.record(CODE, 3, DeoptReason::HoistedCheck);
        stats.record(CodeId(8), 0, DeoptReason::Invalidated);

        assert_eq!(stats.total_count(), 4);
        assert_eq!(stats.site_count(), 3);
        assert_eq!(stats.count_for_reason(DeoptReason::InlineCacheMiss), 2);
        assert_eq!(stats.count_for_method(CODE), 3);
    }

    #[test]
    fn test_site_snapshot() {
        let stats = DeoptStats::new();
        stats.record(CODE, 10, DeoptReason::Explicit);
        stats.record(CODE, 10, DeoptReason::InlineCacheMiss);
        stats.record(CODE, 10, DeoptReason::InlineCacheMiss);

        let site = stats.site(CODE, 10).unwrap();
        assert_eq!(site.total_count, 3);
        assert_eq!(site.dominant_reason, Some(DeoptReason::InlineCacheMiss));
        assert!(stats.site(CODE, 11).is_none());
    }

    #[test]
    fn test_reset() {
        let stats = DeoptStats::new();
        stats.record(CODE, 1, DeoptReason::Explicit);
        stats.reset();
        assert_eq!(stats.total_count(), 0);
        assert_eq!(stats.site_count(), 0);
    }
}
