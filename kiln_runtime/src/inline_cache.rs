//! Receiver-type profiles for virtual call sites.
//!
//! The interpreter records the class of every receiver it dispatches on,
//! per call site (bytecode offset). The compiler reads these entries to
//! decide between a guarded direct call, a bounded polymorphic cache and
//! generic dispatch.

use kiln_core::TypeId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Maximum receiver types tracked per site before it goes megamorphic.
pub const MAX_RECORDED_RECEIVERS: usize = 4;

/// Observed receivers at one call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineCacheEntry {
    /// Bytecode offset of the call.
    pub pc: u32,
    /// Distinct receiver types in first-seen order.
    pub receivers: SmallVec<[TypeId; MAX_RECORDED_RECEIVERS]>,
    /// More distinct receivers were seen than could be recorded.
    pub megamorphic: bool,
}

impl InlineCacheEntry {
    /// Whether exactly one receiver type was seen.
    #[inline]
    pub fn is_monomorphic(&self) -> bool {
        !self.megamorphic && self.receivers.len() == 1
    }

    /// Whether `ty` was seen here.
    #[inline]
    pub fn involves(&self, ty: TypeId) -> bool {
        self.receivers.contains(&ty)
    }

    fn record(&mut self, ty: TypeId) {
        if self.megamorphic || self.receivers.contains(&ty) {
            return;
        }
        if self.receivers.len() == MAX_RECORDED_RECEIVERS {
            self.megamorphic = true;
        } else {
            self.receivers.push(ty);
        }
    }
}

/// All call-site profiles of one method version.
#[derive(Debug, Default)]
pub struct InlineCache {
    sites: Mutex<FxHashMap<u32, InlineCacheEntry>>,
}

impl InlineCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a receiver of class `ty` at `pc`.
    pub fn record(&self, pc: u32, ty: TypeId) {
        self.sites
            .lock()
            .entry(pc)
            .or_insert_with(|| InlineCacheEntry {
                pc,
                ..Default::default()
            })
            .record(ty);
    }

    /// Profile of the site at `pc`.
    pub fn entry(&self, pc: u32) -> Option<InlineCacheEntry> {
        self.sites.lock().get(&pc).cloned()
    }

    /// Drop every site that observed `ty`. Returns how many were dropped.
    pub fn clear_involving(&self, ty: TypeId) -> usize {
        let mut sites = self.sites.lock();
        let before = sites.len();
        sites.retain(|_, entry| !entry.involves(ty));
        before - sites.len()
    }

    /// Drop every site.
    pub fn clear(&self) {
        self.sites.lock().clear();
    }

    /// Number of profiled sites.
    pub fn len(&self) -> usize {
        self.sites.lock().len()
    }

    /// Whether no site is profiled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
