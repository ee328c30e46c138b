//! Per-method hotness counters.
//!
//! The interpreter bumps a method's counter on entry and on every backward
//! branch. Compiled code never touches it. A frozen counter reads zero and
//! ignores increments; methods that can never be compiled are frozen.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Invocation and loop heat of one method version.
#[derive(Debug, Default)]
pub struct HotnessCounter {
    count: AtomicU32,
    frozen: AtomicBool,
}

impl HotnessCounter {
    /// A zeroed counter.
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Current value.
    #[inline]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Add one and return the new value. Saturates; no-op when frozen.
    #[inline]
    pub fn increment(&self) -> u32 {
        if self.frozen.load(Ordering::Relaxed) {
            return self.value();
        }
        let previous = self
            .count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1))
            .unwrap_or(u32::MAX);
        previous.saturating_add(1)
    }

    /// Back to zero, for re-warming after a deoptimization.
    #[inline]
    pub fn reset(&self) {
        if !self.frozen.load(Ordering::Relaxed) {
            self.count.store(0, Ordering::Relaxed);
        }
    }

    /// Zero the counter and keep it there.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }

    /// Whether the counter is frozen.
    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Relaxed)
    }
}
