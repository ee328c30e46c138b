//! Heap statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters describing heap activity.
#[derive(Debug, Default)]
pub struct GcStats {
    // =========================================================================
    // Allocation
    // =========================================================================
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,

    // =========================================================================
    // Collection
    // =========================================================================
    /// Number of completed collections.
    pub collections: AtomicU64,
    /// Objects reclaimed across all collections.
    pub objects_freed: AtomicU64,
    /// Free notifications delivered.
    pub free_events: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub gc_time_ns: AtomicU64,
    /// Live objects after the last collection.
    pub live_objects: AtomicU64,
    /// Live bytes after the last collection.
    pub live_bytes: AtomicU64,
}

impl GcStats {
    /// Create zeroed statistics.
    pub const fn new() -> Self {
        Self {
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            objects_freed: AtomicU64::new(0),
            free_events: AtomicU64::new(0),
            gc_time_ns: AtomicU64::new(0),
            live_objects: AtomicU64::new(0),
            live_bytes: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a completed collection.
    pub fn record_collection(&self, duration: Duration, freed: u64, live: u64, live_bytes: u64) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.objects_freed.fetch_add(freed, Ordering::Relaxed);
        self.gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.live_objects.store(live, Ordering::Relaxed);
        self.live_bytes.store(live_bytes, Ordering::Relaxed);
    }

    /// Record delivered free notifications.
    #[inline]
    pub fn record_free_events(&self, count: u64) {
        self.free_events.fetch_add(count, Ordering::Relaxed);
    }

    /// Average pause per collection.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed) / count)
    }

    /// Copy the counters into a plain struct.
    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            collections: self.collections.load(Ordering::Relaxed),
            objects_freed: self.objects_freed.load(Ordering::Relaxed),
            free_events: self.free_events.load(Ordering::Relaxed),
            live_objects: self.live_objects.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStatsSnapshot {
    /// Total objects allocated.
    pub objects_allocated: u64,
    /// Total bytes allocated.
    pub bytes_allocated: u64,
    /// Completed collections.
    pub collections: u64,
    /// Objects reclaimed.
    pub objects_freed: u64,
    /// Free notifications delivered.
    pub free_events: u64,
    /// Live objects after the last collection.
    pub live_objects: u64,
    /// Live bytes after the last collection.
    pub live_bytes: u64,
}
