//! Heap configuration.

/// Configuration for the object heap.
///
/// # Example
///
/// ```
/// use kiln_gc::HeapConfig;
///
/// let config = HeapConfig {
///     collect_every_allocations: 10_000,
///     ..Default::default()
/// };
/// assert!(config.collect_every_allocations > 0);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// Request a collection after this many allocations.
    ///
    /// The request is honoured at the next safe point of an executing
    /// context. Set to 0 to collect only when asked explicitly.
    ///
    /// Default: 0
    pub collect_every_allocations: u64,

    /// Check after each collection that no survivor references a
    /// reclaimed object.
    ///
    /// Default: true in debug builds
    pub verify_after_collection: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            collect_every_allocations: 0,
            verify_after_collection: cfg!(debug_assertions),
        }
    }
}

impl HeapConfig {
    /// Configuration that collects frequently and verifies every pass.
    pub fn stress() -> Self {
        Self {
            collect_every_allocations: 64,
            verify_after_collection: true,
        }
    }
}
