//! Root tracking.
//!
//! GC roots are the starting points for marking:
//! - Static fields of loaded types
//! - Registers of every frame of every attached context
//! - Class mirrors
//! - Pinned handles held by host code

use kiln_core::{ObjectId, Value};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Where a root reference is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// A static field of a loaded type.
    StaticField,
    /// A register of a managed frame.
    Frame,
    /// A handle pinned by host code.
    Pinned,
    /// The class mirror of a loaded type.
    SystemClass,
    /// Any other root.
    Other,
}

/// Receives roots during marking.
pub trait Tracer {
    /// Trace a value that may hold an object reference.
    fn trace_value(&mut self, value: Value);

    /// Trace an object id.
    fn trace_object(&mut self, id: ObjectId);

    /// Trace a root held in `kind`. Marking treats every kind alike.
    #[inline]
    fn trace_root(&mut self, _kind: RootKind, value: Value) {
        self.trace_value(value);
    }
}

/// Something that can report roots to the collector.
pub trait RootProvider {
    /// Trace every root held by this provider.
    fn trace_roots(&self, tracer: &mut dyn Tracer);
}

/// A provider with no roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    #[inline]
    fn trace_roots(&self, _tracer: &mut dyn Tracer) {}
}

impl RootProvider for [Value] {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for value in self {
            tracer.trace_value(*value);
        }
    }
}

impl RootProvider for Vec<Value> {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        self.as_slice().trace_roots(tracer);
    }
}

/// Pinned objects, counted so nested pins compose.
#[derive(Debug, Default)]
pub struct RootSet {
    pinned: Mutex<FxHashMap<ObjectId, usize>>,
}

impl RootSet {
    /// Create an empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `id`.
    pub fn pin(&self, id: ObjectId) {
        *self.pinned.lock().entry(id).or_insert(0) += 1;
    }

    /// Drop one pin of `id`. Returns whether the object is still pinned.
    pub fn unpin(&self, id: ObjectId) -> bool {
        let mut pinned = self.pinned.lock();
        match pinned.get_mut(&id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                pinned.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Whether `id` is pinned.
    pub fn is_pinned(&self, id: ObjectId) -> bool {
        self.pinned.lock().contains_key(&id)
    }

    /// Number of distinct pinned objects.
    pub fn len(&self) -> usize {
        self.pinned.lock().len()
    }

    /// Whether nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every pin.
    pub fn clear(&self) {
        self.pinned.lock().clear();
    }
}

impl RootProvider for RootSet {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for id in self.pinned.lock().keys() {
            tracer.trace_root(RootKind::Pinned, Value::Ref(*id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingTracer {
        values: usize,
        pinned: usize,
    }

    impl Tracer for CountingTracer {
        fn trace_value(&mut self, _value: Value) {
            self.values += 1;
        }

        fn trace_object(&mut self, _id: ObjectId) {
            unreachable!("roots are traced as values");
        }

        fn trace_root(&mut self, kind: RootKind, value: Value) {
            match kind {
                RootKind::Pinned => self.pinned += 1,
                _ => self.trace_value(value),
            }
        }
    }

    #[test]
    fn test_nested_pins() {
        let roots = RootSet::new();
        let id = ObjectId(4);
        roots.pin(id);
        roots.pin(id);
        assert!(roots.unpin(id));
        assert!(roots.is_pinned(id));
        assert!(!roots.unpin(id));
        assert!(roots.is_empty());
    }

    #[test]
    fn test_traces_pins_and_values() {
        let roots = RootSet::new();
        roots.pin(ObjectId(1));
        roots.pin(ObjectId(2));

        let mut tracer = CountingTracer::default();
        roots.trace_roots(&mut tracer);
        vec![Value::Null, Value::int(3)].trace_roots(&mut tracer);
        NoRoots.trace_roots(&mut tracer);

        assert_eq!(tracer.pinned, 2);
        assert_eq!(tracer.values, 2);
    }
}
