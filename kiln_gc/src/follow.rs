//! Reference-following heap walk.
//!
//! Where [`Heap::iterate`] visits objects in id order, this walk starts at
//! the roots (or one chosen object) and reports every reference it crosses.
//!
//! ```text
//!   roots ──Root(Frame)──► a ──Field(0)──► b ──Field(1)──► c
//!                          │                               ▲
//!                          └──Class──► mirror              │
//!   pins  ──Root(Pinned)──► array ──ArrayElement(2)────────┘
//! ```
//!
//! Each edge out of a reached object is reported once, and each root slot
//! once. The filter is applied to the referee: edges it rejects are not
//! reported but are still followed. The visitor decides per reported edge
//! whether the walk descends into the referee.
//!
//! Like [`Heap::iterate`], the walk holds the heap's write lock for its
//! whole pass and the visitor must not call back into the heap.

use crate::filter::HeapFilter;
use crate::heap::{Heap, HeapInner};
use crate::object::ObjectKind;
use crate::roots::{RootKind, RootProvider, Tracer};
use kiln_core::{KilnResult, ObjectId, TypeId, Value};
use rustc_hash::FxHashSet;

/// What kind of reference an edge is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// A root held outside the heap.
    Root(RootKind),
    /// From an object to the mirror of its class.
    Class,
    /// Instance field slot.
    Field(usize),
    /// Array element index.
    ArrayElement(usize),
}

/// One reported edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceInfo {
    /// Edge kind.
    pub kind: ReferenceKind,
    /// The referring object; `None` for roots.
    pub referrer: Option<ObjectId>,
    /// Tag of the referrer, 0 for roots and untagged referrers.
    pub referrer_tag: u64,
    /// The referenced object.
    pub referee: ObjectId,
    /// Class of the referee.
    pub referee_class: TypeId,
    /// Tag of the referee's class mirror (0 if none).
    pub referee_class_tag: u64,
    /// Tag of the referee at the time of the report.
    pub referee_tag: u64,
    /// Size of the referee in bytes.
    pub size: usize,
}

/// What the walk does after a reported edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowControl {
    /// Descend into the referee's references.
    Follow,
    /// Do not descend through this edge.
    Prune,
    /// Stop the walk.
    Abort,
}

impl Heap {
    /// Walk the object graph from `roots`, pinned handles and class
    /// mirrors, or from `initial` alone when given, reporting every edge
    /// whose referee `filter` admits.
    ///
    /// The visitor receives the edge and the referee's tag, which it may
    /// overwrite. Returns the number of reported edges.
    pub fn follow_references<F>(
        &self,
        roots: &dyn RootProvider,
        initial: Option<ObjectId>,
        filter: HeapFilter,
        mut visitor: F,
    ) -> KilnResult<usize>
    where
        F: FnMut(&ReferenceInfo, &mut u64) -> FollowControl,
    {
        let inner = self.inner().write();
        let mut walk = ReferenceWalk {
            inner: &inner,
            filter,
            visitor: &mut visitor,
            reached: FxHashSet::default(),
            worklist: Vec::new(),
            reported: 0,
        };

        match initial {
            Some(id) => {
                inner.record(id)?;
                walk.reached.insert(id);
                walk.worklist.push(id);
            }
            None => {
                let mut collected = RootCollector::default();
                roots.trace_roots(&mut collected);
                self.roots().trace_roots(&mut collected);
                for mirror in inner.mirrors.values() {
                    collected.trace_root(RootKind::SystemClass, Value::Ref(*mirror));
                }
                for (kind, id) in collected.roots {
                    if !walk.edge(ReferenceKind::Root(kind), None, 0, id) {
                        return Ok(walk.reported);
                    }
                }
            }
        }
        walk.drain();
        Ok(walk.reported)
    }
}

#[derive(Default)]
struct RootCollector {
    roots: Vec<(RootKind, ObjectId)>,
}

impl Tracer for RootCollector {
    #[inline]
    fn trace_value(&mut self, value: Value) {
        self.trace_root(RootKind::Other, value);
    }

    #[inline]
    fn trace_object(&mut self, id: ObjectId) {
        self.roots.push((RootKind::Other, id));
    }

    #[inline]
    fn trace_root(&mut self, kind: RootKind, value: Value) {
        if let Value::Ref(id) = value {
            self.roots.push((kind, id));
        }
    }
}

struct ReferenceWalk<'a, F> {
    inner: &'a HeapInner,
    filter: HeapFilter,
    visitor: &'a mut F,
    reached: FxHashSet<ObjectId>,
    worklist: Vec<ObjectId>,
    reported: usize,
}

impl<F> ReferenceWalk<'_, F>
where
    F: FnMut(&ReferenceInfo, &mut u64) -> FollowControl,
{
    /// Report one edge and queue its referee. False once aborted.
    fn edge(
        &mut self,
        kind: ReferenceKind,
        referrer: Option<ObjectId>,
        referrer_tag: u64,
        referee: ObjectId,
    ) -> bool {
        let inner = self.inner;
        let Some(record) = inner.objects.get(&referee) else {
            return true;
        };
        let class = record.class();
        let tag = record.tag();
        let class_tag = inner.class_tag(class);

        let follow = if self.filter.admits(tag, class_tag) {
            let info = ReferenceInfo {
                kind,
                referrer,
                referrer_tag,
                referee,
                referee_class: class,
                referee_class_tag: class_tag,
                referee_tag: tag,
                size: record.size(),
            };
            let mut new_tag = tag;
            let control = (self.visitor)(&info, &mut new_tag);
            if new_tag != tag {
                record.set_tag(new_tag);
            }
            self.reported += 1;
            match control {
                FollowControl::Follow => true,
                FollowControl::Prune => false,
                FollowControl::Abort => return false,
            }
        } else {
            true
        };

        if follow && self.reached.insert(referee) {
            self.worklist.push(referee);
        }
        true
    }

    fn drain(&mut self) {
        let inner = self.inner;
        while let Some(id) = self.worklist.pop() {
            let Some(record) = inner.objects.get(&id) else {
                continue;
            };
            let tag = record.tag();
            if let Some(mirror) = inner.mirrors.get(&record.class()) {
                if !self.edge(ReferenceKind::Class, Some(id), tag, *mirror) {
                    return;
                }
            }
            let array = record.kind() == ObjectKind::Array;
            for (index, value) in record.snapshot().into_iter().enumerate() {
                let Value::Ref(child) = value else {
                    continue;
                };
                let kind = if array {
                    ReferenceKind::ArrayElement(index)
                } else {
                    ReferenceKind::Field(index)
                };
                if !self.edge(kind, Some(id), tag, child) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::roots::NoRoots;

    fn heap() -> Heap {
        Heap::new(HeapConfig {
            collect_every_allocations: 0,
            verify_after_collection: false,
        })
    }

    /// `a(1) -> b(2) -> c(3)` through fields, and a pinned `array(4)`
    /// holding `c` at index 2.
    fn graph(heap: &Heap) -> (ObjectId, ObjectId, ObjectId, ObjectId) {
        let a = heap.allocate_instance(TypeId(20), 1);
        let b = heap.allocate_instance(TypeId(21), 2);
        let c = heap.allocate_instance(TypeId(22), 0);
        let array = heap.allocate_array(3).unwrap();
        heap.set_slot(a, 0, Value::Ref(b)).unwrap();
        heap.set_slot(b, 1, Value::Ref(c)).unwrap();
        heap.set_slot(array, 2, Value::Ref(c)).unwrap();
        for (id, tag) in [(a, 1), (b, 2), (c, 3), (array, 4)] {
            heap.set_tag(id, tag).unwrap();
        }
        heap.pin(array).unwrap();
        (a, b, c, array)
    }

    fn edges(
        heap: &Heap,
        roots: &dyn RootProvider,
        initial: Option<ObjectId>,
        filter: HeapFilter,
        mut control: impl FnMut(&ReferenceInfo) -> FollowControl,
    ) -> Vec<(ReferenceKind, u64, u64)> {
        let mut out = Vec::new();
        heap.follow_references(roots, initial, filter, |info, _| {
            out.push((info.kind, info.referrer_tag, info.referee_tag));
            control(info)
        })
        .unwrap();
        out.sort_by_key(|(_, from, to)| (*from, *to));
        out
    }

    #[test]
    fn test_reports_every_edge_with_tags() {
        let heap = heap();
        let (a, ..) = graph(&heap);
        heap.allocate_instance(TypeId(23), 0);

        let found = edges(&heap, &vec![Value::Ref(a)], None, HeapFilter::empty(), |_| {
            FollowControl::Follow
        });
        assert_eq!(
            found,
            vec![
                (ReferenceKind::Root(RootKind::Other), 0, 1),
                (ReferenceKind::Root(RootKind::Pinned), 0, 4),
                (ReferenceKind::Field(0), 1, 2),
                (ReferenceKind::Field(1), 2, 3),
                (ReferenceKind::ArrayElement(2), 4, 3),
            ]
        );
    }

    #[test]
    fn test_filtered_edges_are_still_followed() {
        let heap = heap();
        let (a, b, ..) = graph(&heap);
        heap.set_tag(b, 0).unwrap();

        let found = edges(&heap, &vec![Value::Ref(a)], None, HeapFilter::INCLUDE_TAGGED, |_| {
            FollowControl::Follow
        });
        // a -> b is hidden, b -> c is reported with an untagged referrer.
        assert!(found.contains(&(ReferenceKind::Field(1), 0, 3)));
        assert!(!found.iter().any(|(_, _, to)| *to == 0));
    }

    #[test]
    fn test_prune_and_abort() {
        let heap = heap();
        let (a, ..) = graph(&heap);
        let roots = vec![Value::Ref(a)];

        let pruned = edges(&heap, &roots, None, HeapFilter::empty(), |info| {
            if info.referee_tag == 2 {
                FollowControl::Prune
            } else {
                FollowControl::Follow
            }
        });
        assert!(!pruned.iter().any(|(_, from, _)| *from == 2));
        // c is still reached through the array.
        assert!(pruned.contains(&(ReferenceKind::ArrayElement(2), 4, 3)));

        let reported = heap
            .follow_references(&roots, None, HeapFilter::empty(), |_, _| FollowControl::Abort)
            .unwrap();
        assert_eq!(reported, 1);
    }

    #[test]
    fn test_initial_object_and_retag() {
        let heap = heap();
        let (_, b, c, _) = graph(&heap);
        let reported = heap
            .follow_references(&NoRoots, Some(b), HeapFilter::empty(), |info, tag| {
                assert_eq!(info.referrer, Some(b));
                *tag = 30;
                FollowControl::Follow
            })
            .unwrap();
        assert_eq!(reported, 1);
        assert_eq!(heap.get_tag(c).unwrap(), 30);
        assert!(heap.follow_references(&NoRoots, Some(ObjectId(9_999)), HeapFilter::empty(), |_, _| {
            FollowControl::Follow
        })
        .is_err());
    }

    #[test]
    fn test_class_edges_reach_mirrors() {
        let heap = heap();
        let obj = heap.allocate_instance(TypeId(24), 0);
        let mirror = heap.mirror(TypeId(24));
        heap.set_tag(mirror, 7).unwrap();
        heap.set_tag(obj, 8).unwrap();

        let found = edges(&heap, &NoRoots, Some(obj), HeapFilter::empty(), |_| {
            FollowControl::Follow
        });
        assert_eq!(found, vec![(ReferenceKind::Class, 8, 7)]);
    }
}
