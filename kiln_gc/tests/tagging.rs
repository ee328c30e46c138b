//! Tagging, heap walk and free notification through the public API.

use kiln_core::{ObjectId, TypeId, Value};
use kiln_gc::{Heap, HeapConfig, HeapFilter, NoRoots, VisitControl};
use std::sync::{Arc, Mutex};

fn heap() -> Heap {
    Heap::new(HeapConfig {
        collect_every_allocations: 0,
        verify_after_collection: true,
    })
}

#[test]
fn test_tagged_and_untagged_partition_the_heap() {
    let heap = heap();
    let objects: Vec<ObjectId> = (0..10)
        .map(|_| heap.allocate_instance(TypeId::OBJECT, 1))
        .collect();
    for (i, id) in objects.iter().take(3).enumerate() {
        heap.set_tag(*id, 100 + i as u64).unwrap();
    }

    let tagged = heap.count(HeapFilter::INCLUDE_TAGGED);
    let untagged = heap.count(HeapFilter::INCLUDE_UNTAGGED);
    let all = heap.count(HeapFilter::empty());
    assert_eq!(tagged, 3);
    assert_eq!(untagged, 7);
    assert_eq!(all, 10);

    let tagged_ids: Vec<_> = heap
        .heap_objects(HeapFilter::INCLUDE_TAGGED, None, None)
        .into_iter()
        .map(|info| info.id)
        .collect();
    let untagged_ids: Vec<_> = heap
        .heap_objects(HeapFilter::INCLUDE_UNTAGGED, None, None)
        .into_iter()
        .map(|info| info.id)
        .collect();
    assert!(tagged_ids.iter().all(|id| !untagged_ids.contains(id)));
}

#[test]
fn test_walk_is_stable_within_an_epoch() {
    let heap = heap();
    for _ in 0..20 {
        heap.allocate_instance(TypeId::OBJECT, 0);
    }
    let first: Vec<_> = heap.heap_objects(HeapFilter::empty(), None, None);
    let second: Vec<_> = heap.heap_objects(HeapFilter::empty(), None, None);
    assert_eq!(first, second);

    let mut ids: Vec<_> = first.iter().map(|info| info.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 20);
}

#[test]
fn test_each_tagged_object_is_freed_once() {
    let heap = heap();
    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let sink = Arc::clone(&seen);
    heap.set_free_listener(Some(Arc::new(move |tag: u64| {
        sink.lock().unwrap().push(tag);
    })));

    let keep = heap.allocate_array(3).unwrap();
    for (slot, tag) in [10u64, 100, 1000].into_iter().enumerate() {
        let obj = heap.allocate_instance(TypeId::OBJECT, 0);
        heap.set_tag(obj, tag).unwrap();
        heap.set_slot(keep, slot, Value::Ref(obj)).unwrap();
    }
    heap.allocate_instance(TypeId::OBJECT, 0);

    // Still reachable: nothing tagged is freed.
    heap.collect(&vec![Value::Ref(keep)]).unwrap();
    assert!(seen.lock().unwrap().is_empty());

    // Drop the only reference.
    heap.collect(&NoRoots).unwrap();
    heap.collect(&NoRoots).unwrap();

    let mut tags = seen.lock().unwrap().clone();
    tags.sort_unstable();
    assert_eq!(tags, vec![10, 100, 1000]);
    assert_eq!(heap.stats().snapshot().free_events, 3);
}

#[test]
fn test_array_length_is_reported() {
    let heap = heap();
    heap.allocate_array(7).unwrap();
    heap.allocate_instance(TypeId::OBJECT, 2);

    let mut lengths = Vec::new();
    heap.iterate(HeapFilter::empty(), None, None, |info, _| {
        lengths.push((info.array_length, info.size));
        VisitControl::Continue
    });
    assert_eq!(lengths, vec![(Some(7), 16 + 56), (None, 32)]);
}

#[test]
fn test_concurrent_tagging() {
    let heap = Arc::new(heap());
    let ids: Vec<ObjectId> = (0..64)
        .map(|_| heap.allocate_instance(TypeId::OBJECT, 0))
        .collect();

    std::thread::scope(|scope| {
        for chunk in ids.chunks(16) {
            let heap = Arc::clone(&heap);
            scope.spawn(move || {
                for id in chunk {
                    heap.set_tag(*id, id.as_u64()).unwrap();
                }
            });
        }
        scope.spawn(|| heap.count(HeapFilter::INCLUDE_TAGGED));
    });

    assert_eq!(heap.count(HeapFilter::INCLUDE_TAGGED), 64);
}
