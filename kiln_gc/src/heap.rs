//! The object heap.
//!
//! # Locking
//!
//! ```text
//!   inner: RwLock<HeapInner>
//!     read   ── field access, tag get/set, class queries
//!     write  ── allocation, heap walk, collection
//! ```
//!
//! A heap walk holds the write lock for its whole pass, so no allocation,
//! collection or tag write from another thread can interleave with it. The
//! walk sees one snapshot: no object is visited twice and none is skipped.
//! Free notifications are delivered after the lock is released.

use crate::config::HeapConfig;
use crate::filter::HeapFilter;
use crate::object::{ObjectKind, ObjectRecord};
use crate::roots::{RootProvider, RootSet, Tracer};
use crate::stats::GcStats;
use crate::weak::WeakRef;
use crate::TypeHierarchy;
use kiln_core::{KilnError, KilnResult, ObjectId, TypeId, Value};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Callback receiving the last tag of each reclaimed tagged object.
pub type FreeListener = Arc<dyn Fn(u64) + Send + Sync>;

/// What a heap walk reports per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectInfo {
    /// The object.
    pub id: ObjectId,
    /// The object's class.
    pub class: TypeId,
    /// Tag of the class mirror (0 if none).
    pub class_tag: u64,
    /// Size in bytes.
    pub size: usize,
    /// The object's tag at the time of the visit.
    pub tag: u64,
    /// Element count, for arrays.
    pub array_length: Option<usize>,
}

/// Whether a heap walk continues after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitControl {
    /// Visit the next object.
    Continue,
    /// Stop the walk.
    Abort,
}

/// Result of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Objects reclaimed.
    pub freed: usize,
    /// Free notifications delivered.
    pub free_events: usize,
    /// Objects surviving.
    pub live: usize,
    /// Bytes surviving.
    pub live_bytes: usize,
    /// Wall time of the pass.
    pub duration: Duration,
}

#[derive(Default)]
pub(crate) struct HeapInner {
    /// Ordered so that walks are stable within an epoch.
    pub(crate) objects: BTreeMap<ObjectId, Arc<ObjectRecord>>,
    pub(crate) mirrors: FxHashMap<TypeId, ObjectId>,
}

impl HeapInner {
    #[inline]
    pub(crate) fn record(&self, id: ObjectId) -> KilnResult<&Arc<ObjectRecord>> {
        self.objects.get(&id).ok_or(KilnError::invalid_object(id))
    }

    #[inline]
    pub(crate) fn class_tag(&self, ty: TypeId) -> u64 {
        self.mirrors
            .get(&ty)
            .and_then(|id| self.objects.get(id))
            .map_or(0, |mirror| mirror.tag())
    }
}

/// The shared object heap.
pub struct Heap {
    inner: RwLock<HeapInner>,
    next_id: AtomicU64,
    config: HeapConfig,
    stats: GcStats,
    roots: RootSet,
    free_listener: RwLock<Option<FreeListener>>,
    since_collection: AtomicU64,
    collect_requested: AtomicBool,
    /// Serializes collections.
    collecting: Mutex<()>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Create an empty heap.
    pub fn new(config: HeapConfig) -> Self {
        Self {
            inner: RwLock::new(HeapInner::default()),
            next_id: AtomicU64::new(1),
            config,
            stats: GcStats::new(),
            roots: RootSet::new(),
            free_listener: RwLock::new(None),
            since_collection: AtomicU64::new(0),
            collect_requested: AtomicBool::new(false),
            collecting: Mutex::new(()),
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &RwLock<HeapInner> {
        &self.inner
    }

    /// Heap configuration.
    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Heap statistics.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Pinned handles.
    #[inline]
    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate an instance of `ty` with `slots` null field slots.
    pub fn allocate_instance(&self, ty: TypeId, slots: usize) -> ObjectId {
        self.insert(ObjectRecord::new(ty, ObjectKind::Instance, slots))
    }

    /// Allocate a reference array of `length` nulls.
    pub fn allocate_array(&self, length: i64) -> KilnResult<ObjectId> {
        if length < 0 {
            return Err(KilnError::exception(
                kiln_core::error::classes::NEGATIVE_ARRAY_SIZE,
                length.to_string(),
            ));
        }
        Ok(self.insert(ObjectRecord::new(
            TypeId::ARRAY,
            ObjectKind::Array,
            length as usize,
        )))
    }

    /// The class mirror of `ty`, created on first request.
    pub fn mirror(&self, ty: TypeId) -> ObjectId {
        if let Some(id) = self.inner.read().mirrors.get(&ty) {
            return *id;
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.mirrors.get(&ty) {
            return *id;
        }
        let record = ObjectRecord::new(TypeId::CLASS, ObjectKind::Mirror(ty), 0);
        let id = self.fresh_id();
        self.stats.record_allocation(record.size());
        inner.objects.insert(id, Arc::new(record));
        inner.mirrors.insert(ty, id);
        id
    }

    /// The class mirror of `ty` if one exists.
    pub fn existing_mirror(&self, ty: TypeId) -> Option<ObjectId> {
        self.inner.read().mirrors.get(&ty).copied()
    }

    fn insert(&self, record: ObjectRecord) -> ObjectId {
        let id = self.fresh_id();
        self.stats.record_allocation(record.size());
        self.inner.write().objects.insert(id, Arc::new(record));
        self.note_allocation();
        id
    }

    #[inline]
    fn fresh_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn note_allocation(&self) {
        let every = self.config.collect_every_allocations;
        if every == 0 {
            return;
        }
        if self.since_collection.fetch_add(1, Ordering::Relaxed) + 1 >= every {
            self.since_collection.store(0, Ordering::Relaxed);
            self.collect_requested.store(true, Ordering::Release);
        }
    }

    /// Whether an automatic collection is pending.
    #[inline]
    pub fn collection_requested(&self) -> bool {
        self.collect_requested.load(Ordering::Acquire)
    }

    /// Clear and return the pending automatic collection request.
    #[inline]
    pub fn take_collection_request(&self) -> bool {
        self.collect_requested.swap(false, Ordering::AcqRel)
    }

    // =========================================================================
    // Object access
    // =========================================================================

    /// The record behind `id`.
    pub fn record(&self, id: ObjectId) -> KilnResult<Arc<ObjectRecord>> {
        self.inner.read().record(id).cloned()
    }

    /// Whether `id` names a live object.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.read().objects.contains_key(&id)
    }

    /// Number of live objects, mirrors included.
    pub fn live_count(&self) -> usize {
        self.inner.read().objects.len()
    }

    /// The class of `id`.
    pub fn class_of(&self, id: ObjectId) -> KilnResult<TypeId> {
        Ok(self.inner.read().record(id)?.class())
    }

    /// Read slot `index` of `id`.
    pub fn get_slot(&self, id: ObjectId, index: usize) -> KilnResult<Value> {
        self.record(id)?.get(index)
    }

    /// Write slot `index` of `id`.
    pub fn set_slot(&self, id: ObjectId, index: usize, value: Value) -> KilnResult<()> {
        self.record(id)?.set(index, value)
    }

    /// Length of the array `id`.
    pub fn array_length(&self, id: ObjectId) -> KilnResult<usize> {
        let record = self.record(id)?;
        record
            .array_length()
            .ok_or_else(|| KilnError::wrong_operand("array", "instance"))
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Set the tag of `id`. A tag of 0 untags the object.
    pub fn set_tag(&self, id: ObjectId, tag: u64) -> KilnResult<()> {
        self.inner.read().record(id)?.set_tag(tag);
        Ok(())
    }

    /// Tag of `id`; 0 when untagged.
    pub fn get_tag(&self, id: ObjectId) -> KilnResult<u64> {
        Ok(self.inner.read().record(id)?.tag())
    }

    /// Tag of the class mirror of `ty`; 0 when it has none.
    pub fn class_tag(&self, ty: TypeId) -> u64 {
        self.inner.read().class_tag(ty)
    }

    /// Live objects whose tag is one of `tags`, with their tags.
    pub fn objects_with_tags(&self, tags: &[u64]) -> Vec<(ObjectId, u64)> {
        let inner = self.inner.read();
        inner
            .objects
            .iter()
            .filter_map(|(id, record)| {
                let tag = record.tag();
                (tag != 0 && tags.contains(&tag)).then_some((*id, tag))
            })
            .collect()
    }

    /// Install or clear the free listener.
    pub fn set_free_listener(&self, listener: Option<FreeListener>) {
        *self.free_listener.write() = listener;
    }

    // =========================================================================
    // Weak references and pins
    // =========================================================================

    /// Create a weak reference to `id`.
    pub fn downgrade(&self, id: ObjectId) -> KilnResult<WeakRef> {
        self.inner.read().record(id)?;
        Ok(WeakRef::new(id))
    }

    /// Resolve a weak reference; `None` once the target is reclaimed.
    pub fn upgrade(&self, weak: &WeakRef) -> Option<ObjectId> {
        self.contains(weak.target()).then_some(weak.target())
    }

    /// Keep `id` alive until a matching [`unpin`](Self::unpin).
    pub fn pin(&self, id: ObjectId) -> KilnResult<()> {
        self.inner.read().record(id)?;
        self.roots.pin(id);
        Ok(())
    }

    /// Release one pin of `id`.
    pub fn unpin(&self, id: ObjectId) {
        self.roots.unpin(id);
    }

    // =========================================================================
    // Heap walk
    // =========================================================================

    /// Walk live objects admitted by `filter`.
    ///
    /// `class_filter` restricts the walk to instances of a type and its
    /// subtypes. At most `limit` objects are visited. The visitor receives
    /// each object's info and its tag, which it may overwrite. The visitor
    /// must not call back into the heap. Returns the number of visits.
    pub fn iterate<F>(
        &self,
        filter: HeapFilter,
        class_filter: Option<(TypeId, &dyn TypeHierarchy)>,
        limit: Option<usize>,
        mut visitor: F,
    ) -> usize
    where
        F: FnMut(&HeapObjectInfo, &mut u64) -> VisitControl,
    {
        let inner = self.inner.write();
        let limit = limit.unwrap_or(usize::MAX);
        let mut visited = 0;

        for (id, record) in inner.objects.iter() {
            if visited >= limit {
                break;
            }
            let class = record.class();
            if let Some((sup, hierarchy)) = class_filter {
                if !hierarchy.is_subtype(class, sup) {
                    continue;
                }
            }
            let tag = record.tag();
            let class_tag = inner.class_tag(class);
            if !filter.admits(tag, class_tag) {
                continue;
            }

            let info = HeapObjectInfo {
                id: *id,
                class,
                class_tag,
                size: record.size(),
                tag,
                array_length: record.array_length(),
            };
            let mut new_tag = tag;
            let control = visitor(&info, &mut new_tag);
            if new_tag != tag {
                record.set_tag(new_tag);
            }
            visited += 1;
            if control == VisitControl::Abort {
                break;
            }
        }
        visited
    }

    /// Collect the info of every object a walk would visit.
    pub fn heap_objects(
        &self,
        filter: HeapFilter,
        class_filter: Option<(TypeId, &dyn TypeHierarchy)>,
        limit: Option<usize>,
    ) -> Vec<HeapObjectInfo> {
        let mut out = Vec::new();
        self.iterate(filter, class_filter, limit, |info, _| {
            out.push(*info);
            VisitControl::Continue
        });
        out
    }

    /// Count the objects admitted by `filter`.
    pub fn count(&self, filter: HeapFilter) -> usize {
        self.iterate(filter, None, None, |_, _| VisitControl::Continue)
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Reclaim every object unreachable from `roots`, pinned handles and
    /// class mirrors.
    ///
    /// Callers that run mutators concurrently must stop them first.
    pub fn collect(&self, roots: &dyn RootProvider) -> KilnResult<CollectionSummary> {
        let _serial = self.collecting.lock();
        let start = Instant::now();
        self.collect_requested.store(false, Ordering::Release);
        self.since_collection.store(0, Ordering::Relaxed);

        let (freed, live, live_bytes) = {
            let mut inner = self.inner.write();
            let marked = {
                let mut marker = Marker::new(&inner);
                roots.trace_roots(&mut marker);
                self.roots.trace_roots(&mut marker);
                for mirror in inner.mirrors.values() {
                    marker.trace_object(*mirror);
                }
                marker.finish()
            };

            let dead: Vec<ObjectId> = inner
                .objects
                .keys()
                .filter(|id| !marked.contains(id))
                .copied()
                .collect();
            let freed: Vec<Arc<ObjectRecord>> = dead
                .iter()
                .filter_map(|id| inner.objects.remove(id))
                .collect();

            if self.config.verify_after_collection {
                verify(&inner)?;
            }
            let live_bytes: usize = inner.objects.values().map(|r| r.size()).sum();
            (freed, inner.objects.len(), live_bytes)
        };

        // Deliver last-known tags before the records are dropped.
        let listener = self.free_listener.read().clone();
        let mut free_events = 0;
        if let Some(listener) = listener {
            for record in freed.iter() {
                let tag = record.tag();
                if tag != 0 {
                    listener(tag);
                    free_events += 1;
                }
            }
        }
        let freed_count = freed.len();
        drop(freed);

        let duration = start.elapsed();
        self.stats.record_collection(
            duration,
            freed_count as u64,
            live as u64,
            live_bytes as u64,
        );
        self.stats.record_free_events(free_events as u64);
        info!(
            freed = freed_count,
            live,
            live_bytes,
            free_events,
            micros = duration.as_micros() as u64,
            "heap collection complete"
        );

        Ok(CollectionSummary {
            freed: freed_count,
            free_events,
            live,
            live_bytes,
            duration,
        })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

// =============================================================================
// Marking
// =============================================================================

struct Marker<'a> {
    inner: &'a HeapInner,
    marked: FxHashSet<ObjectId>,
    worklist: Vec<ObjectId>,
}

impl<'a> Marker<'a> {
    fn new(inner: &'a HeapInner) -> Self {
        Self {
            inner,
            marked: FxHashSet::default(),
            worklist: Vec::new(),
        }
    }

    fn finish(mut self) -> FxHashSet<ObjectId> {
        let inner = self.inner;
        while let Some(id) = self.worklist.pop() {
            if let Some(record) = inner.objects.get(&id) {
                let mut children = Vec::new();
                record.for_each_reference(|child| children.push(child));
                for child in children {
                    self.trace_object(child);
                }
            }
        }
        debug!(marked = self.marked.len(), "mark phase complete");
        self.marked
    }
}

impl Tracer for Marker<'_> {
    #[inline]
    fn trace_value(&mut self, value: Value) {
        if let Value::Ref(id) = value {
            self.trace_object(id);
        }
    }

    #[inline]
    fn trace_object(&mut self, id: ObjectId) {
        if self.inner.objects.contains_key(&id) && self.marked.insert(id) {
            self.worklist.push(id);
        }
    }
}

fn verify(inner: &HeapInner) -> KilnResult<()> {
    for (id, record) in inner.objects.iter() {
        let mut dangling = None;
        record.for_each_reference(|child| {
            if dangling.is_none() && !inner.objects.contains_key(&child) {
                dangling = Some(child);
            }
        });
        if let Some(child) = dangling {
            return Err(KilnError::internal(format!(
                "survivor {id} references reclaimed object {child}"
            )));
        }
    }
    Ok(())
}
