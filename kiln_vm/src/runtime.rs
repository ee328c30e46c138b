//! The process-wide runtime.
//!
//! One [`Runtime`] owns the class table, the heap, the code cache and the
//! safepoint coordinator. Every operation goes through it explicitly;
//! there is no global state. Threads of control attach to it as
//! [`ExecutionContext`]s.
//!
//! ```text
//!   Runtime
//!     ├── ClassTable ── TypeDescriptor ── MethodSlot ── MethodVersion
//!     ├── Heap (objects, tags, mirrors, pins)
//!     ├── Compiler + CodeCache
//!     ├── SafepointCoordinator ◄── ExecutionContext (one per thread)
//!     ├── DeoptStats + DeoptRecovery
//!     └── natives, events, field watches, class transformers
//! ```

use crate::config::RuntimeConfig;
use crate::context::ExecutionContext;
use crate::deopt::{DeoptRecovery, DeoptStats};
use crate::events::{FieldWatch, NoEvents, RuntimeEvents};
use crate::natives::NativeRegistry;
use crate::redefine::ClassTransformer;
use crate::roots::{PublishedRoots, RuntimeRoots};
use crate::safepoint::SafepointCoordinator;
use dashmap::DashMap;
use kiln_core::{ContextId, KilnError, KilnResult, ObjectId, Symbol, TypeId, Value};
use kiln_gc::{
    CollectionSummary, FollowControl, Heap, HeapFilter, HeapObjectInfo, ReferenceInfo,
    TypeHierarchy, VisitControl,
};
use kiln_jit::{CodeCache, Compiler, InvalidationReason};
use kiln_runtime::{ClassTable, InitState, MethodVersion, TypeDefinition};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// The runtime context shared by every execution context.
pub struct Runtime {
    config: RuntimeConfig,
    table: ClassTable,
    heap: Heap,
    pub(crate) code_cache: CodeCache,
    pub(crate) compiler: Compiler,
    /// Serializes compilation so a method is compiled at most once.
    pub(crate) compile_lock: Mutex<()>,
    safepoints: SafepointCoordinator,
    deopt_stats: DeoptStats,
    pub(crate) recovery: DeoptRecovery,
    natives: NativeRegistry,
    events: RwLock<Arc<dyn RuntimeEvents>>,
    /// Published roots of every attached context.
    pub(crate) contexts: DashMap<ContextId, Arc<PublishedRoots>>,
    next_context: AtomicU64,
    /// Serializes redefinitions.
    pub(crate) redefine_lock: Mutex<()>,
    pub(crate) transformers: RwLock<Vec<Arc<dyn ClassTransformer>>>,
    field_watches: RwLock<FxHashMap<(FieldWatch, TypeId), FxHashSet<Symbol>>>,
    watching: AtomicBool,
}

impl Runtime {
    /// Create a runtime with the bootstrap types loaded.
    pub fn new(config: RuntimeConfig) -> KilnResult<Arc<Self>> {
        config.validate()?;
        let heap = Heap::new(config.heap.clone());
        let compiler = Compiler::new(config.jit.clone());
        let recovery = DeoptRecovery::new(&config.deopt);
        debug!(jit = config.jit.enabled, "runtime created");
        Ok(Arc::new(Self {
            table: ClassTable::new(),
            heap,
            code_cache: CodeCache::new(),
            compiler,
            compile_lock: Mutex::new(()),
            safepoints: SafepointCoordinator::new(),
            deopt_stats: DeoptStats::new(),
            recovery,
            natives: NativeRegistry::new(),
            events: RwLock::new(Arc::new(NoEvents)),
            contexts: DashMap::new(),
            next_context: AtomicU64::new(1),
            redefine_lock: Mutex::new(()),
            transformers: RwLock::new(Vec::new()),
            field_watches: RwLock::new(FxHashMap::default()),
            watching: AtomicBool::new(false),
            config,
        }))
    }

    /// Attach a new execution context.
    pub fn attach(self: &Arc<Self>) -> ExecutionContext {
        let id = ContextId(self.next_context.fetch_add(1, Ordering::Relaxed));
        let roots = Arc::new(PublishedRoots::default());
        self.contexts.insert(id, Arc::clone(&roots));
        self.safepoints.register(id);
        self.events().context_attached(id);
        debug!(context = %id, "context attached");
        ExecutionContext::new(Arc::clone(self), id, roots)
    }

    pub(crate) fn detach(&self, id: ContextId) {
        self.contexts.remove(&id);
        self.safepoints.unregister(id);
        self.events().context_detached(id);
        debug!(context = %id, "context detached");
    }

    // =========================================================================
    // Components
    // =========================================================================

    /// The configuration this runtime was created with.
    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Loaded types.
    #[inline]
    pub fn table(&self) -> &ClassTable {
        &self.table
    }

    /// The object heap.
    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Installed compiled code.
    #[inline]
    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// The safepoint coordinator.
    #[inline]
    pub fn safepoints(&self) -> &SafepointCoordinator {
        &self.safepoints
    }

    /// Deoptimization counters.
    #[inline]
    pub fn deopt_stats(&self) -> &DeoptStats {
        &self.deopt_stats
    }

    /// Registered natives.
    #[inline]
    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    /// Number of attached contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    // =========================================================================
    // Loading and registration
    // =========================================================================

    /// Load a type. Its superclass and interfaces must be loaded.
    pub fn load_type(&self, def: TypeDefinition) -> KilnResult<TypeId> {
        self.table.load(def)
    }

    /// The id of the type named `name`.
    pub fn type_id(&self, name: &str) -> KilnResult<TypeId> {
        self.table.resolve(name).map(|desc| desc.id())
    }

    /// Bind `name` for `InvokeNative`.
    pub fn register_native<F>(&self, name: impl Into<Symbol>, function: F)
    where
        F: Fn(&mut ExecutionContext, &[Value]) -> KilnResult<Value> + Send + Sync + 'static,
    {
        self.natives.register(name, Arc::new(function));
    }

    /// Install the event listener, replacing the previous one.
    pub fn set_events(&self, events: Arc<dyn RuntimeEvents>) {
        *self.events.write() = events;
    }

    #[inline]
    pub(crate) fn events(&self) -> Arc<dyn RuntimeEvents> {
        Arc::clone(&self.events.read())
    }

    /// Register a transformer consulted by [`retransform`](Self::retransform).
    pub fn add_transformer(&self, transformer: Arc<dyn ClassTransformer>) {
        self.transformers.write().push(transformer);
    }

    // =========================================================================
    // Field watches
    // =========================================================================

    /// Report reads of `ty.field` to the event listener.
    pub fn watch_field_access(&self, ty: TypeId, field: impl Into<Symbol>) {
        self.watch(FieldWatch::Access, ty, field.into());
    }

    /// Report writes of `ty.field` to the event listener.
    pub fn watch_field_modification(&self, ty: TypeId, field: impl Into<Symbol>) {
        self.watch(FieldWatch::Modification, ty, field.into());
    }

    /// Remove every field watch.
    pub fn clear_field_watches(&self) {
        self.field_watches.write().clear();
        self.watching.store(false, Ordering::Release);
    }

    fn watch(&self, kind: FieldWatch, ty: TypeId, field: Symbol) {
        self.field_watches
            .write()
            .entry((kind, ty))
            .or_default()
            .insert(field);
        self.watching.store(true, Ordering::Release);
    }

    /// Whether any field is watched.
    #[inline]
    pub(crate) fn has_field_watches(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub(crate) fn is_watched(&self, kind: FieldWatch, declaring: TypeId, field: &str) -> bool {
        self.field_watches
            .read()
            .get(&(kind, declaring))
            .is_some_and(|fields| fields.contains(field))
    }

    /// The type in `class`'s chain that declares instance field `field`.
    pub(crate) fn field_declarer(&self, class: TypeId, field: &str) -> Option<TypeId> {
        self.table.superclass_chain(class).into_iter().find(|id| {
            self.table.get(*id).is_ok_and(|desc| {
                desc.definition()
                    .instance_fields
                    .iter()
                    .any(|f| f.as_ref() == field)
            })
        })
    }

    // =========================================================================
    // Heap
    // =========================================================================

    /// Tag `object`; 0 untags it.
    pub fn set_tag(&self, object: ObjectId, tag: u64) -> KilnResult<()> {
        self.heap.set_tag(object, tag)
    }

    /// Tag of `object`; 0 when untagged.
    pub fn get_tag(&self, object: ObjectId) -> KilnResult<u64> {
        self.heap.get_tag(object)
    }

    /// Tag the class mirror of `ty`.
    pub fn set_class_tag(&self, ty: TypeId, tag: u64) -> KilnResult<()> {
        self.table.get(ty)?;
        self.heap.set_tag(self.heap.mirror(ty), tag)
    }

    /// Live objects carrying any of `tags`.
    pub fn objects_with_tags(&self, tags: &[u64]) -> Vec<(ObjectId, u64)> {
        self.heap.objects_with_tags(tags)
    }

    /// Walk the heap. See [`Heap::iterate`].
    pub fn iterate_heap<F>(
        &self,
        filter: HeapFilter,
        class: Option<TypeId>,
        limit: Option<usize>,
        visitor: F,
    ) -> usize
    where
        F: FnMut(&HeapObjectInfo, &mut u64) -> VisitControl,
    {
        let class_filter = class.map(|ty| (ty, &self.table as &dyn TypeHierarchy));
        self.heap.iterate(filter, class_filter, limit, visitor)
    }

    /// Info of every object a walk would visit.
    pub fn heap_objects(
        &self,
        filter: HeapFilter,
        class: Option<TypeId>,
        limit: Option<usize>,
    ) -> Vec<HeapObjectInfo> {
        let class_filter = class.map(|ty| (ty, &self.table as &dyn TypeHierarchy));
        self.heap.heap_objects(filter, class_filter, limit)
    }

    /// Walk the object graph from statics, published frames, pins and class
    /// mirrors, or from `initial` alone. See [`Heap::follow_references`].
    ///
    /// The world is stopped for the walk. Fails with
    /// `IllegalStateException` on a thread running managed code; use
    /// [`ExecutionContext::follow_references`] there.
    pub fn follow_references<F>(
        &self,
        initial: Option<ObjectId>,
        filter: HeapFilter,
        visitor: F,
    ) -> KilnResult<usize>
    where
        F: FnMut(&ReferenceInfo, &mut u64) -> FollowControl,
    {
        self.check_host_thread("follow_references")?;
        self.follow_references_as(None, initial, filter, visitor)
    }

    pub(crate) fn follow_references_as<F>(
        &self,
        requester: Option<ContextId>,
        initial: Option<ObjectId>,
        filter: HeapFilter,
        visitor: F,
    ) -> KilnResult<usize>
    where
        F: FnMut(&ReferenceInfo, &mut u64) -> FollowControl,
    {
        let _pause = self.safepoints.stop_the_world(requester);
        self.heap
            .follow_references(&RuntimeRoots::new(self), initial, filter, visitor)
    }

    /// Call `listener` with the last tag of each reclaimed tagged object.
    pub fn set_free_listener<F>(&self, listener: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.heap.set_free_listener(Some(Arc::new(listener)));
    }

    /// Stop delivering free notifications.
    pub fn clear_free_listener(&self) {
        self.heap.set_free_listener(None);
    }

    /// Collect garbage from outside any context.
    ///
    /// Fails with `IllegalStateException` on a thread running managed code
    /// (a native); use [`ExecutionContext::collect_garbage`] there.
    pub fn collect_garbage(&self) -> KilnResult<CollectionSummary> {
        self.check_host_thread("collect_garbage")?;
        self.collect_as(None)
    }

    /// Collect under a pause requested by `requester`, whose roots must
    /// already be published.
    pub(crate) fn collect_as(&self, requester: Option<ContextId>) -> KilnResult<CollectionSummary> {
        let _pause = self.safepoints.stop_the_world(requester);
        self.collect_paused(&RuntimeRoots::new(self))
    }

    /// Collect with the world already stopped, bracketed by GC events.
    fn collect_paused(&self, roots: &RuntimeRoots<'_>) -> KilnResult<CollectionSummary> {
        let events = self.events();
        events.gc_started();
        let summary = self.heap.collect(roots)?;
        events.gc_finished(&summary);
        Ok(summary)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// The current version of `name` as seen from `ty`, searching the
    /// superclass chain.
    pub fn find_method(&self, ty: TypeId, name: &str) -> KilnResult<Arc<MethodVersion>> {
        for id in self.table.superclass_chain(ty) {
            if let Some(version) = self.table.get(id)?.method(name) {
                return Ok(version);
            }
        }
        let type_name = self.table.get(ty)?.name().clone();
        Err(KilnError::no_such_method(type_name, name))
    }

    /// Hotness of the current version of `ty.name`.
    pub fn hotness_counter(&self, ty: TypeId, name: &str) -> KilnResult<u32> {
        Ok(self.find_method(ty, name)?.hotness().value())
    }

    /// Compile the current version of `ty.name` now, regardless of hotness.
    pub fn ensure_jit_compiled(&self, ty: TypeId, name: &str) -> KilnResult<()> {
        let method = self.find_method(ty, name)?;
        self.compile_method(&method)?;
        Ok(())
    }

    /// Whether valid compiled code exists for the current version of
    /// `ty.name`.
    pub fn is_compiled(&self, ty: TypeId, name: &str) -> KilnResult<bool> {
        let method = self.find_method(ty, name)?;
        Ok(self.code_cache.get(method.code_id()).is_some())
    }

    /// Discard the compiled code of `ty.name`. Frames running it fall back
    /// to the interpreter at their next state point.
    pub fn deoptimize_method(&self, ty: TypeId, name: &str) -> KilnResult<bool> {
        let method = self.find_method(ty, name)?;
        Ok(self
            .code_cache
            .remove(method.code_id(), InvalidationReason::Explicit)
            .is_some())
    }

    /// Deoptimizations since the runtime started.
    pub fn number_of_deoptimizations(&self) -> u64 {
        self.deopt_stats.total_count()
    }

    /// Type signature, `LName;`.
    pub fn class_signature(&self, ty: TypeId) -> KilnResult<String> {
        Ok(self.table.get(ty)?.signature())
    }

    /// Whether `ty` is an interface.
    pub fn is_interface(&self, ty: TypeId) -> KilnResult<bool> {
        Ok(self.table.get(ty)?.is_interface())
    }

    /// Whether `ty` is the array class.
    pub fn is_array_class(&self, ty: TypeId) -> KilnResult<bool> {
        Ok(self.table.get(ty)?.is_array())
    }

    /// Methods declared by `ty`.
    pub fn method_names(&self, ty: TypeId) -> KilnResult<Vec<Symbol>> {
        Ok(self.table.get(ty)?.method_names())
    }

    /// Every loaded type, bootstrap types included.
    pub fn loaded_classes(&self) -> Vec<(TypeId, Symbol)> {
        self.table
            .all()
            .iter()
            .map(|desc| (desc.id(), desc.name().clone()))
            .collect()
    }

    /// Initialization state of `ty`.
    pub fn init_state(&self, ty: TypeId) -> KilnResult<InitState> {
        Ok(self.table.get(ty)?.init_state())
    }

    /// Value of static field `field` seen from `ty`; `None` until the
    /// declaring type is initialized.
    pub fn static_value(&self, ty: TypeId, field: &str) -> KilnResult<Option<Value>> {
        let declaring = self.table.resolve_static_field(ty, field)?;
        let desc = self.table.get(declaring)?;
        if desc.init_state() != InitState::Initialized {
            return Ok(None);
        }
        Ok(desc.statics().get(field))
    }

    // =========================================================================
    // Failure and teardown
    // =========================================================================

    /// Host entry points pause or wait without naming a context, so a
    /// context running on the calling thread would never reach a safe
    /// state. Refuse instead of hanging.
    pub(crate) fn check_host_thread(&self, operation: &str) -> KilnResult<()> {
        match self.safepoints.running_on_current_thread() {
            Some(ctx) => Err(KilnError::illegal_state(format!(
                "Runtime::{operation} called on the thread running {ctx}; \
                 call it through the execution context instead"
            ))),
            None => Ok(()),
        }
    }

    /// Report an internal consistency failure. Aborts the process when
    /// configured to; otherwise hands the error back for propagation.
    pub fn report_fatal(&self, err: KilnError) -> KilnError {
        error!(%err, "internal consistency failure");
        if self.config.abort_on_internal_error {
            std::process::abort();
        }
        err
    }

    /// Discard all compiled code, stop free notifications and collect
    /// everything not reachable from statics or pins.
    pub fn shutdown(&self) -> KilnResult<CollectionSummary> {
        self.check_host_thread("shutdown")?;
        let discarded = self.code_cache.clear(InvalidationReason::Explicit);
        self.heap.set_free_listener(None);
        let summary = {
            let _pause = self.safepoints.stop_the_world(None);
            self.collect_paused(&RuntimeRoots::statics_only(self))?
        };
        info!(discarded, freed = summary.freed, live = summary.live, "runtime shut down");
        Ok(summary)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("types", &self.table.len())
            .field("objects", &self.heap.live_count())
            .field("compiled", &self.code_cache.len())
            .field("contexts", &self.contexts.len())
            .field("natives", &self.natives.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bytecode::{CodeBuilder, Reg};
    use kiln_runtime::MethodFlags;

    fn runtime() -> Arc<Runtime> {
        Runtime::new(RuntimeConfig {
            abort_on_internal_error: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn point() -> TypeDefinition {
        let mut get = CodeBuilder::new(1);
        get.get_field(Reg(1), Reg(0), "x").ret(Reg(1));
        TypeDefinition::new("Point")
            .field("x")
            .static_field("ORIGIN", Value::int(0))
            .method("getX", MethodFlags::empty(), get.finish().unwrap())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RuntimeConfig::default();
        config.max_stack_depth = 0;
        let err = Runtime::new(config).unwrap_err();
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn test_reflective_metadata() {
        let rt = runtime();
        let ty = rt.load_type(point()).unwrap();
        assert_eq!(rt.type_id("Point").unwrap(), ty);
        assert_eq!(rt.class_signature(ty).unwrap(), "LPoint;");
        assert!(!rt.is_interface(ty).unwrap());
        assert!(!rt.is_array_class(ty).unwrap());
        assert!(rt.is_array_class(TypeId::ARRAY).unwrap());
        assert_eq!(rt.method_names(ty).unwrap(), vec![Symbol::from("getX")]);
        assert!(rt.loaded_classes().iter().any(|(id, _)| *id == ty));
        assert_eq!(rt.init_state(ty).unwrap(), InitState::NotInitialized);
    }

    #[test]
    fn test_static_value_hidden_until_initialized() {
        let rt = runtime();
        let ty = rt.load_type(point()).unwrap();
        assert_eq!(rt.static_value(ty, "ORIGIN").unwrap(), None);
        let mut ctx = rt.attach();
        ctx.initialize(ty).unwrap();
        assert_eq!(rt.static_value(ty, "ORIGIN").unwrap(), Some(Value::int(0)));
    }

    #[test]
    fn test_attach_and_detach() {
        let rt = runtime();
        let ctx = rt.attach();
        assert_eq!(rt.context_count(), 1);
        assert_eq!(rt.safepoints().mutator_count(), 1);
        drop(ctx);
        assert_eq!(rt.context_count(), 0);
        assert_eq!(rt.safepoints().mutator_count(), 0);
    }

    #[test]
    fn test_report_fatal_returns_error_without_abort() {
        let rt = runtime();
        let err = rt.report_fatal(KilnError::internal("broken"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_shutdown_keeps_statics() {
        let rt = runtime();
        let kept = rt.heap().allocate_instance(TypeId::OBJECT, 0);
        let dropped = rt.heap().allocate_instance(TypeId::OBJECT, 0);
        let holder = rt
            .load_type(TypeDefinition::new("Holder").static_field("KEPT", Value::reference(kept)))
            .unwrap();
        rt.attach().initialize(holder).unwrap();
        rt.shutdown().unwrap();
        assert!(rt.heap().contains(kept));
        assert!(!rt.heap().contains(dropped));
    }
}
