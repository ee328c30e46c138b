//! Execution contexts.
//!
//! An [`ExecutionContext`] is one thread of control: a call stack of
//! [`ActivationFrame`]s plus its registration with the safepoint
//! coordinator. It is `Send` but not shared; each host thread attaches its
//! own with [`Runtime::attach`].
//!
//! While no managed code runs the context is `Native` with no roots. Host
//! calls move it to `Running` for their duration. Before entering any safe
//! state the context publishes every frame's registers so a collection
//! started by another context sees them.

use crate::frame::{ActivationFrame, FrameInfo};
use crate::roots::PublishedRoots;
use crate::runtime::Runtime;
use crate::safepoint::MutatorState;
use kiln_core::{ContextId, KilnError, KilnResult, ObjectId, TypeId, Value};
use kiln_gc::{CollectionSummary, FollowControl, HeapFilter, ReferenceInfo, object_size};
use kiln_runtime::MethodVersion;
use std::fmt;
use std::sync::Arc;

/// One thread of control attached to a [`Runtime`].
pub struct ExecutionContext {
    pub(crate) runtime: Arc<Runtime>,
    id: ContextId,
    pub(crate) frames: Vec<ActivationFrame>,
    roots: Arc<PublishedRoots>,
}

impl ExecutionContext {
    pub(crate) fn new(runtime: Arc<Runtime>, id: ContextId, roots: Arc<PublishedRoots>) -> Self {
        Self {
            runtime,
            id,
            frames: Vec::new(),
            roots,
        }
    }

    /// This context's id.
    #[inline]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The runtime this context is attached to.
    #[inline]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Current call depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames from innermost to outermost.
    pub fn stack_trace(&self) -> Vec<FrameInfo> {
        self.frames.iter().rev().map(ActivationFrame::info).collect()
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Call static method `name` of the type named `type_name`.
    pub fn invoke_static(&mut self, type_name: &str, name: &str, args: &[Value]) -> KilnResult<Value> {
        let ty = self.runtime.type_id(type_name)?;
        let method = self.runtime.table().resolve_static(ty, name)?;
        self.initialize(method.declaring())?;
        self.invoke_method(method, args)
    }

    /// Call `name` on `receiver` with virtual dispatch. `args` excludes the
    /// receiver.
    pub fn invoke_virtual(&mut self, receiver: Value, name: &str, args: &[Value]) -> KilnResult<Value> {
        let class = self.receiver_class(receiver)?;
        let method = self.runtime.table().resolve_virtual(class, name)?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(receiver);
        full.extend_from_slice(args);
        self.invoke_method(method, &full)
    }

    /// Run `method` with `args` and return its result.
    pub fn invoke_method(&mut self, method: Arc<MethodVersion>, args: &[Value]) -> KilnResult<Value> {
        let outermost = self.frames.is_empty();
        if outermost {
            self.runtime.safepoints().resume(self.id);
        }
        let base = self.frames.len();
        let result = match self.push_frame(method, args, None) {
            Ok(()) => self.run(base),
            Err(err) => Err(err),
        };
        if outermost {
            self.roots.clear();
            self.runtime.safepoints().enter(self.id, MutatorState::Native);
        }
        result
    }

    /// Class of a receiver; null receivers raise `NullPointerException`.
    pub(crate) fn receiver_class(&self, receiver: Value) -> KilnResult<TypeId> {
        match receiver {
            Value::Ref(id) => self.runtime.heap().class_of(id),
            Value::Null => Err(KilnError::null_pointer("method invoked on null")),
            Value::Int(_) => Err(KilnError::wrong_operand("reference", "int")),
        }
    }

    // =========================================================================
    // Objects and statics
    // =========================================================================

    /// Allocate an instance of the type named `type_name`, initializing
    /// the type first. Fields start as null.
    pub fn new_object(&mut self, type_name: &str) -> KilnResult<ObjectId> {
        let desc = self.runtime.table().resolve(type_name)?;
        if !desc.is_instantiable() {
            return Err(KilnError::exception("InstantiationError", type_name));
        }
        self.initialize(desc.id())?;
        let slots = desc.instance_fields().len();
        let object = self.runtime.heap().allocate_instance(desc.id(), slots);
        Ok(self.allocated(object, desc.id(), slots))
    }

    /// Allocate an array of `length` nulls.
    pub fn new_array(&mut self, length: i64) -> KilnResult<ObjectId> {
        let array = self.runtime.heap().allocate_array(length)?;
        Ok(self.allocated(array, TypeId::ARRAY, length as usize))
    }

    fn allocated(&self, object: ObjectId, class: TypeId, slots: usize) -> ObjectId {
        self.runtime
            .events()
            .object_allocated(self.id, object, class, object_size(slots));
        object
    }

    /// Read instance field `field` of `object`.
    pub fn get_field(&self, object: ObjectId, field: &str) -> KilnResult<Value> {
        let class = self.runtime.heap().class_of(object)?;
        let index = self.runtime.table().field_index(class, field)?;
        self.runtime.heap().get_slot(object, index)
    }

    /// Write instance field `field` of `object`.
    pub fn set_field(&self, object: ObjectId, field: &str, value: Value) -> KilnResult<()> {
        let class = self.runtime.heap().class_of(object)?;
        let index = self.runtime.table().field_index(class, field)?;
        self.runtime.heap().set_slot(object, index, value)
    }

    /// Read static field `field` as seen from the type named `type_name`,
    /// initializing its declaring type first.
    pub fn get_static(&mut self, type_name: &str, field: &str) -> KilnResult<Value> {
        let declaring = self.static_declarer(type_name, field)?;
        let desc = self.runtime.table().get(declaring)?;
        desc.statics()
            .get(field)
            .ok_or_else(|| KilnError::no_such_field(desc.name().clone(), field))
    }

    /// Write static field `field` as seen from the type named `type_name`.
    pub fn set_static(&mut self, type_name: &str, field: &str, value: Value) -> KilnResult<()> {
        let declaring = self.static_declarer(type_name, field)?;
        let desc = self.runtime.table().get(declaring)?;
        if desc.statics().set(field, value) {
            Ok(())
        } else {
            Err(KilnError::no_such_field(desc.name().clone(), field))
        }
    }

    /// Resolve the type declaring static `field` and initialize it.
    pub(crate) fn static_declarer(&mut self, type_name: &str, field: &str) -> KilnResult<TypeId> {
        let ty = self.runtime.type_id(type_name)?;
        let declaring = self.runtime.table().resolve_static_field(ty, field)?;
        self.initialize(declaring)?;
        Ok(declaring)
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Collect garbage, counting this context's frames as roots.
    pub fn collect_garbage(&mut self) -> KilnResult<CollectionSummary> {
        self.publish_roots();
        self.runtime.collect_as(Some(self.id))
    }

    /// Walk references from this context's frames and the runtime's other
    /// roots. See [`Runtime::follow_references`].
    pub fn follow_references<F>(
        &mut self,
        initial: Option<ObjectId>,
        filter: HeapFilter,
        visitor: F,
    ) -> KilnResult<usize>
    where
        F: FnMut(&ReferenceInfo, &mut u64) -> FollowControl,
    {
        self.publish_roots();
        self.runtime
            .follow_references_as(Some(self.id), initial, filter, visitor)
    }

    /// Compile `name` as seen from `ty` now.
    pub fn ensure_jit_compiled(&self, ty: TypeId, name: &str) -> KilnResult<()> {
        self.runtime.ensure_jit_compiled(ty, name)
    }

    // =========================================================================
    // Safepoints
    // =========================================================================

    /// Make every frame's registers visible to the collector.
    pub(crate) fn publish_roots(&self) {
        let values = self
            .frames
            .iter()
            .flat_map(|frame| frame.registers().iter().copied())
            .filter(|value| value.as_ref().is_some())
            .collect();
        self.roots.publish(values);
    }

    /// Park if another context stopped the world, then run any pending
    /// automatic collection.
    pub(crate) fn safepoint_poll(&mut self) -> KilnResult<()> {
        let runtime = Arc::clone(&self.runtime);
        if runtime.safepoints().is_pending() {
            runtime.safepoints().poll(self.id, || self.publish_roots());
        }
        if runtime.heap().collection_requested() && runtime.heap().take_collection_request() {
            self.collect_garbage()?;
        }
        Ok(())
    }

    /// Run `wait` in the `Blocked` state, restoring the previous state
    /// afterwards.
    pub(crate) fn blocking<R>(&self, wait: impl FnOnce() -> R) -> R {
        let safepoints = self.runtime.safepoints();
        let previous = safepoints.state(self.id).unwrap_or(MutatorState::Native);
        self.publish_roots();
        safepoints.enter(self.id, MutatorState::Blocked);
        let result = wait();
        match previous {
            MutatorState::Running | MutatorState::AtSafepoint => safepoints.resume(self.id),
            safe => safepoints.enter(self.id, safe),
        }
        result
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.runtime.detach(self.id);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("frames", &self.frames)
            .finish()
    }
}
