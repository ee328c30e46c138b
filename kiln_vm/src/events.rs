//! Runtime event callbacks.
//!
//! An embedder installs one [`RuntimeEvents`] listener with
//! [`Runtime::set_events`](crate::Runtime::set_events). Callbacks run on
//! the context that caused the event, synchronously, and must not block
//! on other contexts.

use crate::deopt::DeoptReason;
use kiln_core::{ContextId, KilnError, ObjectId, Symbol, TypeId, Value};
use kiln_gc::CollectionSummary;
use kiln_runtime::MethodVersion;

/// Kind of watched field event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldWatch {
    /// Reads of the field.
    Access,
    /// Writes to the field.
    Modification,
}

/// A read or write of a watched field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEvent {
    /// Context performing the access.
    pub context: ContextId,
    /// Type declaring the field.
    pub declaring: TypeId,
    /// Field name.
    pub field: Symbol,
    /// The object, for instance fields.
    pub object: Option<ObjectId>,
    /// Value read, or value about to be written.
    pub value: Value,
}

/// Listener for runtime events. Every callback defaults to a no-op.
pub trait RuntimeEvents: Send + Sync {
    /// A type reached `Initialized`.
    fn class_initialized(&self, _ty: TypeId, _name: &str) {}

    /// A type's initializer failed.
    fn class_init_failed(&self, _ty: TypeId, _name: &str, _error: &KilnError) {}

    /// Compiled code was installed for `method`.
    fn method_compiled(&self, _method: &MethodVersion) {}

    /// A compiled frame of `method` fell back to the interpreter.
    fn deoptimized(&self, _method: &MethodVersion, _pc: u32, _reason: DeoptReason) {}

    /// A type's methods were replaced.
    fn class_redefined(&self, _ty: TypeId, _name: &str) {}

    /// An execution context attached.
    fn context_attached(&self, _context: ContextId) {}

    /// An execution context detached.
    fn context_detached(&self, _context: ContextId) {}

    /// A watched field was read.
    fn field_access(&self, _event: &FieldEvent) {}

    /// A watched field is about to be written.
    fn field_modification(&self, _event: &FieldEvent) {}

    /// `context` allocated `object`, an instance of `class` (or an array).
    fn object_allocated(&self, _context: ContextId, _object: ObjectId, _class: TypeId, _size: usize) {}

    /// A collection is starting. The world is stopped.
    fn gc_started(&self) {}

    /// A collection finished; the world is still stopped.
    fn gc_finished(&self, _summary: &CollectionSummary) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvents;

impl RuntimeEvents for NoEvents {}
