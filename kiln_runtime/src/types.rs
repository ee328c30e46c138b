//! Loaded type descriptors.

use crate::definition::{TypeDefinition, TypeFlags};
use crate::init::{InitCell, InitState};
use crate::method::{MethodSlot, MethodVersion};
use crate::statics::StaticStorage;
use kiln_core::{Symbol, TypeId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// What kind of objects a type describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Ordinary classes and interfaces.
    Instance,
    /// Reference arrays.
    Array,
}

/// A loaded type.
///
/// Owned by the [`ClassTable`](crate::ClassTable). The superclass and
/// interfaces are ids into the same table, never owning pointers.
pub struct TypeDescriptor {
    pub(crate) id: TypeId,
    pub(crate) name: Symbol,
    pub(crate) kind: TypeKind,
    pub(crate) superclass: Option<TypeId>,
    pub(crate) interfaces: Vec<TypeId>,
    pub(crate) flags: TypeFlags,
    /// Full instance layout, inherited fields first.
    pub(crate) instance_fields: Vec<Symbol>,
    pub(crate) statics: StaticStorage,
    pub(crate) init: InitCell,
    pub(crate) methods: FxHashMap<Symbol, MethodSlot>,
    pub(crate) clinit: Option<Arc<MethodVersion>>,
    pub(crate) definition: RwLock<Arc<TypeDefinition>>,
    pub(crate) redefinitions: AtomicU32,
}

impl TypeDescriptor {
    /// Table index.
    #[inline]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Type name.
    #[inline]
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Object kind.
    #[inline]
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    /// Direct superclass; `None` only for `Object`.
    #[inline]
    pub fn superclass(&self) -> Option<TypeId> {
        self.superclass
    }

    /// Directly implemented interfaces.
    #[inline]
    pub fn interfaces(&self) -> &[TypeId] {
        &self.interfaces
    }

    /// Class modifiers.
    #[inline]
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// Whether this is an interface.
    #[inline]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }

    /// Whether this is the array type.
    #[inline]
    pub fn is_array(&self) -> bool {
        self.kind == TypeKind::Array
    }

    /// Whether instances may be created.
    #[inline]
    pub fn is_instantiable(&self) -> bool {
        self.kind == TypeKind::Instance
            && !self.flags.intersects(TypeFlags::INTERFACE | TypeFlags::ABSTRACT)
    }

    /// Type signature, e.g. `LFoo;` or `[LObject;`.
    pub fn signature(&self) -> String {
        match self.kind {
            TypeKind::Instance => format!("L{};", self.name),
            TypeKind::Array => "[LObject;".to_owned(),
        }
    }

    /// Full instance field layout.
    #[inline]
    pub fn instance_fields(&self) -> &[Symbol] {
        &self.instance_fields
    }

    /// Slot index of instance field `name`, most derived declaration first.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.instance_fields.iter().rposition(|f| &**f == name)
    }

    /// Static storage.
    #[inline]
    pub fn statics(&self) -> &StaticStorage {
        &self.statics
    }

    /// Initialization cell.
    #[inline]
    pub fn init(&self) -> &InitCell {
        &self.init
    }

    /// Current initialization state.
    #[inline]
    pub fn init_state(&self) -> InitState {
        self.init.state()
    }

    /// The static initializer.
    #[inline]
    pub fn clinit(&self) -> Option<&Arc<MethodVersion>> {
        self.clinit.as_ref()
    }

    /// Current version of declared method `name`.
    pub fn method(&self, name: &str) -> Option<Arc<MethodVersion>> {
        self.methods.get(name).map(MethodSlot::current)
    }

    /// Slot of declared method `name`.
    pub fn method_slot(&self, name: &str) -> Option<&MethodSlot> {
        self.methods.get(name)
    }

    /// Current versions of every declared method.
    pub fn current_methods(&self) -> Vec<Arc<MethodVersion>> {
        self.methods.values().map(MethodSlot::current).collect()
    }

    /// Declared method names, sorted.
    pub fn method_names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// The definition currently in effect.
    pub fn definition(&self) -> Arc<TypeDefinition> {
        Arc::clone(&self.definition.read())
    }

    /// Record that `definition` is now in effect.
    pub fn set_definition(&self, definition: TypeDefinition) {
        *self.definition.write() = Arc::new(definition);
        self.redefinitions.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of successful redefinitions.
    #[inline]
    pub fn redefinition_count(&self) -> u32 {
        self.redefinitions.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("superclass", &self.superclass)
            .field("init", &self.init_state())
            .finish_non_exhaustive()
    }
}
