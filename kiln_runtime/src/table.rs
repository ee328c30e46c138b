//! The class table.
//!
//! One arena of [`TypeDescriptor`]s indexed by [`TypeId`]. Every "is-a"
//! relation is an id into this arena, so hierarchy walks never chase
//! owning pointers. Types are never removed.
//!
//! # Locking
//!
//! `by_name` is always taken before `types`. Neither lock is held while
//! calling out of the table.

use crate::definition::{MethodDef, TypeDefinition, TypeFlags};
use crate::init::InitCell;
use crate::method::{MethodSlot, MethodVersion};
use crate::statics::StaticStorage;
use crate::types::{TypeDescriptor, TypeKind};
use kiln_core::bytecode::verify_body;
use kiln_core::{CodeId, KilnError, KilnResult, Symbol, TypeId};
use kiln_gc::TypeHierarchy;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Name of the root type.
pub const OBJECT_NAME: &str = "Object";
/// Name of the class-mirror type.
pub const CLASS_NAME: &str = "Class";
/// Name of the reference-array type.
pub const ARRAY_NAME: &str = "Array";

/// Name of the static initializer pseudo-method.
pub const CLINIT_NAME: &str = "<clinit>";

/// All loaded types.
#[derive(Debug)]
pub struct ClassTable {
    types: RwLock<Vec<Arc<TypeDescriptor>>>,
    by_name: RwLock<FxHashMap<Symbol, TypeId>>,
    next_code: AtomicU64,
}

impl ClassTable {
    /// A table holding the bootstrap types `Object`, `Class` and `Array`.
    pub fn new() -> Self {
        let table = Self {
            types: RwLock::new(Vec::new()),
            by_name: RwLock::new(FxHashMap::default()),
            next_code: AtomicU64::new(1),
        };
        table.bootstrap(OBJECT_NAME, None, TypeKind::Instance);
        table.bootstrap(CLASS_NAME, Some(TypeId::OBJECT), TypeKind::Instance);
        table.bootstrap(ARRAY_NAME, Some(TypeId::OBJECT), TypeKind::Array);
        table
    }

    fn bootstrap(&self, name: &str, superclass: Option<TypeId>, kind: TypeKind) {
        let mut by_name = self.by_name.write();
        let mut types = self.types.write();
        let id = TypeId::from_raw(types.len() as u32);
        let name: Symbol = name.into();
        let mut definition = TypeDefinition::new(name.clone());
        definition.superclass = superclass.map(|_| Symbol::from(OBJECT_NAME));
        types.push(Arc::new(TypeDescriptor {
            id,
            name: name.clone(),
            kind,
            superclass,
            interfaces: Vec::new(),
            flags: TypeFlags::FINAL,
            instance_fields: Vec::new(),
            statics: StaticStorage::default(),
            init: InitCell::initialized(),
            methods: FxHashMap::default(),
            clinit: None,
            definition: RwLock::new(Arc::new(definition)),
            redefinitions: AtomicU32::new(0),
        }));
        by_name.insert(name, id);
    }

    /// Hand out a fresh method version id.
    #[inline]
    pub fn next_code_id(&self) -> CodeId {
        CodeId::new(self.next_code.fetch_add(1, Ordering::Relaxed))
    }

    /// Build a version of `def` declared by `declaring`.
    pub fn new_version(&self, declaring: TypeId, def: &MethodDef) -> MethodVersion {
        MethodVersion::new(
            self.next_code_id(),
            declaring,
            def.name.clone(),
            def.flags,
            def.body.clone(),
        )
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load `def`. Its superclass and interfaces must already be loaded.
    pub fn load(&self, def: TypeDefinition) -> KilnResult<TypeId> {
        check_shape(&def)?;

        let mut by_name = self.by_name.write();
        if by_name.contains_key(&def.name) {
            return Err(KilnError::class_format(format!(
                "duplicate definition of {}",
                def.name
            )));
        }

        let mut types = self.types.write();
        let super_name = def.superclass.clone().unwrap_or_else(|| OBJECT_NAME.into());
        let superclass = *by_name
            .get(&super_name)
            .ok_or_else(|| KilnError::no_such_type(super_name.clone()))?;
        let super_desc = Arc::clone(&types[superclass.index()]);
        if super_desc.is_interface() || super_desc.is_array() || superclass == TypeId::CLASS {
            return Err(KilnError::class_format(format!(
                "{} cannot extend {}",
                def.name, super_desc.name
            )));
        }
        if super_desc.flags.contains(TypeFlags::FINAL) && superclass != TypeId::OBJECT {
            return Err(KilnError::class_format(format!(
                "{} cannot extend final {}",
                def.name, super_desc.name
            )));
        }

        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for name in &def.interfaces {
            let id = *by_name
                .get(name)
                .ok_or_else(|| KilnError::no_such_type(name.clone()))?;
            if !types[id.index()].is_interface() {
                return Err(KilnError::class_format(format!(
                    "{} implements non-interface {}",
                    def.name, name
                )));
            }
            interfaces.push(id);
        }

        let id = TypeId::from_raw(types.len() as u32);
        let mut instance_fields = super_desc.instance_fields.clone();
        instance_fields.extend(def.instance_fields.iter().cloned());

        let methods = def
            .methods
            .iter()
            .map(|m| (m.name.clone(), MethodSlot::new(self.new_version(id, m))))
            .collect();
        let clinit = def.clinit.as_ref().map(|body| {
            let clinit = MethodDef {
                name: CLINIT_NAME.into(),
                flags: crate::MethodFlags::STATIC,
                body: body.clone(),
            };
            Arc::new(self.new_version(id, &clinit))
        });

        let name = def.name.clone();
        types.push(Arc::new(TypeDescriptor {
            id,
            name: name.clone(),
            kind: TypeKind::Instance,
            superclass: Some(superclass),
            interfaces,
            flags: def.flags,
            instance_fields,
            statics: StaticStorage::new(&def.static_fields),
            init: InitCell::new(),
            methods,
            clinit,
            definition: RwLock::new(Arc::new(def)),
            redefinitions: AtomicU32::new(0),
        }));
        by_name.insert(name.clone(), id);
        debug!(%name, %id, "type loaded");
        Ok(id)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The descriptor of `id`.
    pub fn get(&self, id: TypeId) -> KilnResult<Arc<TypeDescriptor>> {
        self.types
            .read()
            .get(id.index())
            .cloned()
            .ok_or_else(|| KilnError::internal(format!("{id} is not in the class table")))
    }

    /// Id of the type named `name`.
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.read().get(name).copied()
    }

    /// Descriptor of the type named `name`.
    pub fn resolve(&self, name: &str) -> KilnResult<Arc<TypeDescriptor>> {
        let id = self
            .lookup(name)
            .ok_or_else(|| KilnError::no_such_type(name))?;
        self.get(id)
    }

    /// Every loaded type, bootstrap types included, in load order.
    pub fn all(&self) -> Vec<Arc<TypeDescriptor>> {
        self.types.read().clone()
    }

    /// Number of loaded types.
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// Whether the table is empty. Never true after construction.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// `ty` followed by each of its superclasses up to `Object`.
    pub fn superclass_chain(&self, ty: TypeId) -> SmallVec<[TypeId; 8]> {
        let types = self.types.read();
        let mut chain = SmallVec::new();
        let mut current = Some(ty);
        while let Some(id) = current {
            let Some(desc) = types.get(id.index()) else {
                break;
            };
            chain.push(id);
            current = desc.superclass;
        }
        chain
    }

    /// Whether `sub` is `sup`, extends it, or implements it.
    pub fn is_subtype_of(&self, sub: TypeId, sup: TypeId) -> bool {
        if sub == sup || sup == TypeId::OBJECT {
            return true;
        }
        let types = self.types.read();
        let mut seen = FxHashSet::default();
        let mut work: SmallVec<[TypeId; 8]> = SmallVec::new();
        work.push(sub);
        while let Some(id) = work.pop() {
            if id == sup {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(desc) = types.get(id.index()) {
                work.extend(desc.superclass);
                work.extend(desc.interfaces.iter().copied());
            }
        }
        false
    }

    // =========================================================================
    // Method resolution
    // =========================================================================

    /// Virtual dispatch of `name` on an object of class `class`.
    ///
    /// Walks the superclass chain, then implemented interfaces. Static and
    /// private methods never take part in virtual dispatch.
    pub fn resolve_virtual(&self, class: TypeId, name: &str) -> KilnResult<Arc<MethodVersion>> {
        let chain = self.superclass_chain(class);
        for id in chain.iter() {
            if let Some(version) = self.get(*id)?.method(name) {
                if !version.is_static() && !version.is_private() {
                    return Ok(version);
                }
            }
        }
        for id in chain.iter() {
            for iface in self.get(*id)?.interfaces.clone() {
                if let Ok(version) = self.resolve_virtual(iface, name) {
                    return Ok(version);
                }
            }
        }
        Err(self.missing_method(class, name))
    }

    /// Non-virtual resolution of `name` starting at `from`.
    pub fn resolve_special(&self, from: TypeId, name: &str) -> KilnResult<Arc<MethodVersion>> {
        for id in self.superclass_chain(from) {
            if let Some(version) = self.get(id)?.method(name) {
                if !version.is_static() {
                    return Ok(version);
                }
            }
        }
        Err(self.missing_method(from, name))
    }

    /// Static method `name` visible from `ty`.
    pub fn resolve_static(&self, ty: TypeId, name: &str) -> KilnResult<Arc<MethodVersion>> {
        for id in self.superclass_chain(ty) {
            if let Some(version) = self.get(id)?.method(name) {
                if version.is_static() {
                    return Ok(version);
                }
            }
        }
        Err(self.missing_method(ty, name))
    }

    fn missing_method(&self, ty: TypeId, name: &str) -> KilnError {
        let type_name = self
            .get(ty)
            .map(|d| d.name.clone())
            .unwrap_or_else(|_| ty.to_string().into());
        KilnError::no_such_method(type_name, name)
    }

    // =========================================================================
    // Field resolution
    // =========================================================================

    /// The type declaring static field `name` as seen from `ty`.
    pub fn resolve_static_field(&self, ty: TypeId, name: &str) -> KilnResult<TypeId> {
        for id in self.superclass_chain(ty) {
            let desc = self.get(id)?;
            if desc.statics.declares(name) {
                return Ok(id);
            }
            for iface in desc.interfaces.iter() {
                if self.get(*iface)?.statics.declares(name) {
                    return Ok(*iface);
                }
            }
        }
        let type_name = self.get(ty)?.name.clone();
        Err(KilnError::no_such_field(type_name, name))
    }

    /// Slot index of instance field `name` in objects of class `class`.
    pub fn field_index(&self, class: TypeId, name: &str) -> KilnResult<usize> {
        let desc = self.get(class)?;
        desc.field_index(name)
            .ok_or_else(|| KilnError::no_such_field(desc.name.clone(), name))
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeHierarchy for ClassTable {
    #[inline]
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        self.is_subtype_of(sub, sup)
    }
}

/// Structural checks that need no other type.
fn check_shape(def: &TypeDefinition) -> KilnResult<()> {
    if def.name.is_empty() {
        return Err(KilnError::class_format("type name is empty"));
    }
    let mut names = FxHashSet::default();
    for method in &def.methods {
        if !names.insert(&method.name) {
            return Err(KilnError::class_format(format!(
                "{} declares {} twice",
                def.name, method.name
            )));
        }
        verify_body(&method.body).map_err(|err| {
            KilnError::verification(format!("{}.{}: {}", def.name, method.name, err))
        })?;
        if !method.flags.contains(crate::MethodFlags::STATIC) && method.body.params == 0 {
            return Err(KilnError::class_format(format!(
                "instance method {}.{} takes no receiver",
                def.name, method.name
            )));
        }
    }
    if let Some(body) = &def.clinit {
        verify_body(body)
            .map_err(|err| KilnError::verification(format!("{}.<clinit>: {}", def.name, err)))?;
        if body.params != 0 {
            return Err(KilnError::class_format(format!(
                "{}.<clinit> takes parameters",
                def.name
            )));
        }
    }
    let mut fields = FxHashSet::default();
    for field in &def.instance_fields {
        if !fields.insert(field) {
            return Err(KilnError::class_format(format!(
                "{} declares field {} twice",
                def.name, field
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::MethodFlags;
    use crate::init::InitState;
    use kiln_core::Value;
    use kiln_core::bytecode::{CodeBody, CodeBuilder, Reg};

    fn returns(params: u16, value: i64) -> CodeBody {
        let mut b = CodeBuilder::new(params);
        b.const_int(Reg(params), value).ret(Reg(params));
        b.finish().unwrap()
    }

    fn table_with_hierarchy() -> (ClassTable, TypeId, TypeId, TypeId) {
        let table = ClassTable::new();
        let iface = table
            .load(
                TypeDefinition::new("Named")
                    .with_flags(TypeFlags::INTERFACE | TypeFlags::ABSTRACT)
                    .static_field("PREFIX", Value::int(1))
                    .method("name", MethodFlags::empty(), returns(1, 99)),
            )
            .unwrap();
        let a = table
            .load(
                TypeDefinition::new("A")
                    .field("x")
                    .static_field("count", Value::int(0))
                    .method("foo", MethodFlags::empty(), returns(1, 1))
                    .method("secret", MethodFlags::PRIVATE, returns(1, 7))
                    .method("make", MethodFlags::STATIC, returns(0, 5)),
            )
            .unwrap();
        let b = table
            .load(
                TypeDefinition::new("B")
                    .extends("A")
                    .implements("Named")
                    .field("y")
                    .field("x")
                    .method("foo", MethodFlags::empty(), returns(1, 2)),
            )
            .unwrap();
        (table, iface, a, b)
    }

    #[test]
    fn test_bootstrap_types() {
        let table = ClassTable::new();
        assert_eq!(table.lookup(OBJECT_NAME), Some(TypeId::OBJECT));
        assert_eq!(table.lookup(CLASS_NAME), Some(TypeId::CLASS));
        let array = table.get(TypeId::ARRAY).unwrap();
        assert!(array.is_array());
        assert_eq!(array.signature(), "[LObject;");
        assert_eq!(array.init_state(), InitState::Initialized);
    }

    #[test]
    fn test_layout_inherits_fields_first() {
        let (table, _, a, b) = table_with_hierarchy();
        let b_desc = table.get(b).unwrap();
        assert_eq!(b_desc.instance_fields().len(), 3);
        assert_eq!(table.field_index(b, "x").unwrap(), 2);
        assert_eq!(table.field_index(a, "x").unwrap(), 0);
        assert!(table.field_index(a, "y").is_err());
        assert_eq!(b_desc.signature(), "LB;");
        assert_eq!(b_desc.init_state(), InitState::NotInitialized);
    }

    #[test]
    fn test_subtyping() {
        let (table, iface, a, b) = table_with_hierarchy();
        assert!(table.is_subtype_of(b, a));
        assert!(table.is_subtype_of(b, iface));
        assert!(table.is_subtype_of(b, TypeId::OBJECT));
        assert!(!table.is_subtype_of(a, b));
        assert!(!table.is_subtype_of(a, iface));
        assert_eq!(table.superclass_chain(b).as_slice(), &[b, a, TypeId::OBJECT]);
    }

    #[test]
    fn test_method_resolution() {
        let (table, iface, a, b) = table_with_hierarchy();
        assert_eq!(table.resolve_virtual(b, "foo").unwrap().declaring(), b);
        assert_eq!(table.resolve_virtual(a, "foo").unwrap().declaring(), a);
        assert_eq!(table.resolve_virtual(b, "name").unwrap().declaring(), iface);
        assert!(table.resolve_virtual(b, "secret").is_err());
        assert_eq!(table.resolve_special(a, "secret").unwrap().declaring(), a);
        assert_eq!(table.resolve_special(b, "foo").unwrap().declaring(), b);
        assert_eq!(table.resolve_static(b, "make").unwrap().declaring(), a);
        assert!(matches!(
            table.resolve_virtual(a, "nope"),
            Err(KilnError::NoSuchMethod { .. })
        ));
    }

    #[test]
    fn test_static_field_resolution() {
        let (table, iface, a, b) = table_with_hierarchy();
        assert_eq!(table.resolve_static_field(b, "count").unwrap(), a);
        assert_eq!(table.resolve_static_field(b, "PREFIX").unwrap(), iface);
        assert!(table.resolve_static_field(a, "PREFIX").is_err());
    }

    #[test]
    fn test_load_errors() {
        let (table, _, _, _) = table_with_hierarchy();
        assert!(matches!(
            table.load(TypeDefinition::new("A")),
            Err(KilnError::ClassFormat { .. })
        ));
        assert!(matches!(
            table.load(TypeDefinition::new("C").extends("Missing")),
            Err(KilnError::NoSuchType { .. })
        ));
        assert!(matches!(
            table.load(TypeDefinition::new("D").implements("A")),
            Err(KilnError::ClassFormat { .. })
        ));
        let bad = CodeBody {
            registers: 1,
            params: 1,
            instrs: vec![kiln_core::bytecode::Instr::Jump { target: 5 }],
        };
        assert!(matches!(
            table.load(TypeDefinition::new("E").method("m", MethodFlags::empty(), bad)),
            Err(KilnError::Verification { .. })
        ));
    }

    #[test]
    fn test_code_ids_are_unique() {
        let (table, _, a, b) = table_with_hierarchy();
        let foo_a = table.get(a).unwrap().method("foo").unwrap();
        let foo_b = table.get(b).unwrap().method("foo").unwrap();
        assert_ne!(foo_a.code_id(), foo_b.code_id());
    }
}
