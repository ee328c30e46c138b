//! Type definitions.
//!
//! A `TypeDefinition` is the parsed, format-independent description of a
//! type: what loading consumes and what redefinition replaces. Decoding
//! class or dex payloads into a definition happens outside the runtime.

use bitflags::bitflags;
use kiln_core::bytecode::CodeBody;
use kiln_core::{Symbol, Value};

bitflags! {
    /// Class-level modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// The type is an interface.
        const INTERFACE = 1 << 0;
        /// The type cannot be instantiated.
        const ABSTRACT = 1 << 1;
        /// The type cannot be subclassed.
        const FINAL = 1 << 2;
    }
}

bitflags! {
    /// Method modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodFlags: u32 {
        /// Called without a receiver.
        const STATIC = 1 << 0;
        /// Only callable non-virtually from the declaring type.
        const PRIVATE = 1 << 1;
        /// Cannot be overridden.
        const FINAL = 1 << 2;
        /// Contains a construct the compiler refuses; always interpreted.
        const NON_COMPILABLE = 1 << 3;
    }
}

/// A static field with its explicit initial value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFieldDef {
    /// Field name.
    pub name: Symbol,
    /// Value assigned when initialization begins.
    pub initial: Value,
}

/// A method declaration with its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name. Methods are identified by name alone.
    pub name: Symbol,
    /// Modifiers.
    pub flags: MethodFlags,
    /// Register bytecode.
    pub body: CodeBody,
}

impl MethodDef {
    /// Number of declared parameters, receiver included.
    #[inline]
    pub fn arity(&self) -> u16 {
        self.body.params
    }
}

/// Everything needed to load, or redefine, one type.
///
/// # Example
///
/// ```
/// use kiln_core::bytecode::{CodeBuilder, Reg};
/// use kiln_runtime::{MethodFlags, TypeDefinition};
///
/// let mut b = CodeBuilder::new(1);
/// b.const_int(Reg(1), 42).ret(Reg(1));
/// let def = TypeDefinition::new("Answer")
///     .field("value")
///     .method("get", MethodFlags::empty(), b.finish().unwrap());
/// assert_eq!(def.methods.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    /// Type name.
    pub name: Symbol,
    /// Superclass name; `None` means `Object`.
    pub superclass: Option<Symbol>,
    /// Implemented interfaces.
    pub interfaces: Vec<Symbol>,
    /// Class modifiers.
    pub flags: TypeFlags,
    /// Declared instance fields, in layout order.
    pub instance_fields: Vec<Symbol>,
    /// Declared static fields.
    pub static_fields: Vec<StaticFieldDef>,
    /// Declared methods.
    pub methods: Vec<MethodDef>,
    /// Static initializer.
    pub clinit: Option<CodeBody>,
}

impl TypeDefinition {
    /// Start a definition extending `Object`.
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            superclass: None,
            interfaces: Vec::new(),
            flags: TypeFlags::empty(),
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: Vec::new(),
            clinit: None,
        }
    }

    /// Set the superclass.
    pub fn extends(mut self, superclass: impl Into<Symbol>) -> Self {
        self.superclass = Some(superclass.into());
        self
    }

    /// Add an implemented interface.
    pub fn implements(mut self, interface: impl Into<Symbol>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Set class modifiers.
    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Declare an instance field.
    pub fn field(mut self, name: impl Into<Symbol>) -> Self {
        self.instance_fields.push(name.into());
        self
    }

    /// Declare a static field with its initial value.
    pub fn static_field(mut self, name: impl Into<Symbol>, initial: Value) -> Self {
        self.static_fields.push(StaticFieldDef {
            name: name.into(),
            initial,
        });
        self
    }

    /// Declare a method.
    pub fn method(mut self, name: impl Into<Symbol>, flags: MethodFlags, body: CodeBody) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            flags,
            body,
        });
        self
    }

    /// Set the static initializer.
    pub fn clinit(mut self, body: CodeBody) -> Self {
        self.clinit = Some(body);
        self
    }

    /// The declared method named `name`.
    pub fn find_method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|m| &*m.name == name)
    }

    /// Whether this definition describes an interface.
    #[inline]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bytecode::CodeBuilder;

    fn void_body(params: u16) -> CodeBody {
        let mut b = CodeBuilder::new(params);
        b.ret_void();
        b.finish().unwrap()
    }

    #[test]
    fn test_builder_collects_members() {
        let def = TypeDefinition::new("B")
            .extends("A")
            .implements("Runnable")
            .field("x")
            .field("y")
            .static_field("count", Value::int(3))
            .method("run", MethodFlags::empty(), void_body(1))
            .clinit(void_body(0));

        assert_eq!(def.superclass.as_deref(), Some("A"));
        assert_eq!(def.interfaces.len(), 1);
        assert_eq!(def.instance_fields.len(), 2);
        assert_eq!(def.static_fields[0].initial, Value::int(3));
        assert!(def.clinit.is_some());
        assert_eq!(def.find_method("run").map(MethodDef::arity), Some(1));
        assert!(def.find_method("walk").is_none());
    }

    #[test]
    fn test_interface_flag() {
        let def = TypeDefinition::new("I").with_flags(TypeFlags::INTERFACE | TypeFlags::ABSTRACT);
        assert!(def.is_interface());
        assert!(!TypeDefinition::new("C").is_interface());
    }
}
