//! Register and slot values.
//!
//! Kiln values are small `Copy` enums: the null reference, a 64-bit
//! integer (booleans are `0`/`1`), or a reference to a heap object.
//! References are ids, so a `Value` never owns or borrows heap memory.

use crate::ids::ObjectId;
use std::fmt;

/// A value held in a register, field, static or array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// The null reference (also the default of every slot).
    #[default]
    Null,
    /// A signed 64-bit integer.
    Int(i64),
    /// A reference to a live heap object.
    Ref(ObjectId),
}

impl Value {
    /// Boolean true.
    pub const TRUE: Value = Value::Int(1);
    /// Boolean false.
    pub const FALSE: Value = Value::Int(0);

    /// Create an integer value.
    #[inline]
    pub const fn int(v: i64) -> Self {
        Value::Int(v)
    }

    /// Create a boolean value.
    #[inline]
    pub const fn bool(b: bool) -> Self {
        if b { Value::TRUE } else { Value::FALSE }
    }

    /// Create a reference value.
    #[inline]
    pub const fn reference(id: ObjectId) -> Self {
        Value::Ref(id)
    }

    /// The integer payload, if this is an integer.
    #[inline]
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    /// The object id, if this is a non-null reference.
    #[inline]
    pub const fn as_ref(self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    /// Branch condition semantics: non-zero integers and non-null
    /// references are true.
    #[inline]
    pub const fn is_truthy(self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => v != 0,
            Value::Ref(_) => true,
        }
    }

    /// Short name of the value kind, used in error messages.
    pub const fn kind_name(self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Ref(_) => "reference",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Ref(id)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Ref(id) => write!(f, "{id}"),
        }
    }
}
