//! Identifiers for runtime entities.
//!
//! All cross-entity references in Kiln are plain index-like ids. A type's
//! superclass, an object's class and a frame's method are all stored as
//! ids or shared handles into one owning table, never as owning pointers
//! back up the hierarchy.

use std::fmt;
use std::sync::Arc;

/// Interned-by-sharing name used for types, fields and methods.
pub type Symbol = Arc<str>;

/// Index of a type in the runtime's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// The root `Object` type.
    pub const OBJECT: TypeId = TypeId(0);
    /// The `Class` type of class mirror objects.
    pub const CLASS: TypeId = TypeId(1);
    /// The type of reference arrays.
    pub const ARRAY: TypeId = TypeId(2);
    /// First id handed out to loaded (non-bootstrap) types.
    pub const FIRST_LOADED: u32 = 3;

    /// Create from a raw index.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    /// Index into the type table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Identity of a heap object.
///
/// Ids are never reused within one heap, so a stale id can only ever
/// resolve to "no such object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Get the underlying u64 value.
    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Unique identifier for one version of a method body.
///
/// Redefinition produces a new `CodeId` for every replaced method; the
/// old id keeps naming the obsolete version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u64);

impl CodeId {
    /// Create from a raw u64 value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        CodeId(id)
    }

    /// Get the underlying u64 value.
    #[inline(always)]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// Identity of an execution context (one thread of control).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}
