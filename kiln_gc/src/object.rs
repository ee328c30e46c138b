//! Object records.
//!
//! A record owns its slots behind a lock and its tag in an atomic, so tag
//! traffic never contends with field traffic and tag operations on
//! different objects are independent.

use crate::object_size;
use kiln_core::{KilnError, KilnResult, TypeId, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// What an object is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// An instance with one slot per instance field.
    Instance,
    /// A reference array.
    Array,
    /// The class mirror of a loaded type.
    Mirror(TypeId),
}

/// A live heap object.
#[derive(Debug)]
pub struct ObjectRecord {
    ty: TypeId,
    kind: ObjectKind,
    tag: AtomicU64,
    slots: RwLock<Box<[Value]>>,
}

impl ObjectRecord {
    pub(crate) fn new(ty: TypeId, kind: ObjectKind, slots: usize) -> Self {
        Self {
            ty,
            kind,
            tag: AtomicU64::new(0),
            slots: RwLock::new(vec![Value::Null; slots].into_boxed_slice()),
        }
    }

    /// The object's class.
    #[inline]
    pub fn class(&self) -> TypeId {
        self.ty
    }

    /// The object's kind.
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Current tag.
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    /// Replace the tag.
    #[inline]
    pub fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Release);
    }

    /// Number of slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Length, for arrays.
    #[inline]
    pub fn array_length(&self) -> Option<usize> {
        match self.kind {
            ObjectKind::Array => Some(self.slot_count()),
            _ => None,
        }
    }

    /// Reported size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        object_size(self.slot_count())
    }

    /// Read slot `index`.
    pub fn get(&self, index: usize) -> KilnResult<Value> {
        let slots = self.slots.read();
        slots.get(index).copied().ok_or_else(|| self.out_of_range(index, slots.len()))
    }

    /// Write slot `index`.
    pub fn set(&self, index: usize, value: Value) -> KilnResult<()> {
        let mut slots = self.slots.write();
        let len = slots.len();
        match slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(self.out_of_range(index, len)),
        }
    }

    /// Copy of all slots.
    pub fn snapshot(&self) -> Vec<Value> {
        self.slots.read().to_vec()
    }

    /// Visit every reference held in a slot.
    pub(crate) fn for_each_reference(&self, mut f: impl FnMut(kiln_core::ObjectId)) {
        for value in self.slots.read().iter() {
            if let Value::Ref(id) = value {
                f(*id);
            }
        }
    }

    fn out_of_range(&self, index: usize, len: usize) -> KilnError {
        match self.kind {
            ObjectKind::Array => KilnError::array_index(index as i64, len),
            _ => KilnError::internal(format!(
                "field slot {index} out of range for object of {} with {len} slots",
                self.ty
            )),
        }
    }
}
