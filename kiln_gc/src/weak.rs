//! Weak references.

use kiln_core::ObjectId;

/// A reference that does not keep its target alive.
///
/// Object ids are never reused, so a weak reference whose target has been
/// reclaimed can never resolve to a different object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakRef {
    target: ObjectId,
}

impl WeakRef {
    pub(crate) const fn new(target: ObjectId) -> Self {
        Self { target }
    }

    /// The referent's id, whether or not it is still live.
    #[inline]
    pub const fn target(&self) -> ObjectId {
        self.target
    }
}
