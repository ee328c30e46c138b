//! Kiln object heap.
//!
//! The heap is a registry of object records keyed by [`ObjectId`]. It is
//! not a memory allocator: records live in an ordered map and are
//! reclaimed by a mark/sweep pass over the object graph.
//!
//! # Capabilities
//!
//! - **Tagging**: every record carries an opaque 64-bit tag (0 = untagged)
//!   that can be read and written atomically per object.
//! - **Heap walk**: [`Heap::iterate`] visits a consistent snapshot of live
//!   objects, optionally filtered by tag state, class tag state, class and
//!   count.
//! - **Reference walk**: [`Heap::follow_references`] starts at the roots
//!   and reports each edge with its kind, referrer tag and referee tag.
//! - **Free notification**: a listener receives the last tag of every
//!   tagged object that is reclaimed, exactly once.
//! - **Weak references**: [`WeakRef`] never keeps its target alive.
//!
//! # Roots
//!
//! ```text
//!   RootProvider (runtime: statics, frames)  ──┐
//!   pinned handles (RootSet)                 ──┼──► mark ──► sweep ──► free events
//!   class mirrors                            ──┘
//! ```
//!
//! The heap never pauses mutators itself. Callers that need a globally
//! consistent view stop the world before calling [`Heap::collect`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod filter;
pub mod follow;
pub mod heap;
pub mod object;
pub mod roots;

mod stats;
mod weak;

pub use config::HeapConfig;
pub use filter::HeapFilter;
pub use follow::{FollowControl, ReferenceInfo, ReferenceKind};
pub use heap::{CollectionSummary, FreeListener, Heap, HeapObjectInfo, VisitControl};
pub use object::{ObjectKind, ObjectRecord};
pub use roots::{NoRoots, RootKind, RootProvider, RootSet, Tracer};
pub use stats::{GcStats, GcStatsSnapshot};
pub use weak::WeakRef;

use kiln_core::TypeId;

/// Subtype queries the heap needs for class-filtered walks.
///
/// The heap stores only type ids; the type table answers hierarchy
/// questions on its behalf.
pub trait TypeHierarchy {
    /// Whether `sub` is `sup` or a subtype of it.
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool;
}

impl TypeHierarchy for fn(TypeId, TypeId) -> bool {
    #[inline]
    fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        self(sub, sup)
    }
}

/// Size of an object header in bytes.
pub const OBJECT_HEADER_SIZE: usize = 16;

/// Size of one field or element slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// Reported size of an object with `slots` field or element slots.
#[inline]
pub const fn object_size(slots: usize) -> usize {
    OBJECT_HEADER_SIZE + SLOT_SIZE * slots
}
