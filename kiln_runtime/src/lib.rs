//! # Kiln Runtime
//!
//! The type-level state shared by every execution context:
//!
//! - **Definitions**: [`TypeDefinition`], the parsed description of a type
//! - **Class table**: [`ClassTable`], the arena of loaded [`TypeDescriptor`]s
//! - **Initialization**: [`InitCell`], the per-type state machine
//! - **Statics**: [`StaticStorage`]
//! - **Methods**: [`MethodSlot`] / [`MethodVersion`], the versioned
//!   indirection that redefinition swaps
//! - **Profiling**: [`HotnessCounter`] and [`InlineCache`]
//!
//! Nothing here executes code. The VM crate drives these structures.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod definition;
pub mod hotness;
pub mod init;
pub mod inline_cache;
pub mod method;
pub mod statics;
pub mod table;
pub mod types;

pub use definition::{MethodDef, MethodFlags, StaticFieldDef, TypeDefinition, TypeFlags};
pub use hotness::HotnessCounter;
pub use init::{InitAction, InitCell, InitState};
pub use inline_cache::{InlineCache, InlineCacheEntry, MAX_RECORDED_RECEIVERS};
pub use method::{CompileState, MethodSlot, MethodVersion};
pub use statics::StaticStorage;
pub use table::{ARRAY_NAME, CLASS_NAME, CLINIT_NAME, ClassTable, OBJECT_NAME};
pub use types::{TypeDescriptor, TypeKind};
