//! # Kiln Core
//!
//! Core types shared across all Kiln components:
//!
//! - **Values**: the tagged `Value` representation used by registers,
//!   fields, statics and array elements
//! - **Identifiers**: `TypeId`, `ObjectId`, `CodeId`, `ContextId`
//! - **Error Handling**: the unified `KilnError` / `KilnResult`
//! - **Bytecode**: the register instruction set, a label-aware builder
//!   and a structural verifier

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bytecode;
pub mod error;
pub mod ids;
pub mod value;

pub use error::{KilnError, KilnResult, RedefinitionFailure, Throwable};
pub use ids::{CodeId, ContextId, ObjectId, Symbol, TypeId};
pub use value::Value;

/// Kiln runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
