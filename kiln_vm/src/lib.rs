//! # Kiln VM
//!
//! Execution for the Kiln runtime: contexts, the interpreter, tier
//! promotion, deoptimization and live redefinition.
//!
//! ## Architecture
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!                        │            Runtime            │
//!                        │ ClassTable · Heap · CodeCache │
//!                        │ Compiler · Safepoints · Stats │
//!                        └──────────────┬───────────────┘
//!                                       │ attach
//!            ┌──────────────────────────┼──────────────────────────┐
//!            ▼                          ▼                          ▼
//!    ExecutionContext           ExecutionContext           ExecutionContext
//!     frames ──► interpreter ◄──── deopt ◄──── compiled ops
//!                  │  hotness / back edges        ▲
//!                  └──────────► tier policy ──────┘ compile + OSR
//! ```
//!
//! A frame runs either bytecode or compiled code for one
//! [`MethodVersion`](kiln_runtime::MethodVersion). Compiled code keeps the
//! interpreter's register layout, so entering it (at method entry or at a
//! loop header) and leaving it (deoptimization) never copy values between
//! representations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod deopt;
pub mod events;
pub mod frame;
pub mod handles;
pub mod natives;
pub mod redefine;
pub mod runtime;
pub mod safepoint;

mod init;
mod interpreter;
mod roots;
mod tiering;

pub use config::{ConfigError, DEFAULT_MAX_STACK_DEPTH, DeoptConfig, RuntimeConfig};
pub use context::ExecutionContext;
pub use deopt::{DeoptReason, DeoptStats};
pub use events::{FieldEvent, FieldWatch, NoEvents, RuntimeEvents};
pub use frame::{ActivationFrame, FrameInfo, Tier};
pub use handles::{Lookup, MethodHandle};
pub use natives::{NativeFn, NativeRegistry};
pub use redefine::ClassTransformer;
pub use runtime::Runtime;
pub use safepoint::{MutatorState, SafepointCoordinator, StopTheWorld};
