//! # Kiln JIT
//!
//! The compiled tier of the Kiln runtime.
//!
//! ## Architecture
//!
//! ```text
//!  MethodVersion ──► Compiler ──► CompiledMethod ──► CodeCache
//!   (bytecode,        │  ├─ call specialization      (by CodeId,
//!    inline cache)    │  ├─ branch folding            by dependency)
//!                     │  ├─ check hoisting
//!                     │  └─ state points ◄── Liveness (full CFG)
//!                     └── LoopInfo
//! ```
//!
//! Compiled code keeps bytecode pc numbering, so the VM executes it with
//! the same register file as the interpreter and can switch tiers at any
//! state point.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod code_cache;
pub mod compiled;
pub mod compiler;
pub mod config;
pub mod liveness;
pub mod loops;

pub use code_cache::{CodeCache, CodeCacheStats};
pub use compiled::{CompiledMethod, CompiledOp, InvalidationReason, PolyCase, StatePoint};
pub use compiler::{CompileError, Compiler};
pub use config::{DEFAULT_HOTNESS_THRESHOLD, DEFAULT_OSR_THRESHOLD, JitConfig};
pub use liveness::Liveness;
pub use loops::{LoopInfo, find_loops};
