//! Deoptimization.
//!
//! Moves a compiled frame back to the interpreter when an assumption the
//! compiled code made no longer holds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          Deopt Path                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  1. Guard fails (receiver class, hoisted null check) or the code    │
//! │     was invalidated; the frame is at a state point                  │
//! │                                                                     │
//! │  2. Capture the live value map                                      │
//! │     DeoptState { pc, reason, values: [(reg, value), ...] }          │
//! │                                                                     │
//! │  3. Rebuild the register file from the interpreter's liveness;      │
//! │     a live register without a value is an internal error            │
//! │                                                                     │
//! │  4. Replace the compiled frame with an interpreted one at pc        │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod recovery;
pub mod state;
pub mod stats;

pub use recovery::{DeoptRecovery, RecoveryOutcome};
pub use state::{DeoptReason, DeoptState, REASON_COUNT};
pub use stats::{DeoptSiteKey, DeoptStats, SiteSnapshot};
