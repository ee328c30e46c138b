//! Compiled method representation.
//!
//! A [`CompiledMethod`] keeps the bytecode's pc numbering: `ops[pc]` is the
//! compiled form of `instrs[pc]`. Most ops are the instruction itself; the
//! interesting ones replace a virtual call by a guarded direct call, a
//! constant, or a small polymorphic cache, and some branches are folded.
//! Keeping pcs aligned is what makes OSR entry and deoptimization a plain
//! register-file transfer.
//!
//! ```text
//!   pc   bytecode                      compiled
//!   3    r4 = r0.value()   ──────►     guard class(r0) == A; r4 = 7
//!   4    if r4 goto 9      ──────►     goto 9 (folded)
//! ```

use bitvec::prelude::*;
use kiln_core::bytecode::{Args, Instr, Reg};
use kiln_core::{CodeId, Symbol, TypeId};
use kiln_runtime::MethodVersion;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why compiled code stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InvalidationReason {
    /// A type the code depends on was redefined.
    Redefinition = 1,
    /// The code deoptimized on a failed speculation and was discarded.
    Deoptimized = 2,
    /// Discarded on request (shutdown, explicit flush).
    Explicit = 3,
}

impl InvalidationReason {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Redefinition),
            2 => Some(Self::Deoptimized),
            3 => Some(Self::Explicit),
            _ => None,
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Redefinition => "redefinition",
            Self::Deoptimized => "deoptimized",
            Self::Explicit => "explicit",
        };
        f.write_str(s)
    }
}

/// One receiver case of a polymorphic call site.
#[derive(Debug, Clone)]
pub struct PolyCase {
    /// Exact receiver class.
    pub receiver: TypeId,
    /// Method the class resolves to.
    pub target: Arc<MethodVersion>,
}

/// The compiled form of one bytecode instruction.
#[derive(Debug, Clone)]
pub enum CompiledOp {
    /// Executed exactly as the interpreter would.
    Generic(Instr),

    /// Virtual call speculated monomorphic. A receiver of any other class
    /// deoptimizes before the call.
    GuardedCall {
        /// Result register.
        dst: Option<Reg>,
        /// Arguments, receiver first.
        args: Args,
        /// The only class seen at this site.
        expected: TypeId,
        /// Its resolved target.
        target: Arc<MethodVersion>,
    },

    /// Guarded call to a method whose body only returns a constant,
    /// replaced by that constant.
    InlinedConstant {
        /// Result register.
        dst: Option<Reg>,
        /// Receiver register, still guarded.
        receiver: Reg,
        /// The only class seen at this site.
        expected: TypeId,
        /// The constant.
        value: i64,
    },

    /// Bounded polymorphic cache. A miss falls back to generic dispatch.
    PolymorphicCall {
        /// Result register.
        dst: Option<Reg>,
        /// Method name for the generic fallback.
        method: Symbol,
        /// Arguments, receiver first.
        args: Args,
        /// Cached cases.
        cases: SmallVec<[PolyCase; 4]>,
    },

    /// Conditional branch whose condition was known at compile time.
    /// `Some(target)` always jumps, `None` always falls through.
    FoldedBranch {
        /// Where control goes.
        taken: Option<u32>,
    },
}

impl CompiledOp {
    /// Whether executing this op depends on a speculated receiver class.
    #[inline]
    pub fn is_speculative(&self) -> bool {
        matches!(
            self,
            CompiledOp::GuardedCall { .. } | CompiledOp::InlinedConstant { .. }
        )
    }
}

/// A program point where the compiled frame can be rebuilt as an
/// interpreter frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePoint {
    /// Bytecode pc the interpreter resumes at.
    pub pc: u32,
    /// Registers whose values the interpreter needs at `pc`.
    pub live: BitVec,
}

impl StatePoint {
    /// Live registers in ascending order.
    pub fn live_registers(&self) -> impl Iterator<Item = Reg> + '_ {
        self.live.iter_ones().map(|index| Reg(index as u16))
    }
}

/// Compiled code for one method version.
pub struct CompiledMethod {
    pub(crate) method: Arc<MethodVersion>,
    pub(crate) ops: Vec<CompiledOp>,
    pub(crate) state_points: FxHashMap<u32, StatePoint>,
    pub(crate) header_checks: FxHashMap<u32, SmallVec<[Reg; 4]>>,
    pub(crate) dependencies: SmallVec<[TypeId; 4]>,
    pub(crate) targets: SmallVec<[Arc<MethodVersion>; 4]>,
    pub(crate) speculative: bool,
    invalidated: AtomicU8,
}

impl CompiledMethod {
    pub(crate) fn new(
        method: Arc<MethodVersion>,
        ops: Vec<CompiledOp>,
        state_points: FxHashMap<u32, StatePoint>,
        header_checks: FxHashMap<u32, SmallVec<[Reg; 4]>>,
        dependencies: SmallVec<[TypeId; 4]>,
        targets: SmallVec<[Arc<MethodVersion>; 4]>,
        speculative: bool,
    ) -> Self {
        Self {
            method,
            ops,
            state_points,
            header_checks,
            dependencies,
            targets,
            speculative,
            invalidated: AtomicU8::new(0),
        }
    }

    /// Code id of the compiled version.
    #[inline]
    pub fn code_id(&self) -> CodeId {
        self.method.code_id()
    }

    /// The method version this code was produced from.
    #[inline]
    pub fn method(&self) -> &Arc<MethodVersion> {
        &self.method
    }

    /// Compiled op at `pc`.
    #[inline]
    pub fn op(&self, pc: u32) -> Option<&CompiledOp> {
        self.ops.get(pc as usize)
    }

    /// Number of ops, equal to the bytecode length.
    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether there are no ops. Never true for compiled code.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// State point recorded at `pc`, if any.
    #[inline]
    pub fn state_point(&self, pc: u32) -> Option<&StatePoint> {
        self.state_points.get(&pc)
    }

    /// Number of recorded state points.
    #[inline]
    pub fn state_point_count(&self) -> usize {
        self.state_points.len()
    }

    /// Null checks hoisted to the loop header at `pc`.
    #[inline]
    pub fn header_checks(&self, pc: u32) -> &[Reg] {
        self.header_checks
            .get(&pc)
            .map(SmallVec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether `pc` is a loop header of this code.
    #[inline]
    pub fn is_loop_header(&self, pc: u32) -> bool {
        self.header_checks.contains_key(&pc)
    }

    /// Types whose redefinition invalidates this code.
    #[inline]
    pub fn dependencies(&self) -> &[TypeId] {
        &self.dependencies
    }

    /// Whether the code depends on `ty`.
    #[inline]
    pub fn depends_on(&self, ty: TypeId) -> bool {
        self.dependencies.contains(&ty)
    }

    /// Whether the compiled version, or any call target resolved into the
    /// code, has been replaced by a redefinition.
    pub fn is_stale(&self) -> bool {
        self.method.is_obsolete() || self.targets.iter().any(|target| target.is_obsolete())
    }

    /// Whether the code carries any speculation.
    #[inline]
    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    /// Whether frames may keep executing this code.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.invalidated.load(Ordering::Acquire) == 0
    }

    /// Why the code was invalidated, if it was.
    #[inline]
    pub fn invalidation(&self) -> Option<InvalidationReason> {
        InvalidationReason::from_u8(self.invalidated.load(Ordering::Acquire))
    }

    /// Invalidate the code. Returns true for the call that invalidated it.
    pub fn invalidate(&self, reason: InvalidationReason) -> bool {
        self.invalidated
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("code_id", &self.code_id())
            .field("method", self.method.name())
            .field("ops", &self.ops.len())
            .field("state_points", &self.state_points.len())
            .field("dependencies", &self.dependencies)
            .field("speculative", &self.speculative)
            .field("invalidation", &self.invalidation())
            .finish()
    }
}
