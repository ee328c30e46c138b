//! Deoptimization state capture.
//!
//! At a deopt point the compiled frame hands over only the registers its
//! state point lists as live. Everything else is dropped with the frame.

use kiln_core::bytecode::Reg;
use kiln_core::{CodeId, KilnError, KilnResult, Value};
use kiln_jit::{CompiledMethod, InvalidationReason};
use smallvec::SmallVec;

// =============================================================================
// Deopt Reason
// =============================================================================

/// Reason for deoptimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeoptReason {
    /// A guarded call saw a receiver class outside its inline cache.
    InlineCacheMiss = 0,
    /// A null check hoisted to a loop header failed.
    HoistedCheck = 1,
    /// The compiled code was invalidated, usually by a redefinition.
    Invalidated = 2,
    /// Deoptimization was requested explicitly.
    Explicit = 3,
}

/// Number of [`DeoptReason`] variants.
pub const REASON_COUNT: usize = 4;

impl DeoptReason {
    /// Convert from raw u8 value.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::InlineCacheMiss),
            1 => Some(Self::HoistedCheck),
            2 => Some(Self::Invalidated),
            3 => Some(Self::Explicit),
            _ => None,
        }
    }

    /// Whether a speculation turned out wrong. The code is discarded and
    /// the method re-warms with what the interpreter learns next.
    #[inline]
    pub const fn is_speculation_failure(self) -> bool {
        matches!(self, Self::InlineCacheMiss | Self::HoistedCheck)
    }

    /// The deopt reason for frames running code invalidated for `reason`.
    #[inline]
    pub const fn for_invalidation(reason: InvalidationReason) -> Self {
        match reason {
            InvalidationReason::Explicit => Self::Explicit,
            InvalidationReason::Redefinition | InvalidationReason::Deoptimized => {
                Self::Invalidated
            }
        }
    }
}

impl std::fmt::Display for DeoptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InlineCacheMiss => "inline cache miss",
            Self::HoistedCheck => "hoisted check",
            Self::Invalidated => "invalidated",
            Self::Explicit => "explicit",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Deopt State
// =============================================================================

/// The live value map of a compiled frame at a deopt point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptState {
    /// Bytecode pc to resume at.
    pub pc: u32,
    /// Why the frame is leaving compiled code.
    pub reason: DeoptReason,
    /// The compiled code being left.
    pub code_id: CodeId,
    /// Live registers and their values, ascending by register.
    pub values: SmallVec<[(Reg, Value); 8]>,
}

impl DeoptState {
    /// An empty state.
    pub fn new(pc: u32, reason: DeoptReason, code_id: CodeId) -> Self {
        Self {
            pc,
            reason,
            code_id,
            values: SmallVec::new(),
        }
    }

    /// Capture the registers live at `pc` according to the state point
    /// `code` recorded there.
    pub fn capture(
        code: &CompiledMethod,
        pc: u32,
        reason: DeoptReason,
        registers: &[Value],
    ) -> KilnResult<Self> {
        let point = code.state_point(pc).ok_or_else(|| {
            KilnError::internal(format!(
                "{} has no state point at pc {pc}",
                code.code_id()
            ))
        })?;
        let mut state = Self::new(pc, reason, code.code_id());
        for reg in point.live_registers() {
            let value = registers.get(reg.index()).copied().ok_or_else(|| {
                KilnError::internal(format!(
                    "live register {reg} outside the frame at pc {pc}"
                ))
            })?;
            state.values.push((reg, value));
        }
        Ok(state)
    }

    /// Record a value.
    #[inline]
    pub fn record(&mut self, reg: Reg, value: Value) {
        match self.values.iter_mut().find(|(r, _)| *r == reg) {
            Some(entry) => entry.1 = value,
            None => {
                self.values.push((reg, value));
                self.values.sort_by_key(|(r, _)| *r);
            }
        }
    }

    /// Captured value of `reg`.
    #[inline]
    pub fn get(&self, reg: Reg) -> Option<Value> {
        self.values
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, value)| *value)
    }

    /// Number of captured registers.
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was captured.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deopt_reason_from_u8() {
        assert_eq!(DeoptReason::from_u8(0), Some(DeoptReason::InlineCacheMiss));
        assert_eq!(DeoptReason::from_u8(3), Some(DeoptReason::Explicit));
        assert_eq!(DeoptReason::from_u8(200), None);
    }

    #[test]
    fn test_speculation_failures() {
        assert!(DeoptReason::InlineCacheMiss.is_speculation_failure());
        assert!(DeoptReason::HoistedCheck.is_speculation_failure());
        assert!(!DeoptReason::Invalidated.is_speculation_failure());
        assert_eq!(
            DeoptReason::for_invalidation(InvalidationReason::Redefinition),
            DeoptReason::Invalidated
        );
        assert_eq!(format!("{}", DeoptReason::HoistedCheck), "hoisted check");
    }

    #[test]
    fn test_record_keeps_order() {
        let mut state = DeoptState::new(4, DeoptReason::Explicit, CodeId::new(1));
        state.record(Reg(3), Value::int(30));
        state.record(Reg(1), Value::int(10));
        state.record(Reg(3), Value::int(31));
        assert_eq!(state.len(), 2);
        assert_eq!(state.values[0].0, Reg(1));
        assert_eq!(state.get(Reg(3)), Some(Value::int(31)));
        assert_eq!(state.get(Reg(2)), None);
    }
}
