//! Deoptimization recovery.
//!
//! Rebuilds an interpreter register file from a captured [`DeoptState`]
//! and decides what happens to the method afterwards.
//!
//! The interpreter's own liveness at the resume pc is the authority on
//! which registers must be materialized. A register it needs that the
//! compiled frame did not hand over means the compiler and interpreter
//! disagree about the program, and no value may be made up for it.

use super::state::{DeoptReason, DeoptState};
use crate::config::DeoptConfig;
use kiln_core::bytecode::CodeBody;
use kiln_core::{KilnError, KilnResult, Value};
use kiln_jit::Liveness;
use kiln_runtime::MethodVersion;

/// What happened to the method after a deoptimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Compiled code was dropped; the method re-warms and may be
    /// compiled again with updated profiles.
    Rewarm,
    /// The method deoptimized too often and loses speculation.
    NoSpeculation,
    /// The code was invalidated from outside; nothing to learn.
    Unchanged,
}

/// Handles deoptimization recovery.
#[derive(Debug, Clone)]
pub struct DeoptRecovery {
    recompile_after_deopts: u32,
}

impl DeoptRecovery {
    /// Recovery using `config`.
    pub fn new(config: &DeoptConfig) -> Self {
        Self {
            recompile_after_deopts: config.recompile_after_deopts,
        }
    }

    /// The interpreter register file for resuming `body` at `state.pc`.
    ///
    /// Registers not live at the resume point start out null.
    pub fn reconstruct(&self, body: &CodeBody, state: &DeoptState) -> KilnResult<Vec<Value>> {
        if state.pc as usize >= body.len() {
            return Err(KilnError::internal(format!(
                "deopt of {} resumes at pc {} outside a body of {} instructions",
                state.code_id,
                state.pc,
                body.len()
            )));
        }
        let liveness = Liveness::compute(body);
        let mut registers = vec![Value::Null; body.registers as usize];
        for reg in liveness.live_registers(state.pc) {
            let value = state.get(reg).ok_or_else(|| {
                KilnError::internal(format!(
                    "deopt of {} at pc {}: live register {reg} has no value",
                    state.code_id, state.pc
                ))
            })?;
            registers[reg.index()] = value;
        }
        Ok(registers)
    }

    /// Update `method`'s compile policy after a deopt for `reason`.
    pub fn settle(&self, method: &MethodVersion, reason: DeoptReason) -> RecoveryOutcome {
        if !reason.is_speculation_failure() {
            return RecoveryOutcome::Unchanged;
        }
        let count = method.record_deopt();
        method.hotness().reset();
        if count >= self.recompile_after_deopts {
            method.disable_speculation();
            RecoveryOutcome::NoSpeculation
        } else {
            RecoveryOutcome::Rewarm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bytecode::{CodeBuilder, Reg};
    use kiln_core::{CodeId, TypeId};
    use kiln_runtime::{CompileState, MethodFlags};

    /// r1 = 42; if r0 goto use; return r0; use: return r1
    fn branchy() -> CodeBody {
        let mut b = CodeBuilder::new(1);
        let use_it = b.new_label();
        b.const_int(Reg(1), 42)
            .jump_if(Reg(0), use_it)
            .ret(Reg(0))
            .bind(use_it)
            .ret(Reg(1));
        b.finish().unwrap()
    }

    fn recovery() -> DeoptRecovery {
        DeoptRecovery::new(&DeoptConfig {
            recompile_after_deopts: 2,
        })
    }

    #[test]
    fn test_reconstruct_materializes_live_registers() {
        let body = branchy();
        let mut state = DeoptState::new(1, DeoptReason::Explicit, CodeId::new(1));
        state.record(Reg(0), Value::int(0));
        state.record(Reg(1), Value::int(42));

        let registers = recovery().reconstruct(&body, &state).unwrap();
        assert_eq!(registers, vec![Value::int(0), Value::int(42)]);
    }

    #[test]
    fn test_missing_live_register_is_internal_error() {
        // r1 is only read on the taken branch, which compiled code might
        // have proven dead. It must still be handed over.
        let body = branchy();
        let mut state = DeoptState::new(1, DeoptReason::Explicit, CodeId::new(1));
        state.record(Reg(0), Value::int(0));

        let err = recovery().reconstruct(&body, &state).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("r1"));
    }

    #[test]
    fn test_dead_registers_start_null() {
        let body = branchy();
        let mut state = DeoptState::new(2, DeoptReason::Explicit, CodeId::new(1));
        state.record(Reg(0), Value::int(5));
        let registers = recovery().reconstruct(&body, &state).unwrap();
        assert_eq!(registers[1], Value::Null);
    }

    #[test]
    fn test_settle_disables_speculation_after_limit() {
        let mut b = CodeBuilder::new(0);
        b.ret_void();
        let method = MethodVersion::new(
            CodeId::new(1),
            TypeId::from_raw(3),
            "m".into(),
            MethodFlags::STATIC,
            b.finish().unwrap(),
        );
        let recovery = recovery();
        method.hotness().increment();

        assert_eq!(
            recovery.settle(&method, DeoptReason::Invalidated),
            RecoveryOutcome::Unchanged
        );
        assert_eq!(method.hotness().value(), 1);

        assert_eq!(
            recovery.settle(&method, DeoptReason::InlineCacheMiss),
            RecoveryOutcome::Rewarm
        );
        assert_eq!(method.hotness().value(), 0);
        assert_eq!(
            recovery.settle(&method, DeoptReason::HoistedCheck),
            RecoveryOutcome::NoSpeculation
        );
        assert_eq!(method.compile_state(), CompileState::NoSpeculation);
    }
}
