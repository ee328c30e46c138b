//! Structural verification of method bodies.
//!
//! This is not bytecode type verification. It guarantees only what the
//! interpreter and compiler rely on to index safely: registers inside the
//! register file, branch targets inside the body, and no path that runs
//! past the last instruction.

use super::{CodeBody, Instr};
use crate::error::{KilnError, KilnResult};

/// Verify the shape of `body`.
pub fn verify_body(body: &CodeBody) -> KilnResult<()> {
    if body.instrs.is_empty() {
        return Err(KilnError::verification("method body is empty"));
    }
    if body.params > body.registers {
        return Err(KilnError::verification(format!(
            "{} parameters do not fit in {} registers",
            body.params, body.registers
        )));
    }

    let len = body.instrs.len() as u32;
    for (pc, instr) in body.instrs.iter().enumerate() {
        let pc = pc as u32;
        check_registers(body, pc, instr)?;

        if let Some(target) = instr.branch_target() {
            if target >= len {
                return Err(KilnError::verification(format!(
                    "pc {pc}: branch target {target} outside body of length {len}"
                )));
            }
        }
        if instr.falls_through() && pc + 1 == len {
            return Err(KilnError::verification(format!(
                "pc {pc}: execution can fall off the end of the body"
            )));
        }
    }
    Ok(())
}

fn check_registers(body: &CodeBody, pc: u32, instr: &Instr) -> KilnResult<()> {
    let defs = instr.def().into_iter();
    for reg in defs.chain(instr.uses()) {
        if reg.0 >= body.registers {
            return Err(KilnError::verification(format!(
                "pc {pc}: register {reg} outside register file of size {}",
                body.registers
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Reg;

    fn body(registers: u16, instrs: Vec<Instr>) -> CodeBody {
        CodeBody {
            registers,
            params: 0,
            instrs,
        }
    }

    #[test]
    fn test_valid_body() {
        let b = body(1, vec![Instr::Const { dst: Reg(0), value: 1 }, Instr::Return { src: Reg(0) }]);
        assert!(verify_body(&b).is_ok());
    }

    #[test]
    fn test_register_out_of_range() {
        let b = body(1, vec![Instr::Return { src: Reg(4) }]);
        let err = verify_body(&b).unwrap_err();
        assert!(err.to_string().contains("register r4"));
    }

    #[test]
    fn test_branch_out_of_range() {
        let b = body(0, vec![Instr::Jump { target: 9 }]);
        assert!(verify_body(&b).is_err());
    }

    #[test]
    fn test_fall_off_end() {
        let b = body(1, vec![Instr::Const { dst: Reg(0), value: 1 }]);
        let err = verify_body(&b).unwrap_err();
        assert!(err.to_string().contains("fall off"));
    }

    #[test]
    fn test_empty_body() {
        assert!(verify_body(&body(0, Vec::new())).is_err());
    }
}
