//! Builder for bytecode emission.
//!
//! The `CodeBuilder` emits instructions, tracks the register high-water
//! mark and resolves labels, then verifies the finished body.

use super::verify::verify_body;
use super::{Args, CodeBody, Instr, Reg};
use crate::error::{KilnError, KilnResult};
use crate::ids::Symbol;

/// A label for jump targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

/// Placeholder target written until the label is bound.
const UNRESOLVED: u32 = u32::MAX;

/// Builder for constructing method bodies.
///
/// # Example
/// ```
/// use kiln_core::bytecode::{CodeBuilder, Reg};
///
/// let mut b = CodeBuilder::new(1);
/// let done = b.new_label();
/// b.const_int(Reg(1), 0)
///     .jump_if_not(Reg(0), done)
///     .const_int(Reg(1), 7)
///     .bind(done)
///     .ret(Reg(1));
/// let body = b.finish().unwrap();
/// assert_eq!(body.registers, 2);
/// ```
#[derive(Debug)]
pub struct CodeBuilder {
    /// Emitted instructions.
    instrs: Vec<Instr>,
    /// Number of parameters.
    params: u16,
    /// Maximum register used plus one.
    registers: u16,
    /// Bound label positions, indexed by label number.
    labels: Vec<Option<u32>>,
    /// Instructions whose target still names a label.
    fixups: Vec<(usize, Label)>,
}

impl CodeBuilder {
    /// Create a builder for a body taking `params` parameters.
    pub fn new(params: u16) -> Self {
        Self {
            instrs: Vec::new(),
            params,
            registers: params,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Current emission position.
    #[inline]
    pub fn pc(&self) -> u32 {
        self.instrs.len() as u32
    }

    // =========================================================================
    // Labels
    // =========================================================================

    /// Create a new, unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let pc = self.pc();
        self.labels[label.0 as usize] = Some(pc);
        self
    }

    /// Unconditional jump to `label`.
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.fixups.push((self.instrs.len(), label));
        self.emit(Instr::Jump { target: UNRESOLVED })
    }

    /// Jump to `label` when `cond` is truthy.
    pub fn jump_if(&mut self, cond: Reg, label: Label) -> &mut Self {
        self.fixups.push((self.instrs.len(), label));
        self.emit(Instr::JumpIf {
            cond,
            target: UNRESOLVED,
        })
    }

    /// Jump to `label` when `cond` is falsy.
    pub fn jump_if_not(&mut self, cond: Reg, label: Label) -> &mut Self {
        self.fixups.push((self.instrs.len(), label));
        self.emit(Instr::JumpIfNot {
            cond,
            target: UNRESOLVED,
        })
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit a raw instruction.
    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        if let Some(dst) = instr.def() {
            self.touch(dst);
        }
        for reg in instr.uses() {
            self.touch(reg);
        }
        self.instrs.push(instr);
        self
    }

    #[inline]
    fn touch(&mut self, reg: Reg) {
        self.registers = self.registers.max(reg.0 + 1);
    }

    /// `dst = value`
    pub fn const_int(&mut self, dst: Reg, value: i64) -> &mut Self {
        self.emit(Instr::Const { dst, value })
    }

    /// `dst = null`
    pub fn null(&mut self, dst: Reg) -> &mut Self {
        self.emit(Instr::Null { dst })
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.emit(Instr::Move { dst, src })
    }

    /// `dst = lhs + rhs`
    pub fn add(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Add { dst, lhs, rhs })
    }

    /// `dst = lhs - rhs`
    pub fn sub(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Sub { dst, lhs, rhs })
    }

    /// `dst = lhs * rhs`
    pub fn mul(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Mul { dst, lhs, rhs })
    }

    /// `dst = lhs / rhs`
    pub fn div(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Div { dst, lhs, rhs })
    }

    /// `dst = lhs < rhs`
    pub fn lt(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Lt { dst, lhs, rhs })
    }

    /// `dst = lhs == rhs`
    pub fn eq(&mut self, dst: Reg, lhs: Reg, rhs: Reg) -> &mut Self {
        self.emit(Instr::Eq { dst, lhs, rhs })
    }

    /// `dst = new ty`
    pub fn new_object(&mut self, dst: Reg, ty: &str) -> &mut Self {
        self.emit(Instr::New { dst, ty: ty.into() })
    }

    /// `dst = new [length]`
    pub fn new_array(&mut self, dst: Reg, length: Reg) -> &mut Self {
        self.emit(Instr::NewArray { dst, length })
    }

    /// `dst = array.length`
    pub fn array_length(&mut self, dst: Reg, array: Reg) -> &mut Self {
        self.emit(Instr::ArrayLength { dst, array })
    }

    /// `dst = array[index]`
    pub fn array_get(&mut self, dst: Reg, array: Reg, index: Reg) -> &mut Self {
        self.emit(Instr::ArrayGet { dst, array, index })
    }

    /// `array[index] = src`
    pub fn array_set(&mut self, array: Reg, index: Reg, src: Reg) -> &mut Self {
        self.emit(Instr::ArraySet { array, index, src })
    }

    /// `dst = object.field`
    pub fn get_field(&mut self, dst: Reg, object: Reg, field: &str) -> &mut Self {
        self.emit(Instr::GetField {
            dst,
            object,
            field: field.into(),
        })
    }

    /// `object.field = src`
    pub fn put_field(&mut self, object: Reg, field: &str, src: Reg) -> &mut Self {
        self.emit(Instr::PutField {
            object,
            field: field.into(),
            src,
        })
    }

    /// `dst = ty.field`
    pub fn get_static(&mut self, dst: Reg, ty: &str, field: &str) -> &mut Self {
        self.emit(Instr::GetStatic {
            dst,
            ty: ty.into(),
            field: field.into(),
        })
    }

    /// `ty.field = src`
    pub fn put_static(&mut self, ty: &str, field: &str, src: Reg) -> &mut Self {
        self.emit(Instr::PutStatic {
            ty: ty.into(),
            field: field.into(),
            src,
        })
    }

    /// Virtual call; `args[0]` is the receiver.
    pub fn invoke_virtual(&mut self, dst: Option<Reg>, method: &str, args: &[Reg]) -> &mut Self {
        self.emit(Instr::InvokeVirtual {
            dst,
            method: method.into(),
            args: Args::from_slice(args),
        })
    }

    /// Non-virtual call resolved from `ty`; `args[0]` is the receiver.
    pub fn invoke_special(
        &mut self,
        dst: Option<Reg>,
        ty: &str,
        method: &str,
        args: &[Reg],
    ) -> &mut Self {
        self.emit(Instr::InvokeSpecial {
            dst,
            ty: ty.into(),
            method: method.into(),
            args: Args::from_slice(args),
        })
    }

    /// Static call.
    pub fn invoke_static(
        &mut self,
        dst: Option<Reg>,
        ty: &str,
        method: &str,
        args: &[Reg],
    ) -> &mut Self {
        self.emit(Instr::InvokeStatic {
            dst,
            ty: ty.into(),
            method: method.into(),
            args: Args::from_slice(args),
        })
    }

    /// Host function call.
    pub fn invoke_native(&mut self, dst: Option<Reg>, name: &str, args: &[Reg]) -> &mut Self {
        self.emit(Instr::InvokeNative {
            dst,
            name: name.into(),
            args: Args::from_slice(args),
        })
    }

    /// `dst = object instanceof ty`
    pub fn instance_of(&mut self, dst: Reg, object: Reg, ty: &str) -> &mut Self {
        self.emit(Instr::InstanceOf {
            dst,
            object,
            ty: ty.into(),
        })
    }

    /// Throw a managed exception.
    pub fn throw(&mut self, class: &str, message: Option<&str>) -> &mut Self {
        self.emit(Instr::Throw {
            class: class.into(),
            message: message.map(Symbol::from),
        })
    }

    /// Return `src`.
    pub fn ret(&mut self, src: Reg) -> &mut Self {
        self.emit(Instr::Return { src })
    }

    /// Return without a value.
    pub fn ret_void(&mut self) -> &mut Self {
        self.emit(Instr::ReturnVoid)
    }

    // =========================================================================
    // Finish
    // =========================================================================

    /// Resolve labels and verify the body.
    pub fn finish(mut self) -> KilnResult<CodeBody> {
        for (index, label) in std::mem::take(&mut self.fixups) {
            let pc = self.labels[label.0 as usize].ok_or_else(|| {
                KilnError::verification(format!("label {} was never bound", label.0))
            })?;
            match &mut self.instrs[index] {
                Instr::Jump { target }
                | Instr::JumpIf { target, .. }
                | Instr::JumpIfNot { target, .. } => *target = pc,
                other => {
                    return Err(KilnError::internal(format!(
                        "label fixup points at non-branch {other:?}"
                    )));
                }
            }
        }

        let body = CodeBody {
            registers: self.registers,
            params: self.params,
            instrs: self.instrs,
        };
        verify_body(&body)?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_loop() {
        // r0 = 0; r1 = 10; r2 = 1
        // loop: r3 = r0 < r1; if !r3 goto end; r0 = r0 + r2; goto loop
        // end: return r0
        let mut b = CodeBuilder::new(0);
        let head = b.new_label();
        let end = b.new_label();
        b.const_int(Reg(0), 0)
            .const_int(Reg(1), 10)
            .const_int(Reg(2), 1)
            .bind(head)
            .lt(Reg(3), Reg(0), Reg(1))
            .jump_if_not(Reg(3), end)
            .add(Reg(0), Reg(0), Reg(2))
            .jump(head)
            .bind(end)
            .ret(Reg(0));

        let body = b.finish().unwrap();
        assert_eq!(body.registers, 4);
        assert_eq!(body.instrs[4], Instr::JumpIfNot { cond: Reg(3), target: 7 });
        assert_eq!(body.instrs[6], Instr::Jump { target: 3 });
    }

    #[test]
    fn test_unbound_label_is_rejected() {
        let mut b = CodeBuilder::new(0);
        let nowhere = b.new_label();
        b.jump(nowhere);
        let err = b.finish().unwrap_err();
        assert!(matches!(err, KilnError::Verification { .. }));
    }

    #[test]
    fn test_params_count_as_registers() {
        let mut b = CodeBuilder::new(3);
        b.ret_void();
        assert_eq!(b.finish().unwrap().registers, 3);
    }
}
