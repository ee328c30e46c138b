//! Register liveness over method bytecode.
//!
//! Classic backward dataflow, one bit per register per instruction:
//!
//! ```text
//!   live_out(pc) = ∪ live_in(s)  for every successor s of pc
//!   live_in(pc)  = uses(pc) ∪ (live_out(pc) − def(pc))
//! ```
//!
//! The analysis runs over the bytecode's full control-flow graph. No
//! branch is ever pruned, even when the compiled code later proves it
//! cannot be taken: a register read only on such a path is still live
//! before it. Deoptimization relies on this, since the interpreter
//! resuming at that point may take the path the compiled code ruled out.

use bitvec::prelude::*;
use kiln_core::bytecode::{CodeBody, Reg};

/// Per-instruction live-in sets of one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    registers: usize,
    live_in: Vec<BitVec>,
}

impl Liveness {
    /// Analyze `body`.
    pub fn compute(body: &CodeBody) -> Self {
        let registers = body.registers as usize;
        let len = body.instrs.len();
        let mut live_in: Vec<BitVec> = vec![bitvec![0; registers]; len];

        let mut changed = true;
        while changed {
            changed = false;
            for pc in (0..len).rev() {
                let instr = &body.instrs[pc];
                let mut live: BitVec = bitvec![0; registers];
                for succ in instr.successors(pc as u32) {
                    if let Some(succ_in) = live_in.get(succ as usize) {
                        for reg in succ_in.iter_ones() {
                            live.set(reg, true);
                        }
                    }
                }
                if let Some(def) = instr.def() {
                    live.set(def.index(), false);
                }
                for reg in instr.uses() {
                    live.set(reg.index(), true);
                }
                if live != live_in[pc] {
                    live_in[pc] = live;
                    changed = true;
                }
            }
        }

        Self {
            registers,
            live_in,
        }
    }

    /// Size of the register file.
    #[inline]
    pub fn registers(&self) -> usize {
        self.registers
    }

    /// Registers live on entry to `pc`.
    #[inline]
    pub fn live_in(&self, pc: u32) -> &BitSlice {
        self.live_in
            .get(pc as usize)
            .map(BitVec::as_bitslice)
            .unwrap_or_else(|| BitSlice::empty())
    }

    /// Whether `reg` is live on entry to `pc`.
    #[inline]
    pub fn is_live(&self, pc: u32, reg: Reg) -> bool {
        self.live_in(pc)
            .get(reg.index())
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    /// Registers live on entry to `pc`, in ascending order.
    pub fn live_registers(&self, pc: u32) -> Vec<Reg> {
        self.live_in(pc)
            .iter_ones()
            .map(|index| Reg(index as u16))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::bytecode::CodeBuilder;

    #[test]
    fn test_straight_line() {
        // r1 = 5; r2 = r0 + r1; return r2
        let mut b = CodeBuilder::new(1);
        b.const_int(Reg(1), 5)
            .add(Reg(2), Reg(0), Reg(1))
            .ret(Reg(2));
        let live = Liveness::compute(&b.finish().unwrap());

        assert_eq!(live.live_registers(0), vec![Reg(0)]);
        assert_eq!(live.live_registers(1), vec![Reg(0), Reg(1)]);
        assert_eq!(live.live_registers(2), vec![Reg(2)]);
    }

    #[test]
    fn test_loop_keeps_accumulator_live() {
        // r1 = 0 (i); r2 = 0 (sum); r3 = 1
        // head: r4 = r1 < r0; if !r4 goto end; r2 += r1; r1 += r3; goto head
        // end: return r2
        let mut b = CodeBuilder::new(1);
        let head = b.new_label();
        let end = b.new_label();
        b.const_int(Reg(1), 0)
            .const_int(Reg(2), 0)
            .const_int(Reg(3), 1)
            .bind(head)
            .lt(Reg(4), Reg(1), Reg(0))
            .jump_if_not(Reg(4), end)
            .add(Reg(2), Reg(2), Reg(1))
            .add(Reg(1), Reg(1), Reg(3))
            .jump(head)
            .bind(end)
            .ret(Reg(2));
        let live = Liveness::compute(&b.finish().unwrap());

        // At the loop header every loop-carried register is live.
        assert_eq!(
            live.live_registers(3),
            vec![Reg(0), Reg(1), Reg(2), Reg(3)]
        );
        assert!(!live.is_live(3, Reg(4)));
    }

    #[test]
    fn test_register_used_only_on_one_branch_is_live_before_it() {
        // r1 = 42; if r0 goto use; return r0; use: return r1
        let mut b = CodeBuilder::new(1);
        let use_it = b.new_label();
        b.const_int(Reg(1), 42)
            .jump_if(Reg(0), use_it)
            .ret(Reg(0))
            .bind(use_it)
            .ret(Reg(1));
        let live = Liveness::compute(&b.finish().unwrap());

        assert!(live.is_live(1, Reg(1)));
        assert!(!live.is_live(2, Reg(1)));
    }

    #[test]
    fn test_out_of_range_pc_is_empty() {
        let mut b = CodeBuilder::new(0);
        b.ret_void();
        let live = Liveness::compute(&b.finish().unwrap());
        assert!(live.live_registers(40).is_empty());
        assert_eq!(live.registers(), 0);
    }
}
