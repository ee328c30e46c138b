//! Natural loops and loop-invariant object checks.
//!
//! A loop is found for every backward branch `source → header`: its body
//! is the header plus every instruction that reaches `source` without
//! passing through the header. Loops sharing a header are merged.

use bitvec::prelude::*;
use kiln_core::bytecode::{CodeBody, Instr, Reg};
use smallvec::SmallVec;

/// One natural loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    /// Loop header (target of the backward branches).
    pub header: u32,
    /// Sources of the backward branches.
    pub back_edges: SmallVec<[u32; 2]>,
    /// Instructions in the loop, header included.
    pub body: BitVec,
}

impl LoopInfo {
    /// Whether `pc` is inside the loop.
    #[inline]
    pub fn contains(&self, pc: u32) -> bool {
        self.body.get(pc as usize).map(|bit| *bit).unwrap_or(false)
    }

    /// Number of instructions in the loop.
    #[inline]
    pub fn len(&self) -> usize {
        self.body.count_ones()
    }

    /// Whether the loop is empty. Never true for a discovered loop.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers dereferenced as an object or array inside the loop and
    /// never written inside it. A null check on these can be done once at
    /// the header.
    pub fn invariant_dereferences(&self, body: &CodeBody) -> SmallVec<[Reg; 4]> {
        let mut written: BitVec = bitvec![0; body.registers as usize];
        for pc in self.body.iter_ones() {
            if let Some(def) = body.instrs[pc].def() {
                written.set(def.index(), true);
            }
        }

        let mut out: SmallVec<[Reg; 4]> = SmallVec::new();
        for pc in self.body.iter_ones() {
            if let Some(reg) = dereferenced(&body.instrs[pc]) {
                if !written[reg.index()] && !out.contains(&reg) {
                    out.push(reg);
                }
            }
        }
        out.sort();
        out
    }
}

/// The register an instruction dereferences, if any.
fn dereferenced(instr: &Instr) -> Option<Reg> {
    match instr {
        Instr::GetField { object, .. } | Instr::PutField { object, .. } => Some(*object),
        Instr::ArrayLength { array, .. }
        | Instr::ArrayGet { array, .. }
        | Instr::ArraySet { array, .. } => Some(*array),
        _ => None,
    }
}

/// Find every loop of `body`, ordered by header.
pub fn find_loops(body: &CodeBody) -> Vec<LoopInfo> {
    let len = body.instrs.len();
    let mut preds: Vec<SmallVec<[u32; 2]>> = vec![SmallVec::new(); len];
    for (pc, instr) in body.instrs.iter().enumerate() {
        for succ in instr.successors(pc as u32) {
            if let Some(list) = preds.get_mut(succ as usize) {
                list.push(pc as u32);
            }
        }
    }

    let mut loops: Vec<LoopInfo> = Vec::new();
    for (source, header) in body.back_edges() {
        let mut members: BitVec = bitvec![0; len];
        members.set(header as usize, true);
        let mut work = vec![source];
        while let Some(pc) = work.pop() {
            if members[pc as usize] {
                continue;
            }
            members.set(pc as usize, true);
            work.extend(preds[pc as usize].iter().copied());
        }

        match loops.iter_mut().find(|l| l.header == header) {
            Some(existing) => {
                existing.back_edges.push(source);
                for pc in members.iter_ones() {
                    existing.body.set(pc, true);
                }
            }
            None => loops.push(LoopInfo {
                header,
                back_edges: SmallVec::from_slice(&[source]),
                body: members,
            }),
        }
    }
    loops.sort_by_key(|l| l.header);
    loops
}
