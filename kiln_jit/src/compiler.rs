//! The speculative compiler.
//!
//! Compilation is a sequence of small passes over one method version:
//!
//! 1. **Call specialization** - each profiled virtual call site becomes a
//!    guarded call, an inlined constant or a polymorphic cache.
//! 2. **Branch folding** - conditional branches on a register holding a
//!    block-local constant become unconditional.
//! 3. **Check hoisting** - null checks on loop-invariant object registers
//!    move to the loop header.
//! 4. **State points** - liveness over the *bytecode* CFG is recorded at
//!    every point the compiled frame may hand control back.
//!
//! Folding only changes the compiled ops. Liveness is always computed on
//! the unmodified bytecode, so a register read on a folded-away path stays
//! live at every state point before it.

use crate::compiled::{CompiledMethod, CompiledOp, PolyCase, StatePoint};
use crate::config::JitConfig;
use crate::liveness::Liveness;
use crate::loops::find_loops;
use bitvec::prelude::*;
use kiln_core::bytecode::{Args, CodeBody, Instr, Reg};
use kiln_core::{KilnError, Symbol, TypeId};
use kiln_runtime::{ClassTable, CompileState, MethodVersion};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why a method could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The compiled tier is turned off.
    #[error("compilation is disabled")]
    Disabled,

    /// The version was superseded by a redefinition.
    #[error("{method} is obsolete")]
    Obsolete {
        /// Method name.
        method: Symbol,
    },

    /// The version is marked never-compile.
    #[error("{method} is not compilable")]
    NotCompilable {
        /// Method name.
        method: Symbol,
    },

    /// The body exceeds `max_compiled_instructions`.
    #[error("{method} has {len} instructions, limit is {limit}")]
    TooLarge {
        /// Method name.
        method: Symbol,
        /// Body length.
        len: usize,
        /// Configured limit.
        limit: usize,
    },
}

impl CompileError {
    /// Whether retrying later can never succeed.
    #[inline]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            CompileError::NotCompilable { .. } | CompileError::TooLarge { .. }
        )
    }
}

impl From<CompileError> for KilnError {
    fn from(err: CompileError) -> Self {
        KilnError::compilation(err.to_string())
    }
}

/// Produces [`CompiledMethod`]s from method versions.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: JitConfig,
}

impl Compiler {
    /// A compiler using `config`.
    pub fn new(config: JitConfig) -> Self {
        Self { config }
    }

    /// The configuration.
    #[inline]
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile `method`, speculating on its inline caches unless the
    /// method has lost speculation.
    pub fn compile(
        &self,
        table: &ClassTable,
        method: &Arc<MethodVersion>,
    ) -> Result<CompiledMethod, CompileError> {
        if !self.config.enabled {
            return Err(CompileError::Disabled);
        }
        if method.is_obsolete() {
            return Err(CompileError::Obsolete {
                method: method.name().clone(),
            });
        }
        let speculate = match method.compile_state() {
            CompileState::Eligible => true,
            CompileState::NoSpeculation => false,
            CompileState::Never => {
                return Err(CompileError::NotCompilable {
                    method: method.name().clone(),
                });
            }
        };
        let body = method.body();
        if body.len() > self.config.max_compiled_instructions {
            return Err(CompileError::TooLarge {
                method: method.name().clone(),
                len: body.len(),
                limit: self.config.max_compiled_instructions,
            });
        }

        let mut dependencies: SmallVec<[TypeId; 4]> = SmallVec::new();
        dependencies.push(method.declaring());
        let mut targets: SmallVec<[Arc<MethodVersion>; 4]> = SmallVec::new();

        let mut ops = Vec::with_capacity(body.len());
        for (pc, instr) in body.instrs.iter().enumerate() {
            let op = match instr {
                Instr::InvokeVirtual {
                    dst,
                    method: name,
                    args,
                } => self.specialize_call(
                    table,
                    method,
                    pc as u32,
                    *dst,
                    name,
                    args,
                    speculate,
                    &mut dependencies,
                    &mut targets,
                ),
                other => CompiledOp::Generic(other.clone()),
            };
            ops.push(op);
        }

        fold_branches(body, &mut ops);

        let loops = find_loops(body);
        let mut header_checks: FxHashMap<u32, SmallVec<[Reg; 4]>> = FxHashMap::default();
        for info in &loops {
            let checks = if speculate {
                info.invariant_dereferences(body)
            } else {
                SmallVec::new()
            };
            header_checks.insert(info.header, checks);
        }

        let state_points = state_points(body, &ops, &header_checks);
        let speculative = ops.iter().any(CompiledOp::is_speculative)
            || header_checks.values().any(|checks| !checks.is_empty());

        debug!(
            method = %method.name(),
            code_id = %method.code_id(),
            speculative,
            loops = loops.len(),
            state_points = state_points.len(),
            "method compiled"
        );

        Ok(CompiledMethod::new(
            Arc::clone(method),
            ops,
            state_points,
            header_checks,
            dependencies,
            targets,
            speculative,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn specialize_call(
        &self,
        table: &ClassTable,
        method: &MethodVersion,
        pc: u32,
        dst: Option<Reg>,
        name: &Symbol,
        args: &Args,
        speculate: bool,
        dependencies: &mut SmallVec<[TypeId; 4]>,
        targets: &mut SmallVec<[Arc<MethodVersion>; 4]>,
    ) -> CompiledOp {
        let generic = || CompiledOp::Generic(Instr::InvokeVirtual {
            dst,
            method: name.clone(),
            args: args.clone(),
        });

        let Some(entry) = method.inline_cache().entry(pc) else {
            return generic();
        };
        if entry.megamorphic || entry.receivers.len() > self.config.max_polymorphic_targets {
            return generic();
        }

        let mut cases: SmallVec<[PolyCase; 4]> = SmallVec::new();
        for receiver in entry.receivers.iter().copied() {
            match table.resolve_virtual(receiver, name) {
                Ok(target) if target.arity() == args.len() => {
                    cases.push(PolyCase { receiver, target });
                }
                _ => return generic(),
            }
        }
        if cases.is_empty() {
            return generic();
        }

        for case in &cases {
            add_dependency(dependencies, case.receiver);
            add_dependency(dependencies, case.target.declaring());
            targets.push(Arc::clone(&case.target));
        }

        if speculate && cases.len() == 1 {
            let PolyCase { receiver, target } = cases.remove(0);
            if self.config.inline_trivial_targets {
                if let Some(value) = trivial_constant(target.body()) {
                    return CompiledOp::InlinedConstant {
                        dst,
                        receiver: args[0],
                        expected: receiver,
                        value,
                    };
                }
            }
            return CompiledOp::GuardedCall {
                dst,
                args: args.clone(),
                expected: receiver,
                target,
            };
        }

        CompiledOp::PolymorphicCall {
            dst,
            method: name.clone(),
            args: args.clone(),
            cases,
        }
    }
}

fn add_dependency(dependencies: &mut SmallVec<[TypeId; 4]>, ty: TypeId) {
    if !dependencies.contains(&ty) {
        dependencies.push(ty);
    }
}

/// The constant a body returns, if the body is exactly
/// `rN = const; return rN`.
fn trivial_constant(body: &CodeBody) -> Option<i64> {
    match body.instrs.as_slice() {
        [Instr::Const { dst, value }, Instr::Return { src }] if dst == src => Some(*value),
        _ => None,
    }
}

/// Fold conditional branches whose condition is a constant established
/// earlier in the same basic block.
fn fold_branches(body: &CodeBody, ops: &mut [CompiledOp]) {
    let len = body.instrs.len();
    let mut leaders: BitVec = bitvec![0; len];
    if len > 0 {
        leaders.set(0, true);
    }
    for (pc, instr) in body.instrs.iter().enumerate() {
        if let Some(target) = instr.branch_target() {
            if (target as usize) < len {
                leaders.set(target as usize, true);
            }
        }
        let ends_block = instr.branch_target().is_some() || !instr.falls_through();
        if ends_block && pc + 1 < len {
            leaders.set(pc + 1, true);
        }
    }

    let mut known: FxHashMap<Reg, i64> = FxHashMap::default();
    for pc in 0..len {
        if leaders[pc] {
            known.clear();
        }
        // Some(taken) when the branch at pc folds.
        let folded: Option<Option<u32>> = match &ops[pc] {
            CompiledOp::Generic(Instr::Const { dst, value }) => {
                known.insert(*dst, *value);
                None
            }
            CompiledOp::InlinedConstant {
                dst: Some(dst),
                value,
                ..
            } => {
                known.insert(*dst, *value);
                None
            }
            CompiledOp::Generic(Instr::JumpIf { cond, target }) => {
                known.get(cond).map(|value| (*value != 0).then_some(*target))
            }
            CompiledOp::Generic(Instr::JumpIfNot { cond, target }) => {
                known.get(cond).map(|value| (*value == 0).then_some(*target))
            }
            other => {
                if let Some(def) = op_def(other) {
                    known.remove(&def);
                }
                None
            }
        };
        if let Some(taken) = folded {
            ops[pc] = CompiledOp::FoldedBranch { taken };
        }
    }
}

fn op_def(op: &CompiledOp) -> Option<Reg> {
    match op {
        CompiledOp::Generic(instr) => instr.def(),
        CompiledOp::GuardedCall { dst, .. }
        | CompiledOp::InlinedConstant { dst, .. }
        | CompiledOp::PolymorphicCall { dst, .. } => *dst,
        CompiledOp::FoldedBranch { .. } => None,
    }
}

/// Record interpreter liveness at entry, loop headers and around every
/// call or guard.
fn state_points(
    body: &CodeBody,
    ops: &[CompiledOp],
    header_checks: &FxHashMap<u32, SmallVec<[Reg; 4]>>,
) -> FxHashMap<u32, StatePoint> {
    let liveness = Liveness::compute(body);
    let len = body.instrs.len() as u32;
    let mut pcs: Vec<u32> = vec![0];
    pcs.extend(header_checks.keys().copied());
    for (pc, op) in ops.iter().enumerate() {
        let pc = pc as u32;
        let calls = match op {
            CompiledOp::Generic(instr) => instr.is_invoke(),
            CompiledOp::FoldedBranch { .. } => false,
            _ => true,
        };
        if calls {
            pcs.push(pc);
            if pc + 1 < len {
                pcs.push(pc + 1);
            }
        }
    }

    pcs.into_iter()
        .map(|pc| {
            let live = liveness.live_in(pc).to_bitvec();
            (pc, StatePoint { pc, live })
        })
        .collect()
}
