//! Register bytecode for Kiln method bodies.
//!
//! Every method body is a flat `Vec<Instr>` over a fixed register file.
//! Parameters arrive in `r0..params`. Types, fields and methods are named
//! symbolically and resolved when the instruction executes, so a body can
//! be verified and compiled without any other type being loaded.

mod builder;
mod verify;

pub use builder::{CodeBuilder, Label};
pub use verify::verify_body;

use crate::ids::Symbol;
use smallvec::SmallVec;
use std::fmt;

/// A register index in a method's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u16);

impl Reg {
    /// Index into the register file.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Argument registers of an invoke. The receiver, if any, is first.
pub type Args = SmallVec<[Reg; 4]>;

/// A single bytecode instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// `dst = value`
    Const {
        /// Destination.
        dst: Reg,
        /// The constant.
        value: i64,
    },
    /// `dst = null`
    Null {
        /// Destination.
        dst: Reg,
    },
    /// `dst = src`
    Move {
        /// Destination.
        dst: Reg,
        /// Source.
        src: Reg,
    },
    /// `dst = lhs + rhs` (wrapping)
    Add {
        /// Destination.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs - rhs` (wrapping)
    Sub {
        /// Destination.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs * rhs` (wrapping)
    Mul {
        /// Destination.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs / rhs`, throws on zero divisor.
    Div {
        /// Destination.
        dst: Reg,
        /// Dividend.
        lhs: Reg,
        /// Divisor.
        rhs: Reg,
    },
    /// `dst = lhs < rhs`
    Lt {
        /// Destination, 1 or 0.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs == rhs` (integers by value, references by identity)
    Eq {
        /// Destination, 1 or 0.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// Unconditional jump.
    Jump {
        /// Target pc.
        target: u32,
    },
    /// Jump when `cond` is truthy.
    JumpIf {
        /// Condition register.
        cond: Reg,
        /// Target pc.
        target: u32,
    },
    /// Jump when `cond` is falsy.
    JumpIfNot {
        /// Condition register.
        cond: Reg,
        /// Target pc.
        target: u32,
    },
    /// Allocate an instance of `ty` (initializes `ty`).
    New {
        /// Receives the new object.
        dst: Reg,
        /// Type to instantiate.
        ty: Symbol,
    },
    /// Allocate a reference array of `length` nulls.
    NewArray {
        /// Receives the new array.
        dst: Reg,
        /// Element count.
        length: Reg,
    },
    /// `dst = array.length`
    ArrayLength {
        /// Destination.
        dst: Reg,
        /// The array.
        array: Reg,
    },
    /// `dst = array[index]`
    ArrayGet {
        /// Destination.
        dst: Reg,
        /// The array.
        array: Reg,
        /// Element index.
        index: Reg,
    },
    /// `array[index] = src`
    ArraySet {
        /// The array.
        array: Reg,
        /// Element index.
        index: Reg,
        /// Value stored.
        src: Reg,
    },
    /// `dst = object.field`
    GetField {
        /// Destination.
        dst: Reg,
        /// The object.
        object: Reg,
        /// Field name.
        field: Symbol,
    },
    /// `object.field = src`
    PutField {
        /// The object.
        object: Reg,
        /// Field name.
        field: Symbol,
        /// Value stored.
        src: Reg,
    },
    /// `dst = ty.field` (initializes the declaring type)
    GetStatic {
        /// Destination.
        dst: Reg,
        /// Type the field is looked up from.
        ty: Symbol,
        /// Field name.
        field: Symbol,
    },
    /// `ty.field = src` (initializes the declaring type)
    PutStatic {
        /// Type the field is looked up from.
        ty: Symbol,
        /// Field name.
        field: Symbol,
        /// Value stored.
        src: Reg,
    },
    /// Virtual dispatch on the class of `args[0]`.
    InvokeVirtual {
        /// Receives the result.
        dst: Option<Reg>,
        /// Method name.
        method: Symbol,
        /// Receiver, then arguments.
        args: Args,
    },
    /// Non-virtual dispatch starting at `ty` (super calls, private methods).
    InvokeSpecial {
        /// Receives the result.
        dst: Option<Reg>,
        /// Type the lookup starts at.
        ty: Symbol,
        /// Method name.
        method: Symbol,
        /// Receiver, then arguments.
        args: Args,
    },
    /// Static method call (initializes `ty`).
    InvokeStatic {
        /// Receives the result.
        dst: Option<Reg>,
        /// Type the lookup starts at.
        ty: Symbol,
        /// Method name.
        method: Symbol,
        /// Arguments.
        args: Args,
    },
    /// Call a host function registered with the runtime.
    InvokeNative {
        /// Receives the result.
        dst: Option<Reg>,
        /// Registered native name.
        name: Symbol,
        /// Arguments.
        args: Args,
    },
    /// `dst = object instanceof ty`
    InstanceOf {
        /// Destination, 1 or 0.
        dst: Reg,
        /// The object; null is never an instance.
        object: Reg,
        /// Type tested against.
        ty: Symbol,
    },
    /// Throw a managed exception.
    Throw {
        /// Exception class name.
        class: Symbol,
        /// Detail message.
        message: Option<Symbol>,
    },
    /// Return `src` to the caller.
    Return {
        /// Returned register.
        src: Reg,
    },
    /// Return without a value.
    ReturnVoid,
}

impl Instr {
    /// The register written by this instruction, if any.
    pub fn def(&self) -> Option<Reg> {
        match self {
            Instr::Const { dst, .. }
            | Instr::Null { dst }
            | Instr::Move { dst, .. }
            | Instr::Add { dst, .. }
            | Instr::Sub { dst, .. }
            | Instr::Mul { dst, .. }
            | Instr::Div { dst, .. }
            | Instr::Lt { dst, .. }
            | Instr::Eq { dst, .. }
            | Instr::New { dst, .. }
            | Instr::NewArray { dst, .. }
            | Instr::ArrayLength { dst, .. }
            | Instr::ArrayGet { dst, .. }
            | Instr::GetField { dst, .. }
            | Instr::GetStatic { dst, .. }
            | Instr::InstanceOf { dst, .. } => Some(*dst),
            Instr::InvokeVirtual { dst, .. }
            | Instr::InvokeSpecial { dst, .. }
            | Instr::InvokeStatic { dst, .. }
            | Instr::InvokeNative { dst, .. } => *dst,
            _ => None,
        }
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> SmallVec<[Reg; 4]> {
        let mut out = SmallVec::new();
        match self {
            Instr::Move { src, .. } | Instr::Return { src } => out.push(*src),
            Instr::Add { lhs, rhs, .. }
            | Instr::Sub { lhs, rhs, .. }
            | Instr::Mul { lhs, rhs, .. }
            | Instr::Div { lhs, rhs, .. }
            | Instr::Lt { lhs, rhs, .. }
            | Instr::Eq { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            Instr::JumpIf { cond, .. } | Instr::JumpIfNot { cond, .. } => out.push(*cond),
            Instr::NewArray { length, .. } => out.push(*length),
            Instr::ArrayLength { array, .. } => out.push(*array),
            Instr::ArrayGet { array, index, .. } => {
                out.push(*array);
                out.push(*index);
            }
            Instr::ArraySet { array, index, src } => {
                out.push(*array);
                out.push(*index);
                out.push(*src);
            }
            Instr::GetField { object, .. } | Instr::InstanceOf { object, .. } => {
                out.push(*object)
            }
            Instr::PutField { object, src, .. } => {
                out.push(*object);
                out.push(*src);
            }
            Instr::PutStatic { src, .. } => out.push(*src),
            Instr::InvokeVirtual { args, .. }
            | Instr::InvokeSpecial { args, .. }
            | Instr::InvokeStatic { args, .. }
            | Instr::InvokeNative { args, .. } => out.extend_from_slice(args),
            Instr::Const { .. }
            | Instr::Null { .. }
            | Instr::Jump { .. }
            | Instr::New { .. }
            | Instr::GetStatic { .. }
            | Instr::Throw { .. }
            | Instr::ReturnVoid => {}
        }
        out
    }

    /// Explicit branch target, if this is a jump.
    #[inline]
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Instr::Jump { target }
            | Instr::JumpIf { target, .. }
            | Instr::JumpIfNot { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Whether control can continue with the next instruction.
    #[inline]
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Instr::Jump { .. } | Instr::Return { .. } | Instr::ReturnVoid | Instr::Throw { .. }
        )
    }

    /// Whether this instruction calls into another method or native.
    #[inline]
    pub fn is_invoke(&self) -> bool {
        matches!(
            self,
            Instr::InvokeVirtual { .. }
                | Instr::InvokeSpecial { .. }
                | Instr::InvokeStatic { .. }
                | Instr::InvokeNative { .. }
        )
    }

    /// Control-flow successors of the instruction at `pc`.
    pub fn successors(&self, pc: u32) -> SmallVec<[u32; 2]> {
        let mut out = SmallVec::new();
        if self.falls_through() {
            out.push(pc + 1);
        }
        if let Some(target) = self.branch_target() {
            if !out.contains(&target) {
                out.push(target);
            }
        }
        out
    }
}

/// A verified-shape method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBody {
    /// Size of the register file.
    pub registers: u16,
    /// Number of parameters, passed in `r0..params`.
    pub params: u16,
    /// The instruction stream.
    pub instrs: Vec<Instr>,
}

impl CodeBody {
    /// Number of instructions.
    #[inline]
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// Whether the body has no instructions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Instruction at `pc`.
    #[inline]
    pub fn instr(&self, pc: u32) -> Option<&Instr> {
        self.instrs.get(pc as usize)
    }

    /// All backward branches as `(source_pc, header_pc)` pairs.
    pub fn back_edges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.instrs.iter().enumerate().filter_map(|(pc, instr)| {
            let pc = pc as u32;
            instr
                .branch_target()
                .filter(|&target| target <= pc)
                .map(|target| (pc, target))
        })
    }
}
