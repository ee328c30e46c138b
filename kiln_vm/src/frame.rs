//! Activation frames.
//!
//! A frame captures the `Arc<MethodVersion>` it was entered with and keeps
//! it until it returns, so a redefinition never changes the code a running
//! frame executes. Compiled and interpreted frames share one register
//! layout; switching tiers only swaps `tier` and `compiled`.

use kiln_core::bytecode::Reg;
use kiln_core::{CodeId, Symbol, TypeId, Value};
use kiln_jit::CompiledMethod;
use kiln_runtime::MethodVersion;
use std::fmt;
use std::sync::Arc;

/// Execution tier of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Bytecode interpreter.
    Interpreted,
    /// Compiled code.
    Compiled,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Interpreted => "interpreted",
            Tier::Compiled => "compiled",
        })
    }
}

/// A method invocation.
pub struct ActivationFrame {
    method: Arc<MethodVersion>,
    compiled: Option<Arc<CompiledMethod>>,
    /// Register file.
    pub(crate) registers: Vec<Value>,
    /// Next instruction.
    pub(crate) pc: u32,
    /// Caller register receiving the result.
    pub(crate) return_to: Option<Reg>,
}

impl ActivationFrame {
    /// An interpreted frame with `args` in the first registers.
    pub(crate) fn new(method: Arc<MethodVersion>, args: &[Value], return_to: Option<Reg>) -> Self {
        let size = (method.body().registers as usize).max(args.len());
        let mut registers = vec![Value::Null; size];
        registers[..args.len()].copy_from_slice(args);
        Self {
            method,
            compiled: None,
            registers,
            pc: 0,
            return_to,
        }
    }

    /// The method version this frame runs.
    #[inline]
    pub fn method(&self) -> &Arc<MethodVersion> {
        &self.method
    }

    /// Current tier.
    #[inline]
    pub fn tier(&self) -> Tier {
        if self.compiled.is_some() {
            Tier::Compiled
        } else {
            Tier::Interpreted
        }
    }

    /// Compiled code, when running compiled.
    #[inline]
    pub fn compiled(&self) -> Option<&Arc<CompiledMethod>> {
        self.compiled.as_ref()
    }

    /// Whether the frame's method version was superseded.
    #[inline]
    pub fn is_obsolete(&self) -> bool {
        self.method.is_obsolete()
    }

    /// Current pc.
    #[inline]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// The register file.
    #[inline]
    pub fn registers(&self) -> &[Value] {
        &self.registers
    }

    /// Switch to compiled code at the current pc.
    #[inline]
    pub(crate) fn enter_compiled(&mut self, code: Arc<CompiledMethod>) {
        self.compiled = Some(code);
    }

    /// Switch to the interpreter with a rebuilt register file.
    pub(crate) fn enter_interpreter(&mut self, pc: u32, registers: Vec<Value>) {
        self.compiled = None;
        self.pc = pc;
        self.registers = registers;
    }

    /// Read a register.
    #[inline(always)]
    pub(crate) fn get(&self, reg: Reg) -> Value {
        self.registers[reg.index()]
    }

    /// Write a register.
    #[inline(always)]
    pub(crate) fn set(&mut self, reg: Reg, value: Value) {
        self.registers[reg.index()] = value;
    }

    /// Snapshot for stack traces.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            declaring: self.method.declaring(),
            method: self.method.name().clone(),
            code_id: self.method.code_id(),
            pc: self.pc,
            tier: self.tier(),
            obsolete: self.is_obsolete(),
        }
    }
}

impl fmt::Debug for ActivationFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationFrame")
            .field("method", self.method.name())
            .field("code_id", &self.method.code_id())
            .field("pc", &self.pc)
            .field("tier", &self.tier())
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

/// One line of a stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    /// Type declaring the method.
    pub declaring: TypeId,
    /// Method name.
    pub method: Symbol,
    /// Method version.
    pub code_id: CodeId,
    /// Current pc.
    pub pc: u32,
    /// Execution tier.
    pub tier: Tier,
    /// Whether the version was superseded by a redefinition.
    pub obsolete: bool,
}
