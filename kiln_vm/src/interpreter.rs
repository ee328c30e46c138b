//! The execution loop.
//!
//! One loop runs both tiers. Each step looks at the top frame: an
//! interpreted frame executes the bytecode instruction at its pc, a
//! compiled frame executes the compiled op at the same pc. Calls push a
//! frame and leave the caller's pc on the call; returns pop it, write the
//! result and advance the caller.
//!
//! ```text
//!   step ─┬─ interpreted ── Instr ──────────────┐
//!         │                                     ├─► Continue / Return
//!         └─ compiled ── state point? ─ valid? ─┤
//!                          │            └─ no ──► deopt (Invalidated)
//!                          └─ header check ──────► deopt (HoistedCheck)
//!                             guard miss ────────► deopt (InlineCacheMiss)
//! ```
//!
//! Errors unwind every frame above the loop's base and propagate to the
//! caller of [`ExecutionContext::invoke_method`].

use crate::context::ExecutionContext;
use crate::deopt::{DeoptReason, DeoptState};
use crate::events::{FieldEvent, FieldWatch};
use crate::frame::ActivationFrame;
use kiln_core::bytecode::{CodeBody, Instr, Reg};
use kiln_core::{KilnError, KilnResult, ObjectId, Symbol, Throwable, TypeId, Value};
use kiln_jit::{CompiledMethod, CompiledOp, InvalidationReason};
use kiln_runtime::MethodVersion;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Outcome of one step.
enum Step {
    /// Keep running the top frame.
    Continue,
    /// The top frame returned.
    Return(Value),
}

type ArgValues = SmallVec<[Value; 4]>;

impl ExecutionContext {
    // =========================================================================
    // Frames
    // =========================================================================

    /// Push a frame for `method`, choosing its tier.
    pub(crate) fn push_frame(
        &mut self,
        method: Arc<MethodVersion>,
        args: &[Value],
        return_to: Option<Reg>,
    ) -> KilnResult<()> {
        let depth = self.frames.len();
        if depth >= self.runtime.config().max_stack_depth {
            return Err(KilnError::StackOverflow { depth });
        }
        if args.len() != method.arity() {
            return Err(KilnError::wrong_method_type(format!(
                "{} takes {} arguments, got {}",
                method.name(),
                method.arity(),
                args.len()
            )));
        }
        self.safepoint_poll()?;
        let compiled = self.runtime.tier_on_entry(&method);
        let mut frame = ActivationFrame::new(method, args, return_to);
        if let Some(code) = compiled {
            frame.enter_compiled(code);
        }
        self.frames.push(frame);
        Ok(())
    }

    #[inline]
    fn top(&self) -> KilnResult<&ActivationFrame> {
        self.frames
            .last()
            .ok_or_else(|| KilnError::internal("no active frame"))
    }

    #[inline]
    fn top_mut(&mut self) -> KilnResult<&mut ActivationFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| KilnError::internal("no active frame"))
    }

    /// Run until the frame at `base` returns.
    pub(crate) fn run(&mut self, base: usize) -> KilnResult<Value> {
        let result = self.run_loop(base);
        if result.is_err() {
            self.frames.truncate(base);
        }
        result
    }

    fn run_loop(&mut self, base: usize) -> KilnResult<Value> {
        loop {
            let compiled = self.top()?.compiled().cloned();
            let step = match compiled {
                Some(code) => self.step_compiled(&code)?,
                None => {
                    let body = Arc::clone(self.top()?.method().body());
                    self.step_interpreted(&body)?
                }
            };
            if let Step::Return(value) = step {
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| KilnError::internal("return without a frame"))?;
                if self.frames.len() <= base {
                    return Ok(value);
                }
                let caller = self.top_mut()?;
                if let Some(dst) = frame.return_to {
                    caller.set(dst, value);
                }
                caller.pc += 1;
            }
        }
    }

    // =========================================================================
    // Tiers
    // =========================================================================

    fn step_interpreted(&mut self, body: &CodeBody) -> KilnResult<Step> {
        let pc = self.top()?.pc;
        let instr = body
            .instr(pc)
            .ok_or_else(|| KilnError::internal(format!("pc {pc} is outside the method body")))?;
        self.execute(instr, pc, true)
    }

    fn step_compiled(&mut self, code: &Arc<CompiledMethod>) -> KilnResult<Step> {
        let pc = self.top()?.pc;
        if !code.is_valid() && code.state_point(pc).is_some() {
            let reason = code
                .invalidation()
                .map_or(DeoptReason::Invalidated, DeoptReason::for_invalidation);
            self.deoptimize(reason)?;
            return Ok(Step::Continue);
        }
        if code.is_loop_header(pc) {
            let frame = self.top()?;
            if code
                .header_checks(pc)
                .iter()
                .any(|reg| frame.get(*reg).is_null())
            {
                self.deoptimize(DeoptReason::HoistedCheck)?;
                return Ok(Step::Continue);
            }
        }

        let op = code.op(pc).ok_or_else(|| {
            KilnError::internal(format!("pc {pc} is outside {}", code.code_id()))
        })?;
        match op {
            CompiledOp::Generic(instr) => self.execute(instr, pc, false),
            CompiledOp::GuardedCall {
                dst,
                args,
                expected,
                target,
            } => {
                let receiver = self.receiver_of(args)?;
                if self.receiver_class(receiver)? != *expected {
                    self.deoptimize(DeoptReason::InlineCacheMiss)?;
                    return Ok(Step::Continue);
                }
                let argv = self.read_args(args)?;
                self.push_frame(Arc::clone(target), &argv, *dst)?;
                Ok(Step::Continue)
            }
            CompiledOp::InlinedConstant {
                dst,
                receiver,
                expected,
                value,
            } => {
                let receiver = self.top()?.get(*receiver);
                if self.receiver_class(receiver)? != *expected {
                    self.deoptimize(DeoptReason::InlineCacheMiss)?;
                    return Ok(Step::Continue);
                }
                match dst {
                    Some(dst) => self.write(*dst, Value::int(*value)),
                    None => self.advance(),
                }
            }
            CompiledOp::PolymorphicCall {
                dst,
                method,
                args,
                cases,
            } => {
                let class = self.receiver_class(self.receiver_of(args)?)?;
                let target = match cases.iter().find(|case| case.receiver == class) {
                    Some(case) => Arc::clone(&case.target),
                    None => self.runtime.table().resolve_virtual(class, method)?,
                };
                let argv = self.read_args(args)?;
                self.push_frame(target, &argv, *dst)?;
                Ok(Step::Continue)
            }
            CompiledOp::FoldedBranch { taken } => match taken {
                Some(target) => self.branch(*target, false),
                None => self.advance(),
            },
        }
    }

    /// Replace the top compiled frame with an interpreted one at its pc.
    pub(crate) fn deoptimize(&mut self, reason: DeoptReason) -> KilnResult<()> {
        let runtime = Arc::clone(&self.runtime);
        let frame = self.top_mut()?;
        let Some(code) = frame.compiled().cloned() else {
            return Ok(());
        };
        let pc = frame.pc;
        let registers = DeoptState::capture(&code, pc, reason, frame.registers())
            .and_then(|state| runtime.recovery.reconstruct(frame.method().body(), &state))
            .map_err(|err| runtime.report_fatal(err))?;
        frame.enter_interpreter(pc, registers);

        runtime.deopt_stats().record(code.code_id(), pc, reason);
        if reason.is_speculation_failure() {
            runtime
                .code_cache
                .remove(code.code_id(), InvalidationReason::Deoptimized);
        }
        let outcome = runtime.recovery.settle(frame.method(), reason);
        debug!(
            method = %frame.method().name(),
            pc,
            %reason,
            ?outcome,
            "deoptimized"
        );
        runtime.events().deoptimized(frame.method(), pc, reason);
        Ok(())
    }

    // =========================================================================
    // Instructions
    // =========================================================================

    fn execute(&mut self, instr: &Instr, pc: u32, interpreted: bool) -> KilnResult<Step> {
        match instr {
            Instr::Const { dst, value } => self.write(*dst, Value::int(*value)),
            Instr::Null { dst } => self.write(*dst, Value::Null),
            Instr::Move { dst, src } => {
                let value = self.top()?.get(*src);
                self.write(*dst, value)
            }
            Instr::Add { dst, lhs, rhs } => {
                let (a, b) = self.int_operands(*lhs, *rhs)?;
                self.write(*dst, Value::int(a.wrapping_add(b)))
            }
            Instr::Sub { dst, lhs, rhs } => {
                let (a, b) = self.int_operands(*lhs, *rhs)?;
                self.write(*dst, Value::int(a.wrapping_sub(b)))
            }
            Instr::Mul { dst, lhs, rhs } => {
                let (a, b) = self.int_operands(*lhs, *rhs)?;
                self.write(*dst, Value::int(a.wrapping_mul(b)))
            }
            Instr::Div { dst, lhs, rhs } => {
                let (a, b) = self.int_operands(*lhs, *rhs)?;
                if b == 0 {
                    return Err(KilnError::division_by_zero());
                }
                self.write(*dst, Value::int(a.wrapping_div(b)))
            }
            Instr::Lt { dst, lhs, rhs } => {
                let (a, b) = self.int_operands(*lhs, *rhs)?;
                self.write(*dst, Value::bool(a < b))
            }
            Instr::Eq { dst, lhs, rhs } => {
                let frame = self.top()?;
                let equal = frame.get(*lhs) == frame.get(*rhs);
                self.write(*dst, Value::bool(equal))
            }

            Instr::Jump { target } => self.branch(*target, interpreted),
            Instr::JumpIf { cond, target } => {
                if self.top()?.get(*cond).is_truthy() {
                    self.branch(*target, interpreted)
                } else {
                    self.advance()
                }
            }
            Instr::JumpIfNot { cond, target } => {
                if self.top()?.get(*cond).is_truthy() {
                    self.advance()
                } else {
                    self.branch(*target, interpreted)
                }
            }

            Instr::New { dst, ty } => {
                let object = self.new_object(ty)?;
                self.write(*dst, Value::reference(object))
            }
            Instr::NewArray { dst, length } => {
                let length = self.int(*length)?;
                let array = self.new_array(length)?;
                self.write(*dst, Value::reference(array))
            }
            Instr::ArrayLength { dst, array } => {
                let array = self.deref(*array)?;
                let length = self.runtime.heap().array_length(array)?;
                self.write(*dst, Value::int(length as i64))
            }
            Instr::ArrayGet { dst, array, index } => {
                let (array, index) = self.element(*array, *index)?;
                let value = self.runtime.heap().get_slot(array, index)?;
                self.write(*dst, value)
            }
            Instr::ArraySet { array, index, src } => {
                let (array, index) = self.element(*array, *index)?;
                let value = self.top()?.get(*src);
                self.runtime.heap().set_slot(array, index, value)?;
                self.advance()
            }

            Instr::GetField { dst, object, field } => {
                let object = self.deref(*object)?;
                let class = self.runtime.heap().class_of(object)?;
                let index = self.runtime.table().field_index(class, field)?;
                let value = self.runtime.heap().get_slot(object, index)?;
                if self.runtime.has_field_watches() {
                    self.notify_instance_field(FieldWatch::Access, class, field, object, value);
                }
                self.write(*dst, value)
            }
            Instr::PutField { object, field, src } => {
                let object = self.deref(*object)?;
                let value = self.top()?.get(*src);
                let class = self.runtime.heap().class_of(object)?;
                let index = self.runtime.table().field_index(class, field)?;
                if self.runtime.has_field_watches() {
                    self.notify_instance_field(FieldWatch::Modification, class, field, object, value);
                }
                self.runtime.heap().set_slot(object, index, value)?;
                self.advance()
            }
            Instr::GetStatic { dst, ty, field } => {
                let declaring = self.static_declarer(ty, field)?;
                let desc = self.runtime.table().get(declaring)?;
                let value = desc
                    .statics()
                    .get(field)
                    .ok_or_else(|| KilnError::no_such_field(desc.name().clone(), field.clone()))?;
                if self.runtime.has_field_watches() {
                    self.notify_field(FieldWatch::Access, declaring, field, None, value);
                }
                self.write(*dst, value)
            }
            Instr::PutStatic { ty, field, src } => {
                let declaring = self.static_declarer(ty, field)?;
                let value = self.top()?.get(*src);
                if self.runtime.has_field_watches() {
                    self.notify_field(FieldWatch::Modification, declaring, field, None, value);
                }
                let desc = self.runtime.table().get(declaring)?;
                if !desc.statics().set(field, value) {
                    return Err(KilnError::no_such_field(desc.name().clone(), field.clone()));
                }
                self.advance()
            }

            Instr::InvokeVirtual { dst, method, args } => {
                let class = self.receiver_class(self.receiver_of(args)?)?;
                if interpreted {
                    self.top()?.method().inline_cache().record(pc, class);
                }
                let target = self.runtime.table().resolve_virtual(class, method)?;
                let argv = self.read_args(args)?;
                self.push_frame(target, &argv, *dst)?;
                Ok(Step::Continue)
            }
            Instr::InvokeSpecial {
                dst,
                ty,
                method,
                args,
            } => {
                self.receiver_class(self.receiver_of(args)?)?;
                let from = self.runtime.type_id(ty)?;
                let target = self.runtime.table().resolve_special(from, method)?;
                let argv = self.read_args(args)?;
                self.push_frame(target, &argv, *dst)?;
                Ok(Step::Continue)
            }
            Instr::InvokeStatic {
                dst,
                ty,
                method,
                args,
            } => {
                let ty = self.runtime.type_id(ty)?;
                let target = self.runtime.table().resolve_static(ty, method)?;
                self.initialize(target.declaring())?;
                let argv = self.read_args(args)?;
                self.push_frame(target, &argv, *dst)?;
                Ok(Step::Continue)
            }
            Instr::InvokeNative { dst, name, args } => {
                let native = self.runtime.natives().get(name)?;
                let argv = self.read_args(args)?;
                let result = native(self, &argv[..])?;
                match dst {
                    Some(dst) => self.write(*dst, result),
                    None => self.advance(),
                }
            }

            Instr::InstanceOf { dst, object, ty } => {
                let result = match self.top()?.get(*object) {
                    Value::Ref(id) => {
                        let class = self.runtime.heap().class_of(id)?;
                        let target = self.runtime.type_id(ty)?;
                        self.runtime.table().is_subtype_of(class, target)
                    }
                    Value::Null | Value::Int(_) => false,
                };
                self.write(*dst, Value::bool(result))
            }
            Instr::Throw { class, message } => {
                let throwable = match message {
                    Some(message) => Throwable::new(class.clone(), message.clone()),
                    None => Throwable::bare(class.clone()),
                };
                Err(KilnError::Exception(throwable))
            }
            Instr::Return { src } => Ok(Step::Return(self.top()?.get(*src))),
            Instr::ReturnVoid => Ok(Step::Return(Value::Null)),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[inline]
    fn advance(&mut self) -> KilnResult<Step> {
        self.top_mut()?.pc += 1;
        Ok(Step::Continue)
    }

    #[inline]
    fn write(&mut self, dst: Reg, value: Value) -> KilnResult<Step> {
        let frame = self.top_mut()?;
        frame.set(dst, value);
        frame.pc += 1;
        Ok(Step::Continue)
    }

    /// Jump to `target`. Backward jumps are safepoints and may tier up.
    fn branch(&mut self, target: u32, interpreted: bool) -> KilnResult<Step> {
        let frame = self.top_mut()?;
        let from = frame.pc;
        frame.pc = target;
        if target <= from {
            self.on_backedge(interpreted)?;
        }
        Ok(Step::Continue)
    }

    fn on_backedge(&mut self, interpreted: bool) -> KilnResult<()> {
        self.safepoint_poll()?;
        if !interpreted {
            return Ok(());
        }
        let method = Arc::clone(self.top()?.method());
        if let Some(code) = self.runtime.tier_on_backedge(&method) {
            let frame = self.top_mut()?;
            debug!(method = %method.name(), pc = frame.pc, "OSR entry");
            frame.enter_compiled(code);
        }
        Ok(())
    }

    #[inline]
    fn int(&self, reg: Reg) -> KilnResult<i64> {
        let value = self.top()?.get(reg);
        value
            .as_int()
            .ok_or_else(|| KilnError::wrong_operand("int", value.kind_name()))
    }

    #[inline]
    fn int_operands(&self, lhs: Reg, rhs: Reg) -> KilnResult<(i64, i64)> {
        Ok((self.int(lhs)?, self.int(rhs)?))
    }

    /// The object in `reg`; null raises `NullPointerException`.
    fn deref(&self, reg: Reg) -> KilnResult<ObjectId> {
        match self.top()?.get(reg) {
            Value::Ref(id) => Ok(id),
            Value::Null => Err(KilnError::null_pointer(format!("{reg} is null"))),
            Value::Int(_) => Err(KilnError::wrong_operand("reference", "int")),
        }
    }

    /// Bounds-checked array element.
    fn element(&self, array: Reg, index: Reg) -> KilnResult<(ObjectId, usize)> {
        let array = self.deref(array)?;
        let index = self.int(index)?;
        let length = self.runtime.heap().array_length(array)?;
        usize::try_from(index)
            .ok()
            .filter(|i| *i < length)
            .map(|i| (array, i))
            .ok_or_else(|| KilnError::array_index(index, length))
    }

    fn receiver_of(&self, args: &[Reg]) -> KilnResult<Value> {
        let reg = args
            .first()
            .ok_or_else(|| KilnError::internal("virtual call without a receiver"))?;
        Ok(self.top()?.get(*reg))
    }

    fn read_args(&self, args: &[Reg]) -> KilnResult<ArgValues> {
        let frame = self.top()?;
        Ok(args.iter().map(|reg| frame.get(*reg)).collect())
    }

    fn notify_instance_field(
        &self,
        kind: FieldWatch,
        class: TypeId,
        field: &Symbol,
        object: ObjectId,
        value: Value,
    ) {
        if let Some(declaring) = self.runtime.field_declarer(class, field) {
            self.notify_field(kind, declaring, field, Some(object), value);
        }
    }

    fn notify_field(
        &self,
        kind: FieldWatch,
        declaring: TypeId,
        field: &Symbol,
        object: Option<ObjectId>,
        value: Value,
    ) {
        if !self.runtime.is_watched(kind, declaring, field) {
            return;
        }
        let event = FieldEvent {
            context: self.id(),
            declaring,
            field: field.clone(),
            object,
            value,
        };
        let events = self.runtime.events();
        match kind {
            FieldWatch::Access => events.field_access(&event),
            FieldWatch::Modification => events.field_modification(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::frame::Tier;
    use crate::{Runtime, RuntimeConfig};
    use kiln_core::bytecode::{CodeBuilder, Reg};
    use kiln_core::{KilnError, Value};
    use kiln_runtime::{MethodFlags, TypeDefinition};
    use std::sync::Arc;

    /// static sum(n): s = 0; i = 0; while i < n { s += i; i += 1 }; return s
    fn summer() -> TypeDefinition {
        let mut b = CodeBuilder::new(1);
        let head = b.new_label();
        let done = b.new_label();
        b.const_int(Reg(1), 0)
            .const_int(Reg(2), 0)
            .const_int(Reg(4), 1)
            .bind(head)
            .lt(Reg(3), Reg(2), Reg(0))
            .jump_if_not(Reg(3), done)
            .add(Reg(1), Reg(1), Reg(2))
            .add(Reg(2), Reg(2), Reg(4))
            .jump(head)
            .bind(done)
            .ret(Reg(1));
        TypeDefinition::new("Summer").method("sum", MethodFlags::STATIC, b.finish().unwrap())
    }

    fn run_sum(config: RuntimeConfig, n: i64) -> (Arc<Runtime>, Value) {
        let rt = Runtime::new(config).unwrap();
        rt.load_type(summer()).unwrap();
        let mut ctx = rt.attach();
        let result = ctx.invoke_static("Summer", "sum", &[Value::int(n)]).unwrap();
        drop(ctx);
        (rt, result)
    }

    #[test]
    fn test_loop_interpreted() {
        let (_, result) = run_sum(RuntimeConfig::interpreter_only(), 100);
        assert_eq!(result, Value::int(4_950));
    }

    #[test]
    fn test_osr_gives_same_result() {
        let (rt, result) = run_sum(RuntimeConfig::eager_jit(), 1_000);
        assert_eq!(result, Value::int(499_500));
        let ty = rt.type_id("Summer").unwrap();
        assert!(rt.is_compiled(ty, "sum").unwrap());
        assert_eq!(rt.number_of_deoptimizations(), 0);
    }

    #[test]
    fn test_arithmetic_exceptions() {
        let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
        let mut div = CodeBuilder::new(2);
        div.div(Reg(2), Reg(0), Reg(1)).ret(Reg(2));
        rt.load_type(TypeDefinition::new("Math").method("div", MethodFlags::STATIC, div.finish().unwrap()))
            .unwrap();
        let mut ctx = rt.attach();
        assert_eq!(
            ctx.invoke_static("Math", "div", &[Value::int(7), Value::int(2)]).unwrap(),
            Value::int(3)
        );
        let err = ctx
            .invoke_static("Math", "div", &[Value::int(1), Value::int(0)])
            .unwrap_err();
        assert_eq!(err.exception_class(), Some("ArithmeticException"));
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_array_bounds() {
        let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
        let mut b = CodeBuilder::new(1);
        b.const_int(Reg(1), 3)
            .new_array(Reg(2), Reg(1))
            .array_get(Reg(3), Reg(2), Reg(0))
            .ret(Reg(3));
        rt.load_type(TypeDefinition::new("Arr").method("at", MethodFlags::STATIC, b.finish().unwrap()))
            .unwrap();
        let mut ctx = rt.attach();
        assert_eq!(ctx.invoke_static("Arr", "at", &[Value::int(2)]).unwrap(), Value::Null);
        let err = ctx.invoke_static("Arr", "at", &[Value::int(3)]).unwrap_err();
        assert_eq!(err.exception_class(), Some("ArrayIndexOutOfBoundsException"));
        let err = ctx.invoke_static("Arr", "at", &[Value::int(-1)]).unwrap_err();
        assert_eq!(err.exception_class(), Some("ArrayIndexOutOfBoundsException"));
    }

    #[test]
    fn test_stack_overflow() {
        let rt = Runtime::new(RuntimeConfig {
            max_stack_depth: 16,
            ..RuntimeConfig::interpreter_only()
        })
        .unwrap();
        let mut b = CodeBuilder::new(0);
        b.invoke_static(None, "Deep", "down", &[]).ret_void();
        rt.load_type(TypeDefinition::new("Deep").method("down", MethodFlags::STATIC, b.finish().unwrap()))
            .unwrap();
        let mut ctx = rt.attach();
        let err = ctx.invoke_static("Deep", "down", &[]).unwrap_err();
        assert!(matches!(err, KilnError::StackOverflow { depth: 16 }));
        assert_eq!(ctx.depth(), 0);
    }

    #[test]
    fn test_virtual_dispatch_and_instance_of() {
        let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
        let mut base = CodeBuilder::new(1);
        base.const_int(Reg(1), 1).ret(Reg(1));
        let mut derived = CodeBuilder::new(1);
        derived.const_int(Reg(1), 2).ret(Reg(1));
        let mut check = CodeBuilder::new(1);
        check.instance_of(Reg(1), Reg(0), "Base").ret(Reg(1));
        rt.load_type(
            TypeDefinition::new("Base")
                .method("id", MethodFlags::empty(), base.finish().unwrap())
                .method("check", MethodFlags::STATIC, check.finish().unwrap()),
        )
        .unwrap();
        rt.load_type(
            TypeDefinition::new("Derived")
                .extends("Base")
                .method("id", MethodFlags::empty(), derived.finish().unwrap()),
        )
        .unwrap();

        let mut ctx = rt.attach();
        let b = Value::reference(ctx.new_object("Base").unwrap());
        let d = Value::reference(ctx.new_object("Derived").unwrap());
        assert_eq!(ctx.invoke_virtual(b, "id", &[]).unwrap(), Value::int(1));
        assert_eq!(ctx.invoke_virtual(d, "id", &[]).unwrap(), Value::int(2));
        assert_eq!(ctx.invoke_static("Base", "check", &[d]).unwrap(), Value::TRUE);
        assert_eq!(ctx.invoke_static("Base", "check", &[Value::Null]).unwrap(), Value::FALSE);
    }

    #[test]
    fn test_native_sees_calling_frame() {
        let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
        rt.register_native("depth", |ctx, _args| {
            let trace = ctx.stack_trace();
            assert_eq!(trace[0].tier, Tier::Interpreted);
            Ok(Value::int(ctx.depth() as i64))
        });
        let mut b = CodeBuilder::new(0);
        b.invoke_native(Some(Reg(0)), "depth", &[]).ret(Reg(0));
        rt.load_type(TypeDefinition::new("N").method("call", MethodFlags::STATIC, b.finish().unwrap()))
            .unwrap();
        let mut ctx = rt.attach();
        assert_eq!(ctx.invoke_static("N", "call", &[]).unwrap(), Value::int(1));
    }
}
