//! Live redefinition.
//!
//! Coverage:
//! - New behavior with instance and static state preserved
//! - Redefined instance methods over several live instances
//! - A frame running the old version finishes with the old body
//! - A compiled frame made obsolete deoptimizes and finishes the old body
//! - Rejected schema changes leave everything untouched
//! - Compiled callers that inlined the old body are invalidated
//! - Racing redefinitions serialize

use kiln_core::bytecode::{CodeBody, CodeBuilder, Reg};
use kiln_core::{KilnError, RedefinitionFailure, Value};
use kiln_jit::JitConfig;
use kiln_runtime::{MethodFlags, TypeDefinition};
use kiln_vm::{Runtime, RuntimeConfig, Tier};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn constant(params: u16, value: i64) -> CodeBody {
    let mut b = CodeBuilder::new(params);
    b.const_int(Reg(params), value).ret(Reg(params));
    b.finish().unwrap()
}

fn counter(value: i64) -> TypeDefinition {
    TypeDefinition::new("Counter")
        .field("n")
        .static_field("TOTAL", Value::int(0))
        .method("step", MethodFlags::STATIC, constant(0, value))
}

#[test]
fn test_new_behavior_keeps_state() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    let ty = rt.load_type(counter(1)).unwrap();
    let mut ctx = rt.attach();
    let obj = ctx.new_object("Counter").unwrap();
    ctx.set_field(obj, "n", Value::int(41)).unwrap();
    ctx.set_static("Counter", "TOTAL", Value::int(99)).unwrap();
    assert_eq!(ctx.invoke_static("Counter", "step", &[]).unwrap(), Value::int(1));

    ctx.redefine(ty, counter(2)).unwrap();

    assert_eq!(ctx.invoke_static("Counter", "step", &[]).unwrap(), Value::int(2));
    assert_eq!(ctx.get_field(obj, "n").unwrap(), Value::int(41));
    assert_eq!(ctx.get_static("Counter", "TOTAL").unwrap(), Value::int(99));
}

/// `P.get()` returns `v`, or `v + v` once redefined.
fn point(doubled: bool) -> TypeDefinition {
    let mut b = CodeBuilder::new(1);
    b.get_field(Reg(1), Reg(0), "v");
    if doubled {
        b.add(Reg(1), Reg(1), Reg(1));
    }
    b.ret(Reg(1));
    TypeDefinition::new("P")
        .field("v")
        .method("get", MethodFlags::empty(), b.finish().unwrap())
}

#[test]
fn test_instance_method_redefined_across_instances() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    let ty = rt.load_type(point(false)).unwrap();
    let mut ctx = rt.attach();
    let p = ctx.new_object("P").unwrap();
    let q = ctx.new_object("P").unwrap();
    ctx.set_field(p, "v", Value::int(3)).unwrap();
    ctx.set_field(q, "v", Value::int(4)).unwrap();
    assert_eq!(ctx.invoke_virtual(Value::Ref(p), "get", &[]).unwrap(), Value::int(3));
    assert_eq!(ctx.invoke_virtual(Value::Ref(q), "get", &[]).unwrap(), Value::int(4));

    ctx.redefine(ty, point(true)).unwrap();

    assert_eq!(ctx.get_field(p, "v").unwrap(), Value::int(3));
    assert_eq!(ctx.get_field(q, "v").unwrap(), Value::int(4));
    assert_eq!(ctx.invoke_virtual(Value::Ref(p), "get", &[]).unwrap(), Value::int(6));
    assert_eq!(ctx.invoke_virtual(Value::Ref(q), "get", &[]).unwrap(), Value::int(8));
}

#[test]
fn test_running_frame_keeps_old_body() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();

    // run() calls a native that redefines run() underneath it, then
    // returns a constant: 1 in the old body, 2 in the new one.
    let body = |value: i64| {
        let mut b = CodeBuilder::new(0);
        b.invoke_native(None, "swap", &[])
            .const_int(Reg(0), value)
            .ret(Reg(0));
        b.finish().unwrap()
    };
    let old = TypeDefinition::new("T").method("run", MethodFlags::STATIC, body(1));
    let new = TypeDefinition::new("T").method("run", MethodFlags::STATIC, body(2));

    let saw_obsolete = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_obsolete);
    rt.register_native("swap", move |ctx, _args| {
        let ty = ctx.runtime().type_id("T")?;
        if ctx.runtime().table().get(ty)?.redefinition_count() == 0 {
            ctx.redefine(ty, new.clone())?;
            let trace = ctx.stack_trace();
            let top = &trace[0];
            flag.store(top.obsolete && top.method.as_ref() == "run", Ordering::SeqCst);
        }
        Ok(Value::Null)
    });
    rt.load_type(old).unwrap();

    let mut ctx = rt.attach();
    assert_eq!(ctx.invoke_static("T", "run", &[]).unwrap(), Value::int(1));
    assert!(saw_obsolete.load(Ordering::SeqCst));
    assert_eq!(ctx.invoke_static("T", "run", &[]).unwrap(), Value::int(2));
}

#[test]
fn test_schema_change_rejected() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    let ty = rt.load_type(counter(1)).unwrap();
    let err = rt.redefine(ty, counter(2).field("extra")).unwrap_err();
    assert!(matches!(
        err,
        KilnError::UnsupportedRedefinition {
            kind: RedefinitionFailure::SchemaChanged,
            ..
        }
    ));
    let mut ctx = rt.attach();
    assert_eq!(ctx.invoke_static("Counter", "step", &[]).unwrap(), Value::int(1));
}

#[test]
fn test_inlined_callee_redefinition_invalidates_caller() {
    let config = RuntimeConfig {
        jit: JitConfig {
            hotness_threshold: 1_000_000,
            osr_threshold: 1_000_000,
            ..JitConfig::default()
        },
        ..Default::default()
    };
    let rt = Runtime::new(config).unwrap();
    let a = rt
        .load_type(TypeDefinition::new("A").method("value", MethodFlags::empty(), constant(1, 1)))
        .unwrap();
    let mut call = CodeBuilder::new(1);
    call.invoke_virtual(Some(Reg(1)), "value", &[Reg(0)]).ret(Reg(1));
    let caller = rt
        .load_type(TypeDefinition::new("Caller").method("call", MethodFlags::STATIC, call.finish().unwrap()))
        .unwrap();

    let mut ctx = rt.attach();
    let obj = Value::Ref(ctx.new_object("A").unwrap());
    assert_eq!(ctx.invoke_static("Caller", "call", &[obj]).unwrap(), Value::int(1));
    ctx.ensure_jit_compiled(caller, "call").unwrap();
    assert!(rt.is_compiled(caller, "call").unwrap());

    ctx.redefine(
        a,
        TypeDefinition::new("A").method("value", MethodFlags::empty(), constant(1, 5)),
    )
    .unwrap();
    assert!(!rt.is_compiled(caller, "call").unwrap());
    assert_eq!(ctx.invoke_static("Caller", "call", &[obj]).unwrap(), Value::int(5));
}

#[test]
fn test_racing_redefinitions_serialize() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    let ty = rt.load_type(counter(0)).unwrap();

    thread::scope(|scope| {
        for worker in 0..4_i64 {
            let rt = Arc::clone(&rt);
            scope.spawn(move || {
                let mut ctx = rt.attach();
                for round in 0..10 {
                    ctx.redefine(ty, counter(worker * 100 + round)).unwrap();
                    let value = ctx.invoke_static("Counter", "step", &[]).unwrap();
                    assert!(matches!(value, Value::Int(v) if (0..400).contains(&v)));
                }
            });
        }
    });

    assert_eq!(rt.table().get(ty).unwrap().redefinition_count(), 40);
    let last = rt.find_method(ty, "step").unwrap();
    assert!(!last.is_obsolete());
}

/// `Ticker.run()`: ten iterations calling `tick(i)`, returning the count;
/// the redefined body returns 1000.
fn ticker(redefined: bool) -> TypeDefinition {
    let mut b = CodeBuilder::new(0);
    if redefined {
        b.const_int(Reg(0), 1000).ret(Reg(0));
    } else {
        let head = b.new_label();
        let end = b.new_label();
        b.const_int(Reg(0), 0)
            .const_int(Reg(1), 0)
            .const_int(Reg(2), 1)
            .const_int(Reg(3), 10)
            .bind(head)
            .lt(Reg(4), Reg(1), Reg(3))
            .jump_if_not(Reg(4), end)
            .invoke_native(None, "tick", &[Reg(1)])
            .add(Reg(0), Reg(0), Reg(2))
            .add(Reg(1), Reg(1), Reg(2))
            .jump(head)
            .bind(end)
            .ret(Reg(0));
    }
    TypeDefinition::new("Ticker").method("run", MethodFlags::STATIC, b.finish().unwrap())
}

#[test]
fn test_compiled_obsolete_frame_finishes_old_body() {
    let config = RuntimeConfig {
        jit: JitConfig {
            hotness_threshold: 1_000_000,
            osr_threshold: 1_000_000,
            ..JitConfig::default()
        },
        ..Default::default()
    };
    let rt = Runtime::new(config).unwrap();

    let was_compiled = Arc::new(AtomicBool::new(false));
    let saw_obsolete = Arc::new(AtomicBool::new(false));
    let (compiled, obsolete) = (Arc::clone(&was_compiled), Arc::clone(&saw_obsolete));
    rt.register_native("tick", move |ctx, args| {
        if args.first() == Some(&Value::int(5)) {
            let ty = ctx.runtime().type_id("Ticker")?;
            compiled.store(ctx.stack_trace()[0].tier == Tier::Compiled, Ordering::SeqCst);
            ctx.redefine(ty, ticker(true))?;
            obsolete.store(ctx.stack_trace()[0].obsolete, Ordering::SeqCst);
        }
        Ok(Value::Null)
    });
    let ty = rt.load_type(ticker(false)).unwrap();

    let mut ctx = rt.attach();
    ctx.ensure_jit_compiled(ty, "run").unwrap();
    assert_eq!(ctx.invoke_static("Ticker", "run", &[]).unwrap(), Value::int(10));
    assert!(was_compiled.load(Ordering::SeqCst));
    assert!(saw_obsolete.load(Ordering::SeqCst));
    assert!(rt.number_of_deoptimizations() >= 1);

    assert_eq!(ctx.invoke_static("Ticker", "run", &[]).unwrap(), Value::int(1000));
}
