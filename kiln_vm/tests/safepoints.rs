//! Collections stopping running contexts, and host entry points refused
//! on a thread that is running managed code.

use kiln_core::bytecode::{CodeBuilder, Reg};
use kiln_core::{KilnResult, Value};
use kiln_gc::{FollowControl, HeapFilter};
use kiln_runtime::{MethodFlags, TypeDefinition};
use kiln_vm::{MutatorState, Runtime, RuntimeConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

/// `keep(n)`: allocate a Box, spin `n` times, then read the Box back.
fn load(rt: &Runtime) {
    let mut b = CodeBuilder::new(1);
    let head = b.new_label();
    let end = b.new_label();
    b.new_object(Reg(1), "Box")
        .const_int(Reg(2), 5)
        .put_field(Reg(1), "x", Reg(2))
        .const_int(Reg(3), 0)
        .const_int(Reg(4), 1)
        .bind(head)
        .lt(Reg(5), Reg(3), Reg(0))
        .jump_if_not(Reg(5), end)
        .new_object(Reg(6), "Box")
        .add(Reg(3), Reg(3), Reg(4))
        .jump(head)
        .bind(end)
        .get_field(Reg(7), Reg(1), "x")
        .ret(Reg(7));
    rt.load_type(TypeDefinition::new("Box").field("x")).unwrap();
    rt.load_type(TypeDefinition::new("Spin").method("keep", MethodFlags::STATIC, b.finish().unwrap()))
        .unwrap();
}

#[test]
fn test_collections_see_running_frames() {
    for config in [RuntimeConfig::interpreter_only(), RuntimeConfig::eager_jit()] {
        let rt = Runtime::new(config).unwrap();
        load(&rt);
        let done = Arc::new(AtomicBool::new(false));

        let pauses = thread::scope(|scope| {
            let worker = {
                let rt = Arc::clone(&rt);
                let done = Arc::clone(&done);
                scope.spawn(move || {
                    let mut ctx = rt.attach();
                    let result = ctx.invoke_static("Spin", "keep", &[Value::int(50_000)]);
                    done.store(true, Ordering::SeqCst);
                    result
                })
            };
            let mut pauses = 0;
            while !done.load(Ordering::SeqCst) || pauses == 0 {
                rt.collect_garbage().unwrap();
                pauses += 1;
            }
            assert_eq!(worker.join().unwrap().unwrap(), Value::int(5));
            pauses
        });

        assert!(rt.safepoints().pause_count() >= pauses);
        assert_eq!(rt.context_count(), 0);
    }
}

#[test]
fn test_idle_context_does_not_hold_up_pause() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    load(&rt);
    let ctx = rt.attach();
    assert_eq!(rt.safepoints().state(ctx.id()), Some(MutatorState::Native));
    let summary = rt.collect_garbage().unwrap();
    assert_eq!(summary.live, rt.heap().live_count());
    drop(ctx);
    assert_eq!(rt.safepoints().mutator_count(), 0);
}

#[test]
fn test_host_entry_points_refused_inside_native() {
    let rt = Runtime::new(RuntimeConfig::interpreter_only()).unwrap();
    load(&rt);
    let refused = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&refused);
    rt.register_native("reenter", move |ctx, _args| {
        let rt = Arc::clone(ctx.runtime());
        let ty = rt.type_id("Box")?;
        let attempts: [KilnResult<()>; 4] = [
            rt.collect_garbage().map(drop),
            rt.redefine(ty, TypeDefinition::new("Box").field("x")),
            rt.initialize(ty),
            rt.follow_references(None, HeapFilter::empty(), |_, _| FollowControl::Follow)
                .map(drop),
        ];
        for attempt in attempts {
            let err = attempt.unwrap_err();
            assert_eq!(err.exception_class(), Some("IllegalStateException"));
            count.fetch_add(1, Ordering::SeqCst);
        }
        // The context's own entry points still work.
        ctx.collect_garbage()?;
        Ok(Value::int(1))
    });
    let mut b = CodeBuilder::new(0);
    b.invoke_native(Some(Reg(0)), "reenter", &[]).ret(Reg(0));
    rt.load_type(TypeDefinition::new("Host").method("run", MethodFlags::STATIC, b.finish().unwrap()))
        .unwrap();

    let mut ctx = rt.attach();
    assert_eq!(ctx.invoke_static("Host", "run", &[]).unwrap(), Value::int(1));
    assert_eq!(refused.load(Ordering::SeqCst), 4);
    // Back outside managed code, the host entry points work again.
    rt.collect_garbage().unwrap();
}
