//! Trace-hook dispatch tests: the debug engine publishes the control
//! events, the regular engine and a zero trace level keep them silent.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::program;
use lyra_vm::program::{encode_signed24, op12_12, op24, operands12};
use lyra_vm::{
    builtins, run, BuiltinIndex, FrameView, HookProc, OpCode, Value, Vm, VmEngine,
};

fn counting_hook(counter: &Rc<Cell<usize>>) -> HookProc {
    let counter = Rc::clone(counter);
    Rc::new(move |_frame: &FrameView<'_>, _args: &[Value]| counter.set(counter.get() + 1))
}

/// call-with-values over a producer and consumer; exercises call, return
/// and tail-call paths.
fn busy_program() -> Value {
    let producer = program(
        "producer",
        vec![
            op24(OpCode::AllocFrame, 3),
            op12_12(OpCode::BuiltinRef, 0, BuiltinIndex::Values as u32),
            op12_12(OpCode::LoadConstant, 1, 0),
            op12_12(OpCode::LoadConstant, 2, 1),
            op24(OpCode::TailCall, 3),
        ],
        vec![Value::Int(10), Value::Int(20)],
    );
    let consumer = program(
        "consumer",
        vec![
            op24(OpCode::AllocFrame, 4),
            op24(OpCode::Add, 3),
            operands12(1, 2),
            op24(OpCode::Return, 3),
        ],
        vec![],
    );
    program(
        "main",
        vec![
            op24(OpCode::AllocFrame, 3),
            op12_12(OpCode::BuiltinRef, 0, BuiltinIndex::CallWithValues as u32),
            op12_12(OpCode::LoadConstant, 1, 0),
            op12_12(OpCode::LoadConstant, 2, 1),
            op24(OpCode::TailCall, 3),
        ],
        vec![producer, consumer],
    )
}

#[test]
fn debug_engine_fires_control_event_hooks() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Debug);
    vm.set_trace_level(1);

    let apply = Rc::new(Cell::new(0));
    let push = Rc::new(Cell::new(0));
    let pop = Rc::new(Cell::new(0));
    let next = Rc::new(Cell::new(0));
    vm.apply_hook().add(counting_hook(&apply));
    vm.push_continuation_hook().add(counting_hook(&push));
    vm.pop_continuation_hook().add(counting_hook(&pop));
    vm.next_hook().add(counting_hook(&next));

    let result = run(&mut vm, busy_program(), &[]).unwrap();
    assert_eq!(result, vec![Value::Int(30)]);

    assert!(apply.get() >= 3, "apply fired {} times", apply.get());
    assert!(push.get() >= 1, "push-continuation fired {} times", push.get());
    assert!(pop.get() >= 1, "pop-continuation fired {} times", pop.get());
    assert!(next.get() > apply.get(), "next fires at every boundary");

    // Trace level survives hook dispatch.
    assert_eq!(vm.trace_level(), 1);
}

#[test]
fn zero_trace_level_keeps_hooks_silent() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Debug);
    vm.set_trace_level(0);

    let next = Rc::new(Cell::new(0));
    vm.next_hook().add(counting_hook(&next));

    run(&mut vm, busy_program(), &[]).unwrap();
    assert_eq!(next.get(), 0);
}

#[test]
fn regular_engine_never_dispatches_hooks() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Regular);
    vm.set_trace_level(5);

    let next = Rc::new(Cell::new(0));
    let apply = Rc::new(Cell::new(0));
    vm.next_hook().add(counting_hook(&next));
    vm.apply_hook().add(counting_hook(&apply));

    run(&mut vm, busy_program(), &[]).unwrap();
    assert_eq!(next.get(), 0);
    assert_eq!(apply.get(), 0);
}

#[test]
fn pop_continuation_hook_observes_return_values() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Debug);
    vm.set_trace_level(1);

    let saw_thirty = Rc::new(Cell::new(false));
    {
        let saw_thirty = Rc::clone(&saw_thirty);
        vm.pop_continuation_hook()
            .add(Rc::new(move |_frame: &FrameView<'_>, args: &[Value]| {
                if args.contains(&Value::Int(30)) {
                    saw_thirty.set(true);
                }
            }));
    }

    run(&mut vm, busy_program(), &[]).unwrap();
    assert!(saw_thirty.get());
}

#[test]
fn frame_view_mirrors_live_cursors_during_dispatch() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Debug);
    vm.set_trace_level(1);

    let checked = Rc::new(Cell::new(false));
    {
        let checked = Rc::clone(&checked);
        vm.apply_hook()
            .add(Rc::new(move |frame: &FrameView<'_>, _args: &[Value]| {
                assert!(frame.num_locals() >= 1);
                assert!(frame.procedure().is_some());
                assert_eq!(frame.offset(), 0);
                checked.set(true);
            }));
    }

    run(&mut vm, busy_program(), &[]).unwrap();
    assert!(checked.get());
}

fn prompt_program(tag: Value) -> Value {
    program(
        "with-prompt",
        vec![
            op24(OpCode::AllocFrame, 4),
            op12_12(OpCode::LoadConstant, 1, 0),
            op24(OpCode::Prompt, 1),
            encode_signed24(14),
            op24(OpCode::AllocFrame, 10),
            op12_12(OpCode::BuiltinRef, 7, BuiltinIndex::AbortToPrompt as u32),
            op12_12(OpCode::Mov, 8, 1),
            op12_12(OpCode::LoadConstant, 9, 1),
            op24(OpCode::Call, 7),
            3,
            op12_12(OpCode::Receive, 1, 7),
            4,
            op12_12(OpCode::LoadConstant, 2, 2),
            op24(OpCode::Add, 3),
            operands12(1, 2),
            op24(OpCode::Return, 3),
            op24(OpCode::Cons, 1),
            operands12(4, 5),
            op24(OpCode::Return, 1),
        ],
        vec![tag, Value::Int(7), Value::Int(1)],
    )
}

#[test]
fn abort_and_restore_hooks_fire_around_prompt_control() {
    let mut vm = Vm::new();
    vm.set_engine(VmEngine::Debug);
    vm.set_trace_level(1);

    let aborts = Rc::new(Cell::new(0));
    let restores = Rc::new(Cell::new(0));
    vm.abort_continuation_hook().add(counting_hook(&aborts));
    vm.restore_continuation_hook().add(counting_hook(&restores));

    let result = run(&mut vm, prompt_program(Value::symbol("hook-tag")), &[]).unwrap();
    assert_eq!(aborts.get(), 1);
    assert_eq!(restores.get(), 0);

    let Value::Pair(cell) = &result[0] else {
        panic!("expected the handler's pair");
    };
    let resumed = run(&mut vm, cell.0.clone(), &[Value::Int(1)]).unwrap();
    assert_eq!(resumed, vec![Value::Int(2)]);
    assert_eq!(restores.get(), 1);

    // A full-continuation reinstatement fires restore as well.
    let grab = program("grab-k", vec![op24(OpCode::Return, 1)], vec![]);
    let capture = program(
        "capture",
        vec![
            op24(OpCode::AllocFrame, 3),
            op12_12(OpCode::BuiltinRef, 0, BuiltinIndex::CallCc as u32),
            op12_12(OpCode::LoadConstant, 1, 0),
            op24(OpCode::TailCall, 2),
        ],
        vec![grab],
    );
    let result = run(&mut vm, capture, &[]).unwrap();
    run(&mut vm, result[0].clone(), &[Value::Int(3)]).unwrap();
    assert_eq!(restores.get(), 2);
}

#[test]
fn builtin_table_reaches_every_stub() {
    // Sanity: every builtin is loadable through the table the hooks and
    // tests above lean on.
    for idx in 0..lyra_vm::NUM_BUILTINS {
        assert!(builtins::builtin_ref(idx).is_some());
    }
    assert!(builtins::builtin_ref(lyra_vm::NUM_BUILTINS).is_none());
}
