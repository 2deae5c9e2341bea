//! Property-based tests for the VM's universal invariants:
//! cursor bounds on the value stack, precise GC marking at the live
//! prefix, builtin table roundtrips, and cursor restoration around `run`.

mod common;

use common::program;
use lyra_vm::program::op24;
use lyra_vm::{
    builtin_index_to_name, builtin_name_to_index, builtins, mark_stack, run, BuiltinIndex,
    OpCode, Value, ValueStack, Vm, NUM_BUILTINS, STACK_RESERVE_SIZE,
};
use proptest::prelude::*;

proptest! {
    /// Pushes and pops never take the stack pointer outside
    /// `[base-1, base + usable)`.
    #[test]
    fn stack_cursors_stay_in_bounds(ops in prop::collection::vec(any::<bool>(), 0..256)) {
        let mut stack = ValueStack::new(STACK_RESERVE_SIZE + 512, 1);
        for push in ops {
            if push {
                let _ = stack.push(Value::Int(1));
            } else {
                let _ = stack.pop();
            }
            prop_assert!(stack.sp() + 1 >= stack.base());
            prop_assert!(stack.sp() <= stack.usable());
            prop_assert!(stack.sp() < stack.limit());
        }
    }

    /// Push then pop returns the original immediate.
    #[test]
    fn push_pop_roundtrip(i in any::<i64>()) {
        let mut stack = ValueStack::new(STACK_RESERVE_SIZE + 64, 1);
        stack.push(Value::Int(i)).unwrap();
        prop_assert_eq!(stack.pop().unwrap(), Value::Int(i));
    }

    /// The GC marker traces exactly the live prefix, never the dead tail.
    #[test]
    fn marker_traces_exactly_the_live_prefix(
        pushes in 0usize..128,
        pops in 0usize..128,
    ) {
        let mut stack = ValueStack::new(STACK_RESERVE_SIZE + 256, 1);
        for i in 0..pushes {
            stack.push(Value::Int(i as i64)).unwrap();
        }
        for _ in 0..pops.min(pushes) {
            stack.pop().unwrap();
        }

        let mut traced = Vec::new();
        let count = mark_stack(&stack, &mut |v: &Value| traced.push(v.clone()));
        prop_assert_eq!(count, stack.sp());
        prop_assert_eq!(traced.len(), stack.sp());
        for (i, value) in traced.iter().enumerate() {
            prop_assert_eq!(value, &Value::Int(i as i64));
        }
    }

    /// `run` restores the cursors it found, success or not, and the
    /// delivered values match the arguments handed to `values`.
    #[test]
    fn run_is_cursor_neutral(args in prop::collection::vec(any::<i64>(), 0..24)) {
        let mut vm = Vm::new();
        let argv: Vec<Value> = args.iter().copied().map(Value::Int).collect();
        let result = run(
            &mut vm,
            builtins::builtin(BuiltinIndex::Values),
            &argv,
        ).unwrap();
        prop_assert_eq!(result, argv);
        prop_assert_eq!(vm.sp_word(), 0);
        prop_assert_eq!(vm.fp_word(), 0);
    }

    /// Same, through an erroring program.
    #[test]
    fn failed_run_is_cursor_neutral(word in 31u32..=255) {
        let mut vm = Vm::new();
        let bogus = program("bogus", vec![word], vec![]);
        prop_assert!(run(&mut vm, bogus, &[]).is_err());
        prop_assert_eq!(vm.sp_word(), 0);
        prop_assert_eq!(vm.fp_word(), 0);

        let halt = program("halt", vec![op24(OpCode::Halt, 0)], vec![]);
        prop_assert!(run(&mut vm, halt, &[]).unwrap().is_empty());
    }
}

#[test]
fn builtin_roundtrip_holds_for_every_entry() {
    for idx in 0..NUM_BUILTINS {
        let name = builtin_index_to_name(idx).unwrap();
        assert_eq!(builtin_name_to_index(name), Some(idx));
    }
    assert_eq!(builtin_name_to_index("values"), Some(BuiltinIndex::Values as usize));
    assert_eq!(builtin_name_to_index("frobnicate"), None);
}
