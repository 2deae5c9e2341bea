//! VM-resident builtin procedures.
//!
//! The higher-order primitives the VM itself must know about — `apply`,
//! `values`, `abort-to-prompt`, `call-with-values` and `call/cc` — are
//! expressed as tiny bytecode stubs rather than as native calls. That
//! keeps the call/return protocol uniform: `apply` can apply them, and
//! `call/cc` composes with them with no special cases. Each table entry
//! carries its minimum-arity metadata, and the VM exposes name↔index
//! mappings over the table.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::op_code::OpCode;
use crate::program::{op12_12, op24, Arity, CodeBlock, Program};
use crate::value::Value;

/// One row of the builtin table.
#[derive(Debug, Clone, Copy)]
struct BuiltinDescriptor {
    name: &'static str,
    code: &'static [u32],
    required: u32,
    optional: u32,
    rest: bool,
}

/// The boot continuation: one instruction that collects the values
/// delivered to the boot frame and leaves `run`.
const BOOT_CODE: [u32; 1] = [op24(OpCode::Halt, 0)];

/// `apply`: proc in local 1, arguments from local 2, list tail last.
const APPLY_CODE: [u32; 2] = [
    op24(OpCode::AssertNargsGe, 3),
    op24(OpCode::TailApply, 0),
];

/// `values`: locals 1.. are the values.
const VALUES_CODE: [u32; 1] = [op24(OpCode::ReturnValues, 0)];

/// `abort-to-prompt`: tag in local 1, values from local 2. The abort
/// captures the caller's registers, so the trailing return is only
/// reached if the abort itself is somehow resumed in place.
const ABORT_TO_PROMPT_CODE: [u32; 3] = [
    op24(OpCode::AssertNargsGe, 2),
    op24(OpCode::Abort, 0),
    op24(OpCode::ReturnValues, 0),
];

/// `call-with-values`: call the producer in a fresh frame at slot 6, then
/// shuffle whatever it returned into a tail call of the consumer.
const CALL_WITH_VALUES_CODE: [u32; 7] = [
    op24(OpCode::AssertNargsEe, 3),
    op24(OpCode::AllocFrame, 7),
    op12_12(OpCode::Mov, 6, 1),
    op24(OpCode::Call, 6),
    1, // nargs
    op12_12(OpCode::Mov, 0, 2),
    op24(OpCode::TailCallShuffle, 6),
];

/// `call-with-current-continuation`: capture, then tail call local 1
/// with the reified continuation.
const CALL_WITH_CURRENT_CONTINUATION_CODE: [u32; 2] = [
    op24(OpCode::AssertNargsEe, 2),
    op24(OpCode::CallCc, 0),
];

macro_rules! define_builtins {
    ($(($name:ident, $variant:ident, $scm_name:literal, $req:literal, $opt:literal, $rest:literal)),* $(,)?) => {
        /// Symbolic indices into the builtin table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum BuiltinIndex {
            $($variant,)*
        }

        /// Number of builtins in the table.
        pub const NUM_BUILTINS: usize = [$(stringify!($name)),*].len();

        paste::paste! {
            const DESCRIPTORS: [BuiltinDescriptor; NUM_BUILTINS] = [
                $(
                    BuiltinDescriptor {
                        name: $scm_name,
                        code: &[<$name:upper _CODE>],
                        required: $req,
                        optional: $opt,
                        rest: $rest,
                    },
                )*
            ];
        }
    };
}

define_builtins! {
    (apply, Apply, "apply", 2, 0, true),
    (values, Values, "values", 0, 0, true),
    (abort_to_prompt, AbortToPrompt, "abort-to-prompt", 1, 0, true),
    (call_with_values, CallWithValues, "call-with-values", 2, 0, false),
    (call_with_current_continuation, CallCc, "call-with-current-continuation", 1, 0, false),
}

static NAME_TO_INDEX: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    DESCRIPTORS
        .iter()
        .enumerate()
        .map(|(idx, desc)| (desc.name, idx))
        .collect()
});

thread_local! {
    static PROGRAMS: Vec<Value> = DESCRIPTORS.iter().map(instantiate).collect();
    static BOOT: Value = Value::Program(Program::boot(CodeBlock::new(
        Some("%boot"),
        BOOT_CODE.to_vec(),
        Vec::new(),
    )));
}

fn instantiate(desc: &BuiltinDescriptor) -> Value {
    let code = CodeBlock::new(Some(desc.name), desc.code.to_vec(), Vec::new());
    let arity = Arity {
        required: desc.required,
        optional: desc.optional,
        rest: desc.rest,
    };
    Value::Program(Program::new(code, arity))
}

/// The builtin program at table index `idx`.
pub fn builtin_ref(idx: usize) -> Option<Value> {
    if idx >= NUM_BUILTINS {
        return None;
    }
    PROGRAMS.with(|programs| programs.get(idx).cloned())
}

/// The builtin program for a symbolic index.
pub fn builtin(index: BuiltinIndex) -> Value {
    // Indices from the enum are always in range.
    builtin_ref(index as usize).unwrap_or(Value::Bool(false))
}

/// `builtin-name->index`.
pub fn builtin_name_to_index(name: &str) -> Option<usize> {
    NAME_TO_INDEX.get(name).copied()
}

/// `builtin-index->name`.
pub fn builtin_index_to_name(idx: usize) -> Option<&'static str> {
    DESCRIPTORS.get(idx).map(|desc| desc.name)
}

/// The boot continuation program.
pub(crate) fn boot_continuation() -> Value {
    BOOT.with(Value::clone)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_index_roundtrip() {
        for idx in 0..NUM_BUILTINS {
            let name = builtin_index_to_name(idx).unwrap();
            assert_eq!(builtin_name_to_index(name), Some(idx));
        }
        assert_eq!(builtin_name_to_index("no-such-builtin"), None);
        assert_eq!(builtin_index_to_name(NUM_BUILTINS), None);
    }

    #[test]
    fn test_arity_metadata() {
        let Value::Program(apply) = builtin(BuiltinIndex::Apply) else {
            panic!("expected a program");
        };
        assert_eq!(apply.arity(), Arity::at_least(2));
        assert_eq!(apply.name(), Some("apply"));

        let Value::Program(cwv) = builtin(BuiltinIndex::CallWithValues) else {
            panic!("expected a program");
        };
        assert_eq!(cwv.arity(), Arity::exactly(2));
    }

    #[test]
    fn test_boot_program_is_marked() {
        let Value::Program(boot) = boot_continuation() else {
            panic!("expected a program");
        };
        assert!(boot.is_boot());
        assert_eq!(boot.code().word(0), Some(op24(OpCode::Halt, 0)));
    }

    #[test]
    fn test_builtins_are_per_thread_but_stable() {
        let a = builtin(BuiltinIndex::Values);
        let b = builtin(BuiltinIndex::Values);
        assert!(a.eqv(&b));
    }
}
