//! Shared helpers for the integration tests: a thin hand-assembler over
//! the instruction word packers.

use lyra_vm::{Arity, CodeBlock, Program, Value};

/// Wrap raw instruction words and constants as a runnable program value.
pub fn program(name: &str, words: Vec<u32>, consts: Vec<Value>) -> Value {
    Value::Program(Program::new(
        CodeBlock::new(Some(name), words, consts),
        Arity::at_least(0),
    ))
}
