//! # Lyra Virtual Machine
//!
//! The execution core of the Lyra runtime: a register-based virtual
//! machine for a dynamically typed, multi-valued language with first-class
//! continuations.
//!
//! ## Architecture
//!
//! The VM is organized into a handful of cooperating components:
//!
//! - **Vm**: one instance of the machinery — a value stack, cursors, an
//!   engine selector, a trace level and hook slots
//! - **ValueStack**: fixed-capacity tagged-value stack with a reserve kept
//!   free for stack-overflow handling
//! - **Engine**: the instruction-dispatch harness, built once and
//!   instantiated as a fast *regular* engine and a hook-firing *debug*
//!   engine sharing one opcode semantics
//! - **ContinuationStore / ControlOps**: full and partial (delimited)
//!   continuation capture and reinstatement, and `abort-to-prompt`
//! - **DynStack**: the dynamic-environment stack of winders, prompts and
//!   barriers the control operators drive
//! - **Builtins**: `apply`, `values`, `call-with-values`, `call/cc` and
//!   `abort-to-prompt` as tiny bytecode stubs, so they compose with user
//!   code through the ordinary call/return protocol
//!
//! ## Example
//!
//! ```
//! use lyra_vm::{builtins, run, Value, Vm};
//!
//! let mut vm = Vm::new();
//! let values = builtins::builtin(builtins::BuiltinIndex::Values);
//! let result = run(&mut vm, values, &[Value::Int(1), Value::Int(2)]).unwrap();
//! assert_eq!(result, vec![Value::Int(1), Value::Int(2)]);
//! ```
//!
//! ## Concurrency
//!
//! A VM executes on at most one thread at a time and dispatch is strictly
//! sequential within it. Each thread has its own current VM; further VMs
//! can be installed for a dynamic extent with [`call_with_vm`], with the
//! restriction that continuations captured under a different VM cannot be
//! reinstated once that extent is left.

#![warn(rustdoc::missing_crate_level_docs)]

/// VM-resident builtin procedures and their name↔index table.
pub mod builtins;
/// Continuation snapshots and the control operators over them.
pub mod cont;
/// The dynamic-environment stack of winders, prompts and barriers.
pub mod dynstack;
/// The shared dispatch harness behind both engines.
mod engine;
/// VM error types and result handling.
pub mod error;
/// Call-frame layout and the transient frame view for hooks.
pub mod frame;
/// Trace hooks fired by the debug engine.
pub mod hooks;
/// Precise GC marking of the live stack prefix.
pub mod marker;
/// Opcode definitions and instruction word decoding.
pub mod op_code;
/// Compiled code blocks, code pointers and programs.
pub mod program;
/// The tagged value stack.
pub mod stack;
/// Dynamic values carried on the stack.
pub mod value;
/// The VM object, per-thread registry and `run`.
pub mod vm;

pub use builtins::{
    builtin_index_to_name, builtin_name_to_index, builtin_ref, BuiltinIndex, NUM_BUILTINS,
};
pub use cont::{ContFlags, VmCont};
pub use dynstack::{DynCapture, DynEntry, DynStack, PromptEntry, PromptFlags};
pub use error::{KeywordArgumentReason, VmError, VmResult};
pub use frame::{FrameView, FRAME_OVERHEAD};
pub use hooks::{Hook, HookEvent, HookProc, NUM_HOOKS};
pub use marker::{mark_stack, TraceSink};
pub use op_code::OpCode;
pub use program::{Arity, CodeBlock, CodePtr, Program};
pub use stack::{ValueStack, STACK_RESERVE_SIZE};
pub use value::Value;
pub use vm::{
    call_with_vm, default_vm_engine, run, set_default_vm_engine, the_vm, Vm, VmEngine,
    STACK_SIZE_ENV, VM_DEFAULT_STACK_SIZE, VM_MIN_STACK_SIZE,
};
