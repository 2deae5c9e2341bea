//! The VM object, the per-thread registry, and `run`.
//!
//! A [`Vm`] owns one value stack, its cursors, an engine selector, a
//! trace level and the trace-hook slots. Exactly one VM is current per
//! thread (created lazily on first use); more can exist as plain values
//! and be installed for a dynamic extent with [`call_with_vm`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use once_cell::sync::Lazy;

use crate::dynstack::{DynEntry, DynStack};
use crate::engine;
use crate::error::{VmError, VmException, VmResult};
use crate::hooks::{Hook, NUM_HOOKS};
use crate::program::CodePtr;
use crate::stack::ValueStack;
use crate::value::Value;

/// Smallest accepted stack size, in cells.
pub const VM_MIN_STACK_SIZE: usize = 1024;

/// Stack size used when the environment does not override it.
pub const VM_DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Environment variable consulted once for the default stack size.
pub const STACK_SIZE_ENV: &str = "LYRA_STACK_SIZE";

static DEFAULT_STACK_SIZE: Lazy<usize> = Lazy::new(|| match std::env::var(STACK_SIZE_ENV) {
    Ok(text) => match text.trim().parse::<usize>() {
        Ok(size) if size >= VM_MIN_STACK_SIZE => size,
        _ => {
            log::warn!("ignoring {STACK_SIZE_ENV}={text:?}: below minimum or not a number");
            VM_DEFAULT_STACK_SIZE
        }
    },
    Err(_) => VM_DEFAULT_STACK_SIZE,
});

static DEFAULT_ENGINE: AtomicU8 = AtomicU8::new(0);
static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Engine selector: one opcode semantics, two instrumentation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum VmEngine {
    /// The fast path.
    #[display(fmt = "regular")]
    Regular = 0,
    /// The hook-firing path.
    #[display(fmt = "debug")]
    Debug = 1,
}

impl VmEngine {
    /// Parse an engine name.
    pub fn from_name(name: &str) -> VmResult<Self> {
        match name {
            "regular" => Ok(VmEngine::Regular),
            "debug" => Ok(VmEngine::Debug),
            other => Err(VmError::unknown_engine(other)),
        }
    }

    fn from_index(idx: u8) -> Self {
        if idx == VmEngine::Debug as u8 {
            VmEngine::Debug
        } else {
            VmEngine::Regular
        }
    }
}

/// Set the engine newly created VMs start with. Written at configuration
/// time; concurrent readers may see a stale value, which is tolerated.
pub fn set_default_vm_engine(engine: VmEngine) {
    DEFAULT_ENGINE.store(engine as u8, Ordering::Relaxed);
}

/// The engine newly created VMs start with.
pub fn default_vm_engine() -> VmEngine {
    VmEngine::from_index(DEFAULT_ENGINE.load(Ordering::Relaxed))
}

/// One instance of the execution machinery.
pub struct Vm {
    pub(crate) stack: ValueStack,
    pub(crate) ip: Option<CodePtr>,
    pub(crate) dynstack: DynStack,
    pub(crate) hooks: [Hook; NUM_HOOKS],
    engine: VmEngine,
    trace_level: i32,
    id: u64,
    registers_nonce: u64,
}

impl Vm {
    /// A VM with the process-default stack size and engine.
    pub fn new() -> Self {
        Self::with_stack_size(*DEFAULT_STACK_SIZE)
    }

    /// A VM with an explicit stack size (clamped to the minimum).
    pub fn with_stack_size(size: usize) -> Self {
        let size = size.max(VM_MIN_STACK_SIZE);
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        Vm {
            stack: ValueStack::new(size, id),
            ip: None,
            dynstack: DynStack::new(),
            hooks: std::array::from_fn(|_| Hook::default()),
            engine: default_vm_engine(),
            trace_level: 0,
            id,
            registers_nonce: 0,
        }
    }

    /// This VM's identity; continuation snapshots remember it.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The value stack, for inspection and GC marking.
    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    /// Current engine.
    pub fn engine(&self) -> VmEngine {
        self.engine
    }

    /// Select the engine used by the next `run`; the engine in use does
    /// not change mid-execution.
    pub fn set_engine(&mut self, engine: VmEngine) {
        self.engine = engine;
    }

    /// Current trace level. Hook dispatch is live while it is positive
    /// and the debug engine is selected.
    pub fn trace_level(&self) -> i32 {
        self.trace_level
    }

    /// Set the trace level.
    pub fn set_trace_level(&mut self, level: i32) {
        self.trace_level = level;
    }

    /// The instruction pointer as a plain word, for inspection.
    pub fn ip_word(&self) -> usize {
        self.ip.as_ref().map(CodePtr::pos).unwrap_or(0)
    }

    /// The stack pointer as a plain word, for inspection.
    pub fn sp_word(&self) -> usize {
        self.stack.sp()
    }

    /// The frame pointer as a plain word, for inspection.
    pub fn fp_word(&self) -> usize {
        self.stack.fp()
    }

    /// The apply hook slot.
    pub fn apply_hook(&mut self) -> &mut Hook {
        &mut self.hooks[0]
    }

    /// The push-continuation hook slot.
    pub fn push_continuation_hook(&mut self) -> &mut Hook {
        &mut self.hooks[1]
    }

    /// The pop-continuation hook slot.
    pub fn pop_continuation_hook(&mut self) -> &mut Hook {
        &mut self.hooks[2]
    }

    /// The next-instruction hook slot.
    pub fn next_hook(&mut self) -> &mut Hook {
        &mut self.hooks[3]
    }

    /// The abort-continuation hook slot.
    pub fn abort_continuation_hook(&mut self) -> &mut Hook {
        &mut self.hooks[4]
    }

    /// The restore-continuation hook slot.
    pub fn restore_continuation_hook(&mut self) -> &mut Hook {
        &mut self.hooks[5]
    }

    /// A fresh registers handle for one engine invocation.
    pub(crate) fn next_registers(&mut self) -> u64 {
        self.registers_nonce += 1;
        self.registers_nonce
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<vm {}-engine {}>", self.engine, self.id)
    }
}

/// Run `proc` with `argv` on `vm`, returning its values.
///
/// Control comes back only at HALT (one or more values), at an abort
/// that found no enclosing prompt, or through a raised error. The VM's
/// cursors are restored on exit either way, so a caught error leaves the
/// VM usable.
pub fn run(vm: &mut Vm, proc: Value, argv: &[Value]) -> VmResult<Vec<Value>> {
    match engine::run_internal(vm, proc, argv) {
        Ok(values) => Ok(values),
        Err(VmException::Error(err)) => Err(err),
        Err(VmException::Reenter { registers }) => {
            // A prompt whose engine invocation already exited cannot be
            // resumed; surface it as an unrewindable extent.
            log::error!("abort targeted dead engine registers {registers}");
            Err(VmError::continuation_not_rewindable("#<dead-prompt>"))
        }
    }
}

thread_local! {
    static CURRENT_VM: RefCell<Option<Rc<RefCell<Vm>>>> = const { RefCell::new(None) };
}

/// The current thread's VM, created lazily.
pub fn the_vm() -> Rc<RefCell<Vm>> {
    CURRENT_VM.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(vm) => Rc::clone(vm),
            None => {
                let vm = Rc::new(RefCell::new(Vm::new()));
                *slot = Some(Rc::clone(&vm));
                vm
            }
        }
    })
}

/// Apply `proc` to `args` in a dynamic extent in which `vm` is the
/// current VM.
///
/// As an implementation restriction, if `vm` is not the same as the
/// current thread's VM, continuations captured within the call may not
/// be reinstated once control leaves it: the extent is entered behind a
/// non-rewindable barrier, because a continuation only saves the state
/// of the VM it was captured in.
pub fn call_with_vm(vm: &Rc<RefCell<Vm>>, proc: Value, args: &[Value]) -> VmResult<Vec<Value>> {
    let prev = the_vm();
    let switching = !Rc::ptr_eq(&prev, vm);

    if switching {
        let id = vm.borrow().id();
        CURRENT_VM.with(|slot| *slot.borrow_mut() = Some(Rc::clone(vm)));
        vm.borrow_mut().dynstack.push_barrier(id);
    }

    let result = run(&mut vm.borrow_mut(), proc, args);

    if switching {
        let mut guard = vm.borrow_mut();
        if matches!(
            guard.dynstack.top(),
            Some(entry) if matches!(**entry, DynEntry::Barrier { .. })
        ) {
            guard.dynstack.pop();
        }
        drop(guard);
        CURRENT_VM.with(|slot| *slot.borrow_mut() = Some(prev));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_names() {
        assert_eq!(VmEngine::from_name("regular").unwrap(), VmEngine::Regular);
        assert_eq!(VmEngine::from_name("debug").unwrap(), VmEngine::Debug);
        assert!(matches!(
            VmEngine::from_name("turbo"),
            Err(VmError::UnknownEngine { .. })
        ));
        assert_eq!(VmEngine::Debug.to_string(), "debug");
    }

    #[test]
    fn test_stack_size_clamped_to_minimum() {
        let vm = Vm::with_stack_size(16);
        assert_eq!(vm.stack().usable(), VM_MIN_STACK_SIZE - 1);
    }

    #[test]
    fn test_vm_ids_are_unique() {
        let a = Vm::new();
        let b = Vm::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_the_vm_is_stable_per_thread() {
        let a = the_vm();
        let b = the_vm();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_cursor_words_start_at_rest() {
        let vm = Vm::new();
        assert_eq!(vm.ip_word(), 0);
        assert_eq!(vm.sp_word(), 0);
        assert_eq!(vm.fp_word(), 0);
    }
}
