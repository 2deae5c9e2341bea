//! Trace hooks fired by the debug engine.
//!
//! Six events bracket the distinguished control transfers. Each VM owns
//! one [`Hook`] slot per event; dispatch is live only in the debug engine
//! and only while the VM's trace level is positive. A hook procedure gets
//! a transient [`FrameView`] mirroring the cursors at the event instant —
//! the borrow ends with the call, so the view cannot escape.

use std::rc::Rc;

use crate::frame::FrameView;
use crate::value::Value;
use crate::vm::Vm;

/// Number of hook slots per VM.
pub const NUM_HOOKS: usize = 6;

/// The trace events the debug engine publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum HookEvent {
    /// Immediately before transferring to a callee.
    #[display(fmt = "apply")]
    Apply = 0,
    /// Immediately after establishing a frame that will consume a return.
    #[display(fmt = "push-continuation")]
    PushContinuation = 1,
    /// Immediately before returning values to a prior frame.
    #[display(fmt = "pop-continuation")]
    PopContinuation = 2,
    /// At every instruction boundary.
    #[display(fmt = "next")]
    Next = 3,
    /// When a prompt abort is about to unwind.
    #[display(fmt = "abort-continuation")]
    AbortContinuation = 4,
    /// When a captured continuation is being reinstated.
    #[display(fmt = "restore-continuation")]
    RestoreContinuation = 5,
}

/// A hook procedure: called with the frame view and the event's extra
/// arguments (return values, abort arguments, and so on).
pub type HookProc = Rc<dyn Fn(&FrameView<'_>, &[Value])>;

/// A procedure list attached to one trace event. An empty hook is
/// disabled; dispatch checks this before saving any state.
#[derive(Clone, Default)]
pub struct Hook {
    procs: Vec<HookProc>,
}

impl Hook {
    /// Append a procedure to the hook.
    pub fn add(&mut self, proc: HookProc) {
        self.procs.push(proc);
    }

    /// Remove every procedure.
    pub fn clear(&mut self) {
        self.procs.clear();
    }

    /// True when no procedures are attached.
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Number of attached procedures.
    pub fn len(&self) -> usize {
        self.procs.len()
    }

    fn run(&self, frame: &FrameView<'_>, args: &[Value]) {
        for proc in &self.procs {
            proc(frame, args);
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hook({} procs)", self.procs.len())
    }
}

/// Publish `event` to the VM's hook slot.
///
/// No-op when the slot is empty. Otherwise the trace level is saved and
/// zeroed for the duration so hooks cannot recursively trigger hooks, a
/// frame view mirroring the current cursors is synthesized, and each
/// procedure runs with it; the trace level is restored afterwards.
pub(crate) fn dispatch_hook(vm: &mut Vm, event: HookEvent, args: &[Value]) {
    let slot = event as usize;
    if vm.hooks[slot].is_empty() {
        return;
    }

    let saved_trace_level = vm.trace_level();
    vm.set_trace_level(0);

    let hook = vm.hooks[slot].clone();
    let view = FrameView::new(&vm.stack, vm.ip.clone());
    hook.run(&view, args);

    vm.set_trace_level(saved_trace_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_empty_hook_is_disabled() {
        let hook = Hook::default();
        assert!(hook.is_empty());
    }

    #[test]
    fn test_hook_runs_procs_in_order() {
        let order = Rc::new(Cell::new(0));
        let mut hook = Hook::default();
        for expect in 0..3 {
            let order = Rc::clone(&order);
            hook.add(Rc::new(move |_frame, _args| {
                assert_eq!(order.get(), expect);
                order.set(expect + 1);
            }));
        }
        let mut vm = Vm::new();
        *vm.next_hook() = hook;
        dispatch_hook(&mut vm, HookEvent::Next, &[]);
        assert_eq!(order.get(), 3);
    }

    #[test]
    fn test_dispatch_zeroes_trace_level() {
        let seen = Rc::new(Cell::new(-1i64));
        let mut vm = Vm::new();
        vm.set_trace_level(2);
        {
            let seen = Rc::clone(&seen);
            vm.apply_hook().add(Rc::new(move |_frame, _args| {
                // The dispatching VM has trace level 0 while hooks run;
                // observed indirectly through the restored value below.
                seen.set(seen.get() + 1);
            }));
        }
        dispatch_hook(&mut vm, HookEvent::Apply, &[]);
        assert_eq!(vm.trace_level(), 2);
        assert_eq!(seen.get(), 0);
    }
}
