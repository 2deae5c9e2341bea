//! Continuation snapshots and the control operators over them.
//!
//! A [`VmCont`] is a heap-resident snapshot of a VM slice: either the
//! whole live stack (a full continuation) or the slice above a prompt (a
//! partial, delimited continuation), together with the saved cursors, a
//! captured dynamic-stack handle and a relocation base. Snapshots are
//! immutable once created and are reclaimed like any other value.
//!
//! The operators here — full reinstatement, partial reinstatement, and
//! abort-to-prompt — are reached from CALL-family opcodes and drive both
//! the value stack and the dynamic-environment stack. Control transfers
//! that target an outer engine invocation travel as
//! [`VmException::Reenter`] until the invocation owning the prompt's
//! registers catches them and resumes dispatch.

use std::rc::Rc;

use bitflags::bitflags;

use crate::dynstack::{DynCapture, DynEntry, PromptEntry};
use crate::engine::EngineMode;
use crate::error::{VmError, VmException};
use crate::frame::FRAME_OVERHEAD;
use crate::hooks::{dispatch_hook, HookEvent};
use crate::program::CodePtr;
use crate::value::Value;
use crate::vm::Vm;

bitflags! {
    /// Continuation snapshot flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContFlags: u8 {
        /// The snapshot covers only the slice above a prompt.
        const PARTIAL = 1 << 0;
        /// Reinstatement is permitted.
        const REWINDABLE = 1 << 1;
    }
}

/// A reified continuation: stack slice, cursors, dynamic extent.
#[derive(Debug)]
pub struct VmCont {
    stack_copy: Box<[Value]>,
    /// Stack index the copy was lifted from; the relocation offset of a
    /// reinstatement is computed against this.
    slice_base: usize,
    fp: usize,
    sp: usize,
    ra: CodePtr,
    dynstack: DynCapture,
    flags: ContFlags,
    vm_id: u64,
}

impl VmCont {
    /// True for partial (delimited) continuations.
    pub fn is_partial(&self) -> bool {
        self.flags.contains(ContFlags::PARTIAL)
    }

    /// Snapshot flags.
    pub fn flags(&self) -> ContFlags {
        self.flags
    }

    /// Number of copied cells.
    pub fn stack_size(&self) -> usize {
        self.stack_copy.len()
    }

    /// Id of the VM the snapshot was captured in.
    pub fn vm_id(&self) -> u64 {
        self.vm_id
    }

    /// Saved frame pointer.
    pub fn fp(&self) -> usize {
        self.fp
    }

    /// Saved stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Saved return address; reinstatement resumes here.
    pub fn ra(&self) -> &CodePtr {
        &self.ra
    }

    /// The captured dynamic-stack slice.
    pub fn dynstack(&self) -> &DynCapture {
        &self.dynstack
    }

    /// The copied cells, for inspection.
    pub fn stack_copy(&self) -> &[Value] {
        &self.stack_copy
    }
}

/// The registers a capture records: the cursors and return address of the
/// frame the continuation will deliver values to.
#[derive(Debug, Clone)]
pub(crate) struct CaptureRegs {
    pub sp: usize,
    pub fp: usize,
    pub ra: CodePtr,
}

/// Capture the whole live stack as a full continuation value.
pub(crate) fn capture_stack(vm: &Vm, regs: &CaptureRegs, dynstack: DynCapture) -> Value {
    let copy = vm.stack.cells()[1..=regs.sp].to_vec();
    log::trace!("captured full continuation of {} cells", copy.len());
    Value::Continuation(Rc::new(VmCont {
        stack_copy: copy.into_boxed_slice(),
        slice_base: 1,
        fp: regs.fp,
        sp: regs.sp,
        ra: regs.ra.clone(),
        dynstack,
        flags: ContFlags::REWINDABLE,
        vm_id: vm.id(),
    }))
}

/// Reinstate a full continuation: rewind the dynamic stack to the captured
/// extent, copy the saved cells back over the live area, push the empty
/// frame the return protocol expects, then the arguments, and resume at
/// the saved return address.
pub(crate) fn return_to_continuation<M: EngineMode>(
    vm: &mut Vm,
    cont: &Rc<VmCont>,
    args: &[Value],
    registers: u64,
) -> Result<(), VmException> {
    if cont.vm_id != vm.id() {
        return Err(VmError::continuation_not_rewindable(
            Value::Continuation(Rc::clone(cont)).to_string(),
        )
        .into());
    }
    if vm.stack.usable() < cont.stack_size() + args.len() + FRAME_OVERHEAD {
        return Err(VmError::StackOverflow.into());
    }

    if M::DEBUG && vm.trace_level() > 0 {
        dispatch_hook(vm, HookEvent::RestoreContinuation, args);
    }

    rewind_dynstack(vm, &cont.dynstack, registers)?;

    vm.stack.set_sp(cont.sp);
    vm.stack.restore(&cont.stack_copy, 1);
    vm.stack.set_fp(cont.fp);

    // Push on an empty frame, as the continuation expects.
    for _ in 0..FRAME_OVERHEAD {
        vm.stack.push(Value::Bool(false))?;
    }
    for arg in args {
        vm.stack.push(arg.clone())?;
    }
    vm.ip = Some(cont.ra.clone());
    Ok(())
}

/// Reinstate a partial continuation on top of the current frame.
pub(crate) fn reinstate_partial_continuation<M: EngineMode>(
    vm: &mut Vm,
    cont: &Rc<VmCont>,
    args: &[Value],
    registers: u64,
) -> Result<(), VmException> {
    let cont_name = || Value::Continuation(Rc::clone(cont)).to_string();
    if !cont.flags.contains(ContFlags::REWINDABLE) || cont.dynstack.has_barrier() {
        return Err(VmError::continuation_not_rewindable(cont_name()).into());
    }

    let base = vm.stack.fp();
    if base < vm.stack.base() {
        return Err(VmError::StackUnderflow.into());
    }
    let size = cont.stack_size();
    if (base - 1) + size + args.len() + 1 > vm.stack.usable() {
        return Err(VmError::StackOverflow.into());
    }

    if M::DEBUG && vm.trace_level() > 0 {
        dispatch_hook(vm, HookEvent::RestoreContinuation, args);
    }

    let reloc = base as isize - cont.slice_base as isize;
    vm.stack.set_sp(base + size - 1);
    vm.stack.restore(&cont.stack_copy, base);

    // Relocate the dynamic links of every transplanted frame. The walk
    // stops once a link's cell falls below the transplanted region; that
    // link already points into the live caller.
    let mut fp_walk = relocated(cont.fp, reloc);
    while fp_walk >= base + FRAME_OVERHEAD {
        let link = match vm.stack.get(fp_walk - 3)? {
            Value::DynLink(link) => *link,
            _ => return Err(VmError::StackUnderflow.into()),
        };
        let moved = relocated(link, reloc);
        vm.stack.set(fp_walk - 3, Value::DynLink(moved))?;
        fp_walk = moved;
    }

    vm.stack.set_fp(relocated(cont.fp, reloc));
    vm.ip = Some(cont.ra.clone());

    for arg in args {
        vm.stack.push(arg.clone())?;
    }

    // Wind the captured dynamic-stack slice back on, in capture order:
    // winders run their wind effect, prompts are re-registered with the
    // relocation applied and this invocation's registers.
    for entry in cont.dynstack.iter() {
        match &**entry {
            DynEntry::Winder { wind, .. } => {
                crate::engine::run_internal(vm, wind.clone(), &[])?;
                vm.dynstack.push_entry(Rc::clone(entry));
            }
            DynEntry::Prompt(prompt) => {
                vm.dynstack.push_prompt(prompt.rewound(reloc, registers));
            }
            DynEntry::Barrier { .. } => {
                return Err(VmError::continuation_not_rewindable(cont_name()).into());
            }
        }
    }

    log::trace!(
        "reinstated partial continuation of {size} cells at base {base} (reloc {reloc})"
    );
    Ok(())
}

/// Abort to the prompt tagged `tag`.
///
/// The stack arguments and the flattened tail list become the handler's
/// arguments, preceded by the partial continuation captured above the
/// prompt. Winders between the abort point and the prompt run their
/// unwind effects, the prompt itself is popped, and control transfers to
/// the handler — directly when the prompt belongs to this engine
/// invocation, as a `Reenter` signal otherwise.
pub(crate) fn abort_to_prompt<M: EngineMode>(
    vm: &mut Vm,
    tag: Value,
    stack_args: &[Value],
    tail: Value,
    caller: &CaptureRegs,
    registers: u64,
) -> Result<(), VmException> {
    let tail_args = tail
        .list_to_vec()
        .ok_or_else(|| VmError::improper_list(tail.to_string()))?;
    let mut argv = stack_args.to_vec();
    argv.extend(tail_args);

    let (prompt_idx, prompt) = match vm.dynstack.find_prompt(&tag) {
        Some((idx, prompt)) => (idx, prompt.clone()),
        None => return Err(VmError::missing_prompt(tag.to_string()).into()),
    };

    if M::DEBUG && vm.trace_level() > 0 {
        dispatch_hook(vm, HookEvent::AbortContinuation, &argv);
    }

    // Capture the slice above the prompt before anything unwinds.
    let slice = if caller.sp + 1 > prompt.fp {
        vm.stack.cells()[prompt.fp..=caller.sp].to_vec()
    } else {
        Vec::new()
    };
    let mut flags = ContFlags::PARTIAL;
    if !prompt.flags.contains(crate::dynstack::PromptFlags::ESCAPE_ONLY) {
        flags |= ContFlags::REWINDABLE;
    }
    let cont = Value::Continuation(Rc::new(VmCont {
        stack_copy: slice.into_boxed_slice(),
        slice_base: prompt.fp,
        fp: caller.fp,
        sp: caller.sp,
        ra: caller.ra.clone(),
        dynstack: vm.dynstack.capture_above(prompt_idx),
        flags,
        vm_id: vm.id(),
    }));

    // Unwind to the prompt, running unwind effects, then pop the prompt.
    while vm.dynstack.len() > prompt_idx {
        let entry = match vm.dynstack.pop() {
            Some(entry) => entry,
            None => break,
        };
        if let DynEntry::Winder { unwind, .. } = &*entry {
            crate::engine::run_internal(vm, unwind.clone(), &[])?;
        }
    }

    vm.stack.set_sp(prompt.sp);
    vm.stack.set_fp(prompt.fp);
    vm.stack.push(cont)?;
    for arg in &argv {
        vm.stack.push(arg.clone())?;
    }
    vm.ip = Some(prompt.handler.clone());

    log::debug!(
        "abort to prompt {tag} with {} argument(s), target registers {}",
        argv.len(),
        prompt.registers
    );
    if prompt.registers == registers {
        Ok(())
    } else {
        Err(VmException::Reenter {
            registers: prompt.registers,
        })
    }
}

/// Rewind the live dynamic stack to a full continuation's captured extent:
/// unwind everything above the shared prefix, then wind the captured tail
/// back on in capture order.
fn rewind_dynstack(vm: &mut Vm, target: &DynCapture, registers: u64) -> Result<(), VmException> {
    let common = vm.dynstack.common_prefix(target);

    while vm.dynstack.len() > common {
        let entry = match vm.dynstack.pop() {
            Some(entry) => entry,
            None => break,
        };
        if let DynEntry::Winder { unwind, .. } = &*entry {
            crate::engine::run_internal(vm, unwind.clone(), &[])?;
        }
    }

    for entry in target.entries()[common..].iter() {
        match &**entry {
            DynEntry::Winder { wind, .. } => {
                crate::engine::run_internal(vm, wind.clone(), &[])?;
                vm.dynstack.push_entry(Rc::clone(entry));
            }
            DynEntry::Prompt(prompt) => {
                vm.dynstack.push_prompt(prompt.rewound(0, registers));
            }
            DynEntry::Barrier { .. } => {
                return Err(
                    VmError::continuation_not_rewindable("#<vm-continuation>").into(),
                );
            }
        }
    }
    Ok(())
}

fn relocated(index: usize, reloc: isize) -> usize {
    (index as isize + reloc) as usize
}

/// Build a prompt entry for the current cursors.
pub(crate) fn make_prompt(
    vm: &Vm,
    tag: Value,
    handler: CodePtr,
    registers: u64,
    escape_only: bool,
) -> PromptEntry {
    let mut flags = crate::dynstack::PromptFlags::empty();
    if escape_only {
        flags |= crate::dynstack::PromptFlags::ESCAPE_ONLY;
    }
    PromptEntry {
        tag,
        fp: vm.stack.fp(),
        sp: vm.stack.sp(),
        handler,
        registers,
        flags,
    }
}
