//! The instruction-dispatch harness.
//!
//! One generic dispatch body, [`vm_engine`], instantiated twice: the
//! regular engine compiles the hook plumbing away entirely, the debug
//! engine publishes trace events around the distinguished control
//! transfers. Opcode semantics are written once and shared — the engines
//! differ only in the hook policy.
//!
//! An invocation pushes a boot frame whose return address is the boot
//! continuation (a one-instruction HALT program), copies the procedure
//! and arguments in as the first callee frame, and iterates. Dispatch is
//! strictly sequential within a VM; control leaves the loop only at HALT,
//! an uncaught abort, or a raised error.

use std::rc::Rc;

use crate::builtins;
use crate::cont::{self, CaptureRegs};
use crate::dynstack::DynEntry;
use crate::error::{VmError, VmException};
use crate::frame::{self, FRAME_OVERHEAD};
use crate::hooks::{dispatch_hook, HookEvent};
use crate::op_code::OpCode;
use crate::program::{field24, field_a, field_b, signed24, CodeBlock, CodePtr};
use crate::value::Value;
use crate::vm::Vm;

/// Hook policy: the only difference between the two engines.
pub(crate) trait EngineMode {
    const DEBUG: bool;
}

/// The fast path: no hook dispatch compiled in.
pub(crate) struct RegularEngine;

/// The instrumented path: trace events fire while the trace level is
/// positive.
pub(crate) struct DebugEngine;

impl EngineMode for RegularEngine {
    const DEBUG: bool = false;
}

impl EngineMode for DebugEngine {
    const DEBUG: bool = true;
}

pub(crate) type EngineFn =
    fn(&mut Vm, Value, &[Value]) -> Result<Vec<Value>, VmException>;

/// Engine entry points, indexed by the VM's engine selector.
pub(crate) static ENGINES: [EngineFn; 2] =
    [vm_engine::<RegularEngine>, vm_engine::<DebugEngine>];

/// Run `proc` on whichever engine the VM currently selects. The engine
/// cannot change mid-execution; nested invocations re-read the selector.
pub(crate) fn run_internal(
    vm: &mut Vm,
    proc: Value,
    argv: &[Value],
) -> Result<Vec<Value>, VmException> {
    ENGINES[vm.engine() as usize](vm, proc, argv)
}

fn vm_engine<M: EngineMode>(
    vm: &mut Vm,
    proc: Value,
    argv: &[Value],
) -> Result<Vec<Value>, VmException> {
    let registers = vm.next_registers();
    let saved_ip = vm.ip.clone();
    let saved_sp = vm.stack.sp();
    let saved_fp = vm.stack.fp();
    let saved_dynstack = vm.dynstack.len();
    log::trace!(
        "vm {} run: engine={}, registers={registers}, nargs={}",
        vm.id(),
        if M::DEBUG { "debug" } else { "regular" },
        argv.len()
    );

    let result = engine_body::<M>(vm, proc, argv, registers);

    if let Err(VmException::Reenter { .. }) = result {
        // Control is leaving for an outer engine invocation whose prompt
        // caught an abort; that invocation's state is already installed,
        // so this one must not restore anything on the way out.
        return result;
    }

    unwind_leftovers(vm, saved_dynstack);
    vm.ip = saved_ip;
    vm.stack.set_sp(saved_sp);
    vm.stack.set_fp(saved_fp);
    vm.stack.re_arm_reserve();
    result
}

/// Pop dynamic-stack entries this invocation leaves behind, running their
/// unwind effects. Errors raised by unwinders at this point cannot
/// usefully propagate; they are logged and dropped.
fn unwind_leftovers(vm: &mut Vm, depth: usize) {
    while vm.dynstack.len() > depth {
        let entry = match vm.dynstack.pop() {
            Some(entry) => entry,
            None => break,
        };
        if let DynEntry::Winder { unwind, .. } = &*entry {
            if let Err(err) = run_internal(vm, unwind.clone(), &[]) {
                log::warn!("error in unwinder while leaving run: {err:?}");
            }
        }
    }
}

/// What a single dispatch step decided.
enum Flow {
    Continue,
    Halt(Vec<Value>),
}

fn engine_body<M: EngineMode>(
    vm: &mut Vm,
    proc: Value,
    argv: &[Value],
    registers: u64,
) -> Result<Vec<Value>, VmException> {
    vm.stack.reserve(2 * FRAME_OVERHEAD + 2 + argv.len())?;

    // Boot frame: the synthetic caller every run returns to. Its return
    // address is the boot continuation, whose single HALT instruction
    // collects the delivered values.
    let boot = builtins::boot_continuation();
    let Value::Program(boot_program) = &boot else {
        return Err(VmError::bad_instruction(0).into());
    };
    let boot_entry = boot_program.entry();
    vm.stack.push(Value::DynLink(0))?;
    vm.stack.push(Value::Bool(false))?;
    vm.stack.push(Value::Bool(false))?;
    vm.stack.push(boot.clone())?;
    let boot_fp = vm.stack.sp();

    // First callee frame: the procedure under `run` with its arguments.
    vm.stack.push(Value::DynLink(boot_fp))?;
    vm.stack.push(Value::CodeAddr(boot_entry))?;
    vm.stack.push(Value::Bool(false))?;
    vm.stack.push(proc)?;
    let base = vm.stack.sp();
    for arg in argv {
        vm.stack.push(arg.clone())?;
    }
    vm.stack.set_fp(base);

    enter_apply::<M>(vm, registers)?;

    loop {
        match step::<M>(vm, registers) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Halt(values)) => return Ok(values),
            Err(VmException::Reenter { registers: target }) if target == registers => {
                // An abort landed on a prompt owned by this invocation;
                // the handler state is installed, keep dispatching.
            }
            Err(other) => return Err(other),
        }
    }
}

fn fetch(vm: &Vm) -> Result<(Rc<CodeBlock>, usize, u32), VmException> {
    let ip = match &vm.ip {
        Some(ip) => ip,
        None => return Err(VmError::bad_instruction(u32::MAX).into()),
    };
    let code = Rc::clone(ip.code());
    let pos = ip.pos();
    match code.word(pos) {
        Some(word) => Ok((code, pos, word)),
        None => Err(VmError::bad_instruction(u32::MAX).into()),
    }
}

fn operand_word(code: &CodeBlock, pos: usize, word: u32) -> Result<u32, VmException> {
    code.word(pos + 1)
        .ok_or_else(|| VmError::bad_instruction(word).into())
}

fn advance(vm: &mut Vm, code: Rc<CodeBlock>, pos: usize, width: usize) {
    vm.ip = Some(CodePtr::at(code, pos + width));
}

/// Resolve the procedure in local 0 of the current frame and transfer to
/// it: programs get their entry address, continuations are reinstated,
/// anything else is not applicable.
fn enter_apply<M: EngineMode>(vm: &mut Vm, registers: u64) -> Result<(), VmException> {
    if M::DEBUG && vm.trace_level() > 0 {
        dispatch_hook(vm, HookEvent::Apply, &[]);
    }

    let fp = vm.stack.fp();
    let proc = vm.stack.get(fp)?.clone();
    match proc {
        Value::Program(program) => {
            vm.ip = Some(program.entry());
            Ok(())
        }
        Value::Continuation(cont) => {
            let sp = vm.stack.sp();
            let args: Vec<Value> = if sp > fp {
                vm.stack.cells()[fp + 1..=sp].to_vec()
            } else {
                Vec::new()
            };
            if cont.is_partial() {
                cont::reinstate_partial_continuation::<M>(vm, &cont, &args, registers)
            } else {
                cont::return_to_continuation::<M>(vm, &cont, &args, registers)
            }
        }
        other => Err(VmError::wrong_type_apply(other.to_string()).into()),
    }
}

fn step<M: EngineMode>(vm: &mut Vm, registers: u64) -> Result<Flow, VmException> {
    if M::DEBUG && vm.trace_level() > 0 {
        dispatch_hook(vm, HookEvent::Next, &[]);
    }

    let (code, pos, word) = fetch(vm)?;
    let op = OpCode::decode(word)?;
    let fp = vm.stack.fp();

    match op {
        OpCode::Halt => {
            let start = fp + 1 + FRAME_OVERHEAD;
            let sp = vm.stack.sp();
            let values = if sp >= start {
                vm.stack.cells()[start..=sp].to_vec()
            } else {
                Vec::new()
            };
            return Ok(Flow::Halt(values));
        }

        OpCode::Call => {
            let base = fp + field24(word) as usize;
            let nargs = (operand_word(&code, pos, word)? & 0x00ff_ffff) as usize;
            if nargs == 0 || base < FRAME_OVERHEAD + 1 {
                return Err(VmError::bad_instruction(word).into());
            }
            let new_sp = base + nargs - 1;
            if new_sp > vm.stack.sp() {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            } else {
                vm.stack.set_sp(new_sp);
            }
            let ra = CodePtr::at(Rc::clone(&code), pos + 2);
            frame::write_linkage(&mut vm.stack, base, fp, ra)?;
            vm.stack.set_fp(base);
            if M::DEBUG && vm.trace_level() > 0 {
                dispatch_hook(vm, HookEvent::PushContinuation, &[]);
            }
            enter_apply::<M>(vm, registers)?;
        }

        OpCode::TailCall => {
            let nargs = field24(word) as usize;
            if nargs == 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let new_sp = fp + nargs - 1;
            if new_sp > vm.stack.sp() {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            } else {
                vm.stack.set_sp(new_sp);
            }
            enter_apply::<M>(vm, registers)?;
        }

        OpCode::TailApply => {
            let sp = vm.stack.sp();
            if sp < fp + 2 {
                let proc = vm.stack.get(fp)?.to_string();
                return Err(VmError::wrong_num_args(proc).into());
            }
            let proc = vm.stack.get(fp + 1)?.clone();
            let tail = vm.stack.get(sp)?.clone();
            let tail_args = tail
                .list_to_vec()
                .ok_or_else(|| VmError::apply_to_non_list(tail.to_string()))?;
            let middle: Vec<Value> = vm.stack.cells()[fp + 2..sp].to_vec();

            let total = 1 + middle.len() + tail_args.len();
            let new_sp = fp + total - 1;
            if new_sp > sp {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            } else {
                vm.stack.set_sp(new_sp);
            }
            vm.stack.set(fp, proc)?;
            for (i, arg) in middle.iter().chain(tail_args.iter()).enumerate() {
                vm.stack.set(fp + 1 + i, arg.clone())?;
            }
            enter_apply::<M>(vm, registers)?;
        }

        OpCode::TailCallShuffle => {
            let from = field24(word) as usize;
            if from == 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let sp = vm.stack.sp();
            let src = fp + from;
            let count = (sp + 1).saturating_sub(src);
            vm.stack.shift_down(fp + 1, src, count);
            vm.stack.set_sp(fp + count);
            enter_apply::<M>(vm, registers)?;
        }

        OpCode::ReturnValues => {
            let sp = vm.stack.sp();
            let n = sp.checked_sub(fp).ok_or(VmError::StackUnderflow)?;
            if M::DEBUG && vm.trace_level() > 0 {
                let values: Vec<Value> = vm.stack.cells()[fp + 1..=sp].to_vec();
                dispatch_hook(vm, HookEvent::PopContinuation, &values);
            }
            let dl = frame::dynamic_link(&vm.stack, fp)?;
            let ra = frame::return_address(&vm.stack, fp)?;
            vm.stack.shift_down(fp, fp + 1, n);
            vm.stack.set_sp(fp + n - 1);
            vm.stack.set_fp(dl);
            vm.ip = Some(ra);
        }

        OpCode::Return => {
            let src = field24(word) as usize;
            let value = vm.stack.get(fp + src)?.clone();
            if M::DEBUG && vm.trace_level() > 0 {
                dispatch_hook(vm, HookEvent::PopContinuation, &[value.clone()]);
            }
            let dl = frame::dynamic_link(&vm.stack, fp)?;
            let ra = frame::return_address(&vm.stack, fp)?;
            vm.stack.set(fp, value)?;
            vm.stack.set_sp(fp);
            vm.stack.set_fp(dl);
            vm.ip = Some(ra);
        }

        OpCode::Receive => {
            let dst = field_a(word) as usize;
            let src_base = field_b(word) as usize;
            let nlocals = (operand_word(&code, pos, word)? & 0x00ff_ffff) as usize;
            if nlocals == 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let vbase = fp + src_base;
            let sp = vm.stack.sp();
            if sp + 1 <= vbase {
                return Err(VmError::NoValues.into());
            }
            let value = vm.stack.get(vbase)?.clone();
            let new_sp = fp + nlocals - 1;
            if new_sp > sp {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            } else {
                vm.stack.set_sp(new_sp);
            }
            vm.stack.set(fp + dst, value)?;
            advance(vm, code, pos, 2);
        }

        OpCode::ReceiveValues => {
            let vbase = fp + field24(word) as usize;
            let operand = operand_word(&code, pos, word)?;
            let expected = (operand & 0x00ff_ffff) as usize;
            let allow_extra = operand & (1 << 24) != 0;
            let n = (vm.stack.sp() + 1).saturating_sub(vbase);
            if allow_extra {
                if n < expected {
                    return Err(VmError::NotEnoughValues.into());
                }
            } else if n != expected {
                return Err(VmError::wrong_number_of_values(expected as u32).into());
            }
            advance(vm, code, pos, 2);
        }

        OpCode::AssertNargsEe => {
            let expected = field24(word) as usize;
            let nargs = (vm.stack.sp() + 1).saturating_sub(fp);
            if nargs != expected {
                let proc = vm.stack.get(fp)?.to_string();
                return Err(VmError::wrong_num_args(proc).into());
            }
            advance(vm, code, pos, 1);
        }

        OpCode::AssertNargsGe => {
            let expected = field24(word) as usize;
            let nargs = (vm.stack.sp() + 1).saturating_sub(fp);
            if nargs < expected {
                let proc = vm.stack.get(fp)?.to_string();
                return Err(VmError::wrong_num_args(proc).into());
            }
            advance(vm, code, pos, 1);
        }

        OpCode::AllocFrame => {
            let nlocals = field24(word) as usize;
            if nlocals == 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let new_sp = fp + nlocals - 1;
            if new_sp > vm.stack.sp() {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            }
            advance(vm, code, pos, 1);
        }

        OpCode::ReserveLocals => {
            let nlocals = field24(word) as usize;
            if nlocals == 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let new_sp = fp + nlocals - 1;
            if new_sp > vm.stack.sp() {
                vm.stack.grow_to(new_sp, Value::Bool(false))?;
            } else {
                vm.stack.set_sp(new_sp);
            }
            advance(vm, code, pos, 1);
        }

        OpCode::Mov => {
            let value = vm.stack.get(fp + field_b(word) as usize)?.clone();
            vm.stack.set(fp + field_a(word) as usize, value)?;
            advance(vm, code, pos, 1);
        }

        OpCode::LoadConstant => {
            let value = code
                .constant(field_b(word) as usize)
                .ok_or(VmError::BadInstruction { word })?
                .clone();
            vm.stack.set(fp + field_a(word) as usize, value)?;
            advance(vm, code, pos, 1);
        }

        OpCode::BuiltinRef => {
            let value = builtins::builtin_ref(field_b(word) as usize)
                .ok_or(VmError::BadInstruction { word })?;
            vm.stack.set(fp + field_a(word) as usize, value)?;
            advance(vm, code, pos, 1);
        }

        OpCode::FreeRef => {
            let value = match vm.stack.get(fp)? {
                Value::Program(program) => program
                    .free_ref(field_b(word) as usize)
                    .ok_or(VmError::BadInstruction { word })?
                    .clone(),
                _ => return Err(VmError::bad_instruction(word).into()),
            };
            vm.stack.set(fp + field_a(word) as usize, value)?;
            advance(vm, code, pos, 1);
        }

        OpCode::Push => {
            let value = vm.stack.get(fp + field24(word) as usize)?.clone();
            vm.stack.push(value)?;
            advance(vm, code, pos, 1);
        }

        OpCode::Drop => {
            vm.stack.drop_cells(field24(word) as usize)?;
            advance(vm, code, pos, 1);
        }

        OpCode::Add => {
            let dst = field24(word) as usize;
            let operand = operand_word(&code, pos, word)?;
            let a = vm.stack.get(fp + (operand & 0xfff) as usize)?;
            let b = vm.stack.get(fp + ((operand >> 12) & 0xfff) as usize)?;
            let sum = match (a, b) {
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_add(*y)),
                (Value::Int(_), other) | (other, _) => {
                    let text = other.to_string();
                    return Err(VmError::not_a_number("add", text.as_str()).into());
                }
            };
            vm.stack.set(fp + dst, sum)?;
            advance(vm, code, pos, 2);
        }

        OpCode::Cons => {
            let dst = field24(word) as usize;
            let operand = operand_word(&code, pos, word)?;
            let car = vm.stack.get(fp + (operand & 0xfff) as usize)?.clone();
            let cdr = vm.stack.get(fp + ((operand >> 12) & 0xfff) as usize)?.clone();
            vm.stack.set(fp + dst, Value::cons(car, cdr))?;
            advance(vm, code, pos, 2);
        }

        OpCode::Car => {
            let value = vm.stack.get(fp + field_b(word) as usize)?.clone();
            let car = match &value {
                Value::Pair(cell) => cell.0.clone(),
                other => {
                    let text = other.to_string();
                    return Err(VmError::not_a_pair("car", text.as_str()).into());
                }
            };
            vm.stack.set(fp + field_a(word) as usize, car)?;
            advance(vm, code, pos, 1);
        }

        OpCode::Cdr => {
            let value = vm.stack.get(fp + field_b(word) as usize)?.clone();
            let cdr = match &value {
                Value::Pair(cell) => cell.1.clone(),
                other => {
                    let text = other.to_string();
                    return Err(VmError::not_a_pair("cdr", text.as_str()).into());
                }
            };
            vm.stack.set(fp + field_a(word) as usize, cdr)?;
            advance(vm, code, pos, 1);
        }

        OpCode::Br => {
            let target = pos as i64 + signed24(field24(word)) as i64;
            if target < 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            vm.ip = Some(CodePtr::at(code, target as usize));
        }

        OpCode::BrIfTrue => {
            let operand = operand_word(&code, pos, word)?;
            let test = vm.stack.get(fp + field24(word) as usize)?;
            if test.is_true() {
                let target = pos as i64 + signed24(operand & 0x00ff_ffff) as i64;
                if target < 0 {
                    return Err(VmError::bad_instruction(word).into());
                }
                vm.ip = Some(CodePtr::at(code, target as usize));
            } else {
                advance(vm, code, pos, 2);
            }
        }

        OpCode::Prompt => {
            let tag = vm.stack.get(fp + field24(word) as usize)?.clone();
            let operand = operand_word(&code, pos, word)?;
            let escape_only = operand & (1 << 24) != 0;
            let target = pos as i64 + signed24(operand & 0x00ff_ffff) as i64;
            if target < 0 {
                return Err(VmError::bad_instruction(word).into());
            }
            let handler = CodePtr::at(Rc::clone(&code), target as usize);
            let entry = cont::make_prompt(vm, tag, handler, registers, escape_only);
            vm.dynstack.push_prompt(entry);
            advance(vm, code, pos, 2);
        }

        OpCode::Unwind => {
            if vm.dynstack.pop().is_none() {
                log::warn!("unwind with empty dynamic stack");
            }
            advance(vm, code, pos, 1);
        }

        OpCode::Abort => {
            let sp = vm.stack.sp();
            if sp < fp + 1 {
                let proc = vm.stack.get(fp)?.to_string();
                return Err(VmError::wrong_num_args(proc).into());
            }
            let tag = vm.stack.get(fp + 1)?.clone();
            let stack_args: Vec<Value> = if sp > fp + 1 {
                vm.stack.cells()[fp + 2..=sp].to_vec()
            } else {
                Vec::new()
            };
            let caller = CaptureRegs {
                sp: fp.checked_sub(1).ok_or(VmError::StackUnderflow)?,
                fp: frame::dynamic_link(&vm.stack, fp)?,
                ra: frame::return_address(&vm.stack, fp)?,
            };
            cont::abort_to_prompt::<M>(vm, tag, &stack_args, Value::Nil, &caller, registers)?;
        }

        OpCode::CallCc => {
            let sp = vm.stack.sp();
            if sp < fp + 1 {
                let proc = vm.stack.get(fp)?.to_string();
                return Err(VmError::wrong_num_args(proc).into());
            }
            let proc = vm.stack.get(fp + 1)?.clone();
            let capture_sp = fp
                .checked_sub(FRAME_OVERHEAD + 1)
                .ok_or(VmError::StackUnderflow)?;
            let regs = CaptureRegs {
                sp: capture_sp,
                fp: frame::dynamic_link(&vm.stack, fp)?,
                ra: frame::return_address(&vm.stack, fp)?,
            };
            let k = cont::capture_stack(vm, &regs, vm.dynstack.capture_all());
            vm.stack.set(fp, proc)?;
            vm.stack.set(fp + 1, k)?;
            vm.stack.set_sp(fp + 1);
            enter_apply::<M>(vm, registers)?;
        }

        OpCode::BindKwargs => {
            bind_kwargs(vm, &code, pos, word)?;
            advance(vm, code, pos, 2);
        }

        OpCode::Wind => {
            let wind = vm.stack.get(fp + field_a(word) as usize)?.clone();
            let unwind = vm.stack.get(fp + field_b(word) as usize)?.clone();
            vm.dynstack.push_winder(wind, unwind);
            advance(vm, code, pos, 1);
        }
    }

    Ok(Flow::Continue)
}

/// Parse the keyword/value tail of the current frame. Positional locals
/// stay put; keyword values land in the slots the keyword list names;
/// everything else is a keyword-argument error.
fn bind_kwargs(vm: &mut Vm, code: &CodeBlock, pos: usize, word: u32) -> Result<(), VmException> {
    let nreq = field_a(word) as usize;
    let ntotal = field_b(word) as usize;
    let operand = operand_word(code, pos, word)?;
    let kwlist = code
        .constant((operand & 0x00ff_ffff) as usize)
        .ok_or(VmError::BadInstruction { word })?
        .clone();
    let accepted = kwlist
        .list_to_vec()
        .ok_or(VmError::BadInstruction { word })?;

    let fp = vm.stack.fp();
    let sp = vm.stack.sp();
    let nargs = (sp + 1).saturating_sub(fp);
    let proc = vm.stack.get(fp)?.to_string();
    if nargs < nreq || ntotal < nreq {
        return Err(VmError::wrong_num_args(proc).into());
    }

    let tail: Vec<Value> = if sp + 1 > fp + nreq {
        vm.stack.cells()[fp + nreq..=sp].to_vec()
    } else {
        Vec::new()
    };
    if tail.len() % 2 != 0 {
        return Err(VmError::kwargs_length_not_even(proc).into());
    }

    let new_sp = fp + ntotal - 1;
    if new_sp > sp {
        vm.stack.grow_to(new_sp, Value::Unbound)?;
    } else {
        vm.stack.set_sp(new_sp);
    }

    for chunk in tail.chunks(2) {
        let keyword = &chunk[0];
        if !matches!(keyword, Value::Keyword(_)) {
            return Err(
                VmError::kwargs_invalid_keyword(proc.clone(), keyword.to_string()).into(),
            );
        }
        let mut slot = None;
        for entry in &accepted {
            if let Value::Pair(cell) = entry {
                if cell.0.eqv(keyword) {
                    if let Value::Int(idx) = cell.1 {
                        slot = Some(idx as usize);
                        break;
                    }
                }
            }
        }
        let slot = slot.ok_or_else(|| {
            VmError::kwargs_unrecognized_keyword(proc.clone(), keyword.to_string())
        })?;
        vm.stack.set(fp + slot, chunk[1].clone())?;
    }
    Ok(())
}
