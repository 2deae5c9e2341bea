//! Opcode definitions for the Lyra VM.
//!
//! An instruction is one or more 32-bit words. The low 8 bits of the first
//! word select the opcode; the remaining 24 bits hold one 24-bit operand or
//! two 12-bit operands. Multi-word instructions consume following words as
//! additional operands. The encoding is shared by both engines.

use crate::error::{VmError, VmResult};

/// The instructions understood by the dispatch harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Collect the values delivered to the boot frame and leave `run`.
    Halt = 0,
    /// `call base; nargs` — enter the procedure at local `base`.
    Call = 1,
    /// `tail-call nargs` — re-enter the procedure in local 0.
    TailCall = 2,
    /// Tail call local 1 with flattened arguments; last local is a list tail.
    TailApply = 3,
    /// `tail-call-shuffle from` — shuffle locals down to 1.. and tail call.
    TailCallShuffle = 4,
    /// Return locals 1.. as values to the calling frame.
    ReturnValues = 5,
    /// `return src` — return a single value.
    Return = 6,
    /// `receive dst,base; nlocals` — single-value return site.
    Receive = 7,
    /// `receive-values base; nvalues` — multi-value return site.
    ReceiveValues = 8,
    /// Raise WrongNumArgs unless nargs is exactly the operand.
    AssertNargsEe = 9,
    /// Raise WrongNumArgs unless nargs is at least the operand.
    AssertNargsGe = 10,
    /// Grow the frame to the operand's number of locals.
    AllocFrame = 11,
    /// Grow or shrink the frame to the operand's number of locals.
    ReserveLocals = 12,
    /// `mov dst,src` — copy between locals.
    Mov = 13,
    /// `load-constant dst,idx` — load from the constant pool.
    LoadConstant = 14,
    /// `builtin-ref dst,idx` — load an entry of the builtin table.
    BuiltinRef = 15,
    /// `free-ref dst,idx` — load a captured free variable.
    FreeRef = 16,
    /// `push src` — push a local, growing the stack by one cell.
    Push = 17,
    /// `drop n` — drop cells from the top of the stack.
    Drop = 18,
    /// `add dst; a,b` — fixnum addition.
    Add = 19,
    /// `cons dst; a,b`.
    Cons = 20,
    /// `car dst,src`.
    Car = 21,
    /// `cdr dst,src`.
    Cdr = 22,
    /// `br offset` — relative branch, signed 24-bit word offset.
    Br = 23,
    /// `br-if-true src; offset`.
    BrIfTrue = 24,
    /// `prompt tag; handler-offset|escape-only` — push a prompt.
    Prompt = 25,
    /// Pop one dynamic-stack entry on normal exit from its extent.
    Unwind = 26,
    /// Abort to the prompt whose tag is in local 1.
    Abort = 27,
    /// Capture the caller's continuation, tail call local 1 with it.
    CallCc = 28,
    /// `bind-kwargs nreq,ntotal; kwlist` — parse keyword arguments.
    BindKwargs = 29,
    /// `wind wind,unwind` — push a winder pair onto the dynamic stack.
    Wind = 30,
}

impl OpCode {
    /// Total width of the instruction in 32-bit words.
    pub fn width(self) -> usize {
        match self {
            OpCode::Call
            | OpCode::Receive
            | OpCode::ReceiveValues
            | OpCode::Add
            | OpCode::Cons
            | OpCode::BrIfTrue
            | OpCode::Prompt
            | OpCode::BindKwargs => 2,
            _ => 1,
        }
    }

    /// Decode the opcode byte of an instruction word.
    pub fn decode(word: u32) -> VmResult<Self> {
        Self::try_from((word & 0xff) as u8).map_err(|_| VmError::bad_instruction(word))
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        let op = match byte {
            0 => OpCode::Halt,
            1 => OpCode::Call,
            2 => OpCode::TailCall,
            3 => OpCode::TailApply,
            4 => OpCode::TailCallShuffle,
            5 => OpCode::ReturnValues,
            6 => OpCode::Return,
            7 => OpCode::Receive,
            8 => OpCode::ReceiveValues,
            9 => OpCode::AssertNargsEe,
            10 => OpCode::AssertNargsGe,
            11 => OpCode::AllocFrame,
            12 => OpCode::ReserveLocals,
            13 => OpCode::Mov,
            14 => OpCode::LoadConstant,
            15 => OpCode::BuiltinRef,
            16 => OpCode::FreeRef,
            17 => OpCode::Push,
            18 => OpCode::Drop,
            19 => OpCode::Add,
            20 => OpCode::Cons,
            21 => OpCode::Car,
            22 => OpCode::Cdr,
            23 => OpCode::Br,
            24 => OpCode::BrIfTrue,
            25 => OpCode::Prompt,
            26 => OpCode::Unwind,
            27 => OpCode::Abort,
            28 => OpCode::CallCc,
            29 => OpCode::BindKwargs,
            30 => OpCode::Wind,
            other => return Err(other),
        };
        Ok(op)
    }
}
