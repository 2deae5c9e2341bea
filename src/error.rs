//! Error types for the Lyra VM crate.
//!
//! Every failure the execution core can raise is a variant of [`VmError`],
//! carrying the context a handler outside the VM needs to report it. Errors
//! propagate by unwinding out of `run`; nothing in the core catches them.

use thiserror::Error;

/// Result alias used throughout the VM.
pub type VmResult<T> = Result<T, VmError>;

/// The sub-reason of a keyword-argument error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum KeywordArgumentReason {
    /// The keyword/value tail of the argument list had odd length.
    #[display(fmt = "Odd length of keyword argument list")]
    OddLength,
    /// An object appeared where a keyword was expected.
    #[display(fmt = "Invalid keyword")]
    InvalidKeyword,
    /// A keyword was not among those the procedure accepts.
    #[display(fmt = "Unrecognized keyword")]
    UnrecognizedKeyword,
}

/// VM execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// An instruction word whose opcode byte is not defined.
    #[error("VM: Bad instruction: {word:#010x}")]
    BadInstruction { word: u32 },

    /// A top-level variable lookup missed.
    #[error("Unbound variable in {proc}: {symbol}")]
    Unbound { proc: String, symbol: String },

    /// A fluid had no binding in the current dynamic extent.
    #[error("Unbound fluid in {proc}: {fluid}")]
    UnboundFluid { proc: String, fluid: String },

    /// A variable object was expected.
    #[error("{subr}: Not a variable: {value}")]
    NotAVariable { subr: String, value: String },

    /// A pair was expected.
    #[error("{subr}: Not a pair: {value}")]
    NotAPair { subr: String, value: String },

    /// A number was expected.
    #[error("{subr}: Not a number: {value}")]
    NotANumber { subr: String, value: String },

    /// A bytevector was expected.
    #[error("{subr}: Not a bytevector: {value}")]
    NotAByteVector { subr: String, value: String },

    /// A structure was expected.
    #[error("{subr}: Not a struct: {value}")]
    NotAStruct { subr: String, value: String },

    /// The last argument to `apply` was not a list.
    #[error("Apply to non-list: {value}")]
    ApplyToNonList { value: String },

    /// A proper list was required but the tail was something else.
    #[error("Expected a proper list, but got object with tail {tail}")]
    ImproperList { tail: String },

    /// Keyword-argument parsing failed.
    #[error("{reason} in call to {proc}")]
    KeywordArgumentError {
        reason: KeywordArgumentReason,
        proc: String,
        /// The offending object, when there is one.
        value: Option<String>,
    },

    /// More arguments than the VM can pass.
    #[error("VM: Too many arguments: {nargs}")]
    TooManyArgs { nargs: usize },

    /// A procedure was called with an arity it does not accept.
    #[error("Wrong number of arguments to {proc}")]
    WrongNumArgs { proc: String },

    /// Application of a non-procedure.
    #[error("Wrong type to apply: {proc}")]
    WrongTypeApply { proc: String },

    /// The value stack ran out of room.
    #[error("VM: Stack overflow")]
    StackOverflow,

    /// A frame operation reached below the live stack.
    #[error("VM: Stack underflow")]
    StackUnderflow,

    /// Zero values were returned to a single-value continuation.
    #[error("Zero values returned to single-valued continuation")]
    NoValues,

    /// Fewer values than the receiver requires.
    #[error("Too few values returned to continuation")]
    NotEnoughValues,

    /// A fixed-arity receiver got the wrong number of values.
    #[error("Wrong number of values returned to continuation (expected {expected})")]
    WrongNumberOfValues { expected: u32 },

    /// A continuation whose dynamic extent cannot be re-entered.
    #[error("Unrewindable partial continuation: {cont}")]
    ContinuationNotRewindable { cont: String },

    /// A wide string with an impossible length field.
    #[error("VM: Bad wide string length: {len}")]
    BadWideStringLength { len: usize },

    /// An abort found no enclosing prompt with a matching tag.
    #[error("Abort to unknown prompt tag: {tag}")]
    MissingPrompt { tag: String },

    /// An engine name that is neither `regular` nor `debug`.
    #[error("Unknown VM engine: {name}")]
    UnknownEngine { name: String },
}

impl VmError {
    /// Create a new bad-instruction error from the raw instruction word.
    pub fn bad_instruction(word: u32) -> Self {
        Self::BadInstruction { word }
    }

    /// Create a new unbound-variable error.
    pub fn unbound<S: Into<String>>(proc: S, symbol: S) -> Self {
        Self::Unbound {
            proc: proc.into(),
            symbol: symbol.into(),
        }
    }

    /// Create a new unbound-fluid error.
    pub fn unbound_fluid<S: Into<String>>(proc: S, fluid: S) -> Self {
        Self::UnboundFluid {
            proc: proc.into(),
            fluid: fluid.into(),
        }
    }

    /// Create a new not-a-variable error.
    pub fn not_a_variable<S: Into<String>>(subr: S, value: S) -> Self {
        Self::NotAVariable {
            subr: subr.into(),
            value: value.into(),
        }
    }

    /// Create a new not-a-pair error.
    pub fn not_a_pair<S: Into<String>>(subr: S, value: S) -> Self {
        Self::NotAPair {
            subr: subr.into(),
            value: value.into(),
        }
    }

    /// Create a new not-a-number error.
    pub fn not_a_number<S: Into<String>>(subr: S, value: S) -> Self {
        Self::NotANumber {
            subr: subr.into(),
            value: value.into(),
        }
    }

    /// Create a new not-a-bytevector error.
    pub fn not_a_bytevector<S: Into<String>>(subr: S, value: S) -> Self {
        Self::NotAByteVector {
            subr: subr.into(),
            value: value.into(),
        }
    }

    /// Create a new not-a-struct error.
    pub fn not_a_struct<S: Into<String>>(subr: S, value: S) -> Self {
        Self::NotAStruct {
            subr: subr.into(),
            value: value.into(),
        }
    }

    /// Create a new apply-to-non-list error.
    pub fn apply_to_non_list<S: Into<String>>(value: S) -> Self {
        Self::ApplyToNonList {
            value: value.into(),
        }
    }

    /// Create a new improper-list error carrying the offending tail.
    pub fn improper_list<S: Into<String>>(tail: S) -> Self {
        Self::ImproperList { tail: tail.into() }
    }

    /// Create a new odd-length keyword-argument error.
    pub fn kwargs_length_not_even<S: Into<String>>(proc: S) -> Self {
        Self::KeywordArgumentError {
            reason: KeywordArgumentReason::OddLength,
            proc: proc.into(),
            value: None,
        }
    }

    /// Create a new invalid-keyword error.
    pub fn kwargs_invalid_keyword<S: Into<String>>(proc: S, value: S) -> Self {
        Self::KeywordArgumentError {
            reason: KeywordArgumentReason::InvalidKeyword,
            proc: proc.into(),
            value: Some(value.into()),
        }
    }

    /// Create a new unrecognized-keyword error.
    pub fn kwargs_unrecognized_keyword<S: Into<String>>(proc: S, value: S) -> Self {
        Self::KeywordArgumentError {
            reason: KeywordArgumentReason::UnrecognizedKeyword,
            proc: proc.into(),
            value: Some(value.into()),
        }
    }

    /// Create a new too-many-arguments error.
    pub fn too_many_args(nargs: usize) -> Self {
        Self::TooManyArgs { nargs }
    }

    /// Create a new wrong-arity error naming the procedure.
    pub fn wrong_num_args<S: Into<String>>(proc: S) -> Self {
        Self::WrongNumArgs { proc: proc.into() }
    }

    /// Create a new wrong-type-to-apply error.
    pub fn wrong_type_apply<S: Into<String>>(proc: S) -> Self {
        Self::WrongTypeApply { proc: proc.into() }
    }

    /// Create a new wrong-number-of-values error.
    pub fn wrong_number_of_values(expected: u32) -> Self {
        Self::WrongNumberOfValues { expected }
    }

    /// Create a new continuation-not-rewindable error.
    pub fn continuation_not_rewindable<S: Into<String>>(cont: S) -> Self {
        Self::ContinuationNotRewindable { cont: cont.into() }
    }

    /// Create a new bad-wide-string-length error.
    pub fn bad_wide_string_length(len: usize) -> Self {
        Self::BadWideStringLength { len }
    }

    /// Create a new missing-prompt error.
    pub fn missing_prompt<S: Into<String>>(tag: S) -> Self {
        Self::MissingPrompt { tag: tag.into() }
    }

    /// Create a new unknown-engine error.
    pub fn unknown_engine<S: Into<String>>(name: S) -> Self {
        Self::UnknownEngine { name: name.into() }
    }
}

/// Internal engine signal: either a raised error, or a non-local transfer
/// targeting the engine invocation that owns a prompt's saved registers.
/// `Reenter` never escapes `run`; the owning invocation catches it and
/// resumes dispatch with the state the control operator installed.
#[derive(Debug)]
pub(crate) enum VmException {
    Error(VmError),
    Reenter { registers: u64 },
}

impl From<VmError> for VmException {
    fn from(err: VmError) -> Self {
        VmException::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VmError::bad_instruction(0xdead_beef);
        assert_eq!(err.to_string(), "VM: Bad instruction: 0xdeadbeef");

        let err = VmError::wrong_number_of_values(2);
        assert_eq!(
            err.to_string(),
            "Wrong number of values returned to continuation (expected 2)"
        );
    }

    #[test]
    fn test_kwargs_reasons_are_distinct() {
        let odd = VmError::kwargs_length_not_even("f");
        let invalid = VmError::kwargs_invalid_keyword("f", "5");
        let unknown = VmError::kwargs_unrecognized_keyword("f", "#:q");
        assert_ne!(odd, invalid);
        assert_ne!(invalid, unknown);
        assert!(odd.to_string().contains("Odd length"));
        assert!(unknown.to_string().contains("Unrecognized"));
    }

    #[test]
    fn test_constructors_carry_context() {
        match VmError::not_a_pair("car", "5") {
            VmError::NotAPair { subr, value } => {
                assert_eq!(subr, "car");
                assert_eq!(value, "5");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
