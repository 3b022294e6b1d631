//! Error taxonomy for the loader and interpreter.
//!
//! Callers of this crate get a typed [`LoadError`]/[`FaultKind`], but
//! [`FaultKind::code`] still exposes the `VMX20_*`-style negative return
//! code for anything that needs to cross a process or FFI boundary.

use std::io;

/// Failures that can occur while constructing a [`crate::Vm`] or loading an
/// executable into it, before any core starts running.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The object/executable file could not be read.
    #[error("failed to read executable file: {0}")]
    Io(#[from] io::Error),

    /// The file's header word count did not match the bytes actually
    /// present, or an insymbol/outsymbol entry was malformed.
    #[error("file is not a valid x20 executable")]
    NotValid,

    /// The file carries an outsymbol section, meaning it is an
    /// unresolved object file (`linkx20` output with `-c`, or a `.obj`),
    /// not a linked executable. `testvm` and [`crate::Vm::load`] both
    /// reject these; only `linkx20` consumes them.
    #[error("file contains unresolved outsymbols; link it before loading")]
    ContainsOutsymbols,

    /// `mainx20` was missing, or defined more than once, among the
    /// insymbols.
    #[error("file does not define exactly one `mainx20` entry point")]
    MissingOrDuplicateEntryPoint,

    /// The loaded code would not fit in [`crate::consts::MEM_WORDS`].
    #[error("program of {word_count} words exceeds memory of {capacity} words")]
    ProgramTooLarge { word_count: usize, capacity: usize },
}

impl LoadError {
    /// The historical `VMX20_*` negative return code for this condition.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Io(_) => -2,                        // VMX20_FILE_NOT_FOUND
            Self::NotValid => -3,                      // VMX20_FILE_IS_NOT_VALID
            Self::ContainsOutsymbols => -4,            // VMX20_FILE_CONTAINS_OUTSYMBOLS
            Self::MissingOrDuplicateEntryPoint => -3,  // VMX20_FILE_IS_NOT_VALID
            Self::ProgramTooLarge { .. } => -3,
        }
    }
}

/// A runtime fault raised by a single core's `fetchDecodeExecute` loop.
///
/// A fault terminates only the core that raised it; sibling cores keep
/// running. `halt` is not represented here — normal termination is
/// `Ok(())`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultKind {
    /// `divi`/`muli`-family division where the divisor register held 0.
    #[error("division by zero")]
    DivideByZero,
    /// A memory access, `call`/`ret`, `push`/`pop` or stack-frame operation
    /// addressed a word outside `progEnd..=stack_base` (or, for code
    /// fetch, outside `0..progEnd`).
    #[error("address out of range")]
    AddressOutOfRange,
    /// The opcode byte did not decode to a known instruction, or `pop`'s
    /// bounds check failed and was rejected rather than silently treated
    /// as illegal.
    #[error("illegal instruction")]
    IllegalInstruction,
}

impl FaultKind {
    /// The historical `VMX20_*` negative return code for this fault.
    pub const fn code(self) -> i32 {
        match self {
            Self::DivideByZero => -5,
            Self::AddressOutOfRange => -6,
            Self::IllegalInstruction => -7,
        }
    }
}

/// Errors returned by [`crate::Vm`] accessor methods (`get_word`,
/// `put_word`, `get_address`) once the VM is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The requested address is outside `0..MEM_WORDS`.
    #[error("address out of range")]
    OutOfRange,
    /// `get_address` was asked for a name not present in the insymbol table.
    #[error("unknown symbol")]
    UnknownSymbol,
}
