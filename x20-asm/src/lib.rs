//! Instruction encoding, decoding and formatting for the x20 virtual machine.
//!
//! This crate has no knowledge of memory, cores or execution; it only knows
//! how a 32-bit instruction word maps to and from the typed [`Instruction`]
//! enum.

mod format;
mod instruction;
mod opcode;

pub use format::{sign_extend16, sign_extend20, Format};
pub use instruction::{Instruction, InstructionAt, Reg};
pub use opcode::{consts, Opcode};

/// A raw instruction word, as stored in VM memory or an object file.
pub type Word = i32;

/// Errors produced while decoding an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The low byte of the word did not match any entry in the opcode table.
    #[error("unknown opcode byte 0x{0:02x}")]
    UnknownOpcode(u8),
}
