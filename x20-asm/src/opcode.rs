//! Raw opcode values and the typed [`Opcode`] enum.
//!
//! The opcode occupies the low byte of the instruction word; the remaining
//! bits carry register indices and signed immediates whose width depends on
//! the instruction's format (see [`crate::format::Format`]).

use core::fmt;

pub mod consts {
    //! Raw opcode byte values, in opcode-table order.
    pub const HALT: u8 = 0x00;
    pub const LOAD: u8 = 0x01;
    pub const STORE: u8 = 0x02;
    pub const LDIMM: u8 = 0x03;
    pub const LDADDR: u8 = 0x04;
    pub const LDIND: u8 = 0x05;
    pub const STIND: u8 = 0x06;
    pub const ADDF: u8 = 0x07;
    pub const SUBF: u8 = 0x08;
    pub const DIVF: u8 = 0x09;
    pub const MULF: u8 = 0x0a;
    pub const ADDI: u8 = 0x0b;
    pub const SUBI: u8 = 0x0c;
    pub const DIVI: u8 = 0x0d;
    pub const MULI: u8 = 0x0e;
    pub const CALL: u8 = 0x0f;
    pub const RET: u8 = 0x10;
    pub const BLT: u8 = 0x11;
    pub const BGT: u8 = 0x12;
    pub const BEQ: u8 = 0x13;
    pub const JMP: u8 = 0x14;
    pub const CMPXCHG: u8 = 0x15;
    pub const GETPID: u8 = 0x16;
    pub const GETPN: u8 = 0x17;
    pub const PUSH: u8 = 0x18;
    pub const POP: u8 = 0x19;
    pub const NOP: u8 = 0x20;
}

use consts::*;

/// The mnemonic identified by an instruction word's low byte.
///
/// Every variant advances `$pc` by one word after executing, except `call`,
/// `ret`, `jmp`, `blt`, `bgt` and `beq`, which set `$pc` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Stop the executing core with normal termination.
    Halt = HALT,
    /// `r1 <- memory[pc + a]`
    Load = LOAD,
    /// `memory[pc + a] <- r1`
    Store = STORE,
    /// `r1 <- a`
    Ldimm = LDIMM,
    /// `r1 <- pc + a`
    Ldaddr = LDADDR,
    /// `r1 <- memory[r2 + off]`
    Ldind = LDIND,
    /// `memory[r2 + off] <- r1`
    Stind = STIND,
    /// `r1 <- float(r1) + float(r2)`
    Addf = ADDF,
    /// `r1 <- float(r1) - float(r2)`
    Subf = SUBF,
    /// `r1 <- float(r1) / float(r2)`
    Divf = DIVF,
    /// `r1 <- float(r1) * float(r2)`
    Mulf = MULF,
    /// `r1 <- r1 + r2`
    Addi = ADDI,
    /// `r1 <- r1 - r2`
    Subi = SUBI,
    /// `r1 <- r1 / r2`
    Divi = DIVI,
    /// `r1 <- r1 * r2`
    Muli = MULI,
    /// Push a call frame and branch into the callee.
    Call = CALL,
    /// Pop the current call frame and return to the caller.
    Ret = RET,
    /// Branch if `r1 < r2`.
    Blt = BLT,
    /// Branch if `r1 > r2`.
    Bgt = BGT,
    /// Branch if `r1 == r2`.
    Beq = BEQ,
    /// Unconditional branch.
    Jmp = JMP,
    /// Atomic compare-and-swap against memory, under the VM's memory lock.
    Cmpxchg = CMPXCHG,
    /// `r1 <- core id`
    Getpid = GETPID,
    /// `r1 <- number of processors`
    Getpn = GETPN,
    /// Push `r1` onto the stack.
    Push = PUSH,
    /// Pop the top of the stack into `r1`.
    Pop = POP,
    /// No effect beyond advancing `$pc`.
    Nop = NOP,
}

impl Opcode {
    /// Mnemonic text for disassembly output.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Load => "load",
            Self::Store => "store",
            Self::Ldimm => "ldimm",
            Self::Ldaddr => "ldaddr",
            Self::Ldind => "ldind",
            Self::Stind => "stind",
            Self::Addf => "addf",
            Self::Subf => "subf",
            Self::Divf => "divf",
            Self::Mulf => "mulf",
            Self::Addi => "addi",
            Self::Subi => "subi",
            Self::Divi => "divi",
            Self::Muli => "muli",
            Self::Call => "call",
            Self::Ret => "ret",
            Self::Blt => "blt",
            Self::Bgt => "bgt",
            Self::Beq => "beq",
            Self::Jmp => "jmp",
            Self::Cmpxchg => "cmpxchg",
            Self::Getpid => "getpid",
            Self::Getpn => "getpn",
            Self::Push => "push",
            Self::Pop => "pop",
            Self::Nop => "nop",
        }
    }

    pub(crate) const fn format(self) -> crate::format::Format {
        use crate::format::Format;
        match self {
            Self::Halt | Self::Ret | Self::Nop => Format::Op,
            Self::Call | Self::Jmp => Format::Addr,
            Self::Load | Self::Store | Self::Ldaddr => Format::RegAddr,
            Self::Ldimm => Format::RegConst,
            Self::Ldind | Self::Stind => Format::RegOff,
            Self::Addf | Self::Subf | Self::Divf | Self::Mulf | Self::Addi | Self::Subi
            | Self::Divi | Self::Muli => Format::RegReg,
            Self::Blt | Self::Bgt | Self::Beq | Self::Cmpxchg => Format::RegRegAddr,
            Self::Getpid | Self::Getpn | Self::Push | Self::Pop => Format::Reg,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl TryFrom<u8> for Opcode {
    type Error = crate::DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            HALT => Self::Halt,
            LOAD => Self::Load,
            STORE => Self::Store,
            LDIMM => Self::Ldimm,
            LDADDR => Self::Ldaddr,
            LDIND => Self::Ldind,
            STIND => Self::Stind,
            ADDF => Self::Addf,
            SUBF => Self::Subf,
            DIVF => Self::Divf,
            MULF => Self::Mulf,
            ADDI => Self::Addi,
            SUBI => Self::Subi,
            DIVI => Self::Divi,
            MULI => Self::Muli,
            CALL => Self::Call,
            RET => Self::Ret,
            BLT => Self::Blt,
            BGT => Self::Bgt,
            BEQ => Self::Beq,
            JMP => Self::Jmp,
            CMPXCHG => Self::Cmpxchg,
            GETPID => Self::Getpid,
            GETPN => Self::Getpn,
            PUSH => Self::Push,
            POP => Self::Pop,
            NOP => Self::Nop,
            other => return Err(crate::DecodeError::UnknownOpcode(other)),
        })
    }
}
