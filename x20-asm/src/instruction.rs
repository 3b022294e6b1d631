//! The decoded, typed form of an instruction word, and its formatter.

use core::fmt;

use crate::{
    format::{sign_extend16, sign_extend20, Format},
    opcode::Opcode,
    DecodeError,
};

/// A register index in `0..16`.
///
/// `r13` is the frame pointer, `r14` the stack pointer, `r15` the program
/// counter by convention; this type does not special-case them. Reservedness
/// is a property of the interpreter, not the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(u8);

impl Reg {
    /// Frame pointer register index.
    pub const FP: Reg = Reg(13);
    /// Stack pointer register index.
    pub const SP: Reg = Reg(14);
    /// Program counter register index.
    pub const PC: Reg = Reg(15);

    /// Builds a register from a raw 4-bit index. Panics if `index >= 16`.
    pub const fn new(index: u8) -> Self {
        assert!(index < 16, "register index out of range");
        Reg(index)
    }

    /// The raw register index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A fully decoded instruction, with the opcode's operands interpreted
/// according to its [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Halt,
    Load { r1: Reg, addr: i32 },
    Store { r1: Reg, addr: i32 },
    Ldimm { r1: Reg, value: i32 },
    Ldaddr { r1: Reg, addr: i32 },
    Ldind { r1: Reg, r2: Reg, off: i32 },
    Stind { r1: Reg, r2: Reg, off: i32 },
    Addf { r1: Reg, r2: Reg },
    Subf { r1: Reg, r2: Reg },
    Divf { r1: Reg, r2: Reg },
    Mulf { r1: Reg, r2: Reg },
    Addi { r1: Reg, r2: Reg },
    Subi { r1: Reg, r2: Reg },
    Divi { r1: Reg, r2: Reg },
    Muli { r1: Reg, r2: Reg },
    Call { addr: i32 },
    Ret,
    Blt { r1: Reg, r2: Reg, addr: i32 },
    Bgt { r1: Reg, r2: Reg, addr: i32 },
    Beq { r1: Reg, r2: Reg, addr: i32 },
    Jmp { addr: i32 },
    Cmpxchg { r1: Reg, r2: Reg, addr: i32 },
    Getpid { r1: Reg },
    Getpn { r1: Reg },
    Push { r1: Reg },
    Pop { r1: Reg },
    Nop,
}

impl Instruction {
    /// The opcode this instruction was decoded from (or would encode to).
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Halt => Opcode::Halt,
            Self::Load { .. } => Opcode::Load,
            Self::Store { .. } => Opcode::Store,
            Self::Ldimm { .. } => Opcode::Ldimm,
            Self::Ldaddr { .. } => Opcode::Ldaddr,
            Self::Ldind { .. } => Opcode::Ldind,
            Self::Stind { .. } => Opcode::Stind,
            Self::Addf { .. } => Opcode::Addf,
            Self::Subf { .. } => Opcode::Subf,
            Self::Divf { .. } => Opcode::Divf,
            Self::Mulf { .. } => Opcode::Mulf,
            Self::Addi { .. } => Opcode::Addi,
            Self::Subi { .. } => Opcode::Subi,
            Self::Divi { .. } => Opcode::Divi,
            Self::Muli { .. } => Opcode::Muli,
            Self::Call { .. } => Opcode::Call,
            Self::Ret => Opcode::Ret,
            Self::Blt { .. } => Opcode::Blt,
            Self::Bgt { .. } => Opcode::Bgt,
            Self::Beq { .. } => Opcode::Beq,
            Self::Jmp { .. } => Opcode::Jmp,
            Self::Cmpxchg { .. } => Opcode::Cmpxchg,
            Self::Getpid { .. } => Opcode::Getpid,
            Self::Getpn { .. } => Opcode::Getpn,
            Self::Push { .. } => Opcode::Push,
            Self::Pop { .. } => Opcode::Pop,
            Self::Nop => Opcode::Nop,
        }
    }

    /// Decodes a raw 32-bit instruction word.
    ///
    /// Returns [`DecodeError::UnknownOpcode`] for any byte not in the
    /// opcode table, the same illegal-instruction fault an unrecognized
    /// opcode raises at execution time.
    pub fn decode(word: i32) -> Result<Self, DecodeError> {
        let op = Opcode::try_from((word & 0xff) as u8)?;
        let r1 = Reg::new(((word >> 8) & 0xf) as u8);
        let r2 = Reg::new(((word >> 12) & 0xf) as u8);
        Ok(match op.format() {
            Format::Op => match op {
                Opcode::Halt => Self::Halt,
                Opcode::Ret => Self::Ret,
                Opcode::Nop => Self::Nop,
                _ => unreachable!("Op format is exhaustive over {{Halt, Ret, Nop}}"),
            },
            Format::Addr => {
                let addr = sign_extend20(word >> 12);
                match op {
                    Opcode::Call => Self::Call { addr },
                    Opcode::Jmp => Self::Jmp { addr },
                    _ => unreachable!("Addr format is exhaustive over {{Call, Jmp}}"),
                }
            }
            Format::Reg => match op {
                Opcode::Getpid => Self::Getpid { r1 },
                Opcode::Getpn => Self::Getpn { r1 },
                Opcode::Push => Self::Push { r1 },
                Opcode::Pop => Self::Pop { r1 },
                _ => unreachable!("Reg format is exhaustive over {{Getpid, Getpn, Push, Pop}}"),
            },
            Format::RegConst => Self::Ldimm {
                r1,
                value: sign_extend20(word >> 12),
            },
            Format::RegAddr => {
                let addr = sign_extend20(word >> 12);
                match op {
                    Opcode::Load => Self::Load { r1, addr },
                    Opcode::Store => Self::Store { r1, addr },
                    Opcode::Ldaddr => Self::Ldaddr { r1, addr },
                    _ => unreachable!("RegAddr format is exhaustive over {{Load, Store, Ldaddr}}"),
                }
            }
            Format::RegReg => match op {
                Opcode::Addf => Self::Addf { r1, r2 },
                Opcode::Subf => Self::Subf { r1, r2 },
                Opcode::Divf => Self::Divf { r1, r2 },
                Opcode::Mulf => Self::Mulf { r1, r2 },
                Opcode::Addi => Self::Addi { r1, r2 },
                Opcode::Subi => Self::Subi { r1, r2 },
                Opcode::Divi => Self::Divi { r1, r2 },
                Opcode::Muli => Self::Muli { r1, r2 },
                _ => unreachable!("RegReg format is exhaustive over the ALU opcodes"),
            },
            Format::RegOff => {
                let off = sign_extend16(word >> 16);
                match op {
                    Opcode::Ldind => Self::Ldind { r1, r2, off },
                    Opcode::Stind => Self::Stind { r1, r2, off },
                    _ => unreachable!("RegOff format is exhaustive over {{Ldind, Stind}}"),
                }
            }
            Format::RegRegAddr => {
                let addr = sign_extend16(word >> 16);
                match op {
                    Opcode::Blt => Self::Blt { r1, r2, addr },
                    Opcode::Bgt => Self::Bgt { r1, r2, addr },
                    Opcode::Beq => Self::Beq { r1, r2, addr },
                    Opcode::Cmpxchg => Self::Cmpxchg { r1, r2, addr },
                    _ => unreachable!(
                        "RegRegAddr format is exhaustive over {{Blt, Bgt, Beq, Cmpxchg}}"
                    ),
                }
            }
        })
    }

    /// Encodes this instruction back into a raw 32-bit word.
    ///
    /// Used by `x20-tools`' linker (to rewrite resolved outsymbol
    /// references) and by tests that assemble programs by hand.
    pub fn encode(&self) -> i32 {
        let op = self.opcode() as i32;
        match *self {
            Self::Halt | Self::Ret | Self::Nop => op,
            Self::Call { addr } | Self::Jmp { addr } => op | ((addr & 0xf_ffff) << 12),
            Self::Getpid { r1 } | Self::Getpn { r1 } | Self::Push { r1 } | Self::Pop { r1 } => {
                op | ((r1.index() as i32) << 8)
            }
            Self::Ldimm { r1, value } => op | ((r1.index() as i32) << 8) | ((value & 0xf_ffff) << 12),
            Self::Load { r1, addr } | Self::Store { r1, addr } | Self::Ldaddr { r1, addr } => {
                op | ((r1.index() as i32) << 8) | ((addr & 0xf_ffff) << 12)
            }
            Self::Addf { r1, r2 }
            | Self::Subf { r1, r2 }
            | Self::Divf { r1, r2 }
            | Self::Mulf { r1, r2 }
            | Self::Addi { r1, r2 }
            | Self::Subi { r1, r2 }
            | Self::Divi { r1, r2 }
            | Self::Muli { r1, r2 } => op | ((r1.index() as i32) << 8) | ((r2.index() as i32) << 12),
            Self::Ldind { r1, r2, off } | Self::Stind { r1, r2, off } => {
                op | ((r1.index() as i32) << 8)
                    | ((r2.index() as i32) << 12)
                    | ((off & 0xffff) << 16)
            }
            Self::Blt { r1, r2, addr }
            | Self::Bgt { r1, r2, addr }
            | Self::Beq { r1, r2, addr }
            | Self::Cmpxchg { r1, r2, addr } => {
                op | ((r1.index() as i32) << 8)
                    | ((r2.index() as i32) << 12)
                    | ((addr & 0xffff) << 16)
            }
        }
    }

    /// Renders `"<mnemonic> <operands>"` for disassembly output.
    ///
    /// `at` is the address this instruction was fetched from; address-
    /// bearing operands print as `addr + at + 1` (PC-relative absolute
    /// target).
    pub fn display_at(&self, at: i32) -> InstructionAt<'_> {
        InstructionAt { instr: self, at }
    }
}

/// Formatting adapter returned by [`Instruction::display_at`].
pub struct InstructionAt<'a> {
    instr: &'a Instruction,
    at: i32,
}

impl fmt::Display for InstructionAt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = |addr: i32| addr.wrapping_add(self.at).wrapping_add(1);
        write!(f, "{:<8}", self.instr.opcode().mnemonic())?;
        match *self.instr {
            Instruction::Halt | Instruction::Ret | Instruction::Nop => Ok(()),
            Instruction::Call { addr } | Instruction::Jmp { addr } => write!(f, "{}", target(addr)),
            Instruction::Getpid { r1 }
            | Instruction::Getpn { r1 }
            | Instruction::Push { r1 }
            | Instruction::Pop { r1 } => write!(f, "{r1}"),
            Instruction::Ldimm { r1, value } => write!(f, "{r1}, {value}"),
            Instruction::Load { r1, addr } | Instruction::Store { r1, addr }
            | Instruction::Ldaddr { r1, addr } => {
                write!(f, "{r1}, {}", target(addr))
            }
            Instruction::Addf { r1, r2 }
            | Instruction::Subf { r1, r2 }
            | Instruction::Divf { r1, r2 }
            | Instruction::Mulf { r1, r2 }
            | Instruction::Addi { r1, r2 }
            | Instruction::Subi { r1, r2 }
            | Instruction::Divi { r1, r2 }
            | Instruction::Muli { r1, r2 } => write!(f, "{r1}, {r2}"),
            Instruction::Ldind { r1, r2, off } | Instruction::Stind { r1, r2, off } => {
                write!(f, "{r1}, {off}({r2})")
            }
            Instruction::Blt { r1, r2, addr }
            | Instruction::Bgt { r1, r2, addr }
            | Instruction::Beq { r1, r2, addr }
            | Instruction::Cmpxchg { r1, r2, addr } => {
                write!(f, "{r1}, {r2}, {}", target(addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_halt() {
        assert_eq!(Instruction::decode(0x00).unwrap(), Instruction::Halt);
    }

    #[test]
    fn decode_unknown_opcode_errors() {
        assert!(matches!(
            Instruction::decode(0xff),
            Err(DecodeError::UnknownOpcode(0xff))
        ));
    }

    #[test]
    fn encode_decode_round_trips_ldimm() {
        let instr = Instruction::Ldimm {
            r1: Reg::new(3),
            value: -5,
        };
        assert_eq!(Instruction::decode(instr.encode()).unwrap(), instr);
    }

    #[test]
    fn encode_decode_round_trips_ldind_negative_offset() {
        let instr = Instruction::Ldind {
            r1: Reg::new(1),
            r2: Reg::new(2),
            off: -100,
        };
        assert_eq!(Instruction::decode(instr.encode()).unwrap(), instr);
    }

    #[test]
    fn display_call_prints_pc_relative_target() {
        let instr = Instruction::Call { addr: 5 };
        assert_eq!(instr.display_at(10).to_string(), "call    16");
    }

    #[test]
    fn display_reg_reg() {
        let instr = Instruction::Addi {
            r1: Reg::new(0),
            r2: Reg::new(1),
        };
        assert_eq!(instr.display_at(0).to_string(), "addi    r0, r1");
    }
}
