use x20_asm::{DecodeError, Instruction, Reg};

#[test]
fn decodes_ldaddr_with_negative_displacement() {
    // ldaddr r2, -1(pc): opcode LDADDR=0x04, r1=2, addr=-1
    let word = 0x04 | (2 << 8) | ((-1i32 & 0xf_ffff) << 12);
    assert_eq!(
        Instruction::decode(word).unwrap(),
        Instruction::Ldaddr {
            r1: Reg::new(2),
            addr: -1,
        }
    );
}

#[test]
fn decodes_cmpxchg_operands() {
    let instr = Instruction::Cmpxchg {
        r1: Reg::new(4),
        r2: Reg::new(5),
        addr: 1000,
    };
    assert_eq!(Instruction::decode(instr.encode()).unwrap(), instr);
}

#[test]
fn rejects_illegal_opcode_byte() {
    assert_eq!(Instruction::decode(0x7f), Err(DecodeError::UnknownOpcode(0x7f)));
}

#[test]
fn disassembles_branch_with_pc_relative_target() {
    // beq at address 40, displacement -3 -> target 40 + (-3) + 1 = 38
    let instr = Instruction::Beq {
        r1: Reg::new(0),
        r2: Reg::new(1),
        addr: -3,
    };
    assert_eq!(instr.display_at(40).to_string(), "beq     r0, r1, 38");
}

#[test]
fn disassembles_stind_with_offset() {
    let instr = Instruction::Stind {
        r1: Reg::new(6),
        r2: Reg::new(13),
        off: -8,
    };
    assert_eq!(instr.display_at(0).to_string(), "stind   r6, -8(r13)");
}

#[test]
fn push_pop_round_trip_through_encoding() {
    let push = Instruction::Push { r1: Reg::new(14) };
    let pop = Instruction::Pop { r1: Reg::new(0) };
    assert_eq!(Instruction::decode(push.encode()).unwrap(), push);
    assert_eq!(Instruction::decode(pop.encode()).unwrap(), pop);
}
