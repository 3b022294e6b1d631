//! Standalone disassembler for x20 object/executable files.
//!
//! Prints the insymbol and outsymbol tables, then the code section. With
//! `-r`/`--recursive`, code words are first classified as instruction or
//! embedded data by a single forward scan that restarts backward whenever
//! a branch/call/jump target turns out to lie behind a stretch already
//! marked as data: every instruction except `jmp`/`halt`/`ret` implies
//! the next word is also an instruction (straight-line fallthrough), and
//! `jmp`/`beq`/`blt`/`bgt`/`call` additionally mark their target address
//! as an instruction.

use std::fs::File;

use anyhow::{Context, Result};
use clap::Parser;
use x20_asm::Instruction;
use x20_vm::Program;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Object or executable file to disassemble.
    file: std::path::PathBuf,

    /// Classify code words as instruction/data before printing, following
    /// branch and call targets rather than assuming every word decodes.
    #[arg(short = 'r', long = "recursive")]
    recursive: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let args = Args::parse();

    let file = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let program = Program::read_from(file).context("reading object file")?;

    println!("Insymbol Section ({} entries)\n", program.insymbols.len());
    for sym in program.insymbols.iter() {
        println!("{} {}", sym.name, sym.address);
    }

    println!("\nOutsymbol Section ({} entries)\n", program.outsymbols.len());
    for sym in program.outsymbols.iter() {
        println!("{} {}", sym.name, sym.address);
    }

    let data = if args.recursive {
        Some(mark_data_words(&program.code))
    } else {
        None
    };

    println!("\nObject Code ({} words)\n", program.code.len());
    print_code(&program, data.as_deref());

    Ok(())
}

/// Marks every code index as data (`true`) unless the scan below reaches
/// it as a straight-line or target instruction. `data[0]` is never data:
/// decoding always starts at the first word.
fn mark_data_words(code: &[i32]) -> Vec<bool> {
    let mut is_data = vec![true; code.len()];
    if code.is_empty() {
        return is_data;
    }
    is_data[0] = false;

    let mut pc = 0usize;
    while pc < code.len() {
        if pc != 0 && is_data[pc] {
            pc += 1;
            continue;
        }

        let Ok(instr) = Instruction::decode(code[pc]) else {
            pc += 1;
            continue;
        };

        let target = branch_target(&instr, pc as i32);

        if !matches!(instr, Instruction::Jmp { .. } | Instruction::Halt | Instruction::Ret) {
            if let Some(next) = is_data.get_mut(pc + 1) {
                *next = false;
            }
        }

        if let Some(target) = target {
            if target >= 0 && (target as usize) < code.len() {
                let target = target as usize;
                if target < pc && is_data[target] {
                    // Jumping back into a stretch already written off as
                    // data: that stretch was actually reachable code we
                    // hadn't discovered yet, so re-scan from it.
                    pc = target;
                    is_data[target] = false;
                    continue;
                }
                is_data[target] = false;
            }
        }

        pc += 1;
    }

    is_data
}

/// The absolute target address of a control-flow instruction's
/// PC-relative operand, or `None` if the instruction isn't a
/// jump/branch/call, or its operand is the placeholder value `0` (an
/// unresolved outsymbol reference, treated as undefined for now).
fn branch_target(instr: &Instruction, pc: i32) -> Option<i32> {
    let addr = match *instr {
        Instruction::Jmp { addr } | Instruction::Call { addr } => addr,
        Instruction::Blt { addr, .. } | Instruction::Bgt { addr, .. } | Instruction::Beq { addr, .. } => addr,
        _ => return None,
    };
    if addr == 0 {
        return None;
    }
    Some(addr.wrapping_add(pc).wrapping_add(1))
}

fn print_code(program: &Program, data: Option<&[bool]>) {
    for (pc, &word) in program.code.iter().enumerate() {
        let is_data = data.map(|d| d[pc]).unwrap_or(false);
        if is_data {
            println!("{pc:07}   {word:08x}   {:<8}", "nop");
            continue;
        }
        match Instruction::decode(word) {
            Ok(instr) => {
                let is_outsymbol = program.outsymbols.iter().any(|s| s.address == pc as i32);
                let rendered = render_instruction(&instr, pc as i32, is_outsymbol);
                println!("{pc:07}   {word:08x}   {rendered}");
            }
            Err(_) => println!("{pc:07}   {word:08x}   {:<8}", "nop"),
        }
    }
}

/// Renders one instruction, substituting `[undefined]` for any
/// address-bearing operand at a `pc` that an outsymbol references (an
/// unresolved reference in an object file, not yet given a real target
/// by the linker).
fn render_instruction(instr: &Instruction, pc: i32, is_outsymbol: bool) -> String {
    let mnemonic = instr.opcode().mnemonic();
    let target = |addr: i32| {
        if is_outsymbol {
            "[undefined]".to_string()
        } else {
            addr.wrapping_add(pc).wrapping_add(1).to_string()
        }
    };
    let operands = match *instr {
        Instruction::Halt | Instruction::Ret | Instruction::Nop => String::new(),
        Instruction::Call { addr } | Instruction::Jmp { addr } => target(addr),
        Instruction::Getpid { r1 } | Instruction::Getpn { r1 } | Instruction::Push { r1 } | Instruction::Pop { r1 } => {
            format!("{r1}")
        }
        Instruction::Ldimm { r1, value } => format!("{r1}, {value}"),
        Instruction::Load { r1, addr } | Instruction::Store { r1, addr } | Instruction::Ldaddr { r1, addr } => {
            format!("{r1}, {}", target(addr))
        }
        Instruction::Addf { r1, r2 }
        | Instruction::Subf { r1, r2 }
        | Instruction::Divf { r1, r2 }
        | Instruction::Mulf { r1, r2 }
        | Instruction::Addi { r1, r2 }
        | Instruction::Subi { r1, r2 }
        | Instruction::Divi { r1, r2 }
        | Instruction::Muli { r1, r2 } => format!("{r1}, {r2}"),
        Instruction::Ldind { r1, r2, off } | Instruction::Stind { r1, r2, off } => {
            format!("{r1}, {off}({r2})")
        }
        Instruction::Blt { r1, r2, addr } | Instruction::Bgt { r1, r2, addr } | Instruction::Beq { r1, r2, addr }
        | Instruction::Cmpxchg { r1, r2, addr } => {
            format!("{r1}, {r2}, {}", target(addr))
        }
    };
    format!("{mnemonic:<8}    {operands}")
}
