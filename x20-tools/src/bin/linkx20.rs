//! Links one or more x20 object files into an executable (or, if some
//! outsymbol is left unresolved, a partially-linked object file).
//!
//! Insymbols are concatenated across files with duplicate names fatal;
//! each file's code is concatenated behind a running `pc_offset`; every
//! outsymbol is then resolved against the combined insymbol table by
//! rewriting the referencing instruction word's PC-relative address field
//! in place (`new_addr = definition - (pc + 1)`). Anything still
//! unresolved after that pass — or no file defining `mainx20` at all —
//! forces the output to be written as a `.obj` file instead of a linked
//! `.exe`.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use x20_asm::Instruction;
use x20_vm::{Program, Symbol};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Object files to link, in link order.
    files: Vec<PathBuf>,

    /// Output name, written as `<name>.exe` (or `<name>.obj` if the result
    /// can't be fully linked). Defaults to `mainx20`.
    #[arg(short = 'o', long = "output", default_value = "mainx20")]
    output: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let args = Args::parse();

    if args.files.is_empty() {
        bail!("usage: linkx20 <obj>... [-o <name>]");
    }

    let programs: Vec<Program> = args
        .files
        .iter()
        .map(|path| {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            Program::read_from(file).with_context(|| format!("reading {}", path.display()))
        })
        .collect::<Result<_>>()?;

    let has_main = programs
        .iter()
        .any(|p| p.insymbols.contains(x20_vm::consts::MAIN_SYMBOL));

    let mut combined_insymbols = x20_vm::SymbolTable::new();
    let mut combined_code: Vec<i32> = Vec::new();
    let mut pc_offset = 0i32;
    for program in &programs {
        for sym in program.insymbols.iter() {
            let relocated = Symbol {
                name: sym.name.clone(),
                address: sym.address + pc_offset,
            };
            if !combined_insymbols.insert(relocated) {
                bail!("Fatal error: Duplicate insymbol \"{}\"", sym.name);
            }
        }
        combined_code.extend_from_slice(&program.code);
        pc_offset += program.code.len() as i32;
    }

    let mut unresolved: Vec<Symbol> = Vec::new();
    let mut is_object = !has_main;
    let mut pc_offset = 0i32;
    for program in &programs {
        for sym in program.outsymbols.iter() {
            let pc = pc_offset + sym.address;
            match combined_insymbols.get(&sym.name) {
                Some(definition) => {
                    let new_addr = definition.address - (pc + 1);
                    rewrite_reference(&mut combined_code, pc, new_addr)?;
                }
                None => {
                    eprintln!("Error: Unresolved outsymbol \"{}\"", sym.name);
                    unresolved.push(Symbol {
                        name: sym.name.clone(),
                        address: pc,
                    });
                    is_object = true;
                }
            }
        }
        pc_offset += program.code.len() as i32;
    }

    let filename = if is_object {
        format!("{}.obj", args.output)
    } else {
        format!("{}.exe", args.output)
    };

    write_output(&filename, &combined_insymbols, &unresolved, &combined_code)
        .with_context(|| format!("writing {filename}"))?;

    Ok(())
}

/// Rewrites the PC-relative address operand of the instruction word at
/// `pc` in place, preserving every other field by round-tripping through
/// [`Instruction::decode`]/[`Instruction::encode`] rather than hand-masking
/// bits with an opcode-keyed shift table.
fn rewrite_reference(code: &mut [i32], pc: i32, new_addr: i32) -> Result<()> {
    let word = *code
        .get(pc as usize)
        .with_context(|| format!("outsymbol reference at out-of-range pc {pc}"))?;
    let instr = Instruction::decode(word).with_context(|| format!("decoding instruction at pc {pc}"))?;
    let rewritten = match instr {
        Instruction::Call { .. } => Instruction::Call { addr: new_addr },
        Instruction::Jmp { .. } => Instruction::Jmp { addr: new_addr },
        Instruction::Load { r1, .. } => Instruction::Load { r1, addr: new_addr },
        Instruction::Store { r1, .. } => Instruction::Store { r1, addr: new_addr },
        Instruction::Ldaddr { r1, .. } => Instruction::Ldaddr { r1, addr: new_addr },
        Instruction::Blt { r1, r2, .. } => Instruction::Blt { r1, r2, addr: new_addr },
        Instruction::Bgt { r1, r2, .. } => Instruction::Bgt { r1, r2, addr: new_addr },
        Instruction::Beq { r1, r2, .. } => Instruction::Beq { r1, r2, addr: new_addr },
        Instruction::Cmpxchg { r1, r2, .. } => Instruction::Cmpxchg { r1, r2, addr: new_addr },
        other => bail!("outsymbol reference at pc {pc} does not carry an address operand ({other:?})"),
    };
    code[pc as usize] = rewritten.encode();
    Ok(())
}

fn write_output(
    filename: &str,
    insymbols: &x20_vm::SymbolTable,
    outsymbols: &[Symbol],
    code: &[i32],
) -> Result<()> {
    let mut out = File::create(filename)?;
    let insym_words = (insymbols.len() * 5) as i32;
    let outsym_words = (outsymbols.len() * 5) as i32;
    let code_words = code.len() as i32;

    out.write_all(&insym_words.to_le_bytes())?;
    out.write_all(&outsym_words.to_le_bytes())?;
    out.write_all(&code_words.to_le_bytes())?;

    for sym in insymbols.iter() {
        write_symbol(&mut out, sym)?;
    }
    for sym in outsymbols {
        write_symbol(&mut out, sym)?;
    }
    for &word in code {
        out.write_all(&word.to_le_bytes())?;
    }
    Ok(())
}

fn write_symbol(out: &mut impl Write, sym: &Symbol) -> Result<()> {
    let mut name_bytes = [0u8; 16];
    let bytes = sym.name.as_bytes();
    let n = bytes.len().min(16);
    name_bytes[..n].copy_from_slice(&bytes[..n]);
    out.write_all(&name_bytes)?;
    out.write_all(&sym.address.to_le_bytes())?;
    Ok(())
}
