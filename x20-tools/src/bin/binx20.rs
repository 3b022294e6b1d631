//! Inspects an x20 object or executable file: section word counts, the
//! insymbol/outsymbol tables, and a disassembly of the code section.
//!
//! A thin CLI over `x20_vm`'s own `Program`/`SymbolTable` types and
//! `x20_asm::Instruction`, the way the rest of this workspace's tools
//! are built.

use std::fs::File;

use anyhow::{Context, Result};
use clap::Parser;
use x20_asm::Instruction;
use x20_vm::Program;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Object or executable file to inspect.
    file: std::path::PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let args = Args::parse();

    let file = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let program = Program::read_from(file).context("reading object file")?;

    println!("insymbols:  {} entries", program.insymbols.len());
    println!("outsymbols: {} entries", program.outsymbols.len());
    println!("code:       {} words", program.code.len());

    println!("\nInsymbols:");
    for sym in program.insymbols.iter() {
        println!("  {:<24} {}", sym.name, sym.address);
    }

    println!("\nOutsymbols:");
    for sym in program.outsymbols.iter() {
        println!("  {:<24} {}", sym.name, sym.address);
    }

    println!("\nDisassembly:");
    for (pc, &word) in program.code.iter().enumerate() {
        match Instruction::decode(word) {
            Ok(instr) => println!("{pc:07}   {word:08x}   {}", instr.display_at(pc as i32)),
            Err(err) => println!("{pc:07}   {word:08x}   <{err}>"),
        }
    }

    Ok(())
}
