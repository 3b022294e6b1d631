//! CLI front-end for [`x20_vm::Vm`]: load an executable, optionally poke
//! some symbols before running, run it across one or more cores, then
//! print the symbols that were asked for back out.
//!
//! Trailing positional arguments are either `NAME` (print the symbol's
//! word after execution) or `NAME=VALUE` (write `VALUE` into the symbol
//! before execution; `VALUE` is parsed as a float if it contains `f` or
//! `.`, otherwise as an int).

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use x20_vm::{FaultKind, Termination, Vm};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Executable (`.exe`) file to load and run.
    executable: PathBuf,

    /// Trace every core's instruction stream to stderr.
    #[arg(short = 't', long = "trace")]
    trace: bool,

    /// Number of processors to run, each with its own stack.
    #[arg(short = 'p', long = "processors", default_value_t = 1)]
    processors: usize,

    /// `NAME` to print after execution, or `NAME=VALUE` to poke before it.
    vars: Vec<String>,
}

enum VarArg {
    Read(String),
    Write { name: String, value: i32 },
}

fn parse_var_arg(raw: &str) -> VarArg {
    match raw.split_once('=') {
        None => VarArg::Read(raw.to_string()),
        Some((name, value)) => {
            let word = if value.contains('f') || value.contains('.') {
                value.parse::<f32>().unwrap_or(0.0).to_bits() as i32
            } else {
                value.parse::<i32>().unwrap_or(0)
            };
            VarArg::Write {
                name: name.to_string(),
                value: word,
            }
        }
    }
}

const STACK_SIZE: i32 = 1000;

/// Topmost valid memory word, derived from `x20_vm::consts::MEM_WORDS`
/// rather than a hardcoded literal.
fn top_of_memory() -> i32 {
    x20_vm::consts::MEM_WORDS as i32 - 1
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    let args = Args::parse();

    if args.processors == 0 {
        bail!("must have more than 0 processors");
    }

    let file = File::open(&args.executable)
        .with_context(|| format!("opening {}", args.executable.display()))?;
    let mut vm = Vm::load(file).context("loading executable")?;

    let parsed: Vec<VarArg> = args.vars.iter().map(|s| parse_var_arg(s)).collect();
    for var in &parsed {
        if let VarArg::Write { name, value } = var {
            let Ok(addr) = vm.get_address(name) else {
                eprintln!("failed to retrieve address for {name}");
                continue;
            };
            if vm.put_word(addr, *value).is_err() {
                eprintln!("failed to put word at addr {addr}");
            }
        }
    }

    let top = top_of_memory();
    let initial_sp: Vec<i32> = (0..args.processors as i32)
        .map(|i| top - STACK_SIZE * i)
        .collect();

    let trace: Option<Box<dyn std::io::Write + Send>> = if args.trace {
        Some(Box::new(BufWriter::new(std::io::stderr())))
    } else {
        None
    };

    let terminations = vm.execute(args.processors, &initial_sp, trace);

    for (pid, termination) in terminations.iter().enumerate() {
        if let Termination::Faulted(fault) = termination {
            let reason = match fault {
                FaultKind::DivideByZero => "division by zero",
                FaultKind::AddressOutOfRange => "address out of range",
                FaultKind::IllegalInstruction => "illegal instruction",
            };
            eprintln!("[{pid}] Error: code {} ({reason})", fault.code());
        }
    }

    let has_reads = parsed.iter().any(|v| matches!(v, VarArg::Read(_)));
    if has_reads {
        println!("====================== RESULTS =======================");
        println!("[###]            Label:     Hex      Decimal    Float ");
        println!("------------------------------------------------------");
        for (raw, var) in args.vars.iter().zip(&parsed) {
            let VarArg::Read(name) = var else { continue };
            let Ok(addr) = vm.get_address(name) else {
                eprintln!("failed to retrieve address for {name}");
                continue;
            };
            let Ok(word) = vm.get_word(addr) else {
                eprintln!("failed to get word at addr {addr}");
                continue;
            };
            println!(
                "[{addr:03x}] {raw:>16}: 0x{:08x} {:10} {:8}",
                word as u32,
                word,
                f32::from_bits(word as u32)
            );
        }
    }

    Ok(())
}
