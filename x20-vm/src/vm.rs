//! The VM façade: loads a program, spawns cores, collects their outcomes.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{info, warn};
use x20_asm::Instruction;

use crate::consts::{MAX_PROCESSORS, MEM_WORDS};
use crate::core::Core;
use crate::error::{AccessError, FaultKind, LoadError};
use crate::loader::Program;
use crate::register::Registers;
use crate::symbol::SymbolTable;

/// State shared by every core thread: the one memory image and the
/// optional instruction trace sink.
///
/// Lock order is always trace before memory, never the reverse; in
/// practice the tracer only needs data the caller already holds locally
/// (the just-fetched instruction and register file), so it never needs to
/// acquire the memory lock at all.
pub(crate) struct Shared {
    memory: Mutex<Vec<i32>>,
    trace: Mutex<Option<Box<dyn Write + Send>>>,
    pub(crate) prog_end: i32,
    pub(crate) num_processors: i32,
}

impl Shared {
    pub(crate) fn tracing_enabled(&self) -> bool {
        self.trace.lock().unwrap().is_some()
    }

    pub(crate) fn trace(&self, pid: usize, pc: i32, instr: &Instruction, reg: &Registers) {
        let mut guard = self.trace.lock().unwrap();
        if let Some(sink) = guard.as_mut() {
            let _ = writeln!(
                sink,
                "[core {pid}] {:04}: {}  (sp={} fp={})",
                pc,
                instr.display_at(pc),
                reg.sp(),
                reg.fp(),
            );
        }
    }

    pub(crate) fn read(&self, addr: i32) -> i32 {
        self.memory.lock().unwrap()[addr as usize]
    }

    pub(crate) fn write(&self, addr: i32, value: i32) {
        self.memory.lock().unwrap()[addr as usize] = value;
    }

    /// Atomic compare-and-swap: if `memory[addr] == expected`, stores `new`
    /// and returns `true`; otherwise leaves memory untouched and returns
    /// `false`. Holds the memory lock across the whole read-compare-write,
    /// which is the entire reason `cmpxchg` exists as a single opcode
    /// rather than being expressible with `load`/`store`.
    pub(crate) fn cmpxchg(&self, addr: i32, expected: i32, new: i32) -> Result<bool, FaultKind> {
        if !(0..MEM_WORDS as i32).contains(&addr) {
            return Err(FaultKind::AddressOutOfRange);
        }
        let mut mem = self.memory.lock().unwrap();
        let slot = &mut mem[addr as usize];
        if *slot == expected {
            *slot = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// A loaded x20 program, ready to run on one or more cores.
pub struct Vm {
    shared: Arc<Shared>,
    insymbols: SymbolTable,
    entry_point: i32,
}

/// Why a core stopped, returned per-core from [`Vm::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The core executed `halt`.
    Halted,
    /// The core faulted; siblings are unaffected.
    Faulted(FaultKind),
}

impl Vm {
    /// Reads and validates an executable (not an unresolved object file)
    /// from `reader`.
    pub fn load(reader: impl std::io::Read) -> Result<Self, LoadError> {
        let program = Program::read_from(reader)?;

        if !program.outsymbols.is_empty() {
            return Err(LoadError::ContainsOutsymbols);
        }

        let entry = program
            .insymbols
            .get(crate::consts::MAIN_SYMBOL)
            .ok_or(LoadError::MissingOrDuplicateEntryPoint)?;
        let entry_point = entry.address;

        if program.code.len() > MEM_WORDS {
            return Err(LoadError::ProgramTooLarge {
                word_count: program.code.len(),
                capacity: MEM_WORDS,
            });
        }

        let prog_end = program.code.len() as i32;
        let mut memory = vec![0i32; MEM_WORDS];
        memory[..program.code.len()].copy_from_slice(&program.code);

        info!(words = prog_end, "loaded x20 executable");

        Ok(Self {
            shared: Arc::new(Shared {
                memory: Mutex::new(memory),
                trace: Mutex::new(None),
                prog_end,
                num_processors: 1,
            }),
            insymbols: program.insymbols,
            entry_point,
        })
    }

    /// Looks up a data symbol's address.
    pub fn get_address(&self, name: &str) -> Result<i32, AccessError> {
        self.insymbols
            .get(name)
            .map(|s| s.address)
            .ok_or(AccessError::UnknownSymbol)
    }

    pub fn get_word(&self, addr: i32) -> Result<i32, AccessError> {
        self.check_addr(addr)?;
        Ok(self.shared.read(addr))
    }

    pub fn put_word(&self, addr: i32, value: i32) -> Result<(), AccessError> {
        self.check_addr(addr)?;
        self.shared.write(addr, value);
        Ok(())
    }

    fn check_addr(&self, addr: i32) -> Result<(), AccessError> {
        if (0..MEM_WORDS as i32).contains(&addr) {
            Ok(())
        } else {
            Err(AccessError::OutOfRange)
        }
    }

    /// Runs `num_processors` cores to completion, each seeded with its own
    /// entry in `initial_sp`. If `trace` is given, every core's
    /// instruction stream is serialized (under the trace lock) to it.
    ///
    /// Returns one [`Termination`] per core, in core-index order.
    pub fn execute(
        &mut self,
        num_processors: usize,
        initial_sp: &[i32],
        trace: Option<Box<dyn Write + Send>>,
    ) -> Vec<Termination> {
        assert!(
            num_processors >= 1 && num_processors <= MAX_PROCESSORS,
            "num_processors must be in 1..=MAX_PROCESSORS"
        );
        assert_eq!(initial_sp.len(), num_processors);

        // num_processors is fixed for the lifetime of this run; rebuild
        // Shared with the real count rather than mutate it under a lock
        // only one thread will ever see.
        let shared = Arc::new(Shared {
            memory: Mutex::new(std::mem::take(&mut *self.shared.memory.lock().unwrap())),
            trace: Mutex::new(trace),
            prog_end: self.shared.prog_end,
            num_processors: num_processors as i32,
        });
        self.shared = Arc::clone(&shared);

        let entry_point = self.entry_point;
        let handles: Vec<_> = (0..num_processors)
            .map(|pid| {
                let shared = Arc::clone(&shared);
                let sp = initial_sp[pid];
                thread::Builder::new()
                    .name(format!("x20-core-{pid}"))
                    .spawn(move || Core::new(shared, pid, sp, entry_point).run())
                    .expect("failed to spawn core thread")
            })
            .collect();

        handles
            .into_iter()
            .map(|h| match h.join().expect("core thread panicked") {
                Ok(()) => Termination::Halted,
                Err(fault) => {
                    warn!(?fault, "core faulted");
                    Termination::Faulted(fault)
                }
            })
            .collect()
    }
}
