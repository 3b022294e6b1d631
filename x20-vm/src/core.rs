//! The per-core fetch-decode-execute loop.
//!
//! Each core is an OS thread sharing one memory image (`vm.rs`'s `Shared`)
//! under a single [`std::sync::Mutex`]. Register state is private to the
//! core; only memory and the optional instruction trace are shared.

use std::sync::Arc;

use x20_asm::{Instruction, Reg};

use crate::error::FaultKind;
use crate::register::Registers;
use crate::vm::Shared;

/// One running core: its private registers plus the bounds of the memory
/// region it is allowed to touch.
pub struct Core {
    pub(crate) reg: Registers,
    pub(crate) pid: usize,
    /// Lowest legal stack address: `progEnd`, shared by every core.
    stack_floor: i32,
    /// Highest legal stack address for *this* core: its own initial `sp`.
    stack_ceiling: i32,
    shared: Arc<Shared>,
}

impl Core {
    pub(crate) fn new(shared: Arc<Shared>, pid: usize, initial_sp: i32, entry_point: i32) -> Self {
        let mut reg = Registers::at_entry_point(entry_point);
        reg.set_sp(initial_sp);
        Self {
            reg,
            pid,
            stack_floor: shared.prog_end,
            stack_ceiling: initial_sp,
            shared,
        }
    }

    /// Runs until `halt` or a fault. Normal termination is `Ok(())`; a
    /// fault here means only *this* core stops — the caller is
    /// responsible for letting siblings continue.
    pub fn run(mut self) -> Result<(), FaultKind> {
        loop {
            let pc = self.reg.pc();
            let word = self.fetch(pc)?;
            let instr = Instruction::decode(word).map_err(|_| FaultKind::IllegalInstruction)?;

            if self.shared.tracing_enabled() {
                self.shared.trace(self.pid, pc, &instr, &self.reg);
            }

            match self.step(&instr, pc)? {
                Some(()) => return Ok(()),
                None => continue,
            }
        }
    }

    /// Executes one instruction. Returns `Ok(Some(()))` on `halt`,
    /// `Ok(None)` to keep running.
    fn step(&mut self, instr: &Instruction, pc: i32) -> Result<Option<()>, FaultKind> {
        let mut next_pc = pc.wrapping_add(1);

        match *instr {
            Instruction::Halt => return Ok(Some(())),
            Instruction::Nop => {}

            Instruction::Load { r1, addr } => {
                self.reg[r1] = self.read_code_relative(pc, addr)?;
            }
            Instruction::Store { r1, addr } => {
                let target = pc.wrapping_add(addr).wrapping_add(1);
                self.write_word(target, self.reg[r1])?;
            }
            Instruction::Ldimm { r1, value } => self.reg[r1] = value,
            Instruction::Ldaddr { r1, addr } => {
                self.reg[r1] = pc.wrapping_add(addr).wrapping_add(1);
            }
            Instruction::Ldind { r1, r2, off } => {
                let addr = self.reg[r2].wrapping_add(off);
                self.reg[r1] = self.read_word(addr)?;
            }
            Instruction::Stind { r1, r2, off } => {
                // Bounds-check the computed address (`reg[r2] + off`), not
                // the raw register index, or this would let `stind` write
                // outside the intended bound whenever r2 held a small value.
                let addr = self.reg[r2].wrapping_add(off);
                self.write_word(addr, self.reg[r1])?;
            }

            Instruction::Addf { r1, r2 } => self.alu_float(r1, r2, |a, b| a + b),
            Instruction::Subf { r1, r2 } => self.alu_float(r1, r2, |a, b| a - b),
            Instruction::Mulf { r1, r2 } => self.alu_float(r1, r2, |a, b| a * b),
            Instruction::Divf { r1, r2 } => {
                let divisor = f32::from_bits(self.reg[r2] as u32);
                if divisor == 0.0 {
                    return Err(FaultKind::DivideByZero);
                }
                self.alu_float(r1, r2, |a, b| a / b);
            }

            Instruction::Addi { r1, r2 } => {
                self.reg[r1] = self.reg[r1].wrapping_add(self.reg[r2]);
            }
            Instruction::Subi { r1, r2 } => {
                self.reg[r1] = self.reg[r1].wrapping_sub(self.reg[r2]);
            }
            Instruction::Muli { r1, r2 } => {
                self.reg[r1] = self.reg[r1].wrapping_mul(self.reg[r2]);
            }
            Instruction::Divi { r1, r2 } => {
                if self.reg[r2] == 0 {
                    return Err(FaultKind::DivideByZero);
                }
                self.reg[r1] = self.reg[r1].wrapping_div(self.reg[r2]);
            }

            Instruction::Call { addr } => {
                // Push PC-return, push FP, FP ← SP, push 0 (the
                // return-value slot later filled in by `ret`).
                let target = pc.wrapping_add(addr).wrapping_add(1);
                self.push(next_pc)?;
                self.push(self.reg.fp())?;
                self.reg.set_fp(self.reg.sp());
                self.push(0)?;
                next_pc = target;
            }
            Instruction::Ret => {
                // Pop order mirrors `call`'s push order: return-value slot
                // first, then FP, then the return address.
                let return_value = self.pop()?;
                let saved_fp = self.pop()?;
                let return_pc = self.pop()?;
                self.reg.set_fp(saved_fp);
                // Bubble the value into the caller's own slot now that FP
                // has been restored to the caller's frame.
                let slot = self.reg.fp().wrapping_sub(1);
                self.write_word(slot, return_value)?;
                next_pc = return_pc;
            }

            Instruction::Blt { r1, r2, addr } => {
                if self.reg[r1] < self.reg[r2] {
                    next_pc = pc.wrapping_add(addr).wrapping_add(1);
                }
            }
            Instruction::Bgt { r1, r2, addr } => {
                if self.reg[r1] > self.reg[r2] {
                    next_pc = pc.wrapping_add(addr).wrapping_add(1);
                }
            }
            Instruction::Beq { r1, r2, addr } => {
                if self.reg[r1] == self.reg[r2] {
                    next_pc = pc.wrapping_add(addr).wrapping_add(1);
                }
            }
            Instruction::Jmp { addr } => {
                next_pc = pc.wrapping_add(addr).wrapping_add(1);
            }

            Instruction::Cmpxchg { r1, r2, addr } => {
                let target = pc.wrapping_add(addr).wrapping_add(1);
                let swapped = self.shared.cmpxchg(target, self.reg[r1], self.reg[r2])?;
                self.reg[r1] = swapped as i32;
            }

            Instruction::Getpid { r1 } => self.reg[r1] = self.pid as i32,
            Instruction::Getpn { r1 } => self.reg[r1] = self.shared.num_processors,

            Instruction::Push { r1 } => self.push(self.reg[r1])?,
            Instruction::Pop { r1 } => {
                // The original fell through from `pop` into `default:`
                // (illegal instruction) after popping, because the `case`
                // was missing a `break`. Fixed here: `pop` exits normally.
                let value = self.pop()?;
                self.reg[r1] = value;
            }
        }

        self.reg.set_pc(next_pc);
        Ok(None)
    }

    fn alu_float(&mut self, r1: Reg, r2: Reg, f: impl Fn(f32, f32) -> f32) {
        let a = f32::from_bits(self.reg[r1] as u32);
        let b = f32::from_bits(self.reg[r2] as u32);
        self.reg[r1] = f(a, b).to_bits() as i32;
    }

    fn in_stack_bounds(&self, addr: i32) -> bool {
        addr >= self.stack_floor && addr <= self.stack_ceiling
    }

    fn fetch(&self, pc: i32) -> Result<i32, FaultKind> {
        if pc < 0 || pc >= self.shared.prog_end {
            return Err(FaultKind::AddressOutOfRange);
        }
        Ok(self.shared.read(pc))
    }

    /// `load`/`store` address data words, resolved PC-relative; these may
    /// target anywhere in `0..progEnd` (they read program data, not stack).
    fn read_code_relative(&self, pc: i32, addr: i32) -> Result<i32, FaultKind> {
        let target = pc.wrapping_add(addr).wrapping_add(1);
        self.read_word(target)
    }

    fn read_word(&self, addr: i32) -> Result<i32, FaultKind> {
        if !self.in_stack_bounds(addr) && !(0..self.shared.prog_end).contains(&addr) {
            return Err(FaultKind::AddressOutOfRange);
        }
        Ok(self.shared.read(addr))
    }

    /// Writes to either this core's stack region or the shared code/data
    /// segment below `progEnd` (`store`/`stind` may target a declared
    /// global there); `push` goes through [`Core::push`] instead, which
    /// restricts itself to the stack region only.
    fn write_word(&self, addr: i32, value: i32) -> Result<(), FaultKind> {
        if !self.in_stack_bounds(addr) && !(0..self.shared.prog_end).contains(&addr) {
            return Err(FaultKind::AddressOutOfRange);
        }
        self.shared.write(addr, value);
        Ok(())
    }

    fn push(&mut self, value: i32) -> Result<(), FaultKind> {
        let new_sp = self.reg.sp().wrapping_sub(1);
        if !self.in_stack_bounds(new_sp) {
            return Err(FaultKind::AddressOutOfRange);
        }
        self.shared.write(new_sp, value);
        self.reg.set_sp(new_sp);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, FaultKind> {
        let sp = self.reg.sp();
        if !self.in_stack_bounds(sp) {
            return Err(FaultKind::AddressOutOfRange);
        }
        let value = self.shared.read(sp);
        self.reg.set_sp(sp.wrapping_add(1));
        Ok(value)
    }
}
