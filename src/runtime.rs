use miette::{miette, Result, Severity};

use crate::compile::{compile_program, CompileResult};
use crate::diag::sim_step_limit;
use crate::ir::{Inst, Opcode};
use crate::word::{sext8, signed16};

/// Safety cap for `run`; programs this long are considered stuck.
pub const STEP_LIMIT: u64 = 1_000_000;

/// One row of the execution trace, captured before the instruction
/// at `pc` executes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TraceRecord {
    pub pc: u16,
    pub text: String,
    pub regs: Vec<u16>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OobKind {
    Load,
    Store,
}

impl OobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OobKind::Load => "load",
            OobKind::Store => "store",
        }
    }
}

/// Details of an out-of-bounds access, passed to the OOB callback.
/// Carries copies of the salient scalars; nothing borrows simulator
/// state.
#[derive(Clone, Debug)]
pub struct OobEvent {
    pub kind: OobKind,
    pub addr: u16,
    pub pc: u16,
    pub text: String,
    pub mem_size: u32,
}

type InputFn = Box<dyn FnMut() -> Result<u16>>;
type OutputFn = Box<dyn FnMut(u16) -> Result<()>>;
type OobFn = Box<dyn FnMut(&OobEvent) -> Result<()>>;
type TraceFn = Box<dyn FnMut(&TraceRecord) -> Result<()>>;

/// Non-pipelined SN/X interpreter. Owns its registers, memory, trace
/// and output buffer exclusively; callbacks only ever see copies.
pub struct Simulator {
    instrs: Vec<Inst>,
    regs: Vec<u16>,
    mem: Vec<u16>,
    pc: u16,
    halted: bool,
    output: Vec<u16>,
    trace: Vec<TraceRecord>,
    input_fn: Option<InputFn>,
    output_fn: Option<OutputFn>,
    oob_fn: Option<OobFn>,
    trace_fn: Option<TraceFn>,
}

impl Simulator {
    /// Build a simulator from a finished compile. Refuses sources
    /// with errors: a partial IR has meaningless PC indices.
    pub fn from_compile_result(result: &CompileResult) -> Result<Simulator> {
        if result.has_errors() {
            let count = result
                .diagnostics
                .iter()
                .filter(|d| d.is_error())
                .count();
            return Err(miette!(
                severity = Severity::Error,
                code = "compile::errors",
                help = "fix the reported errors and compile again",
                "refusing to simulate: source has {count} error(s)"
            ));
        }
        let ir = result
            .ir
            .as_ref()
            .ok_or_else(|| miette!("compile result carries no IR"))?;
        Ok(Simulator {
            instrs: ir.instrs.clone(),
            regs: vec![0; result.reg_count as usize],
            mem: vec![0; result.mem_size as usize],
            pc: 0,
            halted: false,
            output: Vec::new(),
            trace: Vec::new(),
            input_fn: None,
            output_fn: None,
            oob_fn: None,
            trace_fn: None,
        })
    }

    /// Compile `source` and construct in one go.
    pub fn from_source(source: &str, reg_count: u16, mem_size: u32) -> Result<Simulator> {
        let result = compile_program(source, reg_count, mem_size, false)?;
        Self::from_compile_result(&result)
    }

    pub fn set_input(&mut self, f: impl FnMut() -> Result<u16> + 'static) {
        self.input_fn = Some(Box::new(f));
    }

    pub fn set_output(&mut self, f: impl FnMut(u16) -> Result<()> + 'static) {
        self.output_fn = Some(Box::new(f));
    }

    pub fn set_oob(&mut self, f: impl FnMut(&OobEvent) -> Result<()> + 'static) {
        self.oob_fn = Some(Box::new(f));
    }

    pub fn set_trace(&mut self, f: impl FnMut(&TraceRecord) -> Result<()> + 'static) {
        self.trace_fn = Some(Box::new(f));
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn regs(&self) -> &[u16] {
        &self.regs
    }

    pub fn reg(&self, index: u8) -> u16 {
        self.regs[index as usize]
    }

    pub fn mem(&self) -> &[u16] {
        &self.mem
    }

    pub fn output(&self) -> &[u16] {
        &self.output
    }

    pub fn trace(&self) -> &[TraceRecord] {
        &self.trace
    }

    /// Execute one instruction. Returns false once the machine has
    /// halted or run past the end of the program.
    pub fn step(&mut self) -> Result<bool> {
        if self.halted || self.pc as usize >= self.instrs.len() {
            return Ok(false);
        }
        let inst = self.instrs[self.pc as usize].clone();

        let record = TraceRecord {
            pc: self.pc,
            text: inst.text.clone(),
            regs: self.regs.clone(),
        };
        if let Some(cb) = self.trace_fn.as_mut() {
            cb(&record)?;
        }
        self.trace.push(record);

        let next_pc = self.pc.wrapping_add(1);
        let mut branched = false;

        match inst.op {
            Opcode::Add => {
                self.regs[inst.dest as usize] =
                    self.regs[inst.src1 as usize].wrapping_add(self.regs[inst.src2 as usize])
            }
            Opcode::And => {
                self.regs[inst.dest as usize] =
                    self.regs[inst.src1 as usize] & self.regs[inst.src2 as usize]
            }
            Opcode::Sub => {
                self.regs[inst.dest as usize] =
                    self.regs[inst.src1 as usize].wrapping_sub(self.regs[inst.src2 as usize])
            }
            Opcode::Slt => {
                let lhs = signed16(self.regs[inst.src1 as usize]);
                let rhs = signed16(self.regs[inst.src2 as usize]);
                self.regs[inst.dest as usize] = (lhs < rhs) as u16;
            }
            Opcode::Not => self.regs[inst.dest as usize] = !self.regs[inst.src1 as usize],
            Opcode::Sr => self.regs[inst.dest as usize] = self.regs[inst.src1 as usize] >> 1,
            Opcode::Hlt => self.halted = true,
            Opcode::Ld => {
                let addr = self.ea(&inst);
                let value = self.mem_read(addr, &inst)?;
                self.regs[inst.dest as usize] = value;
            }
            Opcode::St => {
                let addr = self.ea(&inst);
                self.mem_write(addr, self.regs[inst.dest as usize], &inst)?;
            }
            Opcode::Lda => self.regs[inst.dest as usize] = self.ea(&inst),
            Opcode::In => {
                let value = match self.input_fn.as_mut() {
                    Some(cb) => cb()?,
                    None => 0,
                };
                self.regs[inst.dest as usize] = value;
            }
            Opcode::Out => {
                let value = self.regs[inst.dest as usize];
                if let Some(cb) = self.output_fn.as_mut() {
                    cb(value)?;
                }
                self.output.push(value);
            }
            Opcode::Bz => {
                if self.regs[inst.dest as usize] == 0 {
                    self.pc = self.branch_target(&inst);
                    branched = true;
                }
            }
            Opcode::Bal => {
                let target = self.branch_target(&inst);
                self.regs[inst.dest as usize] = next_pc;
                self.pc = target;
                branched = true;
            }
        }

        if !branched {
            self.pc = next_pc;
        }
        Ok(true)
    }

    /// Step until the program halts, runs off the end, or exceeds
    /// the safety cap.
    pub fn run(&mut self) -> Result<()> {
        self.run_with_limit(STEP_LIMIT)
    }

    pub fn run_with_limit(&mut self, limit: u64) -> Result<()> {
        let mut steps: u64 = 0;
        while self.step()? {
            steps += 1;
            if steps >= limit {
                return Err(sim_step_limit(limit));
            }
        }
        Ok(())
    }

    /// `ea(imm8, base)`. A `$0` base reads as constant zero no matter
    /// what the register holds.
    fn ea(&self, inst: &Inst) -> u16 {
        let base_val = match inst.base {
            0 => 0,
            base => self.regs[base as usize],
        };
        base_val.wrapping_add(sext8((inst.imm & 0xFF) as u16))
    }

    fn branch_target(&self, inst: &Inst) -> u16 {
        match inst.target {
            Some(target) => target,
            None => self.ea(inst),
        }
    }

    fn mem_read(&mut self, addr: u16, inst: &Inst) -> Result<u16> {
        if addr as usize >= self.mem.len() {
            self.fire_oob(OobKind::Load, addr, inst)?;
            return Ok(0);
        }
        Ok(self.mem[addr as usize])
    }

    fn mem_write(&mut self, addr: u16, value: u16, inst: &Inst) -> Result<()> {
        if addr as usize >= self.mem.len() {
            self.fire_oob(OobKind::Store, addr, inst)?;
            return Ok(());
        }
        self.mem[addr as usize] = value;
        Ok(())
    }

    fn fire_oob(&mut self, kind: OobKind, addr: u16, inst: &Inst) -> Result<()> {
        if let Some(cb) = self.oob_fn.as_mut() {
            let event = OobEvent {
                kind,
                addr,
                pc: self.pc,
                text: inst.text.clone(),
                mem_size: self.mem.len() as u32,
            };
            cb(&event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn sim(src: &str) -> Simulator {
        Simulator::from_source(src, 4, 128).unwrap()
    }

    #[test]
    fn add_wraps_mod_2_16() {
        let mut sim = sim("LDA $1, -1($0)\nLDA $2, 2($0)\nADD $3, $1, $2\nHLT");
        sim.run().unwrap();
        // 0xFFFF + 2 wraps to 1
        assert_eq!(sim.reg(3), 1);
    }

    #[test]
    fn sub_wraps_below_zero() {
        let mut sim = sim("LDA $1, 1($0)\nLDA $2, 2($0)\nSUB $3, $1, $2\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.reg(3), 0xFFFF);
    }

    #[test]
    fn slt_compares_signed() {
        let mut sim = sim("LDA $1, -1($0)\nLDA $2, 1($0)\nSLT $3, $1, $2\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.reg(1), 0xFFFF);
        assert_eq!(sim.reg(3), 1);
    }

    #[test]
    fn sr_shifts_logically() {
        let mut sim = sim("LDA $1, -2($0)\nSR $2, $1\nHLT");
        sim.run().unwrap();
        // 0xFFFE >> 1 with zero fill
        assert_eq!(sim.reg(2), 0x7FFF);
    }

    #[test]
    fn not_inverts() {
        let mut sim = sim("LDA $1, 0($0)\nNOT $2, $1\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.reg(2), 0xFFFF);
    }

    #[test]
    fn zero_base_is_constant_even_when_written() {
        // $0 holds 5, yet 3($0) must still address 3
        let mut sim = sim("LDA $0, 5($0)\nLDA $1, 3($0)\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.reg(0), 5);
        assert_eq!(sim.reg(1), 3);
    }

    #[test]
    fn load_store_round_trip() {
        let mut sim = sim("LDA $1, 42($0)\nST $1, 7($0)\nLD $2, 7($0)\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.mem()[7], 42);
        assert_eq!(sim.reg(2), 42);
    }

    #[test]
    fn register_base_addressing() {
        let mut sim = sim("LDA $3, 10($0)\nLDA $1, 9($0)\nST $1, -2($3)\nLD $2, -2($3)\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.mem()[8], 9);
        assert_eq!(sim.reg(2), 9);
    }

    #[test]
    fn out_collects_values() {
        let mut sim = sim("LDA $1, 7($0)\nOUT $1\nOUT $1\nHLT");
        sim.run().unwrap();
        assert_eq!(sim.output(), &[7, 7]);
    }

    #[test]
    fn out_invokes_callback() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let mut sim = sim("LDA $1, 3($0)\nOUT $1\nHLT");
        sim.set_output(move |value| {
            sink.borrow_mut().push(value);
            Ok(())
        });
        sim.run().unwrap();
        assert_eq!(*seen.borrow(), vec![3]);
        assert_eq!(sim.output(), &[3]);
    }

    #[test]
    fn in_reads_callback_or_zero() {
        let mut sim1 = sim("IN $1\nHLT");
        sim1.run().unwrap();
        assert_eq!(sim1.reg(1), 0);

        let mut sim2 = sim("IN $1\nHLT");
        sim2.set_input(|| Ok(123));
        sim2.run().unwrap();
        assert_eq!(sim2.reg(1), 123);
    }

    #[test]
    fn oob_load_defaults_to_zero() {
        let mut sim = sim("LDA $1, 42($0)\nLDA $2, -1($0)\nLD $1, 0($2)\nHLT");
        sim.run().unwrap();
        // Address 0xFFFF is out of bounds, load yields 0
        assert_eq!(sim.reg(1), 0);
    }

    #[test]
    fn oob_store_is_noop() {
        let mut sim = sim("LDA $1, 1($0)\nLDA $2, -1($0)\nST $1, 0($2)\nHLT");
        sim.run().unwrap();
        assert!(sim.halted());
        assert!(sim.mem().iter().all(|&w| w == 0 || w == 1));
    }

    #[test]
    fn failing_oob_callback_stops_run() {
        let mut sim = sim("LDA $2, -1($0)\nLD $1, 0($2)\nLDA $3, 9($0)\nHLT");
        sim.set_oob(|event| Err(miette!("oob {} at {}", event.kind.as_str(), event.addr)));
        assert!(sim.run().is_err());
        // The failing step never wrote its destination, and the
        // following instruction never ran
        assert_eq!(sim.reg(1), 0);
        assert_eq!(sim.reg(3), 0);
        assert!(!sim.halted());
    }

    #[test]
    fn trace_callback_sees_pre_state() {
        let rows = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&rows);
        let mut sim = sim("LDA $1, 5($0)\nHLT");
        sim.set_trace(move |record| {
            sink.borrow_mut().push(record.clone());
            Ok(())
        });
        sim.run().unwrap();
        let rows = rows.borrow();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pc, 0);
        // Snapshot precedes execution
        assert_eq!(rows[0].regs, vec![0, 0, 0, 0]);
        assert_eq!(rows[1].regs, vec![0, 5, 0, 0]);
        assert_eq!(rows.as_slice(), sim.trace());
    }

    #[test]
    fn step_after_halt_is_inert() {
        let mut sim = sim("HLT");
        assert!(sim.step().unwrap());
        assert!(sim.halted());
        assert!(!sim.step().unwrap());
        assert_eq!(sim.trace().len(), 1);
    }

    #[test]
    fn empty_program_stops_immediately() {
        let mut sim = sim("; comments only\n");
        sim.run().unwrap();
        assert!(sim.trace().is_empty());
        assert!(!sim.halted());
    }

    #[test]
    fn run_hits_step_cap() {
        let mut sim = sim("loop: BAL $0, loop");
        let err = sim.run_with_limit(100).unwrap_err();
        assert!(err.to_string().contains("cap"));
        assert_eq!(sim.trace().len(), 100);
    }

    #[test]
    fn refuses_compile_errors() {
        assert!(Simulator::from_source("LD $1, 1000($0)\nHLT", 4, 128).is_err());
    }
}
