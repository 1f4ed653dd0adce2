use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::cfg::Cfg;
use crate::diag::{self, Diagnostic};
use crate::ir::{Inst, Ir, Opcode};
use crate::word::sext8;

/// Initialization fact for one register or memory cell. `Init`
/// remembers the PCs of the writes that produced the value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Init {
    Uninit,
    /// Written on some paths but not all
    MaybeInit,
    Init(BTreeSet<u16>),
}

impl Init {
    fn written_at(pc: u16) -> Init {
        Init::Init(BTreeSet::from([pc]))
    }

    fn join(&self, other: &Init) -> Init {
        match (self, other) {
            (Init::Uninit, Init::Uninit) => Init::Uninit,
            (Init::Init(a), Init::Init(b)) => {
                Init::Init(a.union(b).copied().collect())
            }
            _ => Init::MaybeInit,
        }
    }
}

/// Per-register fact: initialization plus return-address taint.
/// `ret` is the set of PCs a `BAL`-written link value would return
/// to, present only when every path tainted the register.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegFact {
    pub init: Init,
    pub ret: Option<BTreeSet<u16>>,
}

impl RegFact {
    fn uninit() -> Self {
        RegFact {
            init: Init::Uninit,
            ret: None,
        }
    }

    fn join(&self, other: &RegFact) -> RegFact {
        RegFact {
            init: self.init.join(&other.init),
            ret: match (&self.ret, &other.ret) {
                (Some(a), Some(b)) => Some(a.union(b).copied().collect()),
                _ => None,
            },
        }
    }
}

/// Abstract machine state ahead of one instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FlowState {
    pub regs: Vec<RegFact>,
    /// Cells touched through statically known addresses. Absent keys
    /// are `Uninit`.
    pub mem: BTreeMap<u16, Init>,
}

impl FlowState {
    fn entry(reg_count: u16) -> Self {
        FlowState {
            regs: vec![RegFact::uninit(); reg_count as usize],
            mem: BTreeMap::new(),
        }
    }

    fn join(&self, other: &FlowState) -> FlowState {
        let regs = self
            .regs
            .iter()
            .zip(&other.regs)
            .map(|(a, b)| a.join(b))
            .collect();
        let mut mem = BTreeMap::new();
        for key in self.mem.keys().chain(other.mem.keys()) {
            if mem.contains_key(key) {
                continue;
            }
            let a = self.mem.get(key).unwrap_or(&Init::Uninit);
            let b = other.mem.get(key).unwrap_or(&Init::Uninit);
            mem.insert(*key, a.join(b));
        }
        FlowState { regs, mem }
    }
}

/// Fixpoint result: the pre-state of every instruction, `None` where
/// the instruction is unreachable.
#[derive(Debug)]
pub struct Dataflow {
    pub at: Vec<Option<FlowState>>,
}

/// Run the worklist to fixpoint, then report uninitialized register
/// reads and returns through untainted registers.
pub fn analyze(ir: &Ir, cfg: &Cfg, reg_count: u16) -> (Dataflow, Vec<Diagnostic>) {
    let len = ir.len();
    let mut at: Vec<Option<FlowState>> = vec![None; len];
    if len > 0 {
        at[0] = Some(FlowState::entry(reg_count));
        let mut worklist = vec![0u16];
        while let Some(pc) = worklist.pop() {
            let out = transfer(&ir.instrs[pc as usize], pc, at[pc as usize].as_ref().unwrap());
            for &next in cfg.successors(pc) {
                let merged = match &at[next as usize] {
                    Some(existing) => existing.join(&out),
                    None => out.clone(),
                };
                if at[next as usize].as_ref() != Some(&merged) {
                    at[next as usize] = Some(merged);
                    worklist.push(next);
                }
            }
        }
    }

    let mut diags = Vec::new();
    for (pc, inst) in ir.instrs.iter().enumerate() {
        let Some(state) = &at[pc] else { continue };
        let mut seen = Vec::new();
        for reg in reads(inst) {
            if seen.contains(&reg) {
                continue;
            }
            seen.push(reg);
            match state.regs[reg as usize].init {
                Init::Uninit => diags.push(diag::flow_uninit_read(inst.span, reg, true)),
                Init::MaybeInit => diags.push(diag::flow_uninit_read(inst.span, reg, false)),
                Init::Init(_) => {}
            }
        }
        if inst.is_return() && state.regs[inst.base as usize].ret.is_none() {
            diags.push(diag::flow_invalid_return(inst.span, inst.base));
        }
    }
    (Dataflow { at }, diags)
}

/// Registers an instruction reads. `$0` as an address base is the
/// constant zero, not a register read.
fn reads(inst: &Inst) -> Vec<u8> {
    let mut regs = Vec::new();
    let base_read = inst.target.is_none() && inst.base != 0;
    match inst.op {
        Opcode::Add | Opcode::And | Opcode::Sub | Opcode::Slt => {
            regs.push(inst.src1);
            regs.push(inst.src2);
        }
        Opcode::Not | Opcode::Sr => regs.push(inst.src1),
        Opcode::Hlt | Opcode::In => {}
        Opcode::Ld | Opcode::Lda => {
            if base_read {
                regs.push(inst.base);
            }
        }
        Opcode::St => {
            regs.push(inst.dest);
            if base_read {
                regs.push(inst.base);
            }
        }
        Opcode::Out => regs.push(inst.dest),
        Opcode::Bz => {
            regs.push(inst.dest);
            if base_read {
                regs.push(inst.base);
            }
        }
        Opcode::Bal => {
            if base_read {
                regs.push(inst.base);
            }
        }
    }
    regs
}

fn transfer(inst: &Inst, pc: u16, state: &FlowState) -> FlowState {
    let mut out = state.clone();
    match inst.op {
        Opcode::Add
        | Opcode::And
        | Opcode::Sub
        | Opcode::Slt
        | Opcode::Not
        | Opcode::Sr
        | Opcode::Ld
        | Opcode::Lda
        | Opcode::In => {
            out.regs[inst.dest as usize] = RegFact {
                init: Init::written_at(pc),
                ret: None,
            };
        }
        Opcode::Bal => {
            out.regs[inst.dest as usize] = RegFact {
                init: Init::written_at(pc),
                ret: Some(BTreeSet::from([pc.wrapping_add(1)])),
            };
        }
        Opcode::St => {
            if inst.base == 0 {
                let addr = sext8((inst.imm & 0xFF) as u16);
                out.mem.insert(addr, Init::written_at(pc));
            } else {
                // A dynamic store may hit any tracked cell
                for fact in out.mem.values_mut() {
                    *fact = fact.join(&Init::written_at(pc));
                }
            }
        }
        Opcode::Hlt | Opcode::Out | Opcode::Bz => {}
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cfg;
    use crate::lower::lower;
    use crate::parser::AsmParser;

    fn analyze_src(src: &str) -> (Dataflow, Vec<Diagnostic>) {
        let (program, diags) = AsmParser::new(src).parse();
        assert!(diags.is_empty());
        let (ir, diags) = lower(&program, src, 4, 128);
        assert!(diags.iter().all(|d| !d.is_error()), "{diags:?}");
        let (graph, _) = cfg::build(&ir);
        analyze(&ir, &graph, 4)
    }

    fn codes(diags: &[Diagnostic]) -> Vec<&'static str> {
        diags.iter().map(|d| d.code).collect()
    }

    #[test]
    fn clean_program_is_silent() {
        let (_, diags) =
            analyze_src("LDA $1, 3($0)\nLDA $2, 4($0)\nADD $3, $1, $2\nHLT");
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn definite_uninit_read() {
        let (_, diags) = analyze_src("ADD $3, $1, $2\nHLT");
        assert_eq!(codes(&diags), vec!["flow::uninit_read", "flow::uninit_read"]);
        assert!(diags[0].message.contains("$1"));
        assert!(diags[1].message.contains("$2"));
    }

    #[test]
    fn maybe_init_at_merge() {
        // $2 is written only when the branch is not taken
        let (_, diags) = analyze_src(
            "LDA $1, 0($0)\nBZ $1, skip\nLDA $2, 1($0)\nskip: OUT $2\nHLT",
        );
        assert_eq!(codes(&diags), vec!["flow::uninit_read"]);
        assert!(diags[0].message.contains("may be read"));
    }

    #[test]
    fn both_paths_init_is_clean() {
        let (_, diags) = analyze_src(
            "LDA $1, 1($0)\nBZ $1, other\nLDA $2, 1($0)\nBZ $0, join\nother: LDA $2, 2($0)\njoin: OUT $2\nHLT",
        );
        // $0 is read by BZ while holding its initial value; that read
        // is the only finding, and $2 is clean at the join.
        assert_eq!(codes(&diags), vec!["flow::uninit_read"]);
        assert!(diags[0].message.contains("$0"));
    }

    #[test]
    fn zero_base_address_is_not_a_read() {
        let (_, diags) = analyze_src("LDA $1, 3($0)\nHLT");
        assert!(diags.is_empty());
    }

    #[test]
    fn linked_return_is_valid() {
        let (_, diags) = analyze_src("main: BAL $2, foo\nHLT\nfoo: BAL $0, 0($2)");
        assert!(diags.is_empty(), "{diags:?}");
    }

    #[test]
    fn return_without_link_warns() {
        let (_, diags) = analyze_src("LDA $2, 1($0)\nBAL $0, 0($2)\nHLT");
        assert_eq!(codes(&diags), vec!["flow::invalid_return"]);
    }

    #[test]
    fn clobbered_link_warns() {
        let (_, diags) = analyze_src(
            "main: BAL $2, foo\nHLT\nfoo: LDA $2, 5($0)\nBAL $0, 0($2)",
        );
        assert_eq!(codes(&diags), vec!["flow::invalid_return"]);
    }

    #[test]
    fn static_store_then_state_tracks_cell() {
        let (flow, diags) = analyze_src("LDA $1, 7($0)\nST $1, 3($0)\nHLT");
        assert!(diags.is_empty());
        // Pre-state of HLT knows cell 3 was written at PC 1
        let state = flow.at[2].as_ref().unwrap();
        assert_eq!(state.mem[&3], Init::Init(BTreeSet::from([1])));
    }

    #[test]
    fn taint_tracks_return_target() {
        let (flow, _) = analyze_src("main: BAL $2, foo\nHLT\nfoo: HLT");
        let state = flow.at[2].as_ref().unwrap();
        assert_eq!(state.regs[2].ret, Some(BTreeSet::from([1])));
    }

    #[test]
    fn unreachable_has_no_state() {
        let (flow, _) = analyze_src("HLT\nADD $1, $1, $1");
        assert!(flow.at[0].is_some());
        assert!(flow.at[1].is_none());
    }
}
