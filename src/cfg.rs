use crate::diag::{self, Diagnostic};
use crate::ir::{Ir, Opcode};
use crate::word::sext8;

/// Control-flow graph over IR instruction indices.
#[derive(Debug)]
pub struct Cfg {
    /// Statically known successor PCs, deduplicated, per instruction.
    pub succs: Vec<Vec<u16>>,
    /// `BAL` through a link register: an exit from the graph.
    pub return_sites: Vec<bool>,
    /// Reachable from PC 0.
    pub reachable: Vec<bool>,
}

impl Cfg {
    pub fn successors(&self, pc: u16) -> &[u16] {
        &self.succs[pc as usize]
    }
}

/// Build the graph and report unreachable code and obvious
/// non-terminating loops.
pub fn build(ir: &Ir) -> (Cfg, Vec<Diagnostic>) {
    let len = ir.len();
    let mut succs: Vec<Vec<u16>> = Vec::with_capacity(len);
    let mut return_sites = vec![false; len];

    for (pc, inst) in ir.instrs.iter().enumerate() {
        let mut out: Vec<u16> = Vec::with_capacity(2);
        let push = |target: u32, out: &mut Vec<u16>| {
            // Past-the-end successors fall off the program and stop
            if (target as usize) < len && !out.contains(&(target as u16)) {
                out.push(target as u16);
            }
        };
        let fall_through = pc as u32 + 1;

        match inst.op {
            Opcode::Hlt => {}
            Opcode::Bal => match inst.target {
                Some(target) => push(target as u32, &mut out),
                None if inst.base == 0 => {
                    // Constant base: the jump target is static
                    push(sext8((inst.imm & 0xFF) as u16) as u32, &mut out)
                }
                None => return_sites[pc] = true,
            },
            Opcode::Bz => {
                push(fall_through, &mut out);
                match inst.target {
                    Some(target) => push(target as u32, &mut out),
                    None if inst.base == 0 => {
                        push(sext8((inst.imm & 0xFF) as u16) as u32, &mut out)
                    }
                    // Taken target lives in a register; nothing static
                    None => {}
                }
            }
            _ => push(fall_through, &mut out),
        }
        succs.push(out);
    }

    let reachable = reach(&succs, len);
    let cfg = Cfg {
        succs,
        return_sites,
        reachable,
    };

    let mut diags = Vec::new();
    for (pc, inst) in ir.instrs.iter().enumerate() {
        if !cfg.reachable[pc] {
            diags.push(diag::cfg_unreachable(inst.span, pc as u16));
        }
    }
    find_loops(ir, &cfg, &mut diags);
    (cfg, diags)
}

/// BFS from PC 0.
fn reach(succs: &[Vec<u16>], len: usize) -> Vec<bool> {
    let mut seen = vec![false; len];
    let mut queue = Vec::new();
    if len > 0 {
        seen[0] = true;
        queue.push(0u16);
    }
    while let Some(pc) = queue.pop() {
        for &next in &succs[pc as usize] {
            if !seen[next as usize] {
                seen[next as usize] = true;
                queue.push(next);
            }
        }
    }
    seen
}

/// Report each bottom SCC that cycles without I/O: once entered, the
/// program can neither halt nor leave it.
fn find_loops(ir: &Ir, cfg: &Cfg, diags: &mut Vec<Diagnostic>) {
    let mut loops: Vec<u16> = Vec::new();
    for scc in tarjan(&cfg.succs) {
        let is_cycle =
            scc.len() > 1 || cfg.succs[scc[0] as usize].contains(&scc[0]);
        if !is_cycle {
            continue;
        }
        let escapes = scc.iter().any(|&pc| {
            cfg.succs[pc as usize]
                .iter()
                .any(|next| !scc.contains(next))
        });
        let has_io = scc.iter().any(|&pc| ir.instrs[pc as usize].op.is_io());
        if !escapes && !has_io {
            loops.push(*scc.iter().min().unwrap());
        }
    }
    loops.sort_unstable();
    for pc in loops {
        diags.push(diag::cfg_infinite_loop(ir.instrs[pc as usize].span, pc));
    }
}

/// Iterative Tarjan; recursion depth would track program length.
fn tarjan(succs: &[Vec<u16>]) -> Vec<Vec<u16>> {
    let n = succs.len();
    let mut index = vec![usize::MAX; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut stack: Vec<u16> = Vec::new();
    let mut next_index = 0usize;
    let mut sccs: Vec<Vec<u16>> = Vec::new();

    // (node, next successor position)
    let mut frames: Vec<(u16, usize)> = Vec::new();
    for start in 0..n {
        if index[start] != usize::MAX {
            continue;
        }
        frames.push((start as u16, 0));
        index[start] = next_index;
        lowlink[start] = next_index;
        next_index += 1;
        stack.push(start as u16);
        on_stack[start] = true;

        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            let v_us = v as usize;
            if let Some(&w) = succs[v_us].get(frame.1) {
                frame.1 += 1;
                let w_us = w as usize;
                if index[w_us] == usize::MAX {
                    index[w_us] = next_index;
                    lowlink[w_us] = next_index;
                    next_index += 1;
                    stack.push(w);
                    on_stack[w_us] = true;
                    frames.push((w, 0));
                } else if on_stack[w_us] {
                    lowlink[v_us] = lowlink[v_us].min(index[w_us]);
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    let p = parent as usize;
                    lowlink[p] = lowlink[p].min(lowlink[v_us]);
                }
                if lowlink[v_us] == index[v_us] {
                    let mut scc = Vec::new();
                    loop {
                        let w = stack.pop().unwrap();
                        on_stack[w as usize] = false;
                        scc.push(w);
                        if w == v {
                            break;
                        }
                    }
                    scc.sort_unstable();
                    sccs.push(scc);
                }
            }
        }
    }
    sccs
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lower::lower;
    use crate::parser::AsmParser;

    fn build_src(src: &str) -> (Cfg, Vec<Diagnostic>, Ir) {
        let (program, diags) = AsmParser::new(src).parse();
        assert!(diags.is_empty());
        let (ir, diags) = lower(&program, src, 4, 128);
        assert!(diags.iter().all(|d| !d.is_error()), "{diags:?}");
        let (cfg, diags) = build(&ir);
        (cfg, diags, ir)
    }

    #[test]
    fn straight_line_edges() {
        let (cfg, diags, _) = build_src("LDA $1, 1($0)\nADD $1, $1, $1\nHLT");
        assert_eq!(cfg.succs, vec![vec![1], vec![2], vec![]]);
        assert!(diags.is_empty());
    }

    #[test]
    fn branch_has_two_successors() {
        let (cfg, _, _) = build_src("BZ $1, done\nLDA $1, 1($0)\ndone: HLT");
        assert_eq!(cfg.succs[0], vec![1, 2]);
    }

    #[test]
    fn call_and_return_edges() {
        let (cfg, diags, _) = build_src("main: BAL $2, foo\nHLT\nfoo: BAL $0, 0($2)");
        // Call jumps to foo only; the return has no static successor
        assert_eq!(cfg.succs[0], vec![2]);
        assert_eq!(cfg.succs[2], Vec::<u16>::new());
        assert!(cfg.return_sites[2]);
        assert!(!cfg.return_sites[0]);
        assert!(diags.is_empty());
    }

    #[test]
    fn static_jump_through_zero_base() {
        let (cfg, _, _) = build_src("BAL $1, 2($0)\nHLT\nHLT");
        assert_eq!(cfg.succs[0], vec![2]);
        assert!(!cfg.return_sites[0]);
    }

    #[test]
    fn unreachable_after_halt() {
        let (_, diags, _) = build_src("HLT\nLDA $1, 1($0)\nADD $1, $1, $1");
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.code == "cfg::unreachable"));
        assert!(diags[0].message.contains("PC 1"));
        assert!(diags[1].message.contains("PC 2"));
    }

    #[test]
    fn tight_loop_reported() {
        let (_, diags, _) = build_src("loop: BAL $0, loop");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, "cfg::infinite_loop");
    }

    #[test]
    fn two_instruction_loop_reported() {
        let (_, diags, _) = build_src("loop: ADD $1, $1, $1\nBAL $0, loop");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, "cfg::infinite_loop");
        assert!(diags[0].message.contains("PC 0"));
    }

    #[test]
    fn loop_with_exit_not_reported() {
        let (_, diags, _) = build_src("loop: BZ $1, done\nBAL $0, loop\ndone: HLT");
        assert!(diags.is_empty());
    }

    #[test]
    fn loop_with_io_not_reported() {
        let (_, diags, _) = build_src("loop: OUT $1\nBAL $0, loop");
        assert!(diags.is_empty());
    }

    #[test]
    fn empty_program_builds() {
        let (cfg, diags, _) = build_src("; nothing here\n");
        assert!(cfg.succs.is_empty());
        assert!(diags.is_empty());
    }
}
