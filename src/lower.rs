use fxhash::FxHashMap;

use crate::ast::{Instr, Operand, OperandKind, Program};
use crate::diag::{self, Diagnostic};
use crate::ir::{Format, Inst, Ir, Opcode};
use crate::word::{sext8, signed16};

/// Lower the AST into IR plus the binary image.
///
/// Pass 1 assigns a PC index to every line carrying an instruction
/// and collects labels; pass 2 validates shapes, resolves label
/// references, and encodes. A line that fails validation produces no
/// IR entry, leaving the IR partial (callers must check for errors
/// before trusting PC indices).
pub fn lower(
    program: &Program,
    src: &str,
    reg_count: u16,
    mem_size: u32,
) -> (Ir, Vec<Diagnostic>) {
    Lowerer {
        src,
        reg_count,
        mem_size,
        diags: Vec::new(),
    }
    .run(program)
}

struct Lowerer<'a> {
    src: &'a str,
    reg_count: u16,
    mem_size: u32,
    diags: Vec<Diagnostic>,
}

impl<'a> Lowerer<'a> {
    fn run(mut self, program: &Program) -> (Ir, Vec<Diagnostic>) {
        let mut ir = Ir::new();
        ir.symbols = self.collect_symbols(program);

        for line in &program.lines {
            let Some(instr) = &line.instr else { continue };
            if let Some(inst) = self.lower_instr(instr, &ir.symbols) {
                self.check_encoding(&inst);
                ir.push(inst);
            }
        }
        (ir, self.diags)
    }

    /// Pass 1. A label on a line without an instruction binds to the
    /// next instruction's PC; the first definition of a name wins.
    fn collect_symbols(&mut self, program: &Program) -> FxHashMap<String, u16> {
        let mut symbols = FxHashMap::default();
        let mut pc: u16 = 0;
        for line in &program.lines {
            if let Some(label) = &line.label {
                if symbols.contains_key(&label.name) {
                    self.diags
                        .push(diag::lower_duplicate_label(label.span, &label.name));
                } else {
                    symbols.insert(label.name.clone(), pc);
                }
            }
            if line.instr.is_some() {
                pc = pc.wrapping_add(1);
            }
        }
        symbols
    }

    /// Pass 2, one instruction.
    fn lower_instr(&mut self, instr: &Instr, symbols: &FxHashMap<String, u16>) -> Option<Inst> {
        let Some(op) = Opcode::from_mnemonic(&instr.mnemonic) else {
            self.diags
                .push(diag::lower_unknown_mnemonic(instr.mnemonic_span, &instr.mnemonic));
            return None;
        };

        let expected = match op.format() {
            Format::R => 3,
            Format::R1 => 2,
            Format::R0 => 0,
            Format::I => match op {
                Opcode::In | Opcode::Out => 1,
                _ => 2,
            },
        };
        if instr.operands.len() != expected {
            self.diags.push(diag::lower_operand_count(
                instr.span,
                &instr.mnemonic,
                expected,
                instr.operands.len(),
            ));
            return None;
        }

        let text = self.src[instr.span.as_range()].to_string();
        let mut inst = Inst::empty(op, instr.span, text);
        let ops = &instr.operands;

        match op.format() {
            Format::R => {
                inst.dest = self.expect_reg(&ops[0], &instr.mnemonic)?;
                inst.src1 = self.expect_reg(&ops[1], &instr.mnemonic)?;
                inst.src2 = self.expect_reg(&ops[2], &instr.mnemonic)?;
            }
            Format::R1 => {
                inst.dest = self.expect_reg(&ops[0], &instr.mnemonic)?;
                inst.src1 = self.expect_reg(&ops[1], &instr.mnemonic)?;
            }
            Format::R0 => {}
            Format::I => {
                inst.dest = self.expect_reg(&ops[0], &instr.mnemonic)?;
                if let Some(addr) = ops.get(1) {
                    match &addr.kind {
                        OperandKind::Address { imm, base } => {
                            inst.imm = *imm;
                            inst.base = self.check_reg(*base, addr, &instr.mnemonic)?;
                        }
                        OperandKind::LabelRef(name) if matches!(op, Opcode::Bz | Opcode::Bal) => {
                            match symbols.get(name) {
                                Some(pc) => inst.target = Some(*pc),
                                None => {
                                    self.diags
                                        .push(diag::lower_undefined_label(addr.span, name));
                                    return None;
                                }
                            }
                        }
                        _ => {
                            let expected = match op {
                                Opcode::Bz | Opcode::Bal => "a label or address",
                                _ => "an address like 4($1)",
                            };
                            self.diags.push(diag::lower_operand_kind(
                                addr.span,
                                &instr.mnemonic,
                                expected,
                            ));
                            return None;
                        }
                    }
                }
            }
        }
        Some(inst)
    }

    fn expect_reg(&mut self, operand: &Operand, mnemonic: &str) -> Option<u8> {
        match operand.kind {
            OperandKind::Reg(index) => self.check_reg(index, operand, mnemonic),
            _ => {
                self.diags
                    .push(diag::lower_operand_kind(operand.span, mnemonic, "a register"));
                None
            }
        }
    }

    fn check_reg(&mut self, index: u8, operand: &Operand, _mnemonic: &str) -> Option<u8> {
        if (index as u16) < self.reg_count {
            Some(index)
        } else {
            self.diags
                .push(diag::lower_bad_register(operand.span, index, self.reg_count));
            None
        }
    }

    /// Encoder checks: immediate truncation, branch-field overflow,
    /// absolute-address bounds.
    fn check_encoding(&mut self, inst: &Inst) {
        if inst.op.format() != Format::I {
            return;
        }
        match inst.target {
            Some(target) => {
                if target >= 1024 {
                    self.diags.push(diag::enc_branch_overflow(inst.span, target));
                }
            }
            None => {
                if !(-128..=127).contains(&inst.imm) {
                    let effective = signed16(sext8((inst.imm & 0xFF) as u16));
                    self.diags
                        .push(diag::enc_imm_truncated(inst.span, inst.imm, effective));
                }
                // Absolute loads/stores are checked against data
                // memory now; LDA only computes an address.
                if matches!(inst.op, Opcode::Ld | Opcode::St) && inst.base == 0 {
                    let addr = sext8((inst.imm & 0xFF) as u16);
                    if addr as u32 >= self.mem_size {
                        self.diags
                            .push(diag::enc_addr_oob(inst.span, addr, self.mem_size));
                    }
                }
            }
        }
    }
}
