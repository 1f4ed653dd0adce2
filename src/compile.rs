use miette::{bail, Report, Result, Severity};

use crate::ast::Program;
use crate::cfg::{self, Cfg};
use crate::dataflow::{self, Dataflow};
use crate::diag::{self, Diagnostic};
use crate::ir::Ir;
use crate::lower::lower;
use crate::parser::AsmParser;

pub const DEFAULT_REG_COUNT: u16 = 4;
pub const DEFAULT_MEM_SIZE: u32 = 128;

/// Everything one compile produced. `ir` is present even when there
/// are errors, but is then partial: PC indices in it are unreliable,
/// which is why simulator construction checks [`has_errors`].
///
/// [`has_errors`]: CompileResult::has_errors
pub struct CompileResult {
    pub program: Option<Program>,
    pub ir: Option<Ir>,
    pub diagnostics: Vec<Diagnostic>,
    pub cfg: Option<Cfg>,
    pub dataflow: Option<Dataflow>,
    pub reg_count: u16,
    pub mem_size: u32,
    source: String,
}

impl CompileResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_error())
    }

    pub fn has_warnings(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_warning())
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Line-anchored plain text rendering of every diagnostic.
    pub fn format_diagnostics(&self) -> String {
        diag::format_diagnostics(&self.source, &self.diagnostics)
    }

    /// Rich per-diagnostic reports for terminal display.
    pub fn reports(&self) -> Vec<Report> {
        self.diagnostics
            .iter()
            .map(|d| d.to_report(&self.source))
            .collect()
    }
}

/// Run the whole front half of the pipeline: lex, parse, lower,
/// encode, and (optionally) the static analyses.
///
/// Only configuration problems return `Err`; problems with the
/// source land in `CompileResult::diagnostics`.
pub fn compile_program(
    source: &str,
    reg_count: u16,
    mem_size: u32,
    run_static_checks: bool,
) -> Result<CompileResult> {
    if !(1..=4).contains(&reg_count) {
        bail!(
            severity = Severity::Error,
            code = "config::reg_count",
            help = "register fields are two bits wide",
            "reg_count must be between 1 and 4, got {reg_count}"
        );
    }
    if !(1..=0x10000).contains(&mem_size) {
        bail!(
            severity = Severity::Error,
            code = "config::mem_size",
            help = "the address space is 16 bits",
            "mem_size must be between 1 and 65536 words, got {mem_size}"
        );
    }

    let (program, mut diagnostics) = AsmParser::new(source).parse();
    let (ir, lower_diags) = lower(&program, source, reg_count, mem_size);
    diagnostics.extend(lower_diags);
    // Syntax and lowering findings read best in source order; they
    // were collected in pass order.
    diagnostics.sort_by_key(|d| d.span.map(|s| s.offs()).unwrap_or(0));

    let has_errors = diagnostics.iter().any(|d| d.is_error());
    let mut graph = None;
    let mut flow = None;
    if run_static_checks && !has_errors {
        let (built, cfg_diags) = cfg::build(&ir);
        diagnostics.extend(cfg_diags);
        let (solved, flow_diags) = dataflow::analyze(&ir, &built, reg_count);
        diagnostics.extend(flow_diags);
        graph = Some(built);
        flow = Some(solved);
    }

    Ok(CompileResult {
        program: Some(program),
        ir: Some(ir),
        diagnostics,
        cfg: graph,
        dataflow: flow,
        reg_count,
        mem_size,
        source: source.to_string(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clean_compile() {
        let result = compile_program("LDA $1, 3($0)\nHLT", 4, 128, true).unwrap();
        assert!(!result.has_errors());
        assert!(!result.has_warnings());
        assert_eq!(result.ir.as_ref().unwrap().len(), 2);
        assert!(result.cfg.is_some());
        assert!(result.dataflow.is_some());
    }

    #[test]
    fn errors_skip_analyses() {
        let result = compile_program("LD $1, 1000($0)\nHLT", 4, 128, true).unwrap();
        assert!(result.has_errors());
        assert!(result.cfg.is_none());
        assert!(result.dataflow.is_none());
    }

    #[test]
    fn checks_can_be_disabled() {
        let result = compile_program("HLT\nADD $1, $1, $1", 4, 128, false).unwrap();
        assert!(result.diagnostics.is_empty());
        assert!(result.cfg.is_none());
    }

    #[test]
    fn config_bounds_rejected() {
        assert!(compile_program("HLT", 0, 128, false).is_err());
        assert!(compile_program("HLT", 5, 128, false).is_err());
        assert!(compile_program("HLT", 4, 0, false).is_err());
        assert!(compile_program("HLT", 4, 0x10001, false).is_err());
        assert!(compile_program("HLT", 4, 0x10000, false).is_ok());
    }

    #[test]
    fn diagnostics_sorted_by_source_position() {
        // The parse error sits on line 2, the lower error on line 1
        let src = "BZ $1, nowhere\nADD $1, (\nHLT";
        let result = compile_program(src, 4, 128, false).unwrap();
        let codes: Vec<&str> = result.diagnostics.iter().map(|d| d.code).collect();
        assert_eq!(codes, vec!["lower::undefined_label", "parse::unexpected_token"]);
    }

    #[test]
    fn compile_is_idempotent() {
        let src = "main: BAL $2, foo\nLDA $1, 300($0)\nHLT\nfoo: BAL $0, 0($2)";
        let a = compile_program(src, 4, 128, true).unwrap();
        let b = compile_program(src, 4, 128, true).unwrap();
        assert_eq!(a.ir.as_ref().unwrap().words, b.ir.as_ref().unwrap().words);
        assert_eq!(a.format_diagnostics(), b.format_diagnostics());
    }

    #[test]
    fn format_diagnostics_is_line_anchored() {
        let result = compile_program("LDA $1, 300($0)\nHLT", 4, 128, false).unwrap();
        let text = result.format_diagnostics();
        assert!(text.starts_with("line 1: warning[I001]"), "{text}");
    }
}
