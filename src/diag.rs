use std::fmt::Write as _;

use miette::{miette, LabeledSpan, Report, Severity};

use crate::span::Span;

/// A single compile-time finding. Stages append these to a shared
/// list instead of aborting, so one bad line never hides the rest of
/// the file.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub span: Option<Span>,
    pub message: String,
    pub help: Option<&'static str>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    /// Convert into a rich report for terminal display.
    pub fn to_report(&self, src: &str) -> Report {
        let labels = match self.span {
            Some(span) => vec![LabeledSpan::at(span, self.label_text())],
            None => vec![],
        };
        let report = match self.help {
            Some(help) => miette!(
                severity = self.severity,
                code = self.code,
                help = help,
                labels = labels,
                "{}",
                self.message
            ),
            None => miette!(
                severity = self.severity,
                code = self.code,
                labels = labels,
                "{}",
                self.message
            ),
        };
        report.with_source_code(src.to_string())
    }

    fn label_text(&self) -> &'static str {
        match self.severity {
            Severity::Error => "error here",
            Severity::Warning => "warning here",
            _ => "note",
        }
    }
}

fn severity_name(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        _ => "info",
    }
}

/// Render diagnostics as plain line-anchored text, one per row.
pub fn format_diagnostics(src: &str, diags: &[Diagnostic]) -> String {
    let mut out = String::new();
    for diag in diags {
        match diag.span {
            Some(span) => {
                let _ = writeln!(
                    out,
                    "line {}: {}[{}] {}",
                    span.line(src),
                    severity_name(diag.severity),
                    diag.code,
                    diag.message
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "{}[{}] {}",
                    severity_name(diag.severity),
                    diag.code,
                    diag.message
                );
            }
        }
    }
    out
}

// Lexer diagnostics

pub fn lex_unknown(span: Span, lexeme: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lex::unknown",
        span: Some(span),
        message: format!("unrecognized character `{lexeme}`"),
        help: Some("only labels, mnemonics, registers like $1, numbers, `,`, `:` and `()` are allowed"),
    }
}

// Parser diagnostics

pub fn parse_unexpected(span: Span, expected: &str, found: impl std::fmt::Display) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "parse::unexpected_token",
        span: Some(span),
        message: format!("expected {expected}, found {found}"),
        help: Some("the rest of this line is ignored"),
    }
}

pub fn parse_register_index(span: Span, lexeme: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "parse::register",
        span: Some(span),
        message: format!("register `{lexeme}` is not addressable"),
        help: Some("registers are written $0 through $3"),
    }
}

pub fn parse_bad_literal(span: Span, lexeme: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "parse::bad_lit",
        span: Some(span),
        message: format!("numeric literal `{lexeme}` is out of range"),
        help: None,
    }
}

// Lowering diagnostics

pub fn lower_unknown_mnemonic(span: Span, name: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::unknown_mnemonic",
        span: Some(span),
        message: format!("unknown mnemonic `{name}`"),
        help: Some("see the instruction table for the 14 SN/X opcodes"),
    }
}

pub fn lower_operand_count(span: Span, mnemonic: &str, expected: usize, found: usize) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::operand_count",
        span: Some(span),
        message: format!("`{mnemonic}` takes {expected} operand(s), found {found}"),
        help: None,
    }
}

pub fn lower_operand_kind(span: Span, mnemonic: &str, expected: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::operand_kind",
        span: Some(span),
        message: format!("`{mnemonic}` expects {expected} here"),
        help: None,
    }
}

pub fn lower_bad_register(span: Span, index: u8, reg_count: u16) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::bad_register",
        span: Some(span),
        message: format!("register ${index} does not exist on this machine"),
        help: match reg_count {
            4 => Some("registers are $0 through $3"),
            _ => Some("the register file is configured smaller than the default"),
        },
    }
}

pub fn lower_duplicate_label(span: Span, name: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::duplicate_label",
        span: Some(span),
        message: format!("label `{name}` is defined more than once"),
        help: Some("labels are case-insensitive, so FOO and foo collide"),
    }
}

pub fn lower_undefined_label(span: Span, name: &str) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "lower::undefined_label",
        span: Some(span),
        message: format!("label `{name}` is not defined anywhere in this file"),
        help: None,
    }
}

// Encoder diagnostics. M001/I001/B001 are stable codes that other
// tooling matches on; do not rename them.

pub fn enc_imm_truncated(span: Span, value: i64, effective: i16) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        code: "I001",
        span: Some(span),
        message: format!(
            "immediate {value} is outside [-128, 127] and truncates to {effective}"
        ),
        help: Some("the immediate field is 8 bits, sign-extended at run time"),
    }
}

pub fn enc_branch_overflow(span: Span, target: u16) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        code: "B001",
        span: Some(span),
        message: format!(
            "branch target PC {target} does not fit the 10-bit target field; \
             the encoded word overflows into the opcode bits"
        ),
        help: Some("execution is unaffected; only the binary image is distorted"),
    }
}

pub fn enc_addr_oob(span: Span, addr: u16, mem_size: u32) -> Diagnostic {
    Diagnostic {
        severity: Severity::Error,
        code: "M001",
        span: Some(span),
        message: format!("absolute address {addr} is outside data memory of {mem_size} words"),
        help: None,
    }
}

// Static analysis diagnostics

pub fn cfg_unreachable(span: Span, pc: u16) -> Diagnostic {
    Diagnostic {
        severity: Severity::Advice,
        code: "cfg::unreachable",
        span: Some(span),
        message: format!("instruction at PC {pc} can never execute"),
        help: None,
    }
}

pub fn cfg_infinite_loop(span: Span, pc: u16) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        code: "cfg::infinite_loop",
        span: Some(span),
        message: format!(
            "the loop through PC {pc} has no exit, no HLT and no I/O; it will never terminate"
        ),
        help: None,
    }
}

pub fn flow_uninit_read(span: Span, reg: u8, definite: bool) -> Diagnostic {
    let message = if definite {
        format!("register ${reg} is read before it is ever written")
    } else {
        format!("register ${reg} may be read before it is written on some paths")
    };
    Diagnostic {
        severity: Severity::Warning,
        code: "flow::uninit_read",
        span: Some(span),
        message,
        help: Some("registers start at 0 but relying on that is usually a bug"),
    }
}

pub fn flow_invalid_return(span: Span, reg: u8) -> Diagnostic {
    Diagnostic {
        severity: Severity::Warning,
        code: "flow::invalid_return",
        span: Some(span),
        message: format!(
            "return through ${reg}, but ${reg} does not hold a BAL link address here"
        ),
        help: Some("returns should jump through the register a BAL call linked"),
    }
}

// Runtime failures propagate as reports instead of being collected.

pub fn sim_step_limit(cap: u64) -> Report {
    miette!(
        severity = Severity::Error,
        code = "runtime::step_limit",
        help = "the program is likely stuck in a loop without HLT",
        "execution exceeded the safety cap of {cap} steps"
    )
}

pub fn sim_reserved_opcode(bits: u8) -> Report {
    miette!(
        severity = Severity::Error,
        code = "runtime::reserved_opcode",
        "encountered reserved opcode {bits:#x}"
    )
}
