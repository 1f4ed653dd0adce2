use crate::ast::{Instr, LabelDef, Line, Operand, OperandKind, Program};
use crate::diag::{self, Diagnostic};
use crate::lexer::{tokenize, Token, TokenKind};
use crate::span::Span;

/// Transforms the token stream into a [`Program`].
///
/// Parsing is line-oriented: a failure inside one line skips to the
/// next `Eol` and keeps going, so every line gets a chance to report
/// its own problem.
pub struct AsmParser<'a> {
    /// Reference to the source file
    src: &'a str,
    diags: Vec<Diagnostic>,
}

impl<'a> AsmParser<'a> {
    pub fn new(src: &'a str) -> Self {
        AsmParser {
            src,
            diags: Vec::new(),
        }
    }

    fn get_span(&self, span: Span) -> &'a str {
        &self.src[span.as_range()]
    }

    /// Create the AST out of the token stream.
    pub fn parse(mut self) -> (Program, Vec<Diagnostic>) {
        let mut program = Program::new();
        for toks in split_lines(tokenize(self.src), self.src.len()) {
            let line = self.parse_line(&toks);
            program.lines.push(line);
        }
        (program, self.diags)
    }

    /// Parse one line worth of tokens. The final token is always the
    /// line's `Eol` (or a zero-width `Eof` marker).
    fn parse_line(&mut self, toks: &[Token]) -> Line {
        let end = toks.last().expect("line always carries a terminator");
        let body = &toks[..toks.len() - 1];
        let span = match body.first() {
            Some(first) => first.span.join(body.last().unwrap().span),
            None => Span::new(crate::span::SrcOffset(end.span.offs()), 0),
        };

        let mut line = Line {
            label: None,
            instr: None,
            span,
        };

        let mut pos = 0;
        // Prefix label: IDENT followed by `:`
        if body.len() >= 2
            && body[0].kind == TokenKind::Ident
            && body[1].kind == TokenKind::Colon
        {
            line.label = Some(LabelDef {
                name: self.get_span(body[0].span).to_uppercase(),
                span: body[0].span,
            });
            pos = 2;
        }

        if pos == body.len() {
            return line;
        }

        // Anything left must be an instruction
        line.instr = self.parse_instr(&body[pos..]);
        line
    }

    /// Parse `mnemonic operand, operand, ...`. Returns `None` after
    /// emitting a diagnostic; the caller abandons the rest of the line.
    fn parse_instr(&mut self, body: &[Token]) -> Option<Instr> {
        let head = body[0];
        if head.kind != TokenKind::Ident {
            self.unexpected(head, "a mnemonic or label");
            return None;
        }

        let mut operands = Vec::new();
        let mut pos = 1;
        while pos < body.len() {
            // Operands may be separated by a comma or plain whitespace
            if body[pos].kind == TokenKind::Comma {
                pos += 1;
                if pos == body.len() {
                    self.unexpected(body[pos - 1], "an operand after `,`");
                    return None;
                }
            }
            operands.push(self.parse_operand(body, &mut pos)?);
        }

        let span = match operands.last() {
            Some(last) => head.span.join(last.span),
            None => head.span,
        };
        Some(Instr {
            mnemonic: self.get_span(head.span).to_uppercase(),
            mnemonic_span: head.span,
            operands,
            span,
        })
    }

    fn parse_operand(&mut self, body: &[Token], pos: &mut usize) -> Option<Operand> {
        let tok = body[*pos];
        match tok.kind {
            TokenKind::Reg => {
                *pos += 1;
                let index = self.parse_reg(tok)?;
                Some(Operand {
                    kind: OperandKind::Reg(index),
                    span: tok.span,
                })
            }
            TokenKind::Number => {
                *pos += 1;
                let imm = self.parse_number(tok)?;
                // `imm(base)` or a bare `imm`, which addresses off $0
                if *pos < body.len() && body[*pos].kind == TokenKind::LParen {
                    *pos += 1;
                    let base_tok = self.expect(body, pos, TokenKind::Reg)?;
                    let base = self.parse_reg(base_tok)?;
                    let close = self.expect(body, pos, TokenKind::RParen)?;
                    Some(Operand {
                        kind: OperandKind::Address { imm, base },
                        span: tok.span.join(close.span),
                    })
                } else {
                    Some(Operand {
                        kind: OperandKind::Address { imm, base: 0 },
                        span: tok.span,
                    })
                }
            }
            TokenKind::Ident => {
                *pos += 1;
                Some(Operand {
                    kind: OperandKind::LabelRef(self.get_span(tok.span).to_uppercase()),
                    span: tok.span,
                })
            }
            TokenKind::Unknown => {
                self.diags
                    .push(diag::lex_unknown(tok.span, self.get_span(tok.span)));
                None
            }
            _ => {
                self.unexpected(tok, "a register, address, or label");
                None
            }
        }
    }

    fn expect(&mut self, body: &[Token], pos: &mut usize, kind: TokenKind) -> Option<Token> {
        match body.get(*pos) {
            Some(tok) if tok.kind == kind => {
                *pos += 1;
                Some(*tok)
            }
            Some(tok) => {
                self.unexpected(*tok, &format!("{kind}"));
                None
            }
            None => {
                let end = body.last().map(|tok| tok.span).unwrap_or(Span::dummy());
                self.diags
                    .push(diag::parse_unexpected(end, &format!("{kind}"), "end of line"));
                None
            }
        }
    }

    fn parse_reg(&mut self, tok: Token) -> Option<u8> {
        let lexeme = self.get_span(tok.span);
        match lexeme[1..].parse::<u8>() {
            Ok(index) => Some(index),
            Err(_) => {
                self.diags.push(diag::parse_register_index(tok.span, lexeme));
                None
            }
        }
    }

    fn parse_number(&mut self, tok: Token) -> Option<i64> {
        let lexeme = self.get_span(tok.span);
        match lexeme.parse::<i64>() {
            Ok(value) => Some(value),
            Err(_) => {
                self.diags.push(diag::parse_bad_literal(tok.span, lexeme));
                None
            }
        }
    }

    fn unexpected(&mut self, tok: Token, expected: &str) {
        if tok.kind == TokenKind::Unknown {
            self.diags
                .push(diag::lex_unknown(tok.span, self.get_span(tok.span)));
        } else {
            self.diags
                .push(diag::parse_unexpected(tok.span, expected, tok.kind));
        }
    }
}

/// Group the token stream into lines, each terminated by its `Eol`
/// token (the last line gets a synthetic zero-width terminator).
fn split_lines(toks: Vec<Token>, src_len: usize) -> Vec<Vec<Token>> {
    let mut lines = Vec::new();
    let mut current = Vec::new();
    for tok in toks {
        let is_eol = tok.kind == TokenKind::Eol;
        current.push(tok);
        if is_eol {
            lines.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        current.push(Token {
            kind: TokenKind::Eof,
            span: Span::new(crate::span::SrcOffset(src_len), 0),
        });
        lines.push(current);
    }
    lines
}
