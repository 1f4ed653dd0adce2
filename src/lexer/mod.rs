use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

use crate::lexer::cursor::Cursor;
use crate::span::{Span, SrcOffset};

pub mod cursor;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TokenKind {
    /// Mnemonics and labels share this class; the parser disambiguates.
    Ident,
    /// Decimal literal with optional sign
    Number,
    /// `$` followed by decimal digits
    Reg,
    Comma,
    Colon,
    LParen,
    RParen,
    /// Emitted for every newline
    Eol,
    /// Spaces, tabs, carriage returns
    Whitespace,
    /// `;` to end of line
    Comment,
    Unknown,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Ident => "identifier",
            TokenKind::Number => "number",
            TokenKind::Reg => "register",
            TokenKind::Comma => "`,`",
            TokenKind::Colon => "`:`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::Eol => "end of line",
            TokenKind::Whitespace => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Unknown => "unknown token",
            TokenKind::Eof => "end of file",
        };
        f.write_str(name)
    }
}

lazy_static! {
    // Order is important since some patterns are subpatterns of others.
    // Do NOT rearrange without a good hard think.
    static ref PATTERNS: Vec<(TokenKind, Regex)> = vec![
        (TokenKind::Whitespace, Regex::new(r"^[ \t\r]+").unwrap()),
        (TokenKind::Comment, Regex::new(r"^;[^\n]*").unwrap()),
        (TokenKind::Eol, Regex::new(r"^\n").unwrap()),
        (TokenKind::Number, Regex::new(r"^[+-]?[0-9]+").unwrap()),
        (TokenKind::Reg, Regex::new(r"^\$[0-9]+").unwrap()),
        // Includes mnemonics and labels.
        (TokenKind::Ident, Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*").unwrap()),
        (TokenKind::Comma, Regex::new(r"^,").unwrap()),
        (TokenKind::Colon, Regex::new(r"^:").unwrap()),
        (TokenKind::LParen, Regex::new(r"^\(").unwrap()),
        (TokenKind::RParen, Regex::new(r"^\)").unwrap()),
    ];
}

impl Cursor<'_> {
    pub fn advance_token(&mut self) -> Token {
        if self.is_eof() {
            return Token {
                kind: TokenKind::Eof,
                span: Span::new(SrcOffset(self.abs_pos()), 0),
            };
        }

        for (kind, re) in PATTERNS.iter() {
            if let Some(tok) = re.find(self.rest()) {
                let token = Token {
                    kind: *kind,
                    span: Span::new(SrcOffset(self.abs_pos()), tok.len()),
                };
                self.advance(tok.len());
                return token;
            }
        }

        let start = self.abs_pos();
        self.bump();
        Token {
            kind: TokenKind::Unknown,
            span: Span::new(SrcOffset(start), self.abs_pos() - start),
        }
    }
}

/// Tokenize the entire source, dropping whitespace and comments but
/// keeping line structure (every newline becomes an `Eol` token).
pub fn tokenize(src: &str) -> Vec<Token> {
    let mut cursor = Cursor::new(src);
    let mut toks = Vec::new();
    loop {
        let token = cursor.advance_token();
        match token.kind {
            TokenKind::Whitespace | TokenKind::Comment => continue,
            TokenKind::Eof => break,
            _ => toks.push(token),
        }
    }
    toks
}
