// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} on line {line}")]
pub struct LexError {
    pub message: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StringPart {
    Literal(String),
    /// `$name`, `$name[key]` or `{$name['a']['b']}` inside a double-quoted string.
    Variable { name: String, keys: Vec<KeyPart> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Int(i64),
    Str(String),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    OpenTag,
    CloseTag,
    Whitespace,
    Comment,
    Variable(String),
    Identifier(String),
    Integer(i64),
    Float(f64),
    String(String),
    Template(Vec<StringPart>),
    Backtick(String),
    Punct(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}

impl Token {
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(&self.kind, TokenKind::Punct(q) if *q == p)
    }
    /// Case-insensitive keyword/identifier comparison.
    pub fn is_word(&self, word: &str) -> bool {
        matches!(&self.kind, TokenKind::Identifier(w) if w.eq_ignore_ascii_case(word))
    }
    pub fn identifier(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Identifier(w) => Some(w),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::OpenTag => write!(f, "'<?php'"),
            TokenKind::CloseTag => write!(f, "'?>'"),
            TokenKind::Whitespace => write!(f, "whitespace"),
            TokenKind::Comment => write!(f, "comment"),
            TokenKind::Variable(name) => write!(f, "variable '${name}'"),
            TokenKind::Identifier(word) => write!(f, "'{word}'"),
            TokenKind::Integer(i) => write!(f, "integer {i}"),
            TokenKind::Float(x) => write!(f, "number {x}"),
            TokenKind::String(_) | TokenKind::Template(_) => write!(f, "string literal"),
            TokenKind::Backtick(_) => write!(f, "backtick literal"),
            TokenKind::Punct(p) => write!(f, "'{p}'"),
        }
    }
}

const PUNCTUATION: &[&str] = &[
    "===", "!==", "**=", "...", "<<=", ">>=", "??=", "<=>", "==", "!=", "<>", "<=", ">=", "&&",
    "||", "??", "++", "--", "+=", "-=", "*=", "/=", ".=", "%=", "|=", "&=", "^=", "=>", "->",
    "::", "**", "<<", ">>", "+", "-", "*", "/", "%", "=", "<", ">", "!", ".", "(", ")", "{", "}",
    "[", "]", ";", ",", "?", ":", "&", "|", "^", "~", "@", "$", "\\",
];

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic() || c as u32 >= 0x7f
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric() || c as u32 >= 0x7f
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).run()
}

/// Tokens with whitespace and comments removed.
pub fn significant_tokens(source: &str) -> Result<Vec<Token>, LexError> {
    Ok(tokenize(source)?
        .into_iter()
        .filter(|t| !t.is_trivia())
        .collect())
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek(i) == Some(c))
    }

    fn starts_with_ignore_case(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek(i).is_some_and(|p| p.eq_ignore_ascii_case(&c)))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek(0)?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>, line: u32) -> LexError {
        LexError {
            message: message.into(),
            line,
        }
    }

    fn push(&mut self, kind: TokenKind, line: u32) {
        self.tokens.push(Token { kind, line });
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        while let Some(c) = self.peek(0) {
            let line = self.line;
            if c.is_whitespace() {
                while self.peek(0).is_some_and(char::is_whitespace) {
                    self.bump();
                }
                self.push(TokenKind::Whitespace, line);
            } else if self.starts_with_ignore_case("<?php")
                && !self.peek(5).is_some_and(is_ident_continue)
            {
                self.pos += 5;
                self.push(TokenKind::OpenTag, line);
            } else if self.starts_with("?>") {
                self.pos += 2;
                self.push(TokenKind::CloseTag, line);
            } else if self.starts_with("//") || (c == '#' && self.peek(1) != Some('[')) {
                self.line_comment();
                self.push(TokenKind::Comment, line);
            } else if self.starts_with("/*") {
                self.block_comment()?;
                self.push(TokenKind::Comment, line);
            } else if self.starts_with("<<<") {
                return Err(self.error("Heredoc and nowdoc strings are not supported", line));
            } else if c == '$' && self.peek(1).is_some_and(is_ident_start) {
                self.bump();
                let name = self.identifier();
                self.push(TokenKind::Variable(name), line);
            } else if is_ident_start(c) {
                let word = self.identifier();
                self.push(TokenKind::Identifier(word), line);
            } else if c.is_ascii_digit() || (c == '.' && self.peek(1).is_some_and(|d| d.is_ascii_digit())) {
                let kind = self.number()?;
                self.push(kind, line);
            } else if c == '\'' {
                let s = self.single_quoted()?;
                self.push(TokenKind::String(s), line);
            } else if c == '"' {
                let kind = self.double_quoted()?;
                self.push(kind, line);
            } else if c == '`' {
                let s = self.backtick()?;
                self.push(TokenKind::Backtick(s), line);
            } else if let Some(&p) = PUNCTUATION.iter().find(|p| self.starts_with(p)) {
                self.pos += p.chars().count();
                self.push(TokenKind::Punct(p), line);
            } else {
                return Err(self.error(format!("Unexpected character '{c}'"), line));
            }
        }
        Ok(self.tokens)
    }

    fn identifier(&mut self) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek(0).filter(|c| is_ident_continue(*c)) {
            out.push(c);
            self.pos += 1;
        }
        out
    }

    fn line_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' || self.starts_with("?>") {
                break;
            }
            self.bump();
        }
    }

    fn block_comment(&mut self) -> Result<(), LexError> {
        let line = self.line;
        self.pos += 2;
        loop {
            if self.starts_with("*/") {
                self.pos += 2;
                return Ok(());
            }
            if self.bump().is_none() {
                return Err(self.error("Unterminated comment", line));
            }
        }
    }

    fn number(&mut self) -> Result<TokenKind, LexError> {
        let line = self.line;
        if self.peek(0) == Some('0') && matches!(self.peek(1), Some('x' | 'X' | 'b' | 'B')) {
            let radix = if matches!(self.peek(1), Some('x' | 'X')) { 16 } else { 2 };
            self.pos += 2;
            let mut digits = String::new();
            while let Some(c) = self.peek(0).filter(|c| c.is_ascii_hexdigit() || *c == '_') {
                if c != '_' {
                    digits.push(c);
                }
                self.pos += 1;
            }
            return match i64::from_str_radix(&digits, radix) {
                Ok(i) => Ok(TokenKind::Integer(i)),
                Err(_) => u64::from_str_radix(&digits, radix)
                    .map(|u| TokenKind::Float(u as f64))
                    .map_err(|_| self.error("Invalid numeric literal", line)),
            };
        }
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '_' && self.peek(1).is_some_and(|d| d.is_ascii_digit()) {
                // digit separator
            } else if c == '.' && !is_float && self.peek(1).is_some_and(|d| d.is_ascii_digit()) {
                is_float = true;
                text.push(c);
            } else if matches!(c, 'e' | 'E')
                && (self.peek(1).is_some_and(|d| d.is_ascii_digit())
                    || (matches!(self.peek(1), Some('+' | '-'))
                        && self.peek(2).is_some_and(|d| d.is_ascii_digit())))
            {
                is_float = true;
                text.push(c);
                self.pos += 1;
                if let Some(sign) = self.peek(0).filter(|s| *s == '+' || *s == '-') {
                    text.push(sign);
                    self.pos += 1;
                }
                continue;
            } else {
                break;
            }
            self.pos += 1;
        }
        if !is_float {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(TokenKind::Integer(i));
            }
        }
        text.parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| self.error(format!("Invalid numeric literal '{text}'"), line))
    }

    fn single_quoted(&mut self) -> Result<String, LexError> {
        let line = self.line;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("Unterminated string literal", line)),
                Some('\'') => return Ok(out),
                Some('\\') if matches!(self.peek(0), Some('\'' | '\\')) => {
                    if let Some(c) = self.bump() {
                        out.push(c);
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    fn backtick(&mut self) -> Result<String, LexError> {
        let line = self.line;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("Unterminated backtick literal", line)),
                Some('`') => return Ok(out),
                Some(c) => out.push(c),
            }
        }
    }

    fn double_quoted(&mut self) -> Result<TokenKind, LexError> {
        let line = self.line;
        self.bump();
        let mut parts = Vec::new();
        let mut buf = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error("Unterminated string literal", line));
            };
            match c {
                '"' => break,
                '\\' => self.escape(&mut buf),
                '$' if self.peek(0).is_some_and(is_ident_start) => {
                    if !buf.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut buf)));
                    }
                    let name = self.identifier();
                    let mut keys = Vec::new();
                    if self.peek(0) == Some('[') {
                        self.bump();
                        keys.push(self.simple_key(line)?);
                    }
                    parts.push(StringPart::Variable { name, keys });
                }
                '{' if self.peek(0) == Some('$') && self.peek(1).is_some_and(is_ident_start) => {
                    if !buf.is_empty() {
                        parts.push(StringPart::Literal(std::mem::take(&mut buf)));
                    }
                    self.bump();
                    let name = self.identifier();
                    let mut keys = Vec::new();
                    while self.peek(0) == Some('[') {
                        self.bump();
                        keys.push(self.complex_key(line)?);
                    }
                    if self.bump() != Some('}') {
                        return Err(self.error("Unsupported expression in string interpolation", line));
                    }
                    parts.push(StringPart::Variable { name, keys });
                }
                other => buf.push(other),
            }
        }
        if parts.is_empty() {
            return Ok(TokenKind::String(buf));
        }
        if !buf.is_empty() {
            parts.push(StringPart::Literal(buf));
        }
        Ok(TokenKind::Template(parts))
    }

    fn escape(&mut self, buf: &mut String) {
        match self.peek(0) {
            Some('n') => buf.push('\n'),
            Some('t') => buf.push('\t'),
            Some('r') => buf.push('\r'),
            Some('v') => buf.push('\u{0b}'),
            Some('e') => buf.push('\u{1b}'),
            Some('f') => buf.push('\u{0c}'),
            Some('\\') => buf.push('\\'),
            Some('$') => buf.push('$'),
            Some('"') => buf.push('"'),
            Some('x') if self.peek(1).is_some_and(|d| d.is_ascii_hexdigit()) => {
                self.bump();
                let mut hex = String::new();
                while hex.len() < 2 {
                    match self.peek(0).filter(char::is_ascii_hexdigit) {
                        Some(d) => {
                            hex.push(d);
                            self.bump();
                        }
                        None => break,
                    }
                }
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    buf.push(ch);
                }
                return;
            }
            Some('u') if self.peek(1) == Some('{') => {
                self.bump();
                self.bump();
                let mut hex = String::new();
                while let Some(d) = self.peek(0).filter(char::is_ascii_hexdigit) {
                    hex.push(d);
                    self.bump();
                }
                if self.peek(0) == Some('}') {
                    self.bump();
                }
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    buf.push(ch);
                }
                return;
            }
            Some(d @ '0'..='7') => {
                let mut oct = String::from(d);
                self.bump();
                while oct.len() < 3 {
                    match self.peek(0).filter(|c| ('0'..='7').contains(c)) {
                        Some(o) => {
                            oct.push(o);
                            self.bump();
                        }
                        None => break,
                    }
                }
                if let Some(ch) = u32::from_str_radix(&oct, 8).ok().and_then(char::from_u32) {
                    buf.push(ch);
                }
                return;
            }
            _ => {
                buf.push('\\');
                return;
            }
        }
        self.bump();
    }

    /// Key of `"$name[key]"`: bare word, integer or variable, terminated by `]`.
    fn simple_key(&mut self, line: u32) -> Result<KeyPart, LexError> {
        let key = if self.peek(0) == Some('$') {
            self.bump();
            KeyPart::Variable(self.identifier())
        } else {
            let mut raw = String::new();
            while let Some(c) = self.peek(0).filter(|c| *c != ']' && *c != '"') {
                raw.push(c);
                self.bump();
            }
            match raw.parse::<i64>() {
                Ok(i) => KeyPart::Int(i),
                Err(_) => KeyPart::Str(raw),
            }
        };
        if self.bump() != Some(']') {
            return Err(self.error("Unterminated array index in string", line));
        }
        Ok(key)
    }

    /// Key of `"{$name['key']}"`: quoted string, integer or variable.
    fn complex_key(&mut self, line: u32) -> Result<KeyPart, LexError> {
        let key = match self.peek(0) {
            Some('\'') => KeyPart::Str(self.single_quoted()?),
            Some('"') => {
                self.bump();
                let mut raw = String::new();
                while let Some(c) = self.bump() {
                    if c == '"' {
                        break;
                    }
                    raw.push(c);
                }
                KeyPart::Str(raw)
            }
            Some('$') => {
                self.bump();
                KeyPart::Variable(self.identifier())
            }
            _ => {
                let mut raw = String::new();
                while let Some(c) = self.peek(0).filter(|c| c.is_ascii_digit() || *c == '-') {
                    raw.push(c);
                    self.bump();
                }
                KeyPart::Int(
                    raw.parse()
                        .map_err(|_| self.error("Unsupported array index in string", line))?,
                )
            }
        };
        if self.bump() != Some(']') {
            return Err(self.error("Unterminated array index in string", line));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        significant_tokens(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_function_header() {
        let k = kinds("function to_upper($record) { return 1; }");
        assert_eq!(k[0], TokenKind::Identifier("function".into()));
        assert_eq!(k[1], TokenKind::Identifier("to_upper".into()));
        assert_eq!(k[2], TokenKind::Punct("("));
        assert_eq!(k[3], TokenKind::Variable("record".into()));
        assert_eq!(k[8], TokenKind::Integer(1));
    }

    #[test]
    fn test_comments_are_trivia() {
        let tokens = tokenize("exec /* hidden */ (\n// line\n)").unwrap();
        let sig: Vec<_> = tokens.iter().filter(|t| !t.is_trivia()).collect();
        assert_eq!(sig.len(), 3);
        assert!(sig[1].is_punct("("));
        assert_eq!(sig[2].line, 3);
    }

    #[test]
    fn test_string_escapes_and_interpolation() {
        let k = kinds(r#"'it\'s' "a\tb" "Hi $name[first]!" "{$r['x']}""#);
        assert_eq!(k[0], TokenKind::String("it's".into()));
        assert_eq!(k[1], TokenKind::String("a\tb".into()));
        assert_eq!(
            k[2],
            TokenKind::Template(vec![
                StringPart::Literal("Hi ".into()),
                StringPart::Variable {
                    name: "name".into(),
                    keys: vec![KeyPart::Str("first".into())]
                },
                StringPart::Literal("!".into()),
            ])
        );
        assert_eq!(
            k[3],
            TokenKind::Template(vec![StringPart::Variable {
                name: "r".into(),
                keys: vec![KeyPart::Str("x".into())]
            }])
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.5 .5 1e3 0x1F 1_000"),
            vec![
                TokenKind::Integer(42),
                TokenKind::Float(3.5),
                TokenKind::Float(0.5),
                TokenKind::Float(1000.0),
                TokenKind::Integer(31),
                TokenKind::Integer(1000),
            ]
        );
    }

    #[test]
    fn test_variable_variable_and_tags() {
        let k = kinds("<?php $$x; ?>");
        assert_eq!(k[0], TokenKind::OpenTag);
        assert_eq!(k[1], TokenKind::Punct("$"));
        assert_eq!(k[2], TokenKind::Variable("x".into()));
        assert_eq!(k[4], TokenKind::CloseTag);
    }

    #[test]
    fn test_unterminated_string_fails() {
        let err = tokenize("return 'abc;").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("Unterminated"));
    }

    #[test]
    fn test_backtick_literal() {
        assert_eq!(kinds("`ls -la`"), vec![TokenKind::Backtick("ls -la".into())]);
    }
}
