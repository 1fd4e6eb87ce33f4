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

use super::ast::{
    ArrayItem, BinaryOp, CastType, CatchClause, Expr, FunctionDecl, Item, Param, Program, Stmt,
    TemplatePart, UnaryOp,
};
use super::lexer::{significant_tokens, LexError, StringPart, Token, TokenKind};
use thiserror::Error;

const MAX_NESTING: usize = 200;

const ASSIGN_BP: u8 = 5;
const TERNARY_BP: u8 = 6;
const INSTANCEOF_BP: u8 = 20;
const NOT_BP: u8 = 20;
const UNARY_BP: u8 = 21;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} on line {line}")]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            line: err.line,
        }
    }
}

pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = significant_tokens(source)?;
    Parser {
        tokens,
        pos: 0,
        depth: 0,
    }
    .program()
}

fn infix_op(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let op = match &token.kind {
        TokenKind::Identifier(word) => match word.to_ascii_lowercase().as_str() {
            "or" => (BinaryOp::Or, 1, 2),
            "xor" => (BinaryOp::Xor, 2, 3),
            "and" => (BinaryOp::And, 3, 4),
            _ => return None,
        },
        TokenKind::Punct(p) => match *p {
            "??" => (BinaryOp::Coalesce, 7, 7),
            "||" => (BinaryOp::Or, 8, 9),
            "&&" => (BinaryOp::And, 9, 10),
            "|" => (BinaryOp::BitOr, 10, 11),
            "^" => (BinaryOp::BitXor, 11, 12),
            "&" => (BinaryOp::BitAnd, 12, 13),
            "==" => (BinaryOp::Eq, 13, 14),
            "!=" | "<>" => (BinaryOp::NotEq, 13, 14),
            "===" => (BinaryOp::Identical, 13, 14),
            "!==" => (BinaryOp::NotIdentical, 13, 14),
            "<=>" => (BinaryOp::Spaceship, 13, 14),
            "<" => (BinaryOp::Lt, 14, 15),
            ">" => (BinaryOp::Gt, 14, 15),
            "<=" => (BinaryOp::Le, 14, 15),
            ">=" => (BinaryOp::Ge, 14, 15),
            "." => (BinaryOp::Concat, 15, 16),
            "<<" => (BinaryOp::ShiftLeft, 16, 17),
            ">>" => (BinaryOp::ShiftRight, 16, 17),
            "+" => (BinaryOp::Add, 17, 18),
            "-" => (BinaryOp::Sub, 17, 18),
            "*" => (BinaryOp::Mul, 18, 19),
            "/" => (BinaryOp::Div, 18, 19),
            "%" => (BinaryOp::Mod, 18, 19),
            "**" => (BinaryOp::Pow, 22, 22),
            _ => return None,
        },
        _ => return None,
    };
    Some(op)
}

fn assign_op(token: &Token) -> Option<Option<BinaryOp>> {
    let TokenKind::Punct(p) = &token.kind else {
        return None;
    };
    let op = match *p {
        "=" => None,
        "+=" => Some(BinaryOp::Add),
        "-=" => Some(BinaryOp::Sub),
        "*=" => Some(BinaryOp::Mul),
        "/=" => Some(BinaryOp::Div),
        "%=" => Some(BinaryOp::Mod),
        "**=" => Some(BinaryOp::Pow),
        ".=" => Some(BinaryOp::Concat),
        "??=" => Some(BinaryOp::Coalesce),
        "|=" => Some(BinaryOp::BitOr),
        "&=" => Some(BinaryOp::BitAnd),
        "^=" => Some(BinaryOp::BitXor),
        "<<=" => Some(BinaryOp::ShiftLeft),
        ">>=" => Some(BinaryOp::ShiftRight),
        _ => return None,
    };
    Some(op)
}

fn cast_type(word: &str) -> Option<CastType> {
    match word.to_ascii_lowercase().as_str() {
        "int" | "integer" => Some(CastType::Int),
        "float" | "double" => Some(CastType::Float),
        "string" => Some(CastType::String),
        "bool" | "boolean" => Some(CastType::Bool),
        "array" => Some(CastType::Array),
        _ => None,
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn line(&self) -> u32 {
        self.peek()
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn at_punct(&self, p: &str) -> bool {
        self.peek().is_some_and(|t| t.is_punct(p))
    }

    fn at_word(&self, word: &str) -> bool {
        self.peek().is_some_and(|t| t.is_word(word))
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.at_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line(),
        }
    }

    fn unexpected(&self, expecting: Option<&str>) -> ParseError {
        let found = self
            .peek()
            .map_or_else(|| "end of file".to_string(), |t| t.kind.to_string());
        match expecting {
            Some(what) => self.error(format!("unexpected {found}, expecting {what}")),
            None => self.error(format!("unexpected {found}")),
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected(Some(&format!("'{p}'"))))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, ParseError> {
        match self.peek().and_then(Token::identifier) {
            Some(word) => {
                let word = word.to_string();
                self.pos += 1;
                Ok(word)
            }
            None => Err(self.unexpected(Some("identifier"))),
        }
    }

    fn expect_variable(&mut self) -> Result<String, ParseError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Variable(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected(Some("variable"))),
        }
    }

    /// Statement terminator; a closing tag doubles as one.
    fn end_statement(&mut self) -> Result<(), ParseError> {
        if self.eat_punct(";") || matches!(self.peek().map(|t| &t.kind), Some(TokenKind::CloseTag)) {
            Ok(())
        } else {
            Err(self.unexpected(Some("';'")))
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting level too deep"));
        }
        Ok(())
    }

    fn program(mut self) -> Result<Program, ParseError> {
        let mut items = Vec::new();
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::OpenTag)) {
            self.pos += 1;
        }
        while let Some(token) = self.peek() {
            match &token.kind {
                TokenKind::CloseTag => {
                    self.pos += 1;
                    match self.peek().map(|t| &t.kind) {
                        None => break,
                        Some(TokenKind::OpenTag) => self.pos += 1,
                        Some(_) => return Err(self.unexpected(None)),
                    }
                }
                TokenKind::OpenTag => return Err(self.unexpected(None)),
                _ if token.is_word("function")
                    && self
                        .peek_at(1)
                        .is_some_and(|t| t.identifier().is_some()) =>
                {
                    items.push(Item::Function(self.function_decl()?));
                }
                _ => items.push(Item::Statement(self.statement()?)),
            }
        }
        Ok(Program { items })
    }

    fn function_decl(&mut self) -> Result<FunctionDecl, ParseError> {
        let line = self.line();
        self.eat_word("function");
        if self.at_punct("&") {
            return Err(self.error("functions returning by reference are not supported"));
        }
        let name = self.expect_identifier()?;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.at_punct(")") {
            self.skip_type_hint();
            if self.at_punct("&") {
                return Err(self.error("by-reference parameters are not supported"));
            }
            if self.at_punct("...") {
                return Err(self.error("variadic parameters are not supported"));
            }
            let param = self.expect_variable()?;
            let default = if self.eat_punct("=") {
                Some(self.expression()?)
            } else {
                None
            };
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        if self.eat_punct(":") && !self.skip_type_hint() {
            return Err(self.unexpected(Some("return type")));
        }
        let body = self.block()?;
        Ok(FunctionDecl {
            name,
            params,
            body,
            line,
        })
    }

    /// Type declarations are accepted and ignored.
    fn skip_type_hint(&mut self) -> bool {
        let start = self.pos;
        self.eat_punct("?");
        loop {
            self.eat_punct("\\");
            if self.peek().and_then(Token::identifier).is_none() {
                break;
            }
            self.pos += 1;
            if self.at_punct("\\") {
                continue;
            }
            if !self.eat_punct("|") {
                break;
            }
        }
        self.pos > start
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.at_punct("}") {
            if self.peek().is_none() {
                return Err(self.unexpected(Some("'}'")));
            }
            body.push(self.statement()?);
        }
        self.pos += 1;
        Ok(body)
    }

    fn body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if self.at_punct(":") {
            return Err(self.error("alternative control structure syntax is not supported"));
        }
        match self.statement()? {
            Stmt::Block(body) => Ok(body),
            other => Ok(vec![other]),
        }
    }

    fn parenthesized(&mut self) -> Result<Expr, ParseError> {
        self.expect_punct("(")?;
        let expr = self.expression()?;
        self.expect_punct(")")?;
        Ok(expr)
    }

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        self.enter()?;
        let stmt = self.statement_inner();
        self.depth -= 1;
        stmt
    }

    fn statement_inner(&mut self) -> Result<Stmt, ParseError> {
        let Some(token) = self.peek() else {
            return Err(self.unexpected(None));
        };
        if token.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if token.is_punct(";") {
            self.pos += 1;
            return Ok(Stmt::Block(Vec::new()));
        }
        let keyword = token.identifier().map(str::to_ascii_lowercase);
        match keyword.as_deref() {
            Some("if") => self.if_statement(),
            Some("foreach") => self.foreach_statement(),
            Some("for") => self.for_statement(),
            Some("while") => {
                self.pos += 1;
                let condition = self.parenthesized()?;
                let body = self.body()?;
                Ok(Stmt::While { condition, body })
            }
            Some("do") => {
                self.pos += 1;
                let body = self.body()?;
                if !self.eat_word("while") {
                    return Err(self.unexpected(Some("'while'")));
                }
                let condition = self.parenthesized()?;
                self.end_statement()?;
                Ok(Stmt::DoWhile { body, condition })
            }
            Some("switch") => self.switch_statement(),
            Some("return") => {
                self.pos += 1;
                if self.eat_punct(";") {
                    return Ok(Stmt::Return(None));
                }
                let value = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Return(Some(value)))
            }
            Some(word @ ("break" | "continue")) => {
                let stmt = if word == "break" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                };
                self.pos += 1;
                match self.peek().map(|t| &t.kind) {
                    Some(TokenKind::Integer(1)) => self.pos += 1,
                    Some(TokenKind::Integer(_)) => {
                        return Err(self.error("multi-level break and continue are not supported"))
                    }
                    _ => {}
                }
                self.end_statement()?;
                Ok(stmt)
            }
            Some("throw") => {
                self.pos += 1;
                let value = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Throw(value))
            }
            Some("try") => self.try_statement(),
            Some("echo" | "print") => {
                self.pos += 1;
                let mut values = vec![self.expression()?];
                while self.eat_punct(",") {
                    values.push(self.expression()?);
                }
                self.end_statement()?;
                Ok(Stmt::Echo(values))
            }
            Some("unset") => {
                self.pos += 1;
                self.expect_punct("(")?;
                let targets = self.arguments_until(")")?;
                if targets.iter().any(|t| !t.is_assignable()) {
                    return Err(self.error("unset() requires variables or array elements"));
                }
                self.end_statement()?;
                Ok(Stmt::Unset(targets))
            }
            Some("function") => Err(self.error("nested function declarations are not supported")),
            Some("global") => Err(self.error("global variables are not supported")),
            Some("static") if self.peek_at(1).is_some_and(|t| matches!(t.kind, TokenKind::Variable(_))) => {
                Err(self.error("static variables are not supported"))
            }
            Some("class" | "interface" | "trait" | "enum" | "namespace" | "use" | "goto" | "declare") => {
                Err(self.unexpected(None))
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ParseError> {
        self.pos += 1;
        let mut branches = Vec::new();
        let condition = self.parenthesized()?;
        branches.push((condition, self.body()?));
        let mut otherwise = None;
        loop {
            if self.eat_word("elseif") {
                let condition = self.parenthesized()?;
                branches.push((condition, self.body()?));
            } else if self.at_word("else") && self.peek_at(1).is_some_and(|t| t.is_word("if")) {
                self.pos += 2;
                let condition = self.parenthesized()?;
                branches.push((condition, self.body()?));
            } else if self.eat_word("else") {
                otherwise = Some(self.body()?);
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            otherwise,
        })
    }

    fn foreach_statement(&mut self) -> Result<Stmt, ParseError> {
        self.pos += 1;
        self.expect_punct("(")?;
        let subject = self.expression()?;
        if !self.eat_word("as") {
            return Err(self.unexpected(Some("'as'")));
        }
        if self.at_punct("&") {
            return Err(self.error("by-reference foreach is not supported"));
        }
        let first = self.expect_variable()?;
        let (key, value) = if self.eat_punct("=>") {
            if self.at_punct("&") {
                return Err(self.error("by-reference foreach is not supported"));
            }
            (Some(first), self.expect_variable()?)
        } else {
            (None, first)
        };
        self.expect_punct(")")?;
        let body = self.body()?;
        Ok(Stmt::Foreach {
            subject,
            key,
            value,
            body,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        self.pos += 1;
        self.expect_punct("(")?;
        let init = self.expression_list(";")?;
        self.expect_punct(";")?;
        let condition = self.expression_list(";")?;
        self.expect_punct(";")?;
        let step = self.expression_list(")")?;
        self.expect_punct(")")?;
        let body = self.body()?;
        Ok(Stmt::For {
            init,
            condition,
            step,
            body,
        })
    }

    fn expression_list(&mut self, end: &str) -> Result<Vec<Expr>, ParseError> {
        let mut list = Vec::new();
        if self.at_punct(end) {
            return Ok(list);
        }
        list.push(self.expression()?);
        while self.eat_punct(",") {
            list.push(self.expression()?);
        }
        Ok(list)
    }

    fn switch_statement(&mut self) -> Result<Stmt, ParseError> {
        self.pos += 1;
        let subject = self.parenthesized()?;
        self.expect_punct("{")?;
        let mut cases: Vec<(Option<Expr>, Vec<Stmt>)> = Vec::new();
        while !self.eat_punct("}") {
            let label = if self.eat_word("case") {
                Some(self.expression()?)
            } else if self.eat_word("default") {
                None
            } else {
                return Err(self.unexpected(Some("'case'")));
            };
            if !self.eat_punct(":") && !self.eat_punct(";") {
                return Err(self.unexpected(Some("':'")));
            }
            let mut body = Vec::new();
            while !self.at_word("case") && !self.at_word("default") && !self.at_punct("}") {
                if self.peek().is_none() {
                    return Err(self.unexpected(Some("'}'")));
                }
                body.push(self.statement()?);
            }
            cases.push((label, body));
        }
        Ok(Stmt::Switch { subject, cases })
    }

    fn try_statement(&mut self) -> Result<Stmt, ParseError> {
        self.pos += 1;
        let body = self.block()?;
        let mut catches = Vec::new();
        while self.eat_word("catch") {
            self.expect_punct("(")?;
            let mut classes = vec![self.qualified_name()?];
            while self.eat_punct("|") {
                classes.push(self.qualified_name()?);
            }
            let variable = match self.peek().map(|t| &t.kind) {
                Some(TokenKind::Variable(_)) => Some(self.expect_variable()?),
                _ => None,
            };
            self.expect_punct(")")?;
            let body = self.block()?;
            catches.push(CatchClause {
                classes,
                variable,
                body,
            });
        }
        let finally = if self.eat_word("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if catches.is_empty() && finally.is_none() {
            return Err(self.error("cannot use try without catch or finally"));
        }
        Ok(Stmt::Try {
            body,
            catches,
            finally,
        })
    }

    fn qualified_name(&mut self) -> Result<String, ParseError> {
        self.eat_punct("\\");
        let mut name = self.expect_identifier()?;
        while self.at_punct("\\") {
            self.pos += 1;
            name.push('\\');
            name.push_str(&self.expect_identifier()?);
        }
        Ok(name)
    }

    pub fn expression(&mut self) -> Result<Expr, ParseError> {
        self.expr_bp(0)
    }

    fn expr_bp(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        self.enter()?;
        let expr = self.expr_bp_inner(min_bp);
        self.depth -= 1;
        expr
    }

    fn expr_bp_inner(&mut self, min_bp: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        while let Some(token) = self.peek() {
            if token.is_punct("?") {
                if TERNARY_BP < min_bp {
                    break;
                }
                self.pos += 1;
                let then = if self.eat_punct(":") {
                    None
                } else {
                    let then = self.expr_bp(0)?;
                    self.expect_punct(":")?;
                    Some(Box::new(then))
                };
                let otherwise = self.expr_bp(TERNARY_BP + 1)?;
                lhs = Expr::Ternary {
                    condition: Box::new(lhs),
                    then,
                    otherwise: Box::new(otherwise),
                };
                continue;
            }
            if token.is_word("instanceof") {
                if INSTANCEOF_BP < min_bp {
                    break;
                }
                self.pos += 1;
                let class = self.qualified_name()?;
                lhs = Expr::InstanceOf {
                    expr: Box::new(lhs),
                    class,
                };
                continue;
            }
            let Some((op, lbp, rbp)) = infix_op(token) else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr_bp(rbp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.peek() else {
            return Err(self.unexpected(None));
        };
        let op = match &token.kind {
            TokenKind::Punct("!") => Some((UnaryOp::Not, NOT_BP)),
            TokenKind::Punct("-") => Some((UnaryOp::Neg, UNARY_BP)),
            TokenKind::Punct("+") => Some((UnaryOp::Plus, UNARY_BP)),
            TokenKind::Punct("~") => Some((UnaryOp::BitNot, UNARY_BP)),
            TokenKind::Punct("@") => Some((UnaryOp::Silence, UNARY_BP)),
            _ => None,
        };
        if let Some((op, bp)) = op {
            self.pos += 1;
            let expr = self.expr_bp(bp)?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        if token.is_punct("++") || token.is_punct("--") {
            let increment = token.is_punct("++");
            self.pos += 1;
            let target = self.postfix()?;
            if !target.is_assignable() {
                return Err(self.error("increment and decrement require a variable"));
            }
            return Ok(Expr::IncDec {
                target: Box::new(target),
                increment,
                prefix: true,
            });
        }
        if token.is_punct("(") {
            let cast = self
                .peek_at(1)
                .and_then(Token::identifier)
                .and_then(cast_type)
                .filter(|_| self.peek_at(2).is_some_and(|t| t.is_punct(")")));
            if let Some(to) = cast {
                self.pos += 3;
                let expr = self.expr_bp(UNARY_BP)?;
                return Ok(Expr::Cast {
                    to,
                    expr: Box::new(expr),
                });
            }
        }
        if token.is_punct("&") {
            return Err(self.error("references are not supported"));
        }
        if token.is_word("new") {
            return self.new_expression();
        }

        let expr = self.postfix()?;
        if !expr.is_assignable() {
            return Ok(expr);
        }
        if let Some(op) = self.peek().and_then(assign_op) {
            self.pos += 1;
            if op.is_none() && self.at_punct("&") {
                return Err(self.error("assignment by reference is not supported"));
            }
            let value = self.expr_bp(ASSIGN_BP)?;
            return Ok(Expr::Assign {
                target: Box::new(expr),
                op,
                value: Box::new(value),
            });
        }
        if self.at_punct("++") || self.at_punct("--") {
            let increment = self.at_punct("++");
            self.pos += 1;
            return Ok(Expr::IncDec {
                target: Box::new(expr),
                increment,
                prefix: false,
            });
        }
        Ok(expr)
    }

    fn new_expression(&mut self) -> Result<Expr, ParseError> {
        self.pos += 1;
        if self.at_word("class") {
            return Err(self.error("anonymous classes are not supported"));
        }
        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Variable(_))) {
            return Err(self.error("dynamic class names are not supported"));
        }
        let class = self.qualified_name()?;
        let args = if self.eat_punct("(") {
            self.arguments_until(")")?
        } else {
            Vec::new()
        };
        Ok(Expr::New { class, args })
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct("[") {
                if self.eat_punct("]") {
                    expr = Expr::Index {
                        base: Box::new(expr),
                        index: None,
                    };
                    continue;
                }
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Some(Box::new(index)),
                };
            } else if self.at_punct("->") || self.at_punct("?->") {
                self.pos += 1;
                let method = self.expect_identifier()?;
                if !self.eat_punct("(") {
                    return Err(self.error("property access is not supported"));
                }
                let args = self.arguments_until(")")?;
                expr = Expr::MethodCall {
                    object: Box::new(expr),
                    method,
                    args,
                };
            } else if self.at_punct("::") {
                return Err(self.error("static member access is not supported"));
            } else if self.at_punct("(") && matches!(expr, Expr::Variable(_) | Expr::Index { .. }) {
                return Err(self.error("dynamic function calls are not supported"));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Comma separated expressions up to `end`, which is consumed. A trailing
    /// comma is allowed.
    fn arguments_until(&mut self, end: &str) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        while !self.at_punct(end) {
            if self.at_punct("...") {
                return Err(self.error("argument unpacking is not supported"));
            }
            if self.peek().and_then(Token::identifier).is_some()
                && self.peek_at(1).is_some_and(|t| t.is_punct(":"))
            {
                return Err(self.error("named arguments are not supported"));
            }
            args.push(self.expression()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(end)?;
        Ok(args)
    }

    fn array_items(&mut self, end: &str) -> Result<Vec<ArrayItem>, ParseError> {
        let mut items = Vec::new();
        while !self.at_punct(end) {
            if self.at_punct("...") {
                return Err(self.error("array unpacking is not supported"));
            }
            if self.at_punct("&") {
                return Err(self.error("references are not supported"));
            }
            if self.at_punct(",") {
                return Err(self.unexpected(None));
            }
            let first = self.expression()?;
            let item = if self.eat_punct("=>") {
                ArrayItem {
                    key: Some(first),
                    value: self.expression()?,
                }
            } else {
                ArrayItem {
                    key: None,
                    value: first,
                }
            };
            items.push(item);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(end)?;
        Ok(items)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.unexpected(None));
        };
        let expr = match token.kind {
            TokenKind::Variable(name) => {
                self.pos += 1;
                Expr::Variable(name)
            }
            TokenKind::Integer(i) => {
                self.pos += 1;
                Expr::Int(i)
            }
            TokenKind::Float(x) => {
                self.pos += 1;
                Expr::Float(x)
            }
            TokenKind::String(s) => {
                self.pos += 1;
                Expr::Str(s)
            }
            TokenKind::Template(parts) => {
                self.pos += 1;
                Expr::Template(
                    parts
                        .into_iter()
                        .map(|part| match part {
                            StringPart::Literal(s) => TemplatePart::Literal(s),
                            StringPart::Variable { name, keys } => {
                                TemplatePart::Variable { name, keys }
                            }
                        })
                        .collect(),
                )
            }
            TokenKind::Backtick(_) => {
                return Err(self.error("backtick shell execution is not supported"))
            }
            TokenKind::Punct("$") => return Err(self.error("variable variables are not supported")),
            TokenKind::Punct("(") => {
                self.pos += 1;
                let inner = self.expression()?;
                self.expect_punct(")")?;
                inner
            }
            TokenKind::Punct("[") => {
                self.pos += 1;
                Expr::Array(self.array_items("]")?)
            }
            TokenKind::Punct("\\") | TokenKind::Identifier(_) => self.named_expression()?,
            _ => return Err(self.unexpected(None)),
        };
        Ok(expr)
    }

    fn named_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let lowered = self
            .peek()
            .and_then(Token::identifier)
            .map(str::to_ascii_lowercase);
        let next_is_paren = self.peek_at(1).is_some_and(|t| t.is_punct("("));
        match lowered.as_deref() {
            Some("true") => {
                self.pos += 1;
                return Ok(Expr::Bool(true));
            }
            Some("false") => {
                self.pos += 1;
                return Ok(Expr::Bool(false));
            }
            Some("null") => {
                self.pos += 1;
                return Ok(Expr::Null);
            }
            Some("array") if next_is_paren => {
                self.pos += 2;
                return Ok(Expr::Array(self.array_items(")")?));
            }
            Some("isset") if next_is_paren => {
                self.pos += 2;
                let targets = self.arguments_until(")")?;
                if targets.is_empty() || targets.iter().any(|t| !t.is_assignable()) {
                    return Err(self.error("isset() requires variables or array elements"));
                }
                return Ok(Expr::Isset(targets));
            }
            Some("empty") if next_is_paren => {
                self.pos += 2;
                let target = self.expression()?;
                self.expect_punct(")")?;
                return Ok(Expr::Empty(Box::new(target)));
            }
            Some("function" | "fn") => return Err(self.error("closures are not supported")),
            Some("list") if next_is_paren => {
                return Err(self.error("list() destructuring is not supported"))
            }
            _ => {}
        }
        let name = self.qualified_name()?;
        if self.eat_punct("(") {
            let args = self.arguments_until(")")?;
            return Ok(Expr::Call { name, args, line });
        }
        if self.at_punct("::") {
            return Err(self.error("static member access is not supported"));
        }
        Ok(Expr::Constant(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(source: &str) -> Vec<Stmt> {
        let program = parse(source).unwrap();
        let body = program.functions().next().unwrap().body.clone();
        body
    }

    #[test]
    fn test_parses_record_transformer() {
        let program = parse(
            "<?php\nfunction to_upper(array $record): array {\n    $record['name'] = strtoupper($record['name'] ?? '');\n    return $record;\n}\n",
        )
        .unwrap();
        let decl = program.function("TO_UPPER").unwrap();
        assert_eq!(decl.params[0].name, "record");
        assert_eq!(decl.line, 2);
        assert_eq!(decl.body.len(), 2);
        assert!(matches!(decl.body[1], Stmt::Return(Some(Expr::Variable(_)))));
    }

    #[test]
    fn test_precedence() {
        let body = body_of("function f($r) { return 1 + 2 * 3 . 'x'; }");
        let Stmt::Return(Some(Expr::Binary { op, lhs, .. })) = &body[0] else {
            panic!("expected binary return");
        };
        assert_eq!(*op, BinaryOp::Concat);
        assert!(matches!(**lhs, Expr::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn test_negation_binds_weaker_than_instanceof() {
        let body = body_of("function f($r) { return !$r instanceof Exception; }");
        let Stmt::Return(Some(Expr::Unary { op, expr })) = &body[0] else {
            panic!("expected unary return");
        };
        assert_eq!(*op, UnaryOp::Not);
        assert!(matches!(**expr, Expr::InstanceOf { .. }));
    }

    #[test]
    fn test_assignment_inside_condition() {
        let body = body_of("function f($r) { if ($r && $x = 5) { return $x; } return 0; }");
        let Stmt::If { branches, .. } = &body[0] else {
            panic!("expected if");
        };
        let Expr::Binary { rhs, .. } = &branches[0].0 else {
            panic!("expected binary condition");
        };
        assert!(matches!(**rhs, Expr::Assign { .. }));
    }

    #[test]
    fn test_control_flow_forms() {
        let body = body_of(
            "function f($r) {
                foreach ($r as $k => $v) { continue; }
                for ($i = 0; $i < 3; $i++) { break; }
                while (false) {}
                do { $i--; } while ($i > 0);
                switch ($i) { case 1: return 1; default: break; }
                try { throw new \\RuntimeException('x'); } catch (InvalidArgumentException | RuntimeException $e) { echo $e->getMessage(); } finally { unset($r['a']); }
                return $r[] = (int) '3';
            }",
        );
        assert!(matches!(body[0], Stmt::Foreach { key: Some(_), .. }));
        assert!(matches!(body[1], Stmt::For { .. }));
        assert!(matches!(body[3], Stmt::DoWhile { .. }));
        assert!(matches!(body[4], Stmt::Switch { .. }));
        let Stmt::Try { catches, finally, .. } = &body[5] else {
            panic!("expected try");
        };
        assert_eq!(catches[0].classes, vec!["InvalidArgumentException", "RuntimeException"]);
        assert!(finally.is_some());
    }

    #[test]
    fn test_rejects_unsupported_constructs() {
        let cases = [
            ("function f($r) { return $$r; }", "variable variables"),
            ("function f($r) { return `ls`; }", "backtick"),
            ("function f($r) { $g = 'x'; return $g(); }", "dynamic function calls"),
            ("function f($r) { return function () {}; }", "closures"),
            ("function f($r) { function g() {} return 1; }", "nested function"),
        ];
        for (source, needle) in cases {
            let err = parse(source).unwrap_err();
            assert!(err.message.contains(needle), "{source}: {}", err.message);
        }
    }

    #[test]
    fn test_error_reports_line() {
        let err = parse("<?php\nfunction f($r) {\n  return 1\n}\n").unwrap_err();
        assert_eq!(err.line, 4);
        assert_eq!(err.message, "unexpected '}', expecting ';'");
    }

    #[test]
    fn test_deep_nesting_is_an_error_not_an_overflow() {
        let source = format!("function f($r) {{ return {}1{}; }}", "(".repeat(500), ")".repeat(500));
        let err = parse(&source).unwrap_err();
        assert!(err.message.contains("nesting"));
    }
}
