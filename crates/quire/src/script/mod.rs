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

//! Record scripts: a PHP-flavoured subset that is lexed, parsed into an AST
//! and evaluated by a gas-bounded tree interpreter. Scripts only ever see
//! the builtin library and the functions declared in their own source.

pub mod ast;
pub mod builtins;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::Program;
pub use interpreter::{Interpreter, Limits, RuntimeError};
pub use lexer::{significant_tokens, tokenize, LexError, Token, TokenKind};
pub use parser::{parse, ParseError};
pub use value::Value;
