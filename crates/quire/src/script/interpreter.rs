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

use super::ast::{BinaryOp, CastType, Expr, FunctionDecl, Program, Stmt, TemplatePart, UnaryOp};
use super::builtins::{self, BuiltinContext};
use super::lexer::KeyPart;
use super::value::{parse_numeric, ArrayKey, Number, ObjectValue, PhpArray, Value, NEXT_ELEMENT_OCCUPIED};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Resource limits for one invocation. Every statement and expression costs
/// one unit of gas; builtins cost extra in proportion to the size of what
/// they return.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub gas: u64,
    pub max_call_depth: usize,
    pub max_nesting: usize,
    pub deadline: Option<Instant>,
    pub deadline_check_interval: u64,
    pub max_string_bytes: usize,
    pub max_array_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            gas: 5_000_000,
            max_call_depth: 64,
            max_nesting: 256,
            deadline: None,
            deadline_check_interval: 1024,
            max_string_bytes: 8 * 1024 * 1024,
            max_array_len: 1_000_000,
        }
    }
}

impl Limits {
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.deadline = Instant::now().checked_add(budget);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("Uncaught {class}: {message}")]
    Uncaught { class: String, message: String },

    #[error("Gas limit of {0} exhausted")]
    OutOfGas(u64),

    #[error("Maximum function nesting level of {0} reached")]
    CallDepthExceeded(usize),

    #[error("Maximum expression nesting of {0} reached")]
    NestingExceeded(usize),

    #[error("Execution deadline exceeded")]
    DeadlineExceeded,

    #[error("Memory limit exceeded: {0}")]
    MemoryLimit(String),
}

/// Non-local exits. Thrown objects are catchable; fatal errors are not and
/// skip `finally` blocks.
#[derive(Debug)]
pub(crate) enum Fault {
    Throw(Box<ObjectValue>),
    Fatal(RuntimeError),
}

impl From<RuntimeError> for Fault {
    fn from(err: RuntimeError) -> Self {
        Self::Fatal(err)
    }
}

pub(crate) fn throw(class: &str, message: impl Into<String>) -> Fault {
    Fault::Throw(Box::new(ObjectValue {
        class: class.to_string(),
        message: message.into(),
        code: 0,
        previous: None,
    }))
}

const EXCEPTION_CLASSES: &[(&str, Option<&str>)] = &[
    ("Throwable", None),
    ("Exception", Some("Throwable")),
    ("Error", Some("Throwable")),
    ("ErrorException", Some("Exception")),
    ("LogicException", Some("Exception")),
    ("BadFunctionCallException", Some("LogicException")),
    ("DomainException", Some("LogicException")),
    ("InvalidArgumentException", Some("LogicException")),
    ("LengthException", Some("LogicException")),
    ("OutOfRangeException", Some("LogicException")),
    ("RuntimeException", Some("Exception")),
    ("OutOfBoundsException", Some("RuntimeException")),
    ("OverflowException", Some("RuntimeException")),
    ("RangeException", Some("RuntimeException")),
    ("UnderflowException", Some("RuntimeException")),
    ("UnexpectedValueException", Some("RuntimeException")),
    ("JsonException", Some("Exception")),
    ("TypeError", Some("Error")),
    ("ArgumentCountError", Some("TypeError")),
    ("ValueError", Some("Error")),
    ("ArithmeticError", Some("Error")),
    ("DivisionByZeroError", Some("ArithmeticError")),
];

/// Canonical spelling of a known exception class; namespaces are ignored.
pub fn exception_class(name: &str) -> Option<&'static str> {
    let short = name.rsplit('\\').next().unwrap_or(name);
    EXCEPTION_CLASSES
        .iter()
        .find(|(class, _)| class.eq_ignore_ascii_case(short))
        .map(|(class, _)| *class)
}

pub fn is_instance_of(class: &str, ancestor: &str) -> bool {
    let Some(target) = exception_class(ancestor) else {
        return false;
    };
    let mut current = exception_class(class);
    while let Some(c) = current {
        if c == target {
            return true;
        }
        current = EXCEPTION_CLASSES
            .iter()
            .find(|(name, _)| *name == c)
            .and_then(|(_, parent)| *parent);
    }
    false
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

type Scope = HashMap<String, Value>;
type Exec = Result<Flow, Fault>;
type Eval = Result<Value, Fault>;

/// Splits `$a[x][y]` into the root variable and its index expressions.
fn lvalue_path(expr: &Expr) -> Option<(&str, Vec<Option<&Expr>>)> {
    let mut indices = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Variable(name) => {
                indices.reverse();
                return Some((name, indices));
            }
            Expr::Index { base, index } => {
                indices.push(index.as_deref());
                current = base;
            }
            _ => return None,
        }
    }
}

fn index_value(base: &Value, key: &Value) -> Eval {
    match base {
        Value::Array(array) => {
            let key = ArrayKey::from_value(key).map_err(|m| throw("TypeError", m))?;
            Ok(array.get(&key).cloned().unwrap_or_default())
        }
        Value::Str(s) => {
            let offset = match key {
                Value::Int(i) => *i,
                Value::Str(k) => match parse_numeric(k) {
                    Some(Number::Int(i)) => i,
                    _ => return Ok(Value::Null),
                },
                Value::Bool(b) => i64::from(*b),
                Value::Float(f) => super::value::float_to_int(*f),
                _ => return Ok(Value::Null),
            };
            let len = s.chars().count() as i64;
            let position = if offset < 0 { len + offset } else { offset };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|p| s.chars().nth(p))
                .map_or(Value::Null, |c| Value::Str(c.to_string())))
        }
        Value::Object(o) => Err(throw(
            "Error",
            format!("Cannot use object of type {} as array", o.class),
        )),
        _ => Ok(Value::Null),
    }
}

fn assign_into(slot: &mut Value, keys: &[Option<ArrayKey>], value: Value, max_len: usize) -> Result<(), Fault> {
    let Some((first, rest)) = keys.split_first() else {
        *slot = value;
        return Ok(());
    };
    if matches!(slot, Value::Null | Value::Bool(false)) {
        *slot = Value::Array(PhpArray::new());
    }
    let Value::Array(array) = slot else {
        return Err(throw("Error", "Cannot use a scalar value as an array"));
    };
    let grows = first.as_ref().map_or(true, |k| !array.contains_key(k));
    if grows && array.len() >= max_len {
        return Err(RuntimeError::MemoryLimit(format!("array exceeds {max_len} elements")).into());
    }
    let child = match first {
        Some(key) => array.slot(key.clone()),
        None => array
            .push_slot()
            .ok_or_else(|| throw("Error", NEXT_ELEMENT_OCCUPIED))?,
    };
    assign_into(child, rest, value, max_len)
}

/// Perl-style increment of alphanumeric strings: "a" -> "b", "Az" -> "Ba", "zz" -> "aaa".
fn increment_string(s: &str) -> String {
    let mut chars: Vec<char> = s.chars().collect();
    let mut i = chars.len();
    while i > 0 {
        i -= 1;
        let (next, carry) = match chars[i] {
            'z' => ('a', true),
            'Z' => ('A', true),
            '9' => ('0', true),
            c @ ('a'..='y' | 'A'..='Y' | '0'..='8') => (char::from_u32(c as u32 + 1).unwrap_or(c), false),
            _ => return chars.into_iter().collect(),
        };
        chars[i] = next;
        if !carry {
            return chars.into_iter().collect();
        }
    }
    let lead = match chars.first() {
        Some('a') => 'a',
        Some('A') => 'A',
        _ => '1',
    };
    chars.insert(0, lead);
    chars.into_iter().collect()
}

fn operator_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Pow => "**",
        BinaryOp::BitAnd => "&",
        BinaryOp::BitOr => "|",
        BinaryOp::BitXor => "^",
        BinaryOp::ShiftLeft => "<<",
        BinaryOp::ShiftRight => ">>",
        _ => "?",
    }
}

/// Arithmetic operand; arrays, objects and non-numeric strings are type errors.
fn arithmetic_operand(value: &Value, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Number, Fault> {
    let unsupported = || {
        throw(
            "TypeError",
            format!(
                "Unsupported operand types: {} {} {}",
                lhs.type_name(),
                operator_symbol(op),
                rhs.type_name()
            ),
        )
    };
    match value {
        Value::Array(_) | Value::Object(_) => Err(unsupported()),
        Value::Str(s) => {
            if let Some(n) = parse_numeric(s) {
                return Ok(n);
            }
            let prefix = super::value::numeric_prefix(s);
            let has_prefix = s
                .trim_start()
                .trim_start_matches(['+', '-'])
                .starts_with(|c: char| c.is_ascii_digit() || c == '.');
            if has_prefix {
                Ok(prefix)
            } else {
                Err(unsupported())
            }
        }
        other => Ok(other.to_number()),
    }
}

pub(crate) fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Eval {
    let a = arithmetic_operand(lhs, op, lhs, rhs)?;
    let b = arithmetic_operand(rhs, op, lhs, rhs)?;
    let value = match op {
        BinaryOp::Add => match (a, b) {
            (Number::Int(x), Number::Int(y)) => x
                .checked_add(y)
                .map_or_else(|| Value::Float(x as f64 + y as f64), Value::Int),
            _ => Value::Float(a.to_f64() + b.to_f64()),
        },
        BinaryOp::Sub => match (a, b) {
            (Number::Int(x), Number::Int(y)) => x
                .checked_sub(y)
                .map_or_else(|| Value::Float(x as f64 - y as f64), Value::Int),
            _ => Value::Float(a.to_f64() - b.to_f64()),
        },
        BinaryOp::Mul => match (a, b) {
            (Number::Int(x), Number::Int(y)) => x
                .checked_mul(y)
                .map_or_else(|| Value::Float(x as f64 * y as f64), Value::Int),
            _ => Value::Float(a.to_f64() * b.to_f64()),
        },
        BinaryOp::Div => {
            if b.to_f64() == 0.0 {
                return Err(throw("DivisionByZeroError", "Division by zero"));
            }
            match (a, b) {
                (Number::Int(x), Number::Int(y)) if x.checked_rem(y) == Some(0) => {
                    x.checked_div(y).map_or(Value::Float(x as f64 / y as f64), Value::Int)
                }
                _ => Value::Float(a.to_f64() / b.to_f64()),
            }
        }
        BinaryOp::Mod => {
            let x = match a {
                Number::Int(i) => i,
                Number::Float(f) => super::value::float_to_int(f),
            };
            let y = match b {
                Number::Int(i) => i,
                Number::Float(f) => super::value::float_to_int(f),
            };
            if y == 0 {
                return Err(throw("DivisionByZeroError", "Modulo by zero"));
            }
            Value::Int(x.checked_rem(y).unwrap_or(0))
        }
        BinaryOp::Pow => match (a, b) {
            (Number::Int(x), Number::Int(y)) if y >= 0 => u32::try_from(y)
                .ok()
                .and_then(|y| x.checked_pow(y))
                .map_or_else(|| Value::Float((x as f64).powf(y as f64)), Value::Int),
            _ => Value::Float(a.to_f64().powf(b.to_f64())),
        },
        _ => Value::Null,
    };
    Ok(value)
}

fn bitwise(op: BinaryOp, lhs: &Value, rhs: &Value) -> Eval {
    let a = arithmetic_operand(lhs, op, lhs, rhs)?;
    let b = arithmetic_operand(rhs, op, lhs, rhs)?;
    let (x, y) = (a.into_value().to_int(), b.into_value().to_int());
    let value = match op {
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        BinaryOp::BitXor => x ^ y,
        BinaryOp::ShiftLeft | BinaryOp::ShiftRight => {
            if y < 0 {
                return Err(throw("ArithmeticError", "Bit shift by negative number"));
            }
            match (op, u32::try_from(y)) {
                (BinaryOp::ShiftLeft, Ok(s)) if s < 64 => x.wrapping_shl(s),
                (BinaryOp::ShiftLeft, _) => 0,
                (_, Ok(s)) if s < 64 => x >> s,
                _ => {
                    if x < 0 {
                        -1
                    } else {
                        0
                    }
                }
            }
        }
        _ => 0,
    };
    Ok(Value::Int(value))
}

fn step_value(value: Value, increment: bool) -> Eval {
    let stepped = match value {
        Value::Null if increment => Value::Int(1),
        Value::Null => Value::Null,
        Value::Int(i) => {
            let next = if increment { i.checked_add(1) } else { i.checked_sub(1) };
            next.map_or_else(
                || Value::Float(i as f64 + if increment { 1.0 } else { -1.0 }),
                Value::Int,
            )
        }
        Value::Float(f) => Value::Float(if increment { f + 1.0 } else { f - 1.0 }),
        Value::Bool(b) => Value::Bool(b),
        Value::Str(s) => match parse_numeric(&s) {
            Some(n) => return step_value(n.into_value(), increment),
            None if s.is_empty() => {
                if increment {
                    Value::from("1")
                } else {
                    Value::Int(-1)
                }
            }
            None if increment => Value::Str(increment_string(&s)),
            None => Value::Str(s),
        },
        other => {
            let verb = if increment { "increment" } else { "decrement" };
            return Err(throw(
                "TypeError",
                format!("Cannot {verb} {}", other.type_name()),
            ));
        }
    };
    Ok(stepped)
}

/// Tree-walking evaluator for one parsed program.
pub struct Interpreter<'p> {
    program: &'p Program,
    limits: Limits,
    gas_used: u64,
    since_clock_check: u64,
    depth: usize,
    nesting: usize,
    output: String,
}

impl<'p> Interpreter<'p> {
    pub fn new(program: &'p Program, limits: Limits) -> Self {
        Self {
            program,
            limits,
            gas_used: 0,
            since_clock_check: 0,
            depth: 0,
            nesting: 0,
            output: String::new(),
        }
    }

    pub fn gas_used(&self) -> u64 {
        self.gas_used
    }

    /// Text written with `echo`.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Calls a declared function by (case-insensitive) name.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let program = self.program;
        let result = match program.function(name) {
            Some(function) => self.call_user(function, args),
            None => Err(throw("Error", format!("Call to undefined function {name}()"))),
        };
        result.map_err(|fault| match fault {
            Fault::Throw(object) => RuntimeError::Uncaught {
                class: object.class,
                message: object.message,
            },
            Fault::Fatal(err) => err,
        })
    }

    fn charge(&mut self, amount: u64) -> Result<(), Fault> {
        self.gas_used = self.gas_used.saturating_add(amount);
        if self.gas_used > self.limits.gas {
            return Err(RuntimeError::OutOfGas(self.limits.gas).into());
        }
        if let Some(deadline) = self.limits.deadline {
            self.since_clock_check += amount;
            if self.since_clock_check >= self.limits.deadline_check_interval {
                self.since_clock_check = 0;
                if Instant::now() >= deadline {
                    return Err(RuntimeError::DeadlineExceeded.into());
                }
            }
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), Fault> {
        self.nesting += 1;
        if self.nesting > self.limits.max_nesting {
            return Err(RuntimeError::NestingExceeded(self.limits.max_nesting).into());
        }
        self.charge(1)
    }

    fn check_string(&self, s: &str) -> Result<(), Fault> {
        if s.len() > self.limits.max_string_bytes {
            return Err(RuntimeError::MemoryLimit(format!(
                "string exceeds {} bytes",
                self.limits.max_string_bytes
            ))
            .into());
        }
        Ok(())
    }

    fn call_user(&mut self, function: &'p FunctionDecl, args: Vec<Value>) -> Eval {
        if self.depth >= self.limits.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded(self.limits.max_call_depth).into());
        }
        self.depth += 1;
        let result = self.run_function(function, args);
        self.depth -= 1;
        result
    }

    fn run_function(&mut self, function: &'p FunctionDecl, args: Vec<Value>) -> Eval {
        let mut scope = Scope::new();
        let passed = args.len();
        let mut args = args.into_iter();
        for param in &function.params {
            let value = match (args.next(), &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.eval(default, &mut scope)?,
                (None, None) => {
                    let required = function.params.iter().filter(|p| p.default.is_none()).count();
                    let qualifier = if required == function.params.len() {
                        "exactly"
                    } else {
                        "at least"
                    };
                    return Err(throw(
                        "ArgumentCountError",
                        format!(
                            "Too few arguments to function {}(), {passed} passed and {qualifier} {required} expected",
                            function.name
                        ),
                    ));
                }
            };
            scope.insert(param.name.clone(), value);
        }
        match self.exec_block(&function.body, &mut scope)? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Null),
        }
    }

    fn exec_block(&mut self, body: &'p [Stmt], scope: &mut Scope) -> Exec {
        for stmt in body {
            match self.exec(stmt, scope)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &'p Stmt, scope: &mut Scope) -> Exec {
        self.enter()?;
        let flow = self.exec_inner(stmt, scope);
        self.nesting -= 1;
        flow
    }

    fn exec_inner(&mut self, stmt: &'p Stmt, scope: &mut Scope) -> Exec {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::Echo(values) => {
                for value in values {
                    let text = self.eval(value, scope)?.to_php_string();
                    self.output.push_str(&text);
                    self.check_string(&self.output)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.eval(condition, scope)?.to_bool() {
                        return self.exec_block(body, scope);
                    }
                }
                match otherwise {
                    Some(body) => self.exec_block(body, scope),
                    None => Ok(Flow::Normal),
                }
            }
            Stmt::Foreach {
                subject,
                key,
                value,
                body,
            } => {
                let Value::Array(array) = self.eval(subject, scope)? else {
                    return Ok(Flow::Normal);
                };
                for (k, v) in array {
                    self.charge(1)?;
                    if let Some(key) = key {
                        scope.insert(key.clone(), k.to_value());
                    }
                    scope.insert(value.clone(), v);
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                condition,
                step,
                body,
            } => {
                for expr in init {
                    self.eval(expr, scope)?;
                }
                loop {
                    self.charge(1)?;
                    let mut proceed = true;
                    for expr in condition {
                        proceed = self.eval(expr, scope)?.to_bool();
                    }
                    if !proceed {
                        break;
                    }
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    for expr in step {
                        self.eval(expr, scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::While { condition, body } => {
                loop {
                    self.charge(1)?;
                    if !self.eval(condition, scope)?.to_bool() {
                        break;
                    }
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, condition } => {
                loop {
                    self.charge(1)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(condition, scope)?.to_bool() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Switch { subject, cases } => {
                let subject = self.eval(subject, scope)?;
                let mut start = None;
                for (i, (label, _)) in cases.iter().enumerate() {
                    if let Some(label) = label {
                        if subject.loose_eq(&self.eval(label, scope)?) {
                            start = Some(i);
                            break;
                        }
                    }
                }
                let start = start.or_else(|| cases.iter().position(|(label, _)| label.is_none()));
                if let Some(start) = start {
                    for (_, body) in &cases[start..] {
                        match self.exec_block(body, scope)? {
                            Flow::Normal => {}
                            Flow::Break | Flow::Continue => break,
                            Flow::Return(v) => return Ok(Flow::Return(v)),
                        }
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => match self.eval(expr, scope)? {
                Value::Object(object) => Err(Fault::Throw(object)),
                _ => Err(throw("Error", "Can only throw objects")),
            },
            Stmt::Try {
                body,
                catches,
                finally,
            } => {
                let outcome = match self.exec_block(body, scope) {
                    Err(Fault::Throw(object)) => {
                        let clause = catches.iter().find(|clause| {
                            clause
                                .classes
                                .iter()
                                .any(|class| is_instance_of(&object.class, class))
                        });
                        match clause {
                            Some(clause) => {
                                if let Some(variable) = &clause.variable {
                                    scope.insert(variable.clone(), Value::Object(object));
                                }
                                self.exec_block(&clause.body, scope)
                            }
                            None => Err(Fault::Throw(object)),
                        }
                    }
                    other => other,
                };
                if matches!(outcome, Err(Fault::Fatal(_))) {
                    return outcome;
                }
                if let Some(finally) = finally {
                    match self.exec_block(finally, scope)? {
                        Flow::Normal => {}
                        overriding => return Ok(overriding),
                    }
                }
                outcome
            }
            Stmt::Unset(targets) => {
                for target in targets {
                    self.unset(target, scope)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => self.exec_block(body, scope),
        }
    }

    fn eval(&mut self, expr: &'p Expr, scope: &mut Scope) -> Eval {
        self.enter()?;
        let value = self.eval_inner(expr, scope);
        self.nesting -= 1;
        value
    }

    fn eval_inner(&mut self, expr: &'p Expr, scope: &mut Scope) -> Eval {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Template(parts) => self.interpolate(parts, scope),
            Expr::Variable(name) => Ok(scope.get(name).cloned().unwrap_or_default()),
            Expr::Array(items) => {
                let mut array = PhpArray::new();
                for item in items {
                    let key = match &item.key {
                        Some(key) => Some(self.eval_key(key, scope)?),
                        None => None,
                    };
                    let value = self.eval(&item.value, scope)?;
                    match key {
                        Some(key) => array.insert(key, value),
                        None => {
                            if !array.try_push(value) {
                                return Err(throw("Error", NEXT_ELEMENT_OCCUPIED));
                            }
                        }
                    }
                }
                Ok(Value::Array(array))
            }
            Expr::Index { index: None, .. } => Err(throw("Error", "Cannot use [] for reading")),
            Expr::Index { base, index: Some(index) } => {
                if lvalue_path(expr).is_some() {
                    return self.read_path(expr, scope);
                }
                let base = self.eval(base, scope)?;
                let key = self.eval(index, scope)?;
                index_value(&base, &key)
            }
            Expr::Call { name, args, .. } => self.call_function(name, args, scope),
            Expr::MethodCall {
                object,
                method,
                args,
            } => {
                let object = self.eval(object, scope)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                Self::call_method(object, method, &values)
            }
            Expr::New { class, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                Self::instantiate(class, values)
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.to_bool())),
                    UnaryOp::Silence => Ok(value),
                    UnaryOp::Neg => arithmetic(BinaryOp::Mul, &value, &Value::Int(-1)),
                    UnaryOp::Plus => arithmetic(BinaryOp::Mul, &value, &Value::Int(1)),
                    UnaryOp::BitNot => match value {
                        Value::Int(i) => Ok(Value::Int(!i)),
                        Value::Float(f) => Ok(Value::Int(!super::value::float_to_int(f))),
                        other => Err(throw(
                            "TypeError",
                            format!("Cannot perform bitwise not on {}", other.type_name()),
                        )),
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::And => {
                    let result = self.eval(lhs, scope)?.to_bool() && self.eval(rhs, scope)?.to_bool();
                    Ok(Value::Bool(result))
                }
                BinaryOp::Or => {
                    let result = self.eval(lhs, scope)?.to_bool() || self.eval(rhs, scope)?.to_bool();
                    Ok(Value::Bool(result))
                }
                BinaryOp::Coalesce => {
                    let left = self.eval(lhs, scope)?;
                    if left.is_null() {
                        self.eval(rhs, scope)
                    } else {
                        Ok(left)
                    }
                }
                _ => {
                    let left = self.eval(lhs, scope)?;
                    let right = self.eval(rhs, scope)?;
                    self.binary(*op, &left, &right)
                }
            },
            Expr::Assign { target, op, value } => match op {
                None => {
                    let value = self.eval(value, scope)?;
                    self.assign(target, value.clone(), scope)?;
                    Ok(value)
                }
                Some(BinaryOp::Coalesce) => {
                    let current = self.eval(target, scope)?;
                    if !current.is_null() {
                        return Ok(current);
                    }
                    let value = self.eval(value, scope)?;
                    self.assign(target, value.clone(), scope)?;
                    Ok(value)
                }
                Some(op) => {
                    let current = self.eval(target, scope)?;
                    let operand = self.eval(value, scope)?;
                    let value = self.binary(*op, &current, &operand)?;
                    self.assign(target, value.clone(), scope)?;
                    Ok(value)
                }
            },
            Expr::IncDec {
                target,
                increment,
                prefix,
            } => {
                let current = self.eval(target, scope)?;
                let stepped = step_value(current.clone(), *increment)?;
                self.assign(target, stepped.clone(), scope)?;
                Ok(if *prefix { stepped } else { current })
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.eval(condition, scope)?;
                if condition.to_bool() {
                    match then {
                        Some(then) => self.eval(then, scope),
                        None => Ok(condition),
                    }
                } else {
                    self.eval(otherwise, scope)
                }
            }
            Expr::Cast { to, expr } => {
                let value = self.eval(expr, scope)?;
                Ok(match to {
                    CastType::Int => Value::Int(value.to_int()),
                    CastType::Float => Value::Float(value.to_float()),
                    CastType::String => Value::Str(value.to_php_string()),
                    CastType::Bool => Value::Bool(value.to_bool()),
                    CastType::Array => match value {
                        Value::Array(_) => value,
                        Value::Null => Value::Array(PhpArray::new()),
                        other => Value::Array(PhpArray::from_list([other])),
                    },
                })
            }
            Expr::InstanceOf { expr, class } => {
                let value = self.eval(expr, scope)?;
                Ok(Value::Bool(
                    matches!(value, Value::Object(object) if is_instance_of(&object.class, class)),
                ))
            }
            Expr::Isset(targets) => {
                for target in targets {
                    if self.eval(target, scope)?.is_null() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Empty(target) => Ok(Value::Bool(!self.eval(target, scope)?.to_bool())),
            Expr::Constant(name) => builtins::constant(name.trim_start_matches('\\'))
                .ok_or_else(|| throw("Error", format!("Undefined constant \"{name}\""))),
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Eval {
        let value = match op {
            BinaryOp::Add => {
                if let (Value::Array(a), Value::Array(b)) = (lhs, rhs) {
                    let mut union = a.clone();
                    for (key, value) in b.iter() {
                        if !union.contains_key(key) {
                            union.insert(key.clone(), value.clone());
                        }
                    }
                    return Ok(Value::Array(union));
                }
                arithmetic(op, lhs, rhs)?
            }
            BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
                arithmetic(op, lhs, rhs)?
            }
            BinaryOp::BitAnd
            | BinaryOp::BitOr
            | BinaryOp::BitXor
            | BinaryOp::ShiftLeft
            | BinaryOp::ShiftRight => bitwise(op, lhs, rhs)?,
            BinaryOp::Concat => {
                let mut joined = lhs.to_php_string();
                joined.push_str(&rhs.to_php_string());
                self.check_string(&joined)?;
                Value::Str(joined)
            }
            BinaryOp::Eq => Value::Bool(lhs.loose_eq(rhs)),
            BinaryOp::NotEq => Value::Bool(!lhs.loose_eq(rhs)),
            BinaryOp::Identical => Value::Bool(lhs.identical(rhs)),
            BinaryOp::NotIdentical => Value::Bool(!lhs.identical(rhs)),
            BinaryOp::Lt => Value::Bool(lhs.compare(rhs) == Some(Ordering::Less)),
            BinaryOp::Gt => Value::Bool(lhs.compare(rhs) == Some(Ordering::Greater)),
            BinaryOp::Le => Value::Bool(matches!(
                lhs.compare(rhs),
                Some(Ordering::Less | Ordering::Equal)
            )),
            BinaryOp::Ge => Value::Bool(matches!(
                lhs.compare(rhs),
                Some(Ordering::Greater | Ordering::Equal)
            )),
            BinaryOp::Spaceship => Value::Int(match lhs.compare(rhs) {
                Some(Ordering::Less) => -1,
                Some(Ordering::Equal) => 0,
                _ => 1,
            }),
            BinaryOp::And => Value::Bool(lhs.to_bool() && rhs.to_bool()),
            BinaryOp::Or => Value::Bool(lhs.to_bool() || rhs.to_bool()),
            BinaryOp::Xor => Value::Bool(lhs.to_bool() ^ rhs.to_bool()),
            BinaryOp::Coalesce => {
                if lhs.is_null() {
                    rhs.clone()
                } else {
                    lhs.clone()
                }
            }
        };
        Ok(value)
    }

    fn eval_key(&mut self, expr: &'p Expr, scope: &mut Scope) -> Result<ArrayKey, Fault> {
        let key = self.eval(expr, scope)?;
        ArrayKey::from_value(&key).map_err(|m| throw("TypeError", m))
    }

    fn interpolate(&mut self, parts: &'p [TemplatePart], scope: &Scope) -> Eval {
        let mut out = String::new();
        for part in parts {
            match part {
                TemplatePart::Literal(text) => out.push_str(text),
                TemplatePart::Variable { name, keys } => {
                    let mut value = scope.get(name).cloned().unwrap_or_default();
                    for key in keys {
                        let key = match key {
                            KeyPart::Int(i) => Value::Int(*i),
                            KeyPart::Str(s) => Value::Str(s.clone()),
                            KeyPart::Variable(var) => scope.get(var).cloned().unwrap_or_default(),
                        };
                        value = index_value(&value, &key)?;
                    }
                    out.push_str(&value.to_php_string());
                }
            }
            self.check_string(&out)?;
        }
        Ok(Value::Str(out))
    }

    /// Reads `$a[x][y]` without copying the intermediate arrays.
    fn read_path(&mut self, expr: &'p Expr, scope: &mut Scope) -> Eval {
        let Some((root, indices)) = lvalue_path(expr) else {
            return self.eval(expr, scope);
        };
        let mut keys = Vec::with_capacity(indices.len());
        for index in indices {
            match index {
                Some(index) => keys.push(self.eval(index, scope)?),
                None => return Err(throw("Error", "Cannot use [] for reading")),
            }
        }
        let Some(mut current) = scope.get(root) else {
            return Ok(Value::Null);
        };
        for (i, key) in keys.iter().enumerate() {
            match current {
                Value::Array(array) => {
                    let key = ArrayKey::from_value(key).map_err(|m| throw("TypeError", m))?;
                    match array.get(&key) {
                        Some(next) => current = next,
                        None => return Ok(Value::Null),
                    }
                }
                other => {
                    let mut owned = index_value(other, key)?;
                    for key in &keys[i + 1..] {
                        owned = index_value(&owned, key)?;
                    }
                    return Ok(owned);
                }
            }
        }
        Ok(current.clone())
    }

    fn assign(&mut self, target: &'p Expr, value: Value, scope: &mut Scope) -> Result<(), Fault> {
        let Some((root, indices)) = lvalue_path(target) else {
            return Err(throw("Error", "Cannot assign to this expression"));
        };
        let mut keys = Vec::with_capacity(indices.len());
        for index in indices {
            keys.push(match index {
                Some(index) => Some(self.eval_key(index, scope)?),
                None => None,
            });
        }
        let slot = scope.entry(root.to_string()).or_default();
        assign_into(slot, &keys, value, self.limits.max_array_len)
    }

    fn unset(&mut self, target: &'p Expr, scope: &mut Scope) -> Result<(), Fault> {
        let Some((root, indices)) = lvalue_path(target) else {
            return Ok(());
        };
        let mut keys = Vec::with_capacity(indices.len());
        for index in indices {
            match index {
                Some(index) => keys.push(self.eval_key(index, scope)?),
                None => return Err(throw("Error", "Cannot use [] for unsetting")),
            }
        }
        let Some((last, parents)) = keys.split_last() else {
            scope.remove(root);
            return Ok(());
        };
        let Some(mut current) = scope.get_mut(root) else {
            return Ok(());
        };
        for key in parents {
            current = match current {
                Value::Array(array) => match array.get_mut(key) {
                    Some(next) => next,
                    None => return Ok(()),
                },
                _ => return Ok(()),
            };
        }
        if let Value::Array(array) = current {
            array.remove(last);
        }
        Ok(())
    }

    fn call_function(&mut self, name: &str, args: &'p [Expr], scope: &mut Scope) -> Eval {
        let name = name.trim_start_matches('\\');
        let program = self.program;
        if let Some(function) = program.function(name) {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(self.eval(arg, scope)?);
            }
            return self.call_user(function, values);
        }
        if name.eq_ignore_ascii_case("function_exists") {
            let [arg] = args else {
                return Err(throw(
                    "ArgumentCountError",
                    format!("function_exists() expects exactly 1 argument, {} given", args.len()),
                ));
            };
            let candidate = self.eval(arg, scope)?.to_php_string();
            let candidate = candidate.trim_start_matches('\\');
            return Ok(Value::Bool(
                program.function(candidate).is_some() || builtins::is_builtin(candidate),
            ));
        }
        let lowered = name.to_ascii_lowercase();
        let Some(builtin) = builtins::lookup(&lowered) else {
            return Err(throw("Error", format!("Call to undefined function {name}()")));
        };
        if args.len() < builtin.min_args || args.len() > builtin.max_args {
            return Err(throw("ArgumentCountError", builtin.arity_message(args.len())));
        }
        let mut values = Vec::with_capacity(args.len());
        for (position, arg) in args.iter().enumerate() {
            if builtin.by_ref.contains(&position) && !arg.is_assignable() {
                return Err(throw(
                    "Error",
                    format!(
                        "{}(): Argument #{} could not be passed by reference",
                        builtin.name,
                        position + 1
                    ),
                ));
            }
            values.push(self.eval(arg, scope)?);
        }
        let context = BuiltinContext {
            limits: &self.limits,
        };
        let result = (builtin.func)(&context, &mut values)?;
        let size = match &result {
            Value::Str(s) => s.len() / 32,
            Value::Array(a) => a.len() / 4,
            _ => 0,
        };
        self.charge(1 + size as u64)?;
        if let Value::Str(s) = &result {
            self.check_string(s)?;
        }
        for &position in builtin.by_ref {
            if let (Some(arg), Some(value)) = (args.get(position), values.get_mut(position)) {
                self.assign(arg, std::mem::take(value), scope)?;
            }
        }
        Ok(result)
    }

    fn call_method(object: Value, method: &str, args: &[Value]) -> Eval {
        let Value::Object(object) = object else {
            return Err(throw(
                "Error",
                format!(
                    "Call to a member function {method}() on {}",
                    object.type_name()
                ),
            ));
        };
        if !args.is_empty() {
            return Err(throw(
                "ArgumentCountError",
                format!(
                    "{}::{method}() expects exactly 0 arguments, {} given",
                    object.class,
                    args.len()
                ),
            ));
        }
        match method.to_ascii_lowercase().as_str() {
            "getmessage" => Ok(Value::Str(object.message)),
            "getcode" => Ok(Value::Int(object.code)),
            "getprevious" => Ok(object
                .previous
                .map_or(Value::Null, Value::Object)),
            "getline" => Ok(Value::Int(0)),
            "getfile" => Ok(Value::Str(String::new())),
            "gettrace" => Ok(Value::Array(PhpArray::new())),
            "gettraceasstring" => Ok(Value::from("#0 {main}")),
            "__tostring" => Ok(Value::Str(Value::Object(object).to_php_string())),
            _ => Err(throw(
                "Error",
                format!("Call to undefined method {}::{method}()", object.class),
            )),
        }
    }

    fn instantiate(class: &str, args: Vec<Value>) -> Eval {
        let Some(canonical) = exception_class(class) else {
            return Err(throw("Error", format!("Class \"{class}\" not found")));
        };
        if canonical == "Throwable" {
            return Err(throw("Error", "Cannot instantiate interface Throwable"));
        }
        let mut args = args.into_iter();
        let message = args.next().map(|m| m.to_php_string()).unwrap_or_default();
        let code = args.next().map_or(0, |c| c.to_int());
        let previous = match args.next() {
            Some(Value::Object(previous)) => Some(previous),
            _ => None,
        };
        Ok(Value::Object(Box::new(ObjectValue {
            class: canonical.to_string(),
            message,
            code,
            previous,
        })))
    }
}
