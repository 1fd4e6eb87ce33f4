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

//! Runtime values of record scripts.
//!
//! Arrays are ordered maps with integer or string keys and value semantics:
//! assigning an array copies it. Loose comparison follows the PHP 8 rules
//! (numeric strings compare as numbers, non-numeric strings compare as text).

use indexmap::IndexMap;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArrayKey {
    Int(i64),
    Str(String),
}

impl ArrayKey {
    /// Canonical decimal integer strings become integer keys.
    pub fn from_string(s: &str) -> Self {
        let digits = s.strip_prefix('-').unwrap_or(s);
        let canonical = !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && (!digits.starts_with('0') || (digits == "0" && digits.len() == s.len()));
        if canonical {
            if let Ok(i) = s.parse::<i64>() {
                return Self::Int(i);
            }
        }
        Self::Str(s.to_string())
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(Self::Str(String::new())),
            Value::Bool(b) => Ok(Self::Int(i64::from(*b))),
            Value::Int(i) => Ok(Self::Int(*i)),
            Value::Float(f) => Ok(Self::Int(float_to_int(*f))),
            Value::Str(s) => Ok(Self::from_string(s)),
            Value::Array(_) => Err("Illegal offset type: array".to_string()),
            Value::Object(o) => Err(format!("Illegal offset type: {}", o.class)),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(i) => Value::Int(*i),
            Self::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for ArrayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ArrayKey {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for ArrayKey {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}

pub const NEXT_ELEMENT_OCCUPIED: &str = "Cannot add element to the array as the next element is already occupied";

#[derive(Debug, Clone, Default)]
pub struct PhpArray {
    entries: IndexMap<ArrayKey, Value>,
    next_index: i64,
}

impl PhpArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(values: impl IntoIterator<Item = Value>) -> Self {
        let mut array = Self::new();
        for value in values {
            array.push(value);
        }
        array
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &ArrayKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &ArrayKey) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &ArrayKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&ArrayKey::from_string(key))
    }

    /// Existing keys keep their position.
    pub fn insert(&mut self, key: ArrayKey, value: Value) {
        if let ArrayKey::Int(i) = key {
            if i >= self.next_index {
                self.next_index = i.saturating_add(1);
            }
        }
        self.entries.insert(key, value);
    }

    /// Key for the next append, or `None` once `PHP_INT_MAX` is taken.
    pub fn next_key(&self) -> Option<ArrayKey> {
        let key = ArrayKey::Int(self.next_index);
        (!self.entries.contains_key(&key)).then_some(key)
    }

    /// Appends under the next integer key; `false` when that key is taken.
    pub fn try_push(&mut self, value: Value) -> bool {
        let Some(key) = self.next_key() else {
            return false;
        };
        self.insert(key, value);
        true
    }

    /// Appends to lists built up from key zero, which cannot run out of keys.
    pub fn push(&mut self, value: Value) {
        let pushed = self.try_push(value);
        debug_assert!(pushed, "append to an exhausted array");
    }

    /// Slot for `$a[] = ...`.
    pub fn push_slot(&mut self) -> Option<&mut Value> {
        let key = self.next_key()?;
        self.insert(key.clone(), Value::Null);
        Some(self.entries.entry(key).or_default())
    }

    pub fn slot(&mut self, key: ArrayKey) -> &mut Value {
        if !self.entries.contains_key(&key) {
            self.insert(key.clone(), Value::Null);
        }
        self.entries.entry(key).or_default()
    }

    pub fn remove(&mut self, key: &ArrayKey) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ArrayKey, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ArrayKey> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    pub fn first(&self) -> Option<(&ArrayKey, &Value)> {
        self.entries.first()
    }

    pub fn last(&self) -> Option<(&ArrayKey, &Value)> {
        self.entries.last()
    }

    pub fn is_list(&self) -> bool {
        self.entries
            .keys()
            .enumerate()
            .all(|(i, k)| matches!(k, ArrayKey::Int(n) if usize::try_from(*n).is_ok_and(|n| n == i)))
    }

    pub fn pop(&mut self) -> Option<Value> {
        let popped = self.entries.pop().map(|(_, v)| v);
        self.reset_next_index();
        popped
    }

    /// Removes the first element and renumbers integer keys.
    pub fn shift(&mut self) -> Option<Value> {
        let shifted = self.entries.shift_remove_index(0).map(|(_, v)| v);
        *self = self.renumbered();
        shifted
    }

    pub fn unshift(&mut self, values: Vec<Value>) {
        let mut out = Self::from_list(values);
        for (key, value) in self.renumbered().entries {
            match key {
                ArrayKey::Int(_) => out.push(value),
                key => out.insert(key, value),
            }
        }
        *self = out;
    }

    /// Copy with integer keys renumbered from zero; string keys are kept.
    pub fn renumbered(&self) -> Self {
        let mut out = Self::new();
        for (key, value) in &self.entries {
            match key {
                ArrayKey::Int(_) => out.push(value.clone()),
                key => out.insert(key.clone(), value.clone()),
            }
        }
        out
    }

    fn reset_next_index(&mut self) {
        self.next_index = self
            .entries
            .keys()
            .filter_map(|k| match k {
                ArrayKey::Int(i) => Some(i.saturating_add(1)),
                ArrayKey::Str(_) => None,
            })
            .max()
            .unwrap_or(0)
            .max(0);
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&ArrayKey, &Value) -> bool) {
        self.entries.retain(|k, v| keep(k, v));
    }

    pub fn sort_by(&mut self, compare: impl FnMut(&ArrayKey, &Value, &ArrayKey, &Value) -> Ordering) {
        self.entries.sort_by(compare);
    }
}

impl FromIterator<(ArrayKey, Value)> for PhpArray {
    fn from_iter<T: IntoIterator<Item = (ArrayKey, Value)>>(iter: T) -> Self {
        let mut array = Self::new();
        for (key, value) in iter {
            array.insert(key, value);
        }
        array
    }
}

impl IntoIterator for PhpArray {
    type Item = (ArrayKey, Value);
    type IntoIter = indexmap::map::IntoIter<ArrayKey, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A thrown or constructed exception object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectValue {
    pub class: String,
    pub message: String,
    pub code: i64,
    pub previous: Option<Box<ObjectValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Int(i) => Value::Int(i),
            Self::Float(f) => Value::Float(f),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(PhpArray),
    Object(Box<ObjectValue>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.identical(other)
    }
}

const WHITESPACE: &[char] = &[' ', '\t', '\n', '\r', '\u{0b}', '\u{0c}'];

/// Scans a numeric prefix; returns the number and the byte length consumed.
fn scan_number(s: &str) -> Option<(Number, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_start = i;
    while bytes.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let int_digits = i - int_start;
    let mut is_float = false;
    if bytes.get(i) == Some(&b'.') && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
        is_float = true;
        i += 1;
        while bytes.get(i).is_some_and(u8::is_ascii_digit) {
            i += 1;
        }
    } else if bytes.get(i) == Some(&b'.') && int_digits > 0 {
        is_float = true;
        i += 1;
    }
    if int_digits == 0 && !is_float {
        return None;
    }
    if matches!(bytes.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(u8::is_ascii_digit) {
            while bytes.get(j).is_some_and(u8::is_ascii_digit) {
                j += 1;
            }
            is_float = true;
            i = j;
        }
    }
    let text = &s[..i];
    if !is_float {
        if let Ok(n) = text.parse::<i64>() {
            return Some((Number::Int(n), i));
        }
    }
    text.parse::<f64>().ok().map(|f| (Number::Float(f), i))
}

/// Whole-string numeric check; surrounding whitespace is allowed.
pub fn parse_numeric(s: &str) -> Option<Number> {
    let trimmed = s.trim_start_matches(WHITESPACE);
    let (number, used) = scan_number(trimmed)?;
    trimmed[used..]
        .trim_end_matches(WHITESPACE)
        .is_empty()
        .then_some(number)
}

/// Leading numeric prefix, or zero.
pub fn numeric_prefix(s: &str) -> Number {
    scan_number(s.trim_start_matches(WHITESPACE)).map_or(Number::Int(0), |(n, _)| n)
}

pub fn float_to_int(f: f64) -> i64 {
    if !f.is_finite() {
        return 0;
    }
    let t = f.trunc();
    if t >= i64::MAX as f64 || t < i64::MIN as f64 {
        0
    } else {
        t as i64
    }
}

/// Renders a float the way PHP does with `precision=14`.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NAN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let sci = format!("{f:.13e}");
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..14).contains(&exponent) {
        let mut mantissa = trim_fraction(mantissa).to_string();
        if !mantissa.contains('.') {
            mantissa.push_str(".0");
        }
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{mantissa}E{sign}{}", exponent.abs());
    }
    let decimals = usize::try_from(13 - exponent).unwrap_or(0);
    trim_fraction(&format!("{f:.decimals$}")).to_string()
}

fn trim_fraction(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Object(o) => &o.class,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_array(&self) -> Option<&PhpArray> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !(s.is_empty() || s == "0"),
            Self::Array(a) => !a.is_empty(),
            Self::Object(_) => true,
        }
    }

    pub fn to_number(&self) -> Number {
        match self {
            Self::Null => Number::Int(0),
            Self::Bool(b) => Number::Int(i64::from(*b)),
            Self::Int(i) => Number::Int(*i),
            Self::Float(f) => Number::Float(*f),
            Self::Str(s) => numeric_prefix(s),
            Self::Array(a) => Number::Int(i64::from(!a.is_empty())),
            Self::Object(_) => Number::Int(1),
        }
    }

    pub fn to_int(&self) -> i64 {
        match self.to_number() {
            Number::Int(i) => i,
            Number::Float(f) => float_to_int(f),
        }
    }

    pub fn to_float(&self) -> f64 {
        self.to_number().to_f64()
    }

    pub fn to_php_string(&self) -> String {
        match self {
            Self::Null | Self::Bool(false) => String::new(),
            Self::Bool(true) => "1".to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => format_float(*f),
            Self::Str(s) => s.clone(),
            Self::Array(_) => "Array".to_string(),
            Self::Object(o) => format!("{}: {}", o.class, o.message),
        }
    }

    /// Number for operands that are numbers or numeric strings.
    fn numeric_operand(&self) -> Option<Number> {
        match self {
            Self::Int(i) => Some(Number::Int(*i)),
            Self::Float(f) => Some(Number::Float(*f)),
            Self::Str(s) => parse_numeric(s),
            _ => None,
        }
    }

    pub fn identical(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.identical(vb))
            }
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }

    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(b), v) | (v, Self::Bool(b)) => *b == v.to_bool(),
            (Self::Null, Self::Str(s)) | (Self::Str(s), Self::Null) => s.is_empty(),
            (Self::Null, v) | (v, Self::Null) => !v.to_bool(),
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                self.to_float() == other.to_float()
            }
            (Self::Str(s), n @ (Self::Int(_) | Self::Float(_)))
            | (n @ (Self::Int(_) | Self::Float(_)), Self::Str(s)) => match parse_numeric(s) {
                Some(parsed) => numbers_equal(parsed, n.to_number()),
                None => *s == n.to_php_string(),
            },
            (Self::Str(a), Self::Str(b)) => match (parse_numeric(a), parse_numeric(b)) {
                (Some(x), Some(y)) => numbers_equal(x, y),
                _ => a == b,
            },
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.loose_eq(w)))
            }
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Object(o), Self::Str(s)) | (Self::Str(s), Self::Object(o)) => {
                format!("{}: {}", o.class, o.message) == *s
            }
            _ => false,
        }
    }

    /// Loose ordering; `None` when the operands are not comparable.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Bool(_), _) | (_, Self::Bool(_)) | (Self::Null, _) | (_, Self::Null)
                if !matches!((self, other), (Self::Null, Self::Str(_)) | (Self::Str(_), Self::Null)) =>
            {
                Some(self.to_bool().cmp(&other.to_bool()))
            }
            (Self::Null, Self::Str(s)) => Some("".cmp(s.as_str())),
            (Self::Str(s), Self::Null) => Some(s.as_str().cmp("")),
            (Self::Str(a), Self::Str(b)) => match (parse_numeric(a), parse_numeric(b)) {
                (Some(x), Some(y)) => compare_numbers(x, y),
                _ => Some(a.as_bytes().cmp(b.as_bytes())),
            },
            (Self::Array(a), Self::Array(b)) => {
                if a.len() != b.len() {
                    return Some(a.len().cmp(&b.len()));
                }
                for (key, value) in a.iter() {
                    let theirs = b.get(key)?;
                    match value.compare(theirs)? {
                        Ordering::Equal => {}
                        unequal => return Some(unequal),
                    }
                }
                Some(Ordering::Equal)
            }
            (Self::Array(_), _) => Some(Ordering::Greater),
            (_, Self::Array(_)) => Some(Ordering::Less),
            (Self::Object(a), Self::Object(b)) => (a == b).then_some(Ordering::Equal),
            (Self::Object(_), _) | (_, Self::Object(_)) => None,
            _ => match (self.numeric_operand(), other.numeric_operand()) {
                (Some(x), Some(y)) => compare_numbers(x, y),
                _ => Some(
                    self.to_php_string()
                        .as_bytes()
                        .cmp(other.to_php_string().as_bytes()),
                ),
            },
        }
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(*b),
            Json::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(0.0)),
                Self::Int,
            ),
            Json::String(s) => Self::Str(s.clone()),
            Json::Array(items) => Self::Array(PhpArray::from_list(items.iter().map(Self::from_json))),
            Json::Object(map) => Self::Array(
                map.iter()
                    .map(|(k, v)| (ArrayKey::from_string(k), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// List-shaped arrays become JSON arrays, other arrays become objects.
    pub fn to_json(&self) -> Json {
        match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Int(i) => Json::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Json::Null, Json::Number),
            Self::Str(s) => Json::String(s.clone()),
            Self::Array(a) if a.is_list() => Json::Array(a.values().map(Self::to_json).collect()),
            Self::Array(a) => Json::Object(
                a.iter()
                    .map(|(k, v)| (k.to_string(), v.to_json()))
                    .collect::<Map<String, Json>>(),
            ),
            Self::Object(_) => Json::Object(Map::new()),
        }
    }
}

fn numbers_equal(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x == y,
        _ => a.to_f64() == b.to_f64(),
    }
}

fn compare_numbers(a: Number, b: Number) -> Option<Ordering> {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
        _ => a.to_f64().partial_cmp(&b.to_f64()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_php_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<PhpArray> for Value {
    fn from(a: PhpArray) -> Self {
        Self::Array(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_normalisation() {
        assert_eq!(ArrayKey::from_string("12"), ArrayKey::Int(12));
        assert_eq!(ArrayKey::from_string("-3"), ArrayKey::Int(-3));
        assert_eq!(ArrayKey::from_string("0"), ArrayKey::Int(0));
        assert_eq!(ArrayKey::from_string("012"), ArrayKey::Str("012".into()));
        assert_eq!(ArrayKey::from_string("-0"), ArrayKey::Str("-0".into()));
        assert_eq!(ArrayKey::from_string("1.5"), ArrayKey::Str("1.5".into()));
    }

    #[test]
    fn test_append_after_max_key_is_refused() {
        let mut a = PhpArray::new();
        a.insert(ArrayKey::Int(i64::MAX), Value::Int(1));
        assert_eq!(a.next_key(), None);
        assert!(!a.try_push(Value::Int(2)));
        assert!(a.push_slot().is_none());
        assert_eq!(a.get(&ArrayKey::Int(i64::MAX)), Some(&Value::Int(1)));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_push_follows_highest_int_key() {
        let mut a = PhpArray::new();
        a.insert(ArrayKey::Int(5), Value::from("five"));
        a.insert(ArrayKey::from("x"), Value::from("x"));
        a.push(Value::from("six"));
        assert!(a.contains_key(&ArrayKey::Int(6)));
        a.pop();
        a.push(Value::from("again"));
        assert!(a.contains_key(&ArrayKey::Int(6)));
    }

    #[test]
    fn test_shift_renumbers() {
        let mut a = PhpArray::from_list([Value::from(1), Value::from(2), Value::from(3)]);
        assert_eq!(a.shift(), Some(Value::from(1)));
        assert_eq!(a.keys().cloned().collect::<Vec<_>>(), vec![ArrayKey::Int(0), ArrayKey::Int(1)]);
    }

    #[test]
    fn test_loose_equality_php8() {
        assert!(Value::from(0).loose_eq(&Value::from("0")));
        assert!(!Value::from(0).loose_eq(&Value::from("abc")));
        assert!(Value::from("1e1").loose_eq(&Value::from("10")));
        assert!(Value::Null.loose_eq(&Value::from(false)));
        assert!(Value::Null.loose_eq(&Value::from("")));
        assert!(!Value::from("abc").loose_eq(&Value::from("ABC")));
        assert!(Value::from(1.0).loose_eq(&Value::from(1)));
    }

    #[test]
    fn test_identity_is_strict() {
        assert!(!Value::from(1).identical(&Value::from(1.0)));
        assert!(!Value::from("1").identical(&Value::from(1)));
        let a = Value::from_json(&json!({"a": 1, "b": 2}));
        let b = Value::from_json(&json!({"b": 2, "a": 1}));
        assert!(a.loose_eq(&b));
        assert!(!a.identical(&b));
    }

    #[test]
    fn test_compare() {
        assert_eq!(Value::from("10").compare(&Value::from("9")), Some(Ordering::Greater));
        assert_eq!(Value::from("abc").compare(&Value::from("abd")), Some(Ordering::Less));
        assert_eq!(Value::from(2).compare(&Value::from("2.0")), Some(Ordering::Equal));
    }

    #[test]
    fn test_numeric_strings() {
        assert_eq!(parse_numeric(" 42 "), Some(Number::Int(42)));
        assert_eq!(parse_numeric("1.5e3"), Some(Number::Float(1500.0)));
        assert_eq!(parse_numeric(".5"), Some(Number::Float(0.5)));
        assert_eq!(parse_numeric("12abc"), None);
        assert_eq!(numeric_prefix("12abc"), Number::Int(12));
        assert_eq!(Value::from("abc").to_int(), 0);
    }

    #[test]
    fn test_float_format() {
        assert_eq!(format_float(0.1 + 0.2), "0.3");
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(-1.5), "-1.5");
        assert_eq!(format_float(1e20), "1.0E+20");
        assert_eq!(format_float(0.00001), "1.0E-5");
        assert_eq!(format_float(123456.789), "123456.789");
    }

    #[test]
    fn test_json_conversion() {
        let record = json!({"identifier": "7", "tags": ["a", "b"], "price": 9.5, "qty": 3});
        let value = Value::from_json(&record);
        let Value::Array(array) = &value else {
            panic!("expected array");
        };
        assert_eq!(array.get_str("qty"), Some(&Value::Int(3)));
        assert_eq!(value.to_json(), record);
        assert_eq!(Value::Array(PhpArray::new()).to_json(), json!([]));
    }
}
