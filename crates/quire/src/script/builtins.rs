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

//! The fixed builtin library available to record scripts.
//!
//! Nothing here touches the filesystem, network, processes or the host
//! environment. Callback-taking functions are absent because scripts have no
//! first-class callables.

use super::ast::BinaryOp;
use super::interpreter::{arithmetic, exception_class, throw, Fault, Limits, RuntimeError};
use super::value::{float_to_int, format_float, parse_numeric, ArrayKey, Number, PhpArray, Value, NEXT_ELEMENT_OCCUPIED};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex, RegexBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;

pub(crate) struct BuiltinContext<'a> {
    pub limits: &'a Limits,
}

type Outcome = Result<Value, Fault>;
pub(crate) type BuiltinFn = fn(&BuiltinContext<'_>, &mut [Value]) -> Outcome;

pub(crate) struct Builtin {
    pub name: &'static str,
    pub min_args: usize,
    pub max_args: usize,
    /// Argument positions written back to the caller's variable.
    pub by_ref: &'static [usize],
    pub func: BuiltinFn,
}

impl Builtin {
    pub fn arity_message(&self, given: usize) -> String {
        let (qualifier, count) = if self.min_args == self.max_args {
            ("exactly", self.min_args)
        } else if given < self.min_args {
            ("at least", self.min_args)
        } else {
            ("at most", self.max_args)
        };
        let noun = if count == 1 { "argument" } else { "arguments" };
        format!("{}() expects {qualifier} {count} {noun}, {given} given", self.name)
    }
}

const VARIADIC: usize = usize::MAX;

const fn f(name: &'static str, min_args: usize, max_args: usize, func: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args,
        max_args,
        by_ref: &[],
        func,
    }
}

const fn r(name: &'static str, min_args: usize, max_args: usize, by_ref: &'static [usize], func: BuiltinFn) -> Builtin {
    Builtin {
        name,
        min_args,
        max_args,
        by_ref,
        func,
    }
}

static TABLE: &[Builtin] = &[
    // strings
    f("strlen", 1, 1, strlen),
    f("mb_strlen", 1, 2, mb_strlen),
    f("strtolower", 1, 1, strtolower),
    f("strtoupper", 1, 1, strtoupper),
    f("mb_strtolower", 1, 2, mb_strtolower),
    f("mb_strtoupper", 1, 2, mb_strtoupper),
    f("ucfirst", 1, 1, ucfirst),
    f("lcfirst", 1, 1, lcfirst),
    f("ucwords", 1, 2, ucwords),
    f("trim", 1, 2, trim),
    f("ltrim", 1, 2, ltrim),
    f("rtrim", 1, 2, rtrim),
    f("chop", 1, 2, rtrim),
    f("str_replace", 3, 3, str_replace),
    f("str_ireplace", 3, 3, str_ireplace),
    f("substr", 2, 3, substr),
    f("mb_substr", 2, 4, substr),
    f("strpos", 2, 3, strpos),
    f("stripos", 2, 3, stripos),
    f("strrpos", 2, 2, strrpos),
    f("str_contains", 2, 2, str_contains),
    f("str_starts_with", 2, 2, str_starts_with),
    f("str_ends_with", 2, 2, str_ends_with),
    f("str_repeat", 2, 2, str_repeat),
    f("str_pad", 2, 4, str_pad),
    f("str_split", 1, 2, str_split),
    f("explode", 2, 3, explode),
    f("implode", 1, 2, implode),
    f("join", 1, 2, implode),
    f("sprintf", 1, VARIADIC, sprintf),
    f("number_format", 1, 4, number_format),
    f("strrev", 1, 1, strrev),
    f("strcmp", 2, 2, strcmp),
    f("strcasecmp", 2, 2, strcasecmp),
    f("substr_count", 2, 2, substr_count),
    f("nl2br", 1, 1, nl2br),
    f("addslashes", 1, 1, addslashes),
    f("ctype_digit", 1, 1, ctype_digit),
    f("ctype_alpha", 1, 1, ctype_alpha),
    f("md5", 1, 1, md5_hex),
    f("htmlspecialchars", 1, 4, htmlspecialchars),
    f("htmlspecialchars_decode", 1, 2, htmlspecialchars_decode),
    f("html_entity_decode", 1, 3, htmlspecialchars_decode),
    f("strip_tags", 1, 2, strip_tags),
    f("sanitize_text_field", 1, 1, sanitize_text_field),
    // regex
    r("preg_match", 2, 3, &[2], preg_match),
    r("preg_match_all", 2, 3, &[2], preg_match_all),
    f("preg_split", 2, 4, preg_split),
    f("preg_quote", 1, 2, preg_quote),
    // arrays
    f("count", 1, 2, count),
    f("sizeof", 1, 2, count),
    f("array_keys", 1, 2, array_keys),
    f("array_values", 1, 1, array_values),
    f("array_merge", 0, VARIADIC, array_merge),
    f("array_combine", 2, 2, array_combine),
    f("array_flip", 1, 1, array_flip),
    f("array_slice", 2, 4, array_slice),
    f("array_reverse", 1, 2, array_reverse),
    f("array_unique", 1, 1, array_unique),
    f("array_key_exists", 2, 2, array_key_exists),
    f("key_exists", 2, 2, array_key_exists),
    f("in_array", 2, 3, in_array),
    f("array_search", 2, 3, array_search),
    f("array_sum", 1, 1, array_sum),
    f("array_product", 1, 1, array_product),
    f("array_fill", 3, 3, array_fill),
    f("array_fill_keys", 2, 2, array_fill_keys),
    f("array_pad", 3, 3, array_pad),
    f("array_column", 2, 3, array_column),
    f("array_chunk", 2, 3, array_chunk),
    f("array_filter", 1, 1, array_filter),
    f("array_count_values", 1, 1, array_count_values),
    f("array_diff", 1, VARIADIC, array_diff),
    f("array_diff_key", 1, VARIADIC, array_diff_key),
    f("array_intersect", 1, VARIADIC, array_intersect),
    f("array_intersect_key", 1, VARIADIC, array_intersect_key),
    f("array_key_first", 1, 1, array_key_first),
    f("array_key_last", 1, 1, array_key_last),
    f("array_is_list", 1, 1, array_is_list),
    f("range", 2, 3, range),
    r("sort", 1, 2, &[0], sort),
    r("rsort", 1, 2, &[0], rsort),
    r("asort", 1, 2, &[0], asort),
    r("arsort", 1, 2, &[0], arsort),
    r("ksort", 1, 2, &[0], ksort),
    r("krsort", 1, 2, &[0], krsort),
    r("array_push", 1, VARIADIC, &[0], array_push),
    r("array_pop", 1, 1, &[0], array_pop),
    r("array_shift", 1, 1, &[0], array_shift),
    r("array_unshift", 1, VARIADIC, &[0], array_unshift),
    r("reset", 1, 1, &[0], reset),
    r("end", 1, 1, &[0], end),
    // math
    f("abs", 1, 1, abs),
    f("ceil", 1, 1, ceil),
    f("floor", 1, 1, floor),
    f("round", 1, 2, round),
    f("sqrt", 1, 1, sqrt),
    f("pow", 2, 2, pow),
    f("intdiv", 2, 2, intdiv),
    f("fmod", 2, 2, fmod),
    f("max", 1, VARIADIC, max),
    f("min", 1, VARIADIC, min),
    f("pi", 0, 0, pi),
    f("log", 1, 2, log),
    f("exp", 1, 1, exp),
    f("is_nan", 1, 1, is_nan),
    f("is_finite", 1, 1, is_finite),
    f("is_infinite", 1, 1, is_infinite),
    f("dechex", 1, 1, dechex),
    f("hexdec", 1, 1, hexdec),
    // types
    f("gettype", 1, 1, gettype),
    f("get_debug_type", 1, 1, get_debug_type),
    f("get_class", 1, 1, get_class),
    f("is_int", 1, 1, is_int),
    f("is_integer", 1, 1, is_int),
    f("is_long", 1, 1, is_int),
    f("is_float", 1, 1, is_float),
    f("is_double", 1, 1, is_float),
    f("is_string", 1, 1, is_string),
    f("is_bool", 1, 1, is_bool),
    f("is_array", 1, 1, is_array),
    f("is_numeric", 1, 1, is_numeric),
    f("is_null", 1, 1, is_null),
    f("is_scalar", 1, 1, is_scalar),
    f("is_object", 1, 1, is_object),
    f("intval", 1, 2, intval),
    f("floatval", 1, 1, floatval),
    f("doubleval", 1, 1, floatval),
    f("strval", 1, 1, strval),
    f("boolval", 1, 1, boolval),
    // json
    f("json_encode", 1, 3, json_encode),
    f("json_decode", 1, 4, json_decode),
    // date and time, always UTC
    f("time", 0, 0, time),
    f("microtime", 0, 1, microtime),
    f("date", 1, 2, date),
    f("gmdate", 1, 2, date),
    f("strtotime", 1, 2, strtotime),
    f("checkdate", 3, 3, checkdate),
    f("date_default_timezone_get", 0, 0, date_default_timezone_get),
];

/// Interpreter-level functions that look like builtins to scripts.
const INTRINSICS: &[&str] = &["function_exists"];

static INDEX: Lazy<HashMap<&'static str, &'static Builtin>> =
    Lazy::new(|| TABLE.iter().map(|builtin| (builtin.name, builtin)).collect());

pub(crate) fn lookup(lowered: &str) -> Option<&'static Builtin> {
    INDEX.get(lowered).copied()
}

/// Whether `name` (case-insensitive) is a callable provided by the runtime.
pub fn is_builtin(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    INDEX.contains_key(lowered.as_str()) || INTRINSICS.contains(&lowered.as_str())
}

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|builtin| builtin.name).chain(INTRINSICS.iter().copied())
}

pub const JSON_HEX_TAG: i64 = 1;
pub const JSON_HEX_AMP: i64 = 2;
pub const JSON_HEX_APOS: i64 = 4;
pub const JSON_HEX_QUOT: i64 = 8;
pub const JSON_FORCE_OBJECT: i64 = 16;
pub const JSON_UNESCAPED_SLASHES: i64 = 64;
pub const JSON_PRETTY_PRINT: i64 = 128;
pub const JSON_UNESCAPED_UNICODE: i64 = 256;
pub const JSON_THROW_ON_ERROR: i64 = 4_194_304;

const ENT_COMPAT: i64 = 2;
const ENT_QUOTES: i64 = 3;
const SORT_NUMERIC: i64 = 1;
const SORT_STRING: i64 = 2;
const SORT_FLAG_CASE: i64 = 8;
const STR_PAD_LEFT: i64 = 0;
const STR_PAD_RIGHT: i64 = 1;
const STR_PAD_BOTH: i64 = 2;
const PREG_SPLIT_NO_EMPTY: i64 = 1;

pub(crate) fn constant(name: &str) -> Option<Value> {
    let value = match name {
        "PHP_EOL" => Value::from("\n"),
        "PHP_INT_MAX" => Value::Int(i64::MAX),
        "PHP_INT_MIN" => Value::Int(i64::MIN),
        "PHP_INT_SIZE" => Value::Int(8),
        "PHP_FLOAT_EPSILON" => Value::Float(f64::EPSILON),
        "PHP_FLOAT_MAX" => Value::Float(f64::MAX),
        "PHP_FLOAT_MIN" => Value::Float(f64::MIN_POSITIVE),
        "NAN" => Value::Float(f64::NAN),
        "INF" => Value::Float(f64::INFINITY),
        "M_PI" => Value::Float(std::f64::consts::PI),
        "M_E" => Value::Float(std::f64::consts::E),
        "M_SQRT2" => Value::Float(std::f64::consts::SQRT_2),
        "JSON_HEX_TAG" => Value::Int(JSON_HEX_TAG),
        "JSON_HEX_AMP" => Value::Int(JSON_HEX_AMP),
        "JSON_HEX_APOS" => Value::Int(JSON_HEX_APOS),
        "JSON_HEX_QUOT" => Value::Int(JSON_HEX_QUOT),
        "JSON_FORCE_OBJECT" => Value::Int(JSON_FORCE_OBJECT),
        "JSON_UNESCAPED_SLASHES" => Value::Int(JSON_UNESCAPED_SLASHES),
        "JSON_PRETTY_PRINT" => Value::Int(JSON_PRETTY_PRINT),
        "JSON_UNESCAPED_UNICODE" => Value::Int(JSON_UNESCAPED_UNICODE),
        "JSON_THROW_ON_ERROR" => Value::Int(JSON_THROW_ON_ERROR),
        "ENT_NOQUOTES" | "ENT_HTML401" => Value::Int(0),
        "ENT_COMPAT" => Value::Int(ENT_COMPAT),
        "ENT_QUOTES" => Value::Int(ENT_QUOTES),
        "ENT_SUBSTITUTE" => Value::Int(8),
        "ENT_HTML5" => Value::Int(48),
        "SORT_REGULAR" => Value::Int(0),
        "SORT_NUMERIC" => Value::Int(SORT_NUMERIC),
        "SORT_STRING" => Value::Int(SORT_STRING),
        "SORT_FLAG_CASE" => Value::Int(SORT_FLAG_CASE),
        "COUNT_NORMAL" => Value::Int(0),
        "COUNT_RECURSIVE" => Value::Int(1),
        "STR_PAD_LEFT" => Value::Int(STR_PAD_LEFT),
        "STR_PAD_RIGHT" => Value::Int(STR_PAD_RIGHT),
        "STR_PAD_BOTH" => Value::Int(STR_PAD_BOTH),
        "PREG_SPLIT_NO_EMPTY" => Value::Int(PREG_SPLIT_NO_EMPTY),
        "DATE_ATOM" | "DATE_RFC3339" => Value::from("Y-m-d\\TH:i:sP"),
        _ => return None,
    };
    Some(value)
}

static NULL: Value = Value::Null;

fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&NULL)
}

fn int_arg(args: &[Value], i: usize, default: i64) -> i64 {
    args.get(i).map_or(default, Value::to_int)
}

fn float_arg(args: &[Value], i: usize) -> f64 {
    arg(args, i).to_float()
}

fn type_error(func: &str, i: usize, expected: &str, given: &Value) -> Fault {
    throw(
        "TypeError",
        format!(
            "{func}(): Argument #{} must be of type {expected}, {} given",
            i + 1,
            given.type_name()
        ),
    )
}

fn value_error(func: &str, message: &str) -> Fault {
    throw("ValueError", format!("{func}(): {message}"))
}

fn too_large(what: &str) -> Fault {
    Fault::Fatal(RuntimeError::MemoryLimit(what.to_string()))
}

fn text(args: &[Value], i: usize, func: &str) -> Result<String, Fault> {
    match arg(args, i) {
        v @ (Value::Array(_) | Value::Object(_)) => Err(type_error(func, i, "string", v)),
        v => Ok(v.to_php_string()),
    }
}

fn opt_text(args: &[Value], i: usize, func: &str, default: &str) -> Result<String, Fault> {
    if args.len() > i {
        text(args, i, func)
    } else {
        Ok(default.to_string())
    }
}

fn array<'a>(args: &'a [Value], i: usize, func: &str) -> Result<&'a PhpArray, Fault> {
    match arg(args, i) {
        Value::Array(array) => Ok(array),
        other => Err(type_error(func, i, "array", other)),
    }
}

fn array_mut<'a>(args: &'a mut [Value], i: usize, func: &str) -> Result<&'a mut PhpArray, Fault> {
    match args.get_mut(i) {
        Some(Value::Array(array)) => Ok(array),
        other => {
            let given = other.map_or(Value::Null, |v| v.clone());
            Err(type_error(func, i, "array", &given))
        }
    }
}

fn check_len(limits: &Limits, len: usize) -> Result<(), Fault> {
    if len > limits.max_array_len {
        return Err(too_large(&format!("array exceeds {} elements", limits.max_array_len)));
    }
    Ok(())
}

fn check_bytes(limits: &Limits, len: usize) -> Result<(), Fault> {
    if len > limits.max_string_bytes {
        return Err(too_large(&format!("string exceeds {} bytes", limits.max_string_bytes)));
    }
    Ok(())
}

/// Char-based start/length window with PHP's negative offset rules.
fn window(len: usize, start: i64, length: Option<i64>) -> (usize, usize) {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let from = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let to = match length {
        None => len,
        Some(l) if l < 0 => (len + l).max(from),
        Some(l) => from.saturating_add(l).min(len),
    };
    (
        usize::try_from(from).unwrap_or(0),
        usize::try_from(to).unwrap_or(0),
    )
}

// ---- strings

fn strlen(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Int(text(args, 0, "strlen")?.len() as i64))
}

fn mb_strlen(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Int(text(args, 0, "mb_strlen")?.chars().count() as i64))
}

fn strtolower(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "strtolower")?.to_ascii_lowercase()))
}

fn strtoupper(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "strtoupper")?.to_ascii_uppercase()))
}

fn mb_strtolower(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "mb_strtolower")?.to_lowercase()))
}

fn mb_strtoupper(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "mb_strtoupper")?.to_uppercase()))
}

fn map_first(s: &str, map: impl Fn(char) -> char) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => std::iter::once(map(first)).chain(chars).collect(),
        None => String::new(),
    }
}

fn ucfirst(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(map_first(&text(args, 0, "ucfirst")?, |c| c.to_ascii_uppercase())))
}

fn lcfirst(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(map_first(&text(args, 0, "lcfirst")?, |c| c.to_ascii_lowercase())))
}

fn ucwords(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "ucwords")?;
    let delimiters = opt_text(args, 1, "ucwords", " \t\r\n\x0c\x0b")?;
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        out.push(if at_word_start { c.to_ascii_uppercase() } else { c });
        at_word_start = delimiters.contains(c);
    }
    Ok(Value::Str(out))
}

const TRIM_DEFAULT: &str = " \n\r\t\x0b\0";

fn trim_set(args: &[Value], func: &str) -> Result<Vec<char>, Fault> {
    let chars = opt_text(args, 1, func, TRIM_DEFAULT)?;
    let chars: Vec<char> = chars.chars().collect();
    let mut set = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if let (Some('.'), Some('.'), Some(&end)) = (chars.get(i + 1), chars.get(i + 2), chars.get(i + 3)) {
            set.extend(chars[i]..=end);
            i += 4;
            continue;
        }
        set.push(chars[i]);
        i += 1;
    }
    Ok(set)
}

fn trim(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let set = trim_set(args, "trim")?;
    Ok(Value::from(text(args, 0, "trim")?.trim_matches(set.as_slice())))
}

fn ltrim(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let set = trim_set(args, "ltrim")?;
    Ok(Value::from(text(args, 0, "ltrim")?.trim_start_matches(set.as_slice())))
}

fn rtrim(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let set = trim_set(args, "rtrim")?;
    Ok(Value::from(text(args, 0, "rtrim")?.trim_end_matches(set.as_slice())))
}

fn replace_ci(haystack: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    let lower = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (at, _) in lower.match_indices(&needle) {
        out.push_str(&haystack[last..at]);
        out.push_str(replacement);
        last = at + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

fn replace_all(ctx: &BuiltinContext<'_>, args: &[Value], func: &str, insensitive: bool) -> Outcome {
    let pairs: Vec<(String, String)> = match (arg(args, 0), arg(args, 1)) {
        (Value::Array(search), Value::Array(replace)) => {
            let mut replacements = replace.values();
            search
                .values()
                .map(|s| {
                    let r = replacements.next().map(Value::to_php_string).unwrap_or_default();
                    (s.to_php_string(), r)
                })
                .collect()
        }
        (Value::Array(search), replace) => {
            let r = replace.to_php_string();
            search.values().map(|s| (s.to_php_string(), r.clone())).collect()
        }
        (_, Value::Array(_)) => {
            return Err(type_error(func, 1, "string when argument #1 ($search) is a string", arg(args, 1)));
        }
        (search, replace) => vec![(search.to_php_string(), replace.to_php_string())],
    };
    let apply = |subject: &str| -> Result<String, Fault> {
        let mut out = subject.to_string();
        for (search, replace) in &pairs {
            if search.is_empty() {
                continue;
            }
            out = if insensitive {
                replace_ci(&out, search, replace)
            } else {
                out.replace(search.as_str(), replace)
            };
            check_bytes(ctx.limits, out.len())?;
        }
        Ok(out)
    };
    match arg(args, 2) {
        Value::Array(subjects) => {
            let mut out = PhpArray::new();
            for (key, value) in subjects.iter() {
                out.insert(key.clone(), Value::Str(apply(&value.to_php_string())?));
            }
            Ok(Value::Array(out))
        }
        subject => Ok(Value::Str(apply(&subject.to_php_string())?)),
    }
}

fn str_replace(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    replace_all(ctx, args, "str_replace", false)
}

fn str_ireplace(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    replace_all(ctx, args, "str_ireplace", true)
}

fn substr(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "substr")?;
    let length = match arg(args, 2) {
        Value::Null => None,
        v => Some(v.to_int()),
    };
    let chars: Vec<char> = s.chars().collect();
    let (from, to) = window(chars.len(), int_arg(args, 1, 0), length);
    Ok(Value::Str(chars[from..to.max(from)].iter().collect()))
}

/// Char offset of a byte index.
fn char_offset(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

fn find(args: &[Value], func: &str, insensitive: bool) -> Outcome {
    let mut haystack = text(args, 0, func)?;
    let mut needle = text(args, 1, func)?;
    if insensitive {
        haystack = haystack.to_lowercase();
        needle = needle.to_lowercase();
    }
    let len = haystack.chars().count();
    let offset = int_arg(args, 2, 0);
    if offset.unsigned_abs() > len as u64 {
        return Err(value_error(func, "Argument #3 ($offset) must be contained in argument #1 ($haystack)"));
    }
    let (from, _) = window(len, offset, None);
    let start = haystack.char_indices().nth(from).map_or(haystack.len(), |(b, _)| b);
    Ok(haystack[start..]
        .find(&needle)
        .map_or(Value::Bool(false), |at| Value::Int(char_offset(&haystack, start + at))))
}

fn strpos(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    find(args, "strpos", false)
}

fn stripos(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    find(args, "stripos", true)
}

fn strrpos(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let haystack = text(args, 0, "strrpos")?;
    let needle = text(args, 1, "strrpos")?;
    Ok(haystack
        .rfind(&needle)
        .map_or(Value::Bool(false), |at| Value::Int(char_offset(&haystack, at))))
}

fn str_contains(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (h, n) = (text(args, 0, "str_contains")?, text(args, 1, "str_contains")?);
    Ok(Value::Bool(h.contains(&n)))
}

fn str_starts_with(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (h, n) = (text(args, 0, "str_starts_with")?, text(args, 1, "str_starts_with")?);
    Ok(Value::Bool(h.starts_with(&n)))
}

fn str_ends_with(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (h, n) = (text(args, 0, "str_ends_with")?, text(args, 1, "str_ends_with")?);
    Ok(Value::Bool(h.ends_with(&n)))
}

fn str_repeat(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "str_repeat")?;
    let times = int_arg(args, 1, 0);
    let Ok(times) = usize::try_from(times) else {
        return Err(value_error("str_repeat", "Argument #2 ($times) must be greater than or equal to 0"));
    };
    check_bytes(ctx.limits, s.len().saturating_mul(times))?;
    Ok(Value::Str(s.repeat(times)))
}

fn str_pad(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "str_pad")?;
    let target = usize::try_from(int_arg(args, 1, 0)).unwrap_or(0);
    let pad = opt_text(args, 2, "str_pad", " ")?;
    let mode = int_arg(args, 3, STR_PAD_RIGHT);
    if pad.is_empty() {
        return Err(value_error("str_pad", "Argument #3 ($pad_string) must be a non-empty string"));
    }
    check_bytes(ctx.limits, target)?;
    let current = s.chars().count();
    if target <= current {
        return Ok(Value::Str(s));
    }
    let missing = target - current;
    let fill = |n: usize| pad.chars().cycle().take(n).collect::<String>();
    let out = match mode {
        STR_PAD_LEFT => fill(missing) + &s,
        STR_PAD_BOTH => {
            let left = missing / 2;
            fill(left) + &s + &fill(missing - left)
        }
        _ => s + &fill(missing),
    };
    Ok(Value::Str(out))
}

fn str_split(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "str_split")?;
    let size = usize::try_from(int_arg(args, 1, 1)).unwrap_or(0);
    if size == 0 {
        return Err(value_error("str_split", "Argument #2 ($length) must be greater than 0"));
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.is_empty() {
        return Ok(Value::Array(PhpArray::from_list([Value::from("")])));
    }
    Ok(Value::Array(PhpArray::from_list(
        chars.chunks(size).map(|chunk| Value::Str(chunk.iter().collect())),
    )))
}

fn explode(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let separator = text(args, 0, "explode")?;
    let s = text(args, 1, "explode")?;
    if separator.is_empty() {
        return Err(value_error("explode", "Argument #1 ($separator) cannot be empty"));
    }
    let limit = int_arg(args, 2, i64::MAX);
    let parts: Vec<&str> = match usize::try_from(limit) {
        Ok(0) => s.splitn(1, separator.as_str()).collect(),
        Ok(n) => s.splitn(n, separator.as_str()).collect(),
        Err(_) => {
            let all: Vec<&str> = s.split(separator.as_str()).collect();
            let keep = all.len().saturating_sub(usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX));
            all[..keep].to_vec()
        }
    };
    Ok(Value::Array(PhpArray::from_list(parts.into_iter().map(Value::from))))
}

fn implode(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (separator, pieces) = match (arg(args, 0), arg(args, 1)) {
        (Value::Array(pieces), Value::Null) => (String::new(), pieces),
        (Value::Array(pieces), separator) => (separator.to_php_string(), pieces),
        (separator, Value::Array(pieces)) => (separator.to_php_string(), pieces),
        (_, other) => return Err(type_error("implode", 1, "?array", other)),
    };
    let joined = pieces
        .values()
        .map(Value::to_php_string)
        .collect::<Vec<_>>()
        .join(&separator);
    check_bytes(ctx.limits, joined.len())?;
    Ok(Value::Str(joined))
}

fn strrev(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "strrev")?.chars().rev().collect()))
}

fn ordering_value(ordering: Ordering) -> Value {
    Value::Int(match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    })
}

fn strcmp(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (a, b) = (text(args, 0, "strcmp")?, text(args, 1, "strcmp")?);
    Ok(ordering_value(a.cmp(&b)))
}

fn strcasecmp(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (a, b) = (text(args, 0, "strcasecmp")?, text(args, 1, "strcasecmp")?);
    Ok(ordering_value(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())))
}

fn substr_count(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (h, n) = (text(args, 0, "substr_count")?, text(args, 1, "substr_count")?);
    if n.is_empty() {
        return Err(value_error("substr_count", "Argument #2 ($needle) cannot be empty"));
    }
    Ok(Value::Int(h.matches(n.as_str()).count() as i64))
}

fn nl2br(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "nl2br")?;
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                out.push_str("<br />\r\n");
            }
            '\n' | '\r' => {
                out.push_str("<br />");
                out.push(c);
            }
            c => out.push(c),
        }
    }
    Ok(Value::Str(out))
}

fn addslashes(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "addslashes")?;
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' | '"' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    Ok(Value::Str(out))
}

fn ctype_digit(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(match arg(args, 0) {
        Value::Str(s) => !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
        _ => false,
    }))
}

fn ctype_alpha(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(match arg(args, 0) {
        Value::Str(s) => !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphabetic()),
        _ => false,
    }))
}

fn md5_hex(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "md5")?;
    Ok(Value::Str(format!("{:x}", md5::compute(s.as_bytes()))))
}

fn escape_html(s: &str, flags: i64) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if flags & ENT_COMPAT != 0 => out.push_str("&quot;"),
            '\'' if flags & ENT_QUOTES == ENT_QUOTES => out.push_str("&#039;"),
            c => out.push(c),
        }
    }
    out
}

fn htmlspecialchars(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "htmlspecialchars")?;
    Ok(Value::Str(escape_html(&s, int_arg(args, 1, ENT_QUOTES))))
}

fn htmlspecialchars_decode(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "htmlspecialchars_decode")?;
    let decoded = s
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    Ok(Value::Str(decoded))
}

/// Removes markup. A `<` that cannot open a tag is kept, or escaped when
/// `escape_lone_lt` is set.
pub(crate) fn strip_markup(s: &str, escape_lone_lt: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '<' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(next) if next.is_alphabetic() || matches!(next, '/' | '!' | '?') => {
                let mut quote = None;
                for inner in chars.by_ref() {
                    match (quote, inner) {
                        (None, '"' | '\'') => quote = Some(inner),
                        (Some(q), inner) if inner == q => quote = None,
                        (None, '>') => break,
                        _ => {}
                    }
                }
            }
            _ if escape_lone_lt => out.push_str("&lt;"),
            _ => out.push('<'),
        }
    }
    out
}

fn strip_tags(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(strip_markup(&text(args, 0, "strip_tags")?, false)))
}

static SCRIPT_BLOCKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)[^>]*?>.*?</(script|style)>").expect("static pattern"));
static OCTETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)%[a-f0-9]{2}").expect("static pattern"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\r\n\t ]+").expect("static pattern"));

/// Plain-text sanitizer shared by the `sanitize_text_field` builtin and the
/// registry: drops markup and percent-encoded octets, collapses whitespace.
pub fn sanitize_text(s: &str) -> String {
    let mut out = s.to_string();
    if out.contains('<') {
        out = SCRIPT_BLOCKS.replace_all(&out, "").into_owned();
        out = strip_markup(&out, true);
    }
    out = OCTETS.replace_all(&out, "").into_owned();
    SPACES.replace_all(&out, " ").trim().to_string()
}

fn sanitize_text_field(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(sanitize_text(&text(args, 0, "sanitize_text_field")?)))
}

/// Float digits past this are dropped, as PHP truncates them.
const MAX_FLOAT_PRECISION: usize = 53;

struct Directive {
    left: bool,
    plus: bool,
    pad: char,
    width: usize,
    precision: Option<usize>,
}

impl Directive {
    fn apply(&self, sign: &str, body: &str, numeric: bool) -> String {
        let len = sign.chars().count() + body.chars().count();
        if len >= self.width {
            return format!("{sign}{body}");
        }
        let fill: String = std::iter::repeat(self.pad).take(self.width - len).collect();
        if self.left {
            format!("{sign}{body}{fill}")
        } else if numeric && self.pad == '0' {
            format!("{sign}{fill}{body}")
        } else {
            format!("{fill}{sign}{body}")
        }
    }
}

fn conversion_is_float(conversion: Option<&char>) -> bool {
    matches!(conversion, Some('f' | 'F' | 'e' | 'E' | 'g' | 'G'))
}

fn format_exponent(f: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{f:.precision$e}");
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent = if exponent.starts_with('-') {
        exponent.to_string()
    } else {
        format!("+{exponent}")
    };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{exponent}")
}

fn format_printf(format: &str, args: &[Value], max_bytes: usize) -> Result<String, Fault> {
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::with_capacity(format.len());
    let mut i = 0;
    let mut next_arg = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }
        let digits_end = (i..chars.len()).find(|&j| !chars[j].is_ascii_digit()).unwrap_or(chars.len());
        let mut position = None;
        if digits_end > i && chars.get(digits_end) == Some(&'$') {
            let n: usize = chars[i..digits_end].iter().collect::<String>().parse().unwrap_or(0);
            if n == 0 {
                return Err(value_error("sprintf", "Argument number specifier must be greater than zero and less than 2147483647"));
            }
            position = Some(n - 1);
            i = digits_end + 1;
        }
        let mut directive = Directive {
            left: false,
            plus: false,
            pad: ' ',
            width: 0,
            precision: None,
        };
        loop {
            match chars.get(i) {
                Some('-') => directive.left = true,
                Some('+') => directive.plus = true,
                Some('0') => directive.pad = '0',
                Some(' ') => directive.pad = ' ',
                Some('\'') => {
                    i += 1;
                    directive.pad = chars.get(i).copied().unwrap_or(' ');
                }
                _ => break,
            }
            i += 1;
        }
        while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
            directive.width = directive.width.saturating_mul(10).saturating_add(d as usize);
            i += 1;
        }
        if directive.width > max_bytes {
            return Err(too_large(&format!("string exceeds {max_bytes} bytes")));
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut precision: usize = 0;
            while let Some(d) = chars.get(i).and_then(|c| c.to_digit(10)) {
                precision = precision.saturating_mul(10).saturating_add(d as usize);
                i += 1;
            }
            directive.precision = Some(precision);
            if conversion_is_float(chars.get(i)) {
                directive.precision = Some(precision.min(MAX_FLOAT_PRECISION));
            }
        }
        let Some(&conversion) = chars.get(i) else {
            return Err(value_error("sprintf", "Missing format specifier at end of string"));
        };
        i += 1;
        let index = position.unwrap_or_else(|| {
            next_arg += 1;
            next_arg - 1
        });
        let Some(value) = args.get(index) else {
            return Err(throw(
                "ArgumentCountError",
                format!("{} arguments are required, {} given", index + 2, args.len() + 1),
            ));
        };
        let sign_of = |negative: bool| {
            if negative {
                "-"
            } else if directive.plus {
                "+"
            } else {
                ""
            }
        };
        let piece = match conversion {
            'd' | 'i' => {
                let n = value.to_int();
                directive.apply(sign_of(n < 0), &n.unsigned_abs().to_string(), true)
            }
            'u' => directive.apply("", &(value.to_int() as u64).to_string(), true),
            'f' | 'F' => {
                let f = value.to_float();
                let precision = directive.precision.unwrap_or(6);
                directive.apply(sign_of(f < 0.0), &format!("{:.precision$}", f.abs()), true)
            }
            'e' | 'E' => {
                let f = value.to_float();
                let body = format_exponent(f.abs(), directive.precision.unwrap_or(6), conversion == 'E');
                directive.apply(sign_of(f < 0.0), &body, true)
            }
            'g' | 'G' => {
                let f = value.to_float();
                directive.apply(sign_of(f < 0.0), &format_float(f.abs()), true)
            }
            's' => {
                let s = value.to_php_string();
                let s = match directive.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                };
                directive.apply("", &s, false)
            }
            'x' => directive.apply("", &format!("{:x}", value.to_int()), true),
            'X' => directive.apply("", &format!("{:X}", value.to_int()), true),
            'o' => directive.apply("", &format!("{:o}", value.to_int()), true),
            'b' => directive.apply("", &format!("{:b}", value.to_int()), true),
            'c' => u32::try_from(value.to_int())
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default(),
            other => {
                return Err(value_error("sprintf", &format!("Unknown format specifier \"{other}\"")));
            }
        };
        out.push_str(&piece);
    }
    Ok(out)
}

fn sprintf(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let format = text(args, 0, "sprintf")?;
    let out = format_printf(&format, &args[1..], ctx.limits.max_string_bytes)?;
    check_bytes(ctx.limits, out.len())?;
    Ok(Value::Str(out))
}

/// Rounds half away from zero after pre-rounding to 15 significant digits,
/// so 1.005 rounds to 1.01.
fn round_half_up(value: f64, places: i32) -> f64 {
    if !value.is_finite() || value == 0.0 {
        return value;
    }
    // Places past a double's significant digits leave the value as is.
    let magnitude = value.abs().log10().floor() as i32;
    if places > 14 - magnitude {
        return value;
    }
    let scale = 10f64.powi(places);
    let scaled = value * scale;
    let pre: f64 = format!("{scaled:.14e}").parse().unwrap_or(scaled);
    let rounded = pre.round() / scale;
    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

fn number_format(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let number = float_arg(args, 0);
    let decimals = usize::try_from(int_arg(args, 1, 0)).unwrap_or(0).min(MAX_FLOAT_PRECISION);
    let point = opt_text(args, 2, "number_format", ".")?;
    let thousands = opt_text(args, 3, "number_format", ",")?;
    let rounded = round_half_up(number, i32::try_from(decimals).unwrap_or(0));
    let fixed = format!("{:.decimals$}", rounded.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), ""));
    let mut grouped = String::new();
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push_str(&thousands);
        }
        grouped.push(digit);
    }
    let mut out = String::new();
    if rounded < 0.0 && fixed.chars().any(|c| c.is_ascii_digit() && c != '0') {
        out.push('-');
    }
    out.push_str(&grouped);
    if decimals > 0 {
        out.push_str(&point);
        out.push_str(fraction);
    }
    Ok(Value::Str(out))
}

// ---- regex

static PATTERNS: Lazy<Mutex<HashMap<String, Option<Regex>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Translates a delimited pattern such as `/ab+c/i`. Constructs the engine
/// cannot express (backreferences, lookaround) fail to compile.
fn translate_pattern(pattern: &str) -> Option<Regex> {
    let pattern = pattern.trim_start();
    let open = pattern.chars().next()?;
    if open.is_alphanumeric() || open == '\\' {
        return None;
    }
    let close = match open {
        '(' => ')',
        '{' => '}',
        '[' => ']',
        '<' => '>',
        c => c,
    };
    let body_start = open.len_utf8();
    let end = pattern.rfind(close)?;
    if end < body_start {
        return None;
    }
    let mut builder = RegexBuilder::new(&pattern[body_start..end]);
    for modifier in pattern[end + close.len_utf8()..].chars() {
        match modifier {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'U' => builder.swap_greed(true),
            'u' | 'D' | 'S' | '\n' | ' ' => &mut builder,
            _ => return None,
        };
    }
    builder.size_limit(1 << 20).build().ok()
}

fn compile_pattern(pattern: &str) -> Option<Regex> {
    let mut cache = PATTERNS.lock();
    if let Some(compiled) = cache.get(pattern) {
        return compiled.clone();
    }
    let compiled = translate_pattern(pattern);
    if cache.len() >= 256 {
        cache.clear();
    }
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}

fn capture_names(regex: &Regex) -> Vec<Option<String>> {
    regex.capture_names().map(|name| name.map(str::to_string)).collect()
}

fn captures_array(names: &[Option<String>], captures: &Captures<'_>) -> PhpArray {
    let last = (0..captures.len()).rev().find(|&i| captures.get(i).is_some()).unwrap_or(0);
    let mut out = PhpArray::new();
    for i in 0..=last {
        let matched = Value::from(captures.get(i).map_or("", |m| m.as_str()));
        if let Some(Some(name)) = names.get(i) {
            out.insert(ArrayKey::from_string(name), matched.clone());
        }
        out.insert(ArrayKey::Int(i as i64), matched);
    }
    out
}

fn preg_match(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let pattern = text(args, 0, "preg_match")?;
    let subject = text(args, 1, "preg_match")?;
    let Some(regex) = compile_pattern(&pattern) else {
        return Ok(Value::Bool(false));
    };
    let captures = regex.captures(&subject);
    let found = captures.is_some();
    if let Some(slot) = args.get_mut(2) {
        *slot = Value::Array(captures.map_or_else(PhpArray::new, |c| captures_array(&capture_names(&regex), &c)));
    }
    Ok(Value::Int(i64::from(found)))
}

fn preg_match_all(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let pattern = text(args, 0, "preg_match_all")?;
    let subject = text(args, 1, "preg_match_all")?;
    let Some(regex) = compile_pattern(&pattern) else {
        return Ok(Value::Bool(false));
    };
    let names = capture_names(&regex);
    let mut groups: Vec<PhpArray> = vec![PhpArray::new(); names.len()];
    let mut count = 0;
    for captures in regex.captures_iter(&subject) {
        count += 1;
        for (i, group) in groups.iter_mut().enumerate() {
            group.push(Value::from(captures.get(i).map_or("", |m| m.as_str())));
        }
    }
    if let Some(slot) = args.get_mut(2) {
        let mut out = PhpArray::new();
        for (i, group) in groups.into_iter().enumerate() {
            if let Some(Some(name)) = names.get(i) {
                out.insert(ArrayKey::from_string(name), Value::Array(group.clone()));
            }
            out.insert(ArrayKey::Int(i as i64), Value::Array(group));
        }
        *slot = Value::Array(out);
    }
    Ok(Value::Int(count))
}

fn preg_split(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let pattern = text(args, 0, "preg_split")?;
    let subject = text(args, 1, "preg_split")?;
    let Some(regex) = compile_pattern(&pattern) else {
        return Ok(Value::Bool(false));
    };
    let limit = int_arg(args, 2, -1);
    let no_empty = int_arg(args, 3, 0) & PREG_SPLIT_NO_EMPTY != 0;
    let pieces: Vec<&str> = match usize::try_from(limit) {
        Ok(n) if n > 0 => regex.splitn(&subject, n).collect(),
        _ => regex.split(&subject).collect(),
    };
    Ok(Value::Array(PhpArray::from_list(
        pieces
            .into_iter()
            .filter(|piece| !(no_empty && piece.is_empty()))
            .map(Value::from),
    )))
}

fn preg_quote(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let s = text(args, 0, "preg_quote")?;
    let delimiter = opt_text(args, 1, "preg_quote", "")?;
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if (".\\+*?[^]$(){}=!<>|:-#".contains(c)) || delimiter.contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    Ok(Value::Str(out))
}

// ---- arrays

fn count_values(array: &PhpArray, recursive: bool) -> i64 {
    array
        .values()
        .map(|value| match value {
            Value::Array(inner) if recursive => 1 + count_values(inner, true),
            _ => 1,
        })
        .sum()
}

fn count(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    match arg(args, 0) {
        Value::Array(array) => Ok(Value::Int(count_values(array, int_arg(args, 1, 0) == 1))),
        other => Err(type_error("count", 0, "Countable|array", other)),
    }
}

fn array_keys(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_keys")?;
    let filter = args.get(1);
    Ok(Value::Array(PhpArray::from_list(
        array
            .iter()
            .filter(|(_, value)| filter.map_or(true, |wanted| value.loose_eq(wanted)))
            .map(|(key, _)| key.to_value()),
    )))
}

fn array_values(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_values")?;
    Ok(Value::Array(PhpArray::from_list(array.values().cloned())))
}

fn array_merge(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let mut out = PhpArray::new();
    for i in 0..args.len() {
        for (key, value) in array(args, i, "array_merge")?.iter() {
            match key {
                ArrayKey::Int(_) => out.push(value.clone()),
                key => out.insert(key.clone(), value.clone()),
            }
        }
        check_len(ctx.limits, out.len())?;
    }
    Ok(Value::Array(out))
}

fn array_combine(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let keys = array(args, 0, "array_combine")?;
    let values = array(args, 1, "array_combine")?;
    if keys.len() != values.len() {
        return Err(value_error(
            "array_combine",
            "Argument #1 ($keys) and argument #2 ($values) must have the same number of elements",
        ));
    }
    let mut out = PhpArray::new();
    for (key, value) in keys.values().zip(values.values()) {
        out.insert(ArrayKey::from_string(&key.to_php_string()), value.clone());
    }
    Ok(Value::Array(out))
}

fn array_flip(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_flip")?;
    let mut out = PhpArray::new();
    for (key, value) in array.iter() {
        if let Value::Int(_) | Value::Str(_) = value {
            if let Ok(flipped) = ArrayKey::from_value(value) {
                out.insert(flipped, key.to_value());
            }
        }
    }
    Ok(Value::Array(out))
}

fn array_slice(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_slice")?;
    let length = match arg(args, 2) {
        Value::Null => None,
        v => Some(v.to_int()),
    };
    let preserve = arg(args, 3).to_bool();
    let (from, to) = window(array.len(), int_arg(args, 1, 0), length);
    let mut out = PhpArray::new();
    for (key, value) in array.iter().skip(from).take(to.saturating_sub(from)) {
        match key {
            ArrayKey::Int(_) if !preserve => out.push(value.clone()),
            key => out.insert(key.clone(), value.clone()),
        }
    }
    Ok(Value::Array(out))
}

fn array_reverse(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_reverse")?;
    let preserve = arg(args, 1).to_bool();
    let entries: Vec<(&ArrayKey, &Value)> = array.iter().collect();
    let mut out = PhpArray::new();
    for (key, value) in entries.into_iter().rev() {
        match key {
            ArrayKey::Int(_) if !preserve => out.push(value.clone()),
            key => out.insert(key.clone(), value.clone()),
        }
    }
    Ok(Value::Array(out))
}

fn array_unique(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_unique")?;
    let mut seen = std::collections::HashSet::new();
    Ok(Value::Array(
        array
            .iter()
            .filter(|(_, value)| seen.insert(value.to_php_string()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    ))
}

fn array_key_exists(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 1, "array_key_exists")?;
    let key = ArrayKey::from_value(arg(args, 0)).map_err(|m| throw("TypeError", m))?;
    Ok(Value::Bool(array.contains_key(&key)))
}

fn position(args: &[Value], func: &str) -> Result<Option<ArrayKey>, Fault> {
    let needle = arg(args, 0);
    let haystack = array(args, 1, func)?;
    let strict = arg(args, 2).to_bool();
    Ok(haystack
        .iter()
        .find(|(_, value)| {
            if strict {
                value.identical(needle)
            } else {
                value.loose_eq(needle)
            }
        })
        .map(|(key, _)| key.clone()))
}

fn in_array(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(position(args, "in_array")?.is_some()))
}

fn array_search(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(position(args, "array_search")?.map_or(Value::Bool(false), |key| key.to_value()))
}

fn fold_numbers(args: &[Value], func: &str, init: i64, op: BinaryOp) -> Outcome {
    let array = array(args, 0, func)?;
    let mut total = Value::Int(init);
    for value in array.values() {
        let operand = match value {
            Value::Array(_) | Value::Object(_) => continue,
            Value::Str(s) => super::value::numeric_prefix(s).into_value(),
            v => v.to_number().into_value(),
        };
        total = arithmetic(op, &total, &operand)?;
    }
    Ok(total)
}

fn array_sum(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    fold_numbers(args, "array_sum", 0, BinaryOp::Add)
}

fn array_product(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    fold_numbers(args, "array_product", 1, BinaryOp::Mul)
}

fn array_fill(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let start = int_arg(args, 0, 0);
    let Ok(count) = usize::try_from(int_arg(args, 1, 0)) else {
        return Err(value_error("array_fill", "Argument #2 ($count) must be greater than or equal to 0"));
    };
    check_len(ctx.limits, count)?;
    let value = arg(args, 2);
    let mut out = PhpArray::new();
    for i in 0..count {
        out.insert(ArrayKey::Int(start.saturating_add(i as i64)), value.clone());
    }
    Ok(Value::Array(out))
}

fn array_fill_keys(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let keys = array(args, 0, "array_fill_keys")?;
    let value = arg(args, 1);
    Ok(Value::Array(
        keys.values()
            .map(|key| (ArrayKey::from_string(&key.to_php_string()), value.clone()))
            .collect(),
    ))
}

fn array_pad(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_pad")?;
    let size = int_arg(args, 1, 0);
    let target = usize::try_from(size.unsigned_abs()).unwrap_or(usize::MAX);
    if target <= array.len() {
        return Ok(Value::Array(array.clone()));
    }
    check_len(ctx.limits, target)?;
    let filler = std::iter::repeat(arg(args, 2).clone()).take(target - array.len());
    let values: Vec<Value> = if size < 0 {
        filler.chain(array.values().cloned()).collect()
    } else {
        array.values().cloned().chain(filler).collect()
    };
    Ok(Value::Array(PhpArray::from_list(values)))
}

fn array_column(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let rows = array(args, 0, "array_column")?;
    let column = arg(args, 1);
    let index = arg(args, 2);
    let mut out = PhpArray::new();
    for row in rows.values() {
        let Value::Array(row) = row else { continue };
        let value = if column.is_null() {
            Value::Array(row.clone())
        } else {
            let key = ArrayKey::from_value(column).map_err(|m| throw("TypeError", m))?;
            match row.get(&key) {
                Some(value) => value.clone(),
                None => continue,
            }
        };
        let key = if index.is_null() {
            None
        } else {
            let key = ArrayKey::from_value(index).map_err(|m| throw("TypeError", m))?;
            row.get(&key).and_then(|k| ArrayKey::from_value(k).ok())
        };
        match key {
            Some(key) => out.insert(key, value),
            None => out.push(value),
        }
    }
    Ok(Value::Array(out))
}

fn array_chunk(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_chunk")?;
    let size = usize::try_from(int_arg(args, 1, 0)).unwrap_or(0);
    if size == 0 {
        return Err(value_error("array_chunk", "Argument #2 ($length) must be greater than 0"));
    }
    let preserve = arg(args, 2).to_bool();
    let entries: Vec<(&ArrayKey, &Value)> = array.iter().collect();
    Ok(Value::Array(PhpArray::from_list(entries.chunks(size).map(|chunk| {
        let mut part = PhpArray::new();
        for (key, value) in chunk {
            if preserve {
                part.insert((*key).clone(), (*value).clone());
            } else {
                part.push((*value).clone());
            }
        }
        Value::Array(part)
    }))))
}

fn array_filter(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let mut array = array(args, 0, "array_filter")?.clone();
    array.retain(|_, value| value.to_bool());
    Ok(Value::Array(array))
}

fn array_count_values(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_count_values")?;
    let mut out = PhpArray::new();
    for value in array.values() {
        if let Value::Int(_) | Value::Str(_) = value {
            if let Ok(key) = ArrayKey::from_value(value) {
                let slot = out.slot(key);
                *slot = Value::Int(slot.to_int() + 1);
            }
        }
    }
    Ok(Value::Array(out))
}

fn set_filter(args: &[Value], func: &str, keep_common: bool, by_key: bool) -> Outcome {
    let first = array(args, 0, func)?;
    let mut others = Vec::with_capacity(args.len().saturating_sub(1));
    for i in 1..args.len() {
        others.push(array(args, i, func)?);
    }
    let present = |key: &ArrayKey, value: &Value, other: &PhpArray| {
        if by_key {
            other.contains_key(key)
        } else {
            let needle = value.to_php_string();
            other.values().any(|v| v.to_php_string() == needle)
        }
    };
    let mut out = first.clone();
    out.retain(|key, value| {
        if keep_common {
            others.iter().all(|other| present(key, value, other))
        } else {
            !others.iter().any(|other| present(key, value, other))
        }
    });
    Ok(Value::Array(out))
}

fn array_diff(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    set_filter(args, "array_diff", false, false)
}

fn array_diff_key(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    set_filter(args, "array_diff_key", false, true)
}

fn array_intersect(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    set_filter(args, "array_intersect", true, false)
}

fn array_intersect_key(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    set_filter(args, "array_intersect_key", true, true)
}

fn array_key_first(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_key_first")?;
    Ok(array.first().map_or(Value::Null, |(key, _)| key.to_value()))
}

fn array_key_last(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "array_key_last")?;
    Ok(array.last().map_or(Value::Null, |(key, _)| key.to_value()))
}

fn array_is_list(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(array(args, 0, "array_is_list")?.is_list()))
}

fn range(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (start, end) = (arg(args, 0), arg(args, 1));
    let step = arg(args, 2);
    let single_char = |v: &Value| match v {
        Value::Str(s) if s.chars().count() == 1 && parse_numeric(s).is_none() => s.chars().next(),
        _ => None,
    };
    if let (Some(a), Some(b)) = (single_char(start), single_char(end)) {
        let step = usize::try_from(int_arg(args, 2, 1).unsigned_abs()).unwrap_or(1).max(1);
        let (lo, hi) = (a.min(b) as u32, a.max(b) as u32);
        let mut chars: Vec<Value> = (lo..=hi)
            .step_by(step)
            .filter_map(char::from_u32)
            .map(|c| Value::Str(c.to_string()))
            .collect();
        if a > b {
            chars.reverse();
        }
        return Ok(Value::Array(PhpArray::from_list(chars)));
    }
    let is_float = |v: &Value| matches!(v.to_number(), Number::Float(_));
    let step_number = if step.is_null() { Number::Int(1) } else { step.to_number() };
    if step_number.to_f64() == 0.0 {
        return Err(value_error("range", "Argument #3 ($step) cannot be 0"));
    }
    if is_float(start) || is_float(end) || matches!(step_number, Number::Float(f) if f.fract() != 0.0) {
        let (a, b, s) = (start.to_float(), end.to_float(), step_number.to_f64().abs());
        let n = ((b - a).abs() / s).floor();
        if !n.is_finite() {
            return Err(value_error("range", "Argument #3 ($step) must not exceed the specified range"));
        }
        let n = float_to_int(n) as usize;
        check_len(ctx.limits, n + 1)?;
        let direction = if b >= a { 1.0 } else { -1.0 };
        return Ok(Value::Array(PhpArray::from_list(
            (0..=n).map(|i| Value::Float(a + direction * s * i as f64)),
        )));
    }
    let (a, b) = (start.to_int(), end.to_int());
    let s = match step_number {
        Number::Int(i) => i.unsigned_abs(),
        Number::Float(f) => float_to_int(f).unsigned_abs(),
    };
    let n = a.abs_diff(b) / s;
    check_len(ctx.limits, usize::try_from(n).unwrap_or(usize::MAX).saturating_add(1))?;
    let values = (0..=n).map(|i| {
        let offset = i128::from(i) * i128::from(s);
        let v = if b >= a { i128::from(a) + offset } else { i128::from(a) - offset };
        Value::Int(i64::try_from(v).unwrap_or(0))
    });
    Ok(Value::Array(PhpArray::from_list(values)))
}

fn sort_order(flags: i64) -> impl Fn(&Value, &Value) -> Ordering {
    move |a, b| match flags & !SORT_FLAG_CASE {
        SORT_NUMERIC => a.to_float().partial_cmp(&b.to_float()).unwrap_or(Ordering::Equal),
        SORT_STRING if flags & SORT_FLAG_CASE != 0 => a
            .to_php_string()
            .to_lowercase()
            .cmp(&b.to_php_string().to_lowercase()),
        SORT_STRING => a.to_php_string().cmp(&b.to_php_string()),
        _ => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

fn sort_values(args: &mut [Value], func: &str, descending: bool) -> Outcome {
    let order = sort_order(int_arg(args, 1, 0));
    let array = array_mut(args, 0, func)?;
    let mut values: Vec<Value> = std::mem::take(array).into_iter().map(|(_, v)| v).collect();
    values.sort_by(|a, b| if descending { order(b, a) } else { order(a, b) });
    *array = PhpArray::from_list(values);
    Ok(Value::Bool(true))
}

fn sort_entries(args: &mut [Value], func: &str, by_key: bool, descending: bool) -> Outcome {
    let order = sort_order(int_arg(args, 1, 0));
    let array = array_mut(args, 0, func)?;
    array.sort_by(|ka, va, kb, vb| {
        let ordering = if by_key {
            order(&ka.to_value(), &kb.to_value())
        } else {
            order(va, vb)
        };
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
    Ok(Value::Bool(true))
}

fn sort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_values(args, "sort", false)
}

fn rsort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_values(args, "rsort", true)
}

fn asort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_entries(args, "asort", false, false)
}

fn arsort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_entries(args, "arsort", false, true)
}

fn ksort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_entries(args, "ksort", true, false)
}

fn krsort(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    sort_entries(args, "krsort", true, true)
}

fn array_push(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (target, rest) = args.split_at_mut(1);
    let array = array_mut(target, 0, "array_push")?;
    check_len(ctx.limits, array.len() + rest.len())?;
    for value in rest.iter_mut() {
        if !array.try_push(std::mem::take(value)) {
            return Err(throw("Error", NEXT_ELEMENT_OCCUPIED));
        }
    }
    Ok(Value::Int(array.len() as i64))
}

fn array_pop(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(array_mut(args, 0, "array_pop")?.pop().unwrap_or_default())
}

fn array_shift(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(array_mut(args, 0, "array_shift")?.shift().unwrap_or_default())
}

fn array_unshift(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (target, rest) = args.split_at_mut(1);
    let array = array_mut(target, 0, "array_unshift")?;
    check_len(ctx.limits, array.len() + rest.len())?;
    array.unshift(rest.iter_mut().map(std::mem::take).collect());
    Ok(Value::Int(array.len() as i64))
}

fn reset(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "reset")?;
    Ok(array.first().map_or(Value::Bool(false), |(_, v)| v.clone()))
}

fn end(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let array = array(args, 0, "end")?;
    Ok(array.last().map_or(Value::Bool(false), |(_, v)| v.clone()))
}

// ---- math

fn number_arg(args: &[Value], i: usize, func: &str) -> Result<Number, Fault> {
    match arg(args, i) {
        Value::Str(s) => parse_numeric(s).ok_or_else(|| type_error(func, i, "int|float", &Value::Str(s.clone()))),
        v @ (Value::Array(_) | Value::Object(_)) => Err(type_error(func, i, "int|float", v)),
        v => Ok(v.to_number()),
    }
}

fn abs(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(match number_arg(args, 0, "abs")? {
        Number::Int(i) => i.checked_abs().map_or(Value::Float(-(i as f64)), Value::Int),
        Number::Float(f) => Value::Float(f.abs()),
    })
}

fn ceil(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(number_arg(args, 0, "ceil")?.to_f64().ceil()))
}

fn floor(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(number_arg(args, 0, "floor")?.to_f64().floor()))
}

fn round(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let value = number_arg(args, 0, "round")?.to_f64();
    let places = i32::try_from(int_arg(args, 1, 0).clamp(-308, 308)).unwrap_or(0);
    Ok(Value::Float(round_half_up(value, places)))
}

fn sqrt(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(number_arg(args, 0, "sqrt")?.to_f64().sqrt()))
}

fn pow(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    arithmetic(BinaryOp::Pow, arg(args, 0), arg(args, 1))
}

fn intdiv(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (a, b) = (int_arg(args, 0, 0), int_arg(args, 1, 0));
    if b == 0 {
        return Err(throw("DivisionByZeroError", "Division by zero"));
    }
    a.checked_div(b).map(Value::Int).ok_or_else(|| {
        throw(
            "ArithmeticError",
            "Division of PHP_INT_MIN by -1 is not an integer",
        )
    })
}

fn fmod(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(float_arg(args, 0) % float_arg(args, 1)))
}

fn extreme(args: &[Value], func: &str, wanted: Ordering) -> Outcome {
    let candidates: Vec<&Value> = match args {
        [Value::Array(array)] => array.values().collect(),
        [other] => return Err(type_error(func, 0, "array", other)),
        values => values.iter().collect(),
    };
    let mut best: Option<&Value> = None;
    for candidate in candidates {
        best = match best {
            Some(current) if candidate.compare(current) != Some(wanted) => Some(current),
            _ => Some(candidate),
        };
    }
    best.cloned()
        .ok_or_else(|| value_error(func, "Argument #1 ($value) must contain at least one element"))
}

fn max(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    extreme(args, "max", Ordering::Greater)
}

fn min(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    extreme(args, "min", Ordering::Less)
}

fn pi(_: &BuiltinContext<'_>, _: &mut [Value]) -> Outcome {
    Ok(Value::Float(std::f64::consts::PI))
}

fn log(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let x = number_arg(args, 0, "log")?.to_f64();
    Ok(Value::Float(match args.get(1) {
        Some(base) => {
            let base = base.to_float();
            if base <= 0.0 {
                return Err(value_error("log", "Argument #2 ($base) must be greater than 0"));
            }
            x.ln() / base.ln()
        }
        None => x.ln(),
    }))
}

fn exp(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(number_arg(args, 0, "exp")?.to_f64().exp()))
}

fn is_nan(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(float_arg(args, 0).is_nan()))
}

fn is_finite(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(float_arg(args, 0).is_finite()))
}

fn is_infinite(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(float_arg(args, 0).is_infinite()))
}

fn dechex(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(format!("{:x}", int_arg(args, 0, 0))))
}

fn hexdec(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let digits: String = text(args, 0, "hexdec")?.chars().filter(char::is_ascii_hexdigit).collect();
    if digits.is_empty() {
        return Ok(Value::Int(0));
    }
    Ok(i64::from_str_radix(&digits, 16).map_or_else(
        |_| Value::Float(digits.chars().fold(0.0, |acc, c| acc * 16.0 + f64::from(c.to_digit(16).unwrap_or(0)))),
        Value::Int,
    ))
}

// ---- types

fn gettype(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::from(match arg(args, 0) {
        Value::Null => "NULL",
        Value::Bool(_) => "boolean",
        Value::Int(_) => "integer",
        Value::Float(_) => "double",
        Value::Str(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }))
}

fn get_debug_type(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::from(arg(args, 0).type_name()))
}

fn get_class(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    match arg(args, 0) {
        Value::Object(object) => Ok(Value::from(exception_class(&object.class).unwrap_or(object.class.as_str()))),
        other => Err(type_error("get_class", 0, "object", other)),
    }
}

fn is_int(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Int(_))))
}

fn is_float(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Float(_))))
}

fn is_string(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Str(_))))
}

fn is_bool(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Bool(_))))
}

fn is_array(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Array(_))))
}

fn is_numeric(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(match arg(args, 0) {
        Value::Int(_) | Value::Float(_) => true,
        Value::Str(s) => parse_numeric(s).is_some(),
        _ => false,
    }))
}

fn is_null(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(arg(args, 0).is_null()))
}

fn is_scalar(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(
        arg(args, 0),
        Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
    )))
}

fn is_object(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(matches!(arg(args, 0), Value::Object(_))))
}

fn intval(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let base = int_arg(args, 1, 10);
    match (arg(args, 0), u32::try_from(base)) {
        (Value::Str(s), Ok(radix)) if radix != 10 && (2..=36).contains(&radix) => {
            let trimmed = s.trim();
            let (negative, digits) = match trimmed.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, trimmed.trim_start_matches('+')),
            };
            let digits = match radix {
                16 => digits.trim_start_matches("0x").trim_start_matches("0X"),
                8 => digits.trim_start_matches("0o"),
                2 => digits.trim_start_matches("0b"),
                _ => digits,
            };
            let valid: String = digits.chars().take_while(|c| c.is_digit(radix)).collect();
            let parsed = i64::from_str_radix(&valid, radix).unwrap_or(if valid.is_empty() { 0 } else { i64::MAX });
            Ok(Value::Int(if negative { -parsed } else { parsed }))
        }
        (value, _) => Ok(Value::Int(value.to_int())),
    }
}

fn floatval(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Float(float_arg(args, 0)))
}

fn strval(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Str(text(args, 0, "strval")?))
}

fn boolval(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    Ok(Value::Bool(arg(args, 0).to_bool()))
}

// ---- json

fn encode_json_string(s: &str, flags: i64, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' if flags & JSON_HEX_QUOT != 0 => out.push_str("\\u0022"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '/' if flags & JSON_UNESCAPED_SLASHES == 0 => out.push_str("\\/"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '<' if flags & JSON_HEX_TAG != 0 => out.push_str("\\u003C"),
            '>' if flags & JSON_HEX_TAG != 0 => out.push_str("\\u003E"),
            '&' if flags & JSON_HEX_AMP != 0 => out.push_str("\\u0026"),
            '\'' if flags & JSON_HEX_APOS != 0 => out.push_str("\\u0027"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c if !c.is_ascii() && flags & JSON_UNESCAPED_UNICODE == 0 => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn newline(out: &mut String, flags: i64, level: usize) {
    if flags & JSON_PRETTY_PRINT != 0 {
        out.push('\n');
        out.push_str(&"    ".repeat(level));
    }
}

/// Encodes like `json_encode`: slashes and non-ASCII escaped unless the
/// matching flags are set; list-shaped arrays become JSON arrays.
pub fn encode_json(value: &Value, flags: i64, level: usize, out: &mut String) -> Result<(), String> {
    if level > 512 {
        return Err("Maximum stack depth exceeded".to_string());
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err("Inf and NaN cannot be JSON encoded".to_string());
            }
            if f.fract() == 0.0 && f.abs() < 1e15 {
                out.push_str(&format!("{f:.1}"));
            } else {
                out.push_str(&f.to_string());
            }
        }
        Value::Str(s) => encode_json_string(s, flags, out),
        Value::Array(array) => {
            let as_list = array.is_list() && flags & JSON_FORCE_OBJECT == 0;
            let (open, close) = if as_list { ('[', ']') } else { ('{', '}') };
            out.push(open);
            for (i, (key, item)) in array.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                newline(out, flags, level + 1);
                if !as_list {
                    encode_json_string(&key.to_string(), flags, out);
                    out.push(':');
                    if flags & JSON_PRETTY_PRINT != 0 {
                        out.push(' ');
                    }
                }
                encode_json(item, flags, level + 1, out)?;
            }
            if !array.is_empty() {
                newline(out, flags, level);
            }
            out.push(close);
        }
        Value::Object(_) => out.push_str("{}"),
    }
    Ok(())
}

fn json_encode(ctx: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let flags = int_arg(args, 1, 0);
    let mut out = String::new();
    match encode_json(arg(args, 0), flags, 0, &mut out) {
        Ok(()) => {
            check_bytes(ctx.limits, out.len())?;
            Ok(Value::Str(out))
        }
        Err(message) if flags & JSON_THROW_ON_ERROR != 0 => Err(throw("JsonException", message)),
        Err(_) => Ok(Value::Bool(false)),
    }
}

fn json_decode(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let source = text(args, 0, "json_decode")?;
    let flags = int_arg(args, 3, 0);
    match serde_json::from_str::<serde_json::Value>(&source) {
        Ok(json) => Ok(Value::from_json(&json)),
        Err(_) if flags & JSON_THROW_ON_ERROR != 0 => Err(throw("JsonException", "Syntax error")),
        Err(_) => Ok(Value::Null),
    }
}

// ---- date and time

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// `None` when the timestamp lies outside the representable calendar.
fn timestamp_arg(args: &[Value], i: usize) -> Option<DateTime<Utc>> {
    match args.get(i) {
        None | Some(Value::Null) => Some(now()),
        Some(value) => Utc.timestamp_opt(value.to_int(), 0).single(),
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

fn ordinal_suffix(day: u32) -> &'static str {
    match (day % 10, day % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    }
}

/// Renders a `date()` format string in UTC.
pub fn format_date(format: &str, at: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(format.len() * 2);
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        let hour12 = match at.hour() % 12 {
            0 => 12,
            h => h,
        };
        let piece = match c {
            'd' => format!("{:02}", at.day()),
            'D' => at.format("%a").to_string(),
            'j' => at.day().to_string(),
            'l' => at.format("%A").to_string(),
            'N' => at.weekday().number_from_monday().to_string(),
            'S' => ordinal_suffix(at.day()).to_string(),
            'w' => at.weekday().num_days_from_sunday().to_string(),
            'z' => at.ordinal0().to_string(),
            'W' => format!("{:02}", at.iso_week().week()),
            'F' => at.format("%B").to_string(),
            'm' => format!("{:02}", at.month()),
            'M' => at.format("%b").to_string(),
            'n' => at.month().to_string(),
            't' => days_in_month(at.year(), at.month()).to_string(),
            'L' => u8::from(NaiveDate::from_ymd_opt(at.year(), 2, 29).is_some()).to_string(),
            'o' => at.iso_week().year().to_string(),
            'Y' => at.year().to_string(),
            'y' => format!("{:02}", at.year().rem_euclid(100)),
            'a' => if at.hour() < 12 { "am" } else { "pm" }.to_string(),
            'A' => if at.hour() < 12 { "AM" } else { "PM" }.to_string(),
            'g' => hour12.to_string(),
            'G' => at.hour().to_string(),
            'h' => format!("{hour12:02}"),
            'H' => format!("{:02}", at.hour()),
            'i' => format!("{:02}", at.minute()),
            's' => format!("{:02}", at.second()),
            'u' => format!("{:06}", at.timestamp_subsec_micros()),
            'v' => format!("{:03}", at.timestamp_subsec_millis()),
            'e' | 'T' => "UTC".to_string(),
            'P' => "+00:00".to_string(),
            'p' => "Z".to_string(),
            'O' => "+0000".to_string(),
            'Z' | 'I' => "0".to_string(),
            'c' => at.format("%Y-%m-%dT%H:%M:%S+00:00").to_string(),
            'r' => at.format("%a, %d %b %Y %H:%M:%S +0000").to_string(),
            'U' => at.timestamp().to_string(),
            '\\' => chars.next().map(String::from).unwrap_or_default(),
            other => other.to_string(),
        };
        out.push_str(&piece);
    }
    out
}

fn time(_: &BuiltinContext<'_>, _: &mut [Value]) -> Outcome {
    Ok(Value::Int(now().timestamp()))
}

fn microtime(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let at = now();
    let micros = f64::from(at.timestamp_subsec_micros()) / 1_000_000.0;
    if arg(args, 0).to_bool() {
        return Ok(Value::Float(at.timestamp() as f64 + micros));
    }
    Ok(Value::Str(format!("{micros:.8} {}", at.timestamp())))
}

fn date(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let format = text(args, 0, "date")?;
    Ok(timestamp_arg(args, 1).map_or(Value::Bool(false), |at| Value::Str(format_date(&format, at))))
}

static RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([+-]?\d+)\s*(sec|second|min|minute|hour|day|week|fortnight|month|year)s?(\s+ago)?$")
        .expect("static pattern")
});

fn shift_by(base: DateTime<Utc>, amount: i64, unit: &str) -> Option<DateTime<Utc>> {
    let months = |n: i64| {
        let magnitude = Months::new(u32::try_from(n.unsigned_abs()).ok()?);
        if n >= 0 {
            base.checked_add_months(magnitude)
        } else {
            base.checked_sub_months(magnitude)
        }
    };
    match unit {
        "sec" | "second" => base.checked_add_signed(Duration::try_seconds(amount)?),
        "min" | "minute" => base.checked_add_signed(Duration::try_minutes(amount)?),
        "hour" => base.checked_add_signed(Duration::try_hours(amount)?),
        "day" => base.checked_add_signed(Duration::try_days(amount)?),
        "week" => base.checked_add_signed(Duration::try_weeks(amount)?),
        "fortnight" => base.checked_add_signed(Duration::try_weeks(amount.checked_mul(2)?)?),
        "month" => months(amount),
        "year" => months(amount.checked_mul(12)?),
        _ => None,
    }
}

/// A practical subset of `strtotime`: absolute ISO and common numeric
/// dates, `@timestamp`, `now`/`today`/`tomorrow`/`yesterday` and single
/// relative offsets such as `+3 days` or `2 weeks ago`.
pub fn parse_time(input: &str, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let input = input.trim();
    let lowered = input.to_ascii_lowercase();
    let midnight = |at: DateTime<Utc>| at.date_naive().and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    match lowered.as_str() {
        "now" | "" => return Some(base),
        "today" | "midnight" => return midnight(base),
        "tomorrow" => return midnight(base.checked_add_signed(Duration::days(1))?),
        "yesterday" => return midnight(base.checked_sub_signed(Duration::days(1))?),
        _ => {}
    }
    if let Some(seconds) = input.strip_prefix('@') {
        return Utc.timestamp_opt(seconds.parse().ok()?, 0).single();
    }
    if let Some(captures) = RELATIVE.captures(&lowered) {
        let mut amount: i64 = captures[1].parse().ok()?;
        if captures.get(3).is_some() {
            amount = -amount;
        }
        return shift_by(base, amount, &captures[2]);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Some(at.with_timezone(&Utc));
    }
    if let Ok(at) = DateTime::parse_from_rfc2822(input) {
        return Some(at.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y/%m/%d %H:%M:%S"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(input, pattern) {
            return Some(at.and_utc());
        }
    }
    for pattern in ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d %B %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, pattern) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    None
}

fn strtotime(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let input = text(args, 0, "strtotime")?;
    let parsed = timestamp_arg(args, 1).and_then(|base| parse_time(&input, base));
    Ok(parsed.map_or(Value::Bool(false), |at| Value::Int(at.timestamp())))
}

fn checkdate(_: &BuiltinContext<'_>, args: &mut [Value]) -> Outcome {
    let (month, day, year) = (int_arg(args, 0, 0), int_arg(args, 1, 0), int_arg(args, 2, 0));
    let valid = match (i32::try_from(year), u32::try_from(month), u32::try_from(day)) {
        (Ok(y), Ok(m), Ok(d)) => (1..=32767).contains(&y) && NaiveDate::from_ymd_opt(y, m, d).is_some(),
        _ => false,
    };
    Ok(Value::Bool(valid))
}

fn date_default_timezone_get(_: &BuiltinContext<'_>, _: &mut [Value]) -> Outcome {
    Ok(Value::from("UTC"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, mut args: Vec<Value>) -> Result<Value, Fault> {
        let limits = Limits::default();
        let ctx = BuiltinContext { limits: &limits };
        let builtin = lookup(name).unwrap();
        (builtin.func)(&ctx, &mut args)
    }

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    fn list(values: &[&str]) -> Value {
        Value::Array(PhpArray::from_list(values.iter().map(|v| Value::from(*v))))
    }

    #[test]
    fn test_names_are_lowercase_and_unique() {
        let mut seen = std::collections::HashSet::new();
        for name in builtin_names() {
            assert_eq!(name, name.to_ascii_lowercase());
            assert!(seen.insert(name), "duplicate builtin {name}");
        }
        assert!(is_builtin("STRLEN"));
        assert!(is_builtin("function_exists"));
        assert!(!is_builtin("exec"));
        assert!(!is_builtin("eval"));
    }

    #[test]
    fn test_arity_message() {
        let strlen = lookup("strlen").unwrap();
        assert_eq!(strlen.arity_message(0), "strlen() expects exactly 1 argument, 0 given");
        let substr = lookup("substr").unwrap();
        assert_eq!(substr.arity_message(4), "substr() expects at most 3 arguments, 4 given");
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("substr", vec![s("abcdef"), Value::Int(-3), Value::Int(2)]).unwrap(), s("de"));
        assert_eq!(call("strpos", vec![s("hello"), s("l")]).unwrap(), Value::Int(2));
        assert_eq!(call("strpos", vec![s("hello"), s("z")]).unwrap(), Value::Bool(false));
        assert_eq!(call("ucwords", vec![s("hello big world")]).unwrap(), s("Hello Big World"));
        assert_eq!(call("trim", vec![s("xxhixx"), s("x")]).unwrap(), s("hi"));
        assert_eq!(
            call("str_pad", vec![s("7"), Value::Int(3), s("0"), Value::Int(STR_PAD_LEFT)]).unwrap(),
            s("007")
        );
        assert_eq!(
            call("str_replace", vec![list(&["a", "b"]), s("x"), s("abc")]).unwrap(),
            s("xxc")
        );
        assert_eq!(call("explode", vec![s(","), s("a,b,c"), Value::Int(-1)]).unwrap(), list(&["a", "b"]));
        assert_eq!(call("implode", vec![s("-"), list(&["a", "b"])]).unwrap(), s("a-b"));
    }

    #[test]
    fn test_sprintf_and_number_format() {
        let out = call(
            "sprintf",
            vec![s("%05.1f|%-4s|%'*6d|%2$s|%x"), Value::Float(3.14159), s("ab"), Value::Int(42), Value::Int(255)],
        )
        .unwrap();
        assert_eq!(out, s("003.1|ab  |****42|ab|ff"));
        assert_eq!(
            call("number_format", vec![Value::Float(1234567.891), Value::Int(2)]).unwrap(),
            s("1,234,567.89")
        );
        assert_eq!(call("round", vec![Value::Float(1.005), Value::Int(2)]).unwrap(), Value::Float(1.01));
    }

    #[test]
    fn test_float_precision_is_clamped() {
        let out = call("sprintf", vec![s("%.999999999f"), Value::Float(1.0)]).unwrap();
        assert_eq!(out, s(&format!("1.{}", "0".repeat(53))));
        let out = call("sprintf", vec![s("%.99999999999999999999999e"), Value::Float(1.0)]).unwrap();
        assert!(out.to_php_string().starts_with("1.0000"), "{out:?}");
        assert_eq!(call("round", vec![Value::Float(1.5), Value::Int(999_999_999)]).unwrap(), Value::Float(1.5));
        assert_eq!(call("round", vec![Value::Float(2.5), Value::Int(-999_999_999)]).unwrap(), Value::Float(0.0));
        let formatted = call("number_format", vec![Value::Float(1.5), Value::Int(1_000_000)]).unwrap();
        assert_eq!(formatted.to_php_string().len(), "1.".len() + 53);
    }

    #[test]
    fn test_format_width_respects_string_limit() {
        let err = call("sprintf", vec![s("%999999999999d"), Value::Int(1)]).unwrap_err();
        assert!(format!("{err:?}").contains("exceeds"), "{err:?}");
    }

    #[test]
    fn test_sanitizers() {
        assert_eq!(
            sanitize_text("  <b>Hello</b>\n\t<script>alert(1)</script> world %0a "),
            "Hello world"
        );
        assert_eq!(sanitize_text("a < b"), "a &lt; b");
        assert_eq!(
            call("htmlspecialchars", vec![s("<a href='x'>\"&\"</a>")]).unwrap(),
            s("&lt;a href=&#039;x&#039;&gt;&quot;&amp;&quot;&lt;/a&gt;")
        );
        assert_eq!(call("strip_tags", vec![s("<p>1 < 2</p>")]).unwrap(), s("1 < 2"));
    }

    #[test]
    fn test_regex_translation() {
        assert!(translate_pattern("/a+b/i").is_some());
        assert!(translate_pattern("#^\\d{3}$#").is_some());
        assert!(translate_pattern("{x}").is_some());
        assert!(translate_pattern("abc").is_none());
        assert!(translate_pattern("/abc/e").is_none());
        assert!(translate_pattern("/(a)\\1/").is_none());
        let mut args = vec![s("/(?P<year>\\d{4})-(\\d{2})/"), s("on 2024-05"), Value::Null];
        let limits = Limits::default();
        let found = preg_match(&BuiltinContext { limits: &limits }, &mut args).unwrap();
        assert_eq!(found, Value::Int(1));
        let matches = args[2].as_array().unwrap();
        assert_eq!(matches.get_str("year"), Some(&s("2024")));
        assert_eq!(matches.get(&ArrayKey::Int(2)), Some(&s("05")));
    }

    #[test]
    fn test_array_functions() {
        let numbers = Value::Array(PhpArray::from_list([Value::Int(3), Value::from("4"), Value::Float(0.5)]));
        assert_eq!(call("array_sum", vec![numbers.clone()]).unwrap(), Value::Float(7.5));
        assert_eq!(call("max", vec![numbers]).unwrap(), Value::from("4"));
        assert_eq!(
            call("range", vec![Value::Int(5), Value::Int(1), Value::Int(2)]).unwrap(),
            Value::Array(PhpArray::from_list([Value::Int(5), Value::Int(3), Value::Int(1)]))
        );
        assert_eq!(call("array_unique", vec![list(&["a", "b", "a"])]).unwrap(), list(&["a", "b"]));
        assert!(matches!(
            call("array_chunk", vec![list(&["a"]), Value::Int(0)]),
            Err(Fault::Throw(ref o)) if o.class == "ValueError"
        ));
    }

    #[test]
    fn test_range_respects_array_limit() {
        let limits = Limits {
            max_array_len: 10,
            ..Limits::default()
        };
        let ctx = BuiltinContext { limits: &limits };
        let err = range(&ctx, &mut [Value::Int(1), Value::Int(1000)]).unwrap_err();
        assert!(matches!(err, Fault::Fatal(RuntimeError::MemoryLimit(_))));
    }

    #[test]
    fn test_json_encoding_flags() {
        let mut record = PhpArray::new();
        record.insert("url".into(), s("a/b"));
        record.insert("name".into(), s("Zoë"));
        record.insert("n".into(), Value::Float(2.0));
        let value = Value::Array(record);
        assert_eq!(
            call("json_encode", vec![value.clone()]).unwrap(),
            s(r#"{"url":"a\/b","name":"Zo\u00eb","n":2.0}"#)
        );
        let flags = JSON_UNESCAPED_SLASHES | JSON_UNESCAPED_UNICODE;
        assert_eq!(
            call("json_encode", vec![value, Value::Int(flags)]).unwrap(),
            s(r#"{"url":"a/b","name":"Zoë","n":2.0}"#)
        );
        assert_eq!(call("json_decode", vec![s("{bad")]).unwrap(), Value::Null);
    }

    #[test]
    fn test_dates_are_utc() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap();
        assert_eq!(format_date("Y-m-d H:i:s D jS \\o\\f F, t", at), "2024-03-01 14:05:09 Fri 1st of March, 31");
        assert_eq!(parse_time("2024-03-01", at).map(|t| t.timestamp()), Some(1_709_251_200));
        assert_eq!(parse_time("+1 day", at), Some(at + Duration::days(1)));
        assert_eq!(parse_time("2 weeks ago", at), Some(at - Duration::weeks(2)));
        assert_eq!(parse_time("not a date", at), None);
    }

    #[test]
    fn test_out_of_range_timestamps_are_false() {
        let huge = Value::Int(99_999_999_999_999_999);
        assert_eq!(call("date", vec![s("Y"), huge.clone()]).unwrap(), Value::Bool(false));
        assert_eq!(call("gmdate", vec![s("Y"), huge.clone()]).unwrap(), Value::Bool(false));
        assert_eq!(call("strtotime", vec![s("+1 day"), huge]).unwrap(), Value::Bool(false));
        assert_eq!(call("date", vec![s("Y"), Value::Int(0)]).unwrap(), s("1970"));
    }
}
