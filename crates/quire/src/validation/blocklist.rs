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

//! Pattern screening of untrusted source before it is parsed or stored.
//!
//! Checks run in a fixed order and the first hit decides the message, so
//! callers see the same verdict for the same source every time.

use crate::model::ValidationResult;
use crate::script::{tokenize, Token, TokenKind};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Capabilities untrusted code may never reach, in the order they are
/// reported.
pub const DENY_LIST: &[&str] = &[
    // process execution
    "exec",
    "passthru",
    "shell_exec",
    "system",
    "proc_open",
    "popen",
    "pcntl_exec",
    // dynamic evaluation and callable indirection
    "eval",
    "assert",
    "create_function",
    "call_user_func",
    "call_user_func_array",
    "preg_replace",
    // inclusion
    "include",
    "include_once",
    "require",
    "require_once",
    "dl",
    // filesystem
    "file_put_contents",
    "file_get_contents",
    "unlink",
    "fopen",
    "file",
    "rename",
    "copy",
    "rmdir",
    "mkdir",
    "chmod",
    "chown",
    "touch",
    // database drivers and host handle methods
    "mysql_query",
    "mysqli_query",
    "pg_query",
    "sqlite_query",
    "PDO",
    "query",
    "get_results",
    "get_row",
    "get_col",
    "get_var",
    "prepare",
    // host http helpers
    "wp_remote_request",
    "wp_remote_get",
    "wp_remote_post",
    "wp_remote_head",
    // sockets
    "curl_exec",
    "curl_init",
    "fsockopen",
    "socket_create",
    // decoders used for obfuscation
    "base64_decode",
    "gzinflate",
    "gzuncompress",
    "gzdecode",
    "str_rot13",
];

const INCLUSION: &[&str] = &["include", "include_once", "require", "require_once"];

pub const CLEAN: &str = "No dangerous code detected.";

static VARIABLE_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$[a-zA-Z_\x7f-\x{10FFFF}]").expect("static pattern"));
static VARIABLE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$[a-zA-Z_\x7f-\x{10FFFF}][a-zA-Z0-9_\x7f-\x{10FFFF}]*\s*\(").expect("static pattern")
});
static OPEN_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<\?(php)?").expect("static pattern"));
static DB_HANDLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\$wpdb\s*->|\bglobal\s+\$wpdb\b").expect("static pattern"));
static BACKTICK: Lazy<Regex> = Lazy::new(|| Regex::new(r"`[^`]*`").expect("static pattern"));
static UNSERIALIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bunserialize\b").expect("static pattern"));
static REFLECTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bReflection\w*").expect("static pattern"));

struct DenyPattern {
    name: &'static str,
    call: Regex,
    matcher: Regex,
}

static DENY_PATTERNS: Lazy<Vec<DenyPattern>> = Lazy::new(|| {
    DENY_LIST
        .iter()
        .map(|name| {
            let escaped = regex::escape(name);
            DenyPattern {
                name,
                call: Regex::new(&format!(r"(?i)\b{escaped}\s*\(")).expect("escaped pattern"),
                matcher: Regex::new(&format!(
                    r#"(?i)(function_exists|is_callable)\s*\(\s*['"]{escaped}['"]"#
                ))
                .expect("escaped pattern"),
            }
        })
        .collect()
});

/// Case-insensitive deny-list membership, returning the canonical spelling.
pub fn denied(name: &str) -> Option<&'static str> {
    DENY_LIST.iter().copied().find(|d| d.eq_ignore_ascii_case(name))
}

pub fn check(source: &str) -> ValidationResult {
    let tokens = match tokenize(source) {
        Ok(tokens) => Some(tokens),
        Err(e) => {
            debug!(error = %e, "Token sweep skipped, source does not tokenize");
            None
        }
    };

    if VARIABLE_VARIABLE.is_match(source) {
        return ValidationResult::invalid("Variable variables ($$var) are not allowed for security reasons.");
    }
    if VARIABLE_CALL.is_match(source) {
        let mut message = String::from("Dynamic function calls using variables are not allowed.");
        if let Some(name) = tokens.as_deref().and_then(string_literal_reference) {
            message.pop();
            message.push_str(&format!(" (string literal references dangerous function '{name}')."));
        }
        return ValidationResult::invalid(message);
    }
    if OPEN_MARKER
        .find_iter(source)
        .any(|m| !m.as_str().eq_ignore_ascii_case("<?php"))
    {
        return ValidationResult::invalid("Short open tags (<?) are not allowed. Use <?php instead.");
    }

    for pattern in DENY_PATTERNS.iter() {
        if pattern.call.is_match(source) {
            return dangerous(pattern.name);
        }
        if pattern.matcher.is_match(source) {
            return ValidationResult::invalid(format!(
                "Attempting to check for dangerous function '{}' is not allowed.",
                pattern.name
            ));
        }
    }
    if let Some(name) = tokens.as_deref().and_then(sweep) {
        return dangerous(name);
    }

    if DB_HANDLE.is_match(source) {
        return ValidationResult::invalid("Direct database access using $wpdb is not allowed.");
    }
    if BACKTICK.is_match(source) {
        return ValidationResult::invalid("Backtick operators (`) for shell execution are not allowed.");
    }
    if UNSERIALIZE.is_match(source) {
        return ValidationResult::invalid("The unserialize() function is not allowed for security reasons.");
    }
    if REFLECTION.is_match(source) {
        return ValidationResult::invalid("Reflection classes and methods are not allowed for security reasons.");
    }

    ValidationResult::valid(CLEAN)
}

fn dangerous(name: &str) -> ValidationResult {
    ValidationResult::invalid(format!("Dangerous function '{name}' detected in code."))
}

/// Deny-listed identifiers used as calls. Comments between the name and the
/// parenthesis do not hide it, and inclusion constructs need no parenthesis.
fn sweep(tokens: &[Token]) -> Option<&'static str> {
    let significant: Vec<&Token> = tokens.iter().filter(|t| !t.is_trivia()).collect();
    significant.iter().enumerate().find_map(|(i, token)| {
        let name = denied(token.identifier()?)?;
        let called = significant.get(i + 1).is_some_and(|next| next.is_punct("("));
        let inclusion = INCLUSION.contains(&name);
        (called || inclusion).then_some(name)
    })
}

fn string_literal_reference(tokens: &[Token]) -> Option<&'static str> {
    tokens.iter().find_map(|token| match &token.kind {
        TokenKind::String(s) => denied(s.trim()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(source: &str) -> String {
        check(source).message
    }

    #[test]
    fn test_clean_source_passes() {
        let result = check("function enrich($record) { $record['x'] = strtoupper($record['x']); return $record; }");
        assert!(result.valid);
        assert_eq!(result.message, CLEAN);
    }

    #[test]
    fn test_variable_variables_rejected() {
        assert_eq!(
            message("function f($record) { $$name = 1; return $record; }"),
            "Variable variables ($$var) are not allowed for security reasons."
        );
    }

    #[test]
    fn test_dynamic_call_names_string_literal() {
        assert_eq!(
            message("function f($record) { $f = 'EXEC'; $f('ls'); return $record; }"),
            "Dynamic function calls using variables are not allowed (string literal references dangerous function 'exec')."
        );
        assert_eq!(
            message("function f($record) { $g = 'strlen'; return $g('x'); }"),
            "Dynamic function calls using variables are not allowed."
        );
    }

    #[test]
    fn test_short_open_tag_rejected() {
        assert!(check("<?php function f($record) { return $record; }").valid);
        assert_eq!(
            message("<? function f($record) { return $record; }"),
            "Short open tags (<?) are not allowed. Use <?php instead."
        );
        assert!(!check("<?= 1 ?>").valid);
    }

    #[test]
    fn test_deny_list_in_list_order() {
        assert_eq!(
            message("function f($record) { system('ls'); exec('ls'); return $record; }"),
            "Dangerous function 'exec' detected in code."
        );
        assert_eq!(
            message("function f($record) { return Base64_Decode ($record); }"),
            "Dangerous function 'base64_decode' detected in code."
        );
        // Words that merely contain a denied name are fine.
        assert!(check("function f($record) { return my_copy_helper($record); } function my_copy_helper($r) { return $r; }").valid);
    }

    #[test]
    fn test_existence_check_rejected() {
        assert_eq!(
            message("function f($record) { if (is_callable ( \"shell_exec\")) {} return $record; }"),
            "Attempting to check for dangerous function 'shell_exec' is not allowed."
        );
    }

    #[test]
    fn test_token_sweep_sees_through_comments() {
        assert_eq!(
            message("function f($record) { passthru/* hidden */('id'); return $record; }"),
            "Dangerous function 'passthru' detected in code."
        );
        assert_eq!(
            message("function f($record) { include 'other.php'; return $record; }"),
            "Dangerous function 'include' detected in code."
        );
    }

    #[test]
    fn test_remaining_checks() {
        assert_eq!(
            message("function f($record) { global $wpdb; return $record; }"),
            "Direct database access using $wpdb is not allowed."
        );
        assert_eq!(
            message("function f($record) { return `ls`; }"),
            "Backtick operators (`) for shell execution are not allowed."
        );
        assert_eq!(
            message("function f($record) { return unserialize($record); }"),
            "The unserialize() function is not allowed for security reasons."
        );
        assert_eq!(
            message("function f($record) { $r = new ReflectionClass('X'); return $record; }"),
            "Reflection classes and methods are not allowed for security reasons."
        );
    }
}
