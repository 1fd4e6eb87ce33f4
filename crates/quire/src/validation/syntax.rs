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

//! Layered syntax checking. The parser is authoritative; an external lint
//! binary and a token balance check stand in when it is switched off.

use crate::config::ValidationConfig;
use crate::model::{SyntaxLayer, ValidationResult};
use crate::script::{parse, tokenize, TokenKind};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

static LINT_PARSE_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Parse error:\s*(.+?)\s*in\s*.+?\s*on\s*line\s*\d+").expect("static pattern"));

/// Which layers this process may use, decided once at startup.
#[derive(Debug, Clone)]
pub struct SyntaxCapabilities {
    pub parser: bool,
    pub lint_binaries: Vec<String>,
    pub lint_timeout: Duration,
    pub tokens: bool,
}

impl SyntaxCapabilities {
    pub fn resolve(config: &ValidationConfig) -> Self {
        let capabilities = Self {
            parser: config.parser,
            lint_binaries: if config.lint {
                config.lint_binaries.clone()
            } else {
                Vec::new()
            },
            lint_timeout: Duration::from_millis(config.lint_timeout_ms),
            tokens: config.tokens,
        };
        info!(
            parser = capabilities.parser,
            lint_candidates = capabilities.lint_binaries.len(),
            tokens = capabilities.tokens,
            "Syntax checking layers resolved"
        );
        capabilities
    }

    pub fn parser_only() -> Self {
        Self {
            parser: true,
            lint_binaries: Vec::new(),
            lint_timeout: Duration::from_secs(5),
            tokens: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntaxChecker {
    capabilities: SyntaxCapabilities,
}

impl SyntaxChecker {
    pub fn new(capabilities: SyntaxCapabilities) -> Self {
        Self { capabilities }
    }

    pub fn capabilities(&self) -> &SyntaxCapabilities {
        &self.capabilities
    }

    pub async fn check_syntax(&self, name: &str, source: &str) -> ValidationResult {
        if self.capabilities.parser {
            return check_with_parser(name, source).checked_by(SyntaxLayer::Parser);
        }

        let result = match self.check_with_lint(source).await {
            Some(result) => result.checked_by(SyntaxLayer::Lint),
            None if self.capabilities.tokens => check_with_tokens(source).checked_by(SyntaxLayer::Tokens),
            None => ValidationResult::valid("Syntax check skipped: no syntax checking layer is available.")
                .checked_by(SyntaxLayer::Unavailable),
        };
        warn!(
            function = name,
            layer = ?result.checked_by,
            valid = result.valid,
            "Syntax verdict came from a fallback layer"
        );
        result
    }

    /// Runs each candidate `-l` binary until one gives a verdict.
    async fn check_with_lint(&self, source: &str) -> Option<ValidationResult> {
        if self.capabilities.lint_binaries.is_empty() {
            return None;
        }

        let code = source.trim_start();
        let code = match code.get(..5) {
            Some(tag) if tag.eq_ignore_ascii_case("<?php") => &code[5..],
            _ => code,
        };
        let namespace = format!("Quire_Validator_{:x}", md5::compute(Uuid::new_v4().as_bytes()));
        let wrapped = format!("<?php\nnamespace {namespace};\n{code}\n?>");

        let mut file = match tempfile::Builder::new()
            .prefix("quire-syntax-check-")
            .suffix(".php")
            .tempfile()
        {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Could not create lint file");
                return None;
            }
        };
        if let Err(e) = file.write_all(wrapped.as_bytes()).and_then(|_| file.flush()) {
            warn!(error = %e, "Could not write lint file");
            return None;
        }

        let mut last_failure: Option<String> = None;
        for binary in &self.capabilities.lint_binaries {
            let child = Command::new(binary)
                .arg("-l")
                .arg(file.path())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn();
            let child = match child {
                Ok(child) => child,
                Err(e) => {
                    debug!(binary = %binary, error = %e, "Lint binary not usable");
                    continue;
                }
            };
            let output = match tokio::time::timeout(self.capabilities.lint_timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    debug!(binary = %binary, error = %e, "Lint binary failed");
                    continue;
                }
                Err(_) => {
                    warn!(binary = %binary, "Lint binary timed out and was killed");
                    continue;
                }
            };

            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));

            if text.contains("php-fpm") && text.contains("Usage:") && text.contains("-t") {
                debug!(binary = %binary, "Skipping FastCGI binary");
                last_failure = None;
                continue;
            }
            if text.contains("No syntax errors") {
                return Some(ValidationResult::valid("Syntax is valid (checked by external lint)."));
            }
            if !output.status.success() && text.contains("Parse error:") {
                return Some(ValidationResult::invalid(format!("Syntax error: {}", lint_error(&text))));
            }
            last_failure = (!output.status.success() && !text.trim().is_empty()).then_some(text);
        }

        last_failure.map(|text| ValidationResult::invalid(format!("Syntax error: {}", lint_error(&text))))
    }
}

impl Default for SyntaxChecker {
    fn default() -> Self {
        Self::new(SyntaxCapabilities::parser_only())
    }
}

fn lint_error(output: &str) -> String {
    LINT_PARSE_ERROR
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| "Unknown syntax error".to_string(), |m| m.as_str().to_string())
}

pub fn check_with_parser(name: &str, source: &str) -> ValidationResult {
    let program = match parse(source) {
        Ok(program) => program,
        Err(e) => return ValidationResult::invalid(format!("Syntax error: {} on line {}", e.message, e.line)),
    };

    // Only a real top-level declaration counts; names in comments or
    // strings do not.
    if program.function(name).is_none() {
        return ValidationResult::invalid(format!(
            "Function declaration for '{name}' not found in code. Make sure your function is properly defined."
        ));
    }
    if program.items.len() > 1 {
        return ValidationResult::invalid("Only a single top-level function declaration is allowed.");
    }

    ValidationResult::valid("Syntax is valid (checked by parser).")
}

pub fn check_with_tokens(source: &str) -> ValidationResult {
    let tokens = match tokenize(source) {
        Ok(tokens) => tokens,
        Err(e) => return ValidationResult::invalid(format!("Syntax error: Unable to tokenize code ({e}).")),
    };

    let (mut braces, mut parens, mut brackets) = (0i64, 0i64, 0i64);
    let (mut has_function, mut has_return) = (false, false);
    for token in &tokens {
        match &token.kind {
            TokenKind::Punct("{") => braces += 1,
            TokenKind::Punct("}") => braces -= 1,
            TokenKind::Punct("(") => parens += 1,
            TokenKind::Punct(")") => parens -= 1,
            TokenKind::Punct("[") => brackets += 1,
            TokenKind::Punct("]") => brackets -= 1,
            _ if token.is_word("function") => has_function = true,
            _ if token.is_word("return") => has_return = true,
            _ => {}
        }
        if braces < 0 || parens < 0 || brackets < 0 {
            return ValidationResult::invalid("Syntax error: Unexpected closing brace, parenthesis, or bracket.");
        }
    }

    if braces != 0 || parens != 0 || brackets != 0 {
        let mut message = String::from("Syntax error: ");
        if braces != 0 {
            message.push_str("Unbalanced curly braces. ");
        }
        if parens != 0 {
            message.push_str("Unbalanced parentheses. ");
        }
        if brackets != 0 {
            message.push_str("Unbalanced brackets. ");
        }
        return ValidationResult::invalid(message);
    }
    if !has_function {
        return ValidationResult::invalid("Syntax error: No function declaration found.");
    }
    if !has_return {
        return ValidationResult::invalid("Syntax error: No return statement found.");
    }

    ValidationResult::valid("Syntax appears valid (based on limited token analysis).")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback(lint_binaries: Vec<String>, tokens: bool) -> SyntaxChecker {
        SyntaxChecker::new(SyntaxCapabilities {
            parser: false,
            lint_binaries,
            lint_timeout: Duration::from_millis(500),
            tokens,
        })
    }

    #[tokio::test]
    async fn test_parser_layer_accepts_single_function() {
        let result = SyntaxChecker::default()
            .check_syntax("enrich", "<?php\nfunction enrich($record) {\n  return $record;\n}")
            .await;
        assert!(result.valid, "{}", result.message);
        assert_eq!(result.message, "Syntax is valid (checked by parser).");
        assert_eq!(result.checked_by, Some(SyntaxLayer::Parser));
    }

    #[test]
    fn test_parser_layer_reports_line() {
        let result = check_with_parser("f", "function f($record) {\n  $x = ;\n  return $record;\n}");
        assert!(!result.valid);
        assert!(result.message.starts_with("Syntax error: "), "{}", result.message);
        assert!(result.message.ends_with("on line 2"), "{}", result.message);
    }

    #[test]
    fn test_parser_layer_rejects_extra_items() {
        let result = check_with_parser(
            "f",
            "function f($record) { return helper($record); }\nfunction helper($r) { return $r; }",
        );
        assert_eq!(result.message, "Only a single top-level function declaration is allowed.");

        let result = check_with_parser("f", "function f($record) { return $record; }\n$leak = 1;");
        assert_eq!(result.message, "Only a single top-level function declaration is allowed.");
    }

    #[test]
    fn test_entry_must_be_a_real_declaration() {
        assert!(check_with_parser("enrich", "function ENRICH($record) { return $record; }").valid);

        let result = check_with_parser("f", "function g($record) { return 1; } /* function f($record) */");
        assert!(!result.valid);
        assert_eq!(
            result.message,
            "Function declaration for 'f' not found in code. Make sure your function is properly defined."
        );

        let quoted = check_with_parser("f", "function g($record) { return 'function f($record) {}'; }");
        assert!(!quoted.valid);
    }

    #[test]
    fn test_token_layer_messages() {
        assert_eq!(
            check_with_tokens("function f($record) { return $record; }}").message,
            "Syntax error: Unexpected closing brace, parenthesis, or bracket."
        );
        assert_eq!(
            check_with_tokens("function f($record) { return [$record;").message,
            "Syntax error: Unbalanced curly braces. Unbalanced brackets. "
        );
        assert_eq!(
            check_with_tokens("$x = 1; return $x;").message,
            "Syntax error: No function declaration found."
        );
        assert_eq!(
            check_with_tokens("function f($record) { $record; }").message,
            "Syntax error: No return statement found."
        );
        assert!(check_with_tokens("function f($record) { return $record; }").valid);
        assert!(check_with_tokens("function f($record) { return 'open; }")
            .message
            .starts_with("Syntax error: Unable to tokenize code ("));
    }

    #[tokio::test]
    async fn test_missing_lint_binary_falls_back_to_tokens() {
        let checker = fallback(vec!["/nonexistent/quire-php".into()], true);
        let result = checker.check_syntax("f", "function f($record) { return $record; }").await;
        assert!(result.valid);
        assert_eq!(result.checked_by, Some(SyntaxLayer::Tokens));
    }

    #[tokio::test]
    async fn test_no_layer_never_blocks() {
        let result = fallback(Vec::new(), false).check_syntax("f", "function f(").await;
        assert!(result.valid);
        assert_eq!(result.message, "Syntax check skipped: no syntax checking layer is available.");
        assert_eq!(result.checked_by, Some(SyntaxLayer::Unavailable));
    }

    #[cfg(unix)]
    fn fake_lint(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lint_layer_verdicts() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = fake_lint(&dir, "fpm", "echo 'Usage: php-fpm [-t]'; exit 64");
        let ok = fake_lint(&dir, "ok", "echo \"No syntax errors detected in $2\"");
        let result = fallback(vec![fpm.clone(), ok], true)
            .check_syntax("f", "function f($record) { return $record; }")
            .await;
        assert_eq!(result.message, "Syntax is valid (checked by external lint).");
        assert_eq!(result.checked_by, Some(SyntaxLayer::Lint));

        let bad = fake_lint(
            &dir,
            "bad",
            "echo \"PHP Parse error:  syntax error, unexpected '}' in $2 on line 4\"; exit 255",
        );
        let result = fallback(vec![bad], true).check_syntax("f", "function f($record) { }").await;
        assert_eq!(result.message, "Syntax error: syntax error, unexpected '}'");

        let opaque = fake_lint(&dir, "opaque", "echo 'segfault'; exit 1");
        let result = fallback(vec![opaque], true).check_syntax("f", "function f($record) { }").await;
        assert_eq!(result.message, "Syntax error: Unknown syntax error");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lint_timeout_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let slow = fake_lint(&dir, "slow", "sleep 5");
        let result = fallback(vec![slow], true)
            .check_syntax("f", "function f($record) { return $record; }")
            .await;
        assert_eq!(result.checked_by, Some(SyntaxLayer::Tokens));
    }
}
