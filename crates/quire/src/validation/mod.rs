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

pub mod blocklist;
pub mod syntax;

pub use syntax::{SyntaxCapabilities, SyntaxChecker};

use crate::logging;
use crate::model::ValidationResult;
use crate::script::builtins::is_builtin;
use once_cell::sync::Lazy;
use regex::Regex;

/// Words a function may not be named after, compared lowercase.
pub const RESERVED_WORDS: &[&str] = &[
    "abstract", "and", "array", "as", "break", "callable", "case", "catch", "class", "clone",
    "const", "continue", "declare", "default", "die", "do", "echo", "else", "elseif", "empty",
    "enddeclare", "endfor", "endforeach", "endif", "endswitch", "endwhile", "extends", "final",
    "finally", "fn", "for", "foreach", "function", "global", "goto", "if", "implements",
    "include", "include_once", "instanceof", "insteadof", "interface", "isset", "list", "match",
    "namespace", "new", "or", "print", "private", "protected", "public", "require",
    "require_once", "return", "static", "switch", "throw", "trait", "try", "unset", "use", "var",
    "while", "xor", "yield", "int", "float", "bool", "string", "true", "false", "null",
    "__class__", "__dir__", "__file__", "__function__", "__line__", "__method__",
    "__namespace__", "__trait__",
];

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_\x7f-\x{10FFFF}][a-zA-Z0-9_\x7f-\x{10FFFF}]*$").expect("static pattern")
});
static RETURN_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\breturn\b\s*[^;]*;").expect("static pattern"));

const INVALID_NAME: &str = "Invalid function name. Function names must start with a letter or \
     underscore, followed by any number of letters, numbers, or underscores.";

pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

pub fn is_reserved(name: &str) -> bool {
    let lowered = name.to_lowercase();
    RESERVED_WORDS.contains(&lowered.as_str())
}

/// The admission pipeline for user functions: naming rules, pattern
/// screening, declaration shape, then syntax.
#[derive(Debug, Clone, Default)]
pub struct FunctionValidator {
    syntax: SyntaxChecker,
}

impl FunctionValidator {
    pub fn new(syntax: SyntaxChecker) -> Self {
        Self { syntax }
    }

    pub fn syntax(&self) -> &SyntaxChecker {
        &self.syntax
    }

    pub async fn validate_function_code(&self, name: &str, code: &str) -> ValidationResult {
        let result = self.run(name.trim(), code.trim()).await;
        logging::log_validation(name.trim(), &result);
        result
    }

    async fn run(&self, name: &str, code: &str) -> ValidationResult {
        if let Some(result) = check_static(name, code) {
            return result;
        }

        let syntax = self.syntax.check_syntax(name, code).await;
        if !syntax.valid {
            return syntax;
        }

        ValidationResult {
            checked_by: syntax.checked_by,
            ..ValidationResult::valid("Function code is valid.")
        }
    }
}

/// Every check that needs no I/O, in pipeline order.
fn check_static(name: &str, code: &str) -> Option<ValidationResult> {
    if name.is_empty() {
        return Some(ValidationResult::invalid("Function name cannot be empty."));
    }
    if code.is_empty() {
        return Some(ValidationResult::invalid("Function code cannot be empty."));
    }
    if !is_identifier(name) {
        return Some(ValidationResult::invalid(INVALID_NAME));
    }
    if is_reserved(name) {
        return Some(ValidationResult::invalid(format!(
            "'{name}' is a reserved word and cannot be used as a function name."
        )));
    }
    if is_builtin(name) {
        return Some(ValidationResult::invalid(format!(
            "Function name '{name}' conflicts with an existing built-in function."
        )));
    }

    let screened = blocklist::check(code);
    if !screened.valid {
        return Some(screened);
    }

    let escaped = regex::escape(name);
    let (Ok(declaration), Ok(record_param)) = (
        Regex::new(&format!(r"(?i)function\s+{escaped}\s*\(")),
        Regex::new(&format!(r"(?i)function\s+{escaped}\s*\(\s*\$record\b")),
    ) else {
        return Some(ValidationResult::invalid(INVALID_NAME));
    };
    match declaration.find_iter(code).count() {
        0 => {
            return Some(ValidationResult::invalid(format!(
                "Function '{name}' declaration not found in code. \
                 Make sure the function name in your code matches '{name}'."
            )))
        }
        1 => {}
        _ => {
            return Some(ValidationResult::invalid(format!(
                "Function '{name}' is declared more than once."
            )))
        }
    }

    if !record_param.is_match(code) {
        return Some(ValidationResult::invalid(
            "Function must accept a $record parameter as the first argument.",
        ));
    }
    if !RETURN_STATEMENT.is_match(code) {
        return Some(ValidationResult::invalid("Function must include at least one return statement."));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyntaxLayer;

    async fn validate(name: &str, code: &str) -> ValidationResult {
        FunctionValidator::default().validate_function_code(name, code).await
    }

    #[tokio::test]
    async fn test_valid_function() {
        let result = validate(
            " enrich ",
            "function enrich($record) {\n    $record['total'] = $record['price'] * $record['qty'];\n    return $record;\n}",
        )
        .await;
        assert!(result.valid, "{}", result.message);
        assert_eq!(result.message, "Function code is valid.");
        assert_eq!(result.checked_by, Some(SyntaxLayer::Parser));
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        assert_eq!(validate("  ", "x").await.message, "Function name cannot be empty.");
        assert_eq!(validate("f", " \n ").await.message, "Function code cannot be empty.");
    }

    #[tokio::test]
    async fn test_naming_rules() {
        assert!(validate("9lives", "x").await.message.starts_with("Invalid function name."));
        assert!(validate("has-dash", "x").await.message.starts_with("Invalid function name."));
        assert_eq!(
            validate("Foreach", "x").await.message,
            "'Foreach' is a reserved word and cannot be used as a function name."
        );
        assert_eq!(
            validate("__LINE__", "x").await.message,
            "'__LINE__' is a reserved word and cannot be used as a function name."
        );
        assert_eq!(
            validate("StrLen", "x").await.message,
            "Function name 'StrLen' conflicts with an existing built-in function."
        );
        assert!(is_identifier("données"));
    }

    #[tokio::test]
    async fn test_blocklist_runs_before_declaration_checks() {
        assert_eq!(
            validate("f", "eval('1');").await.message,
            "Dangerous function 'eval' detected in code."
        );
    }

    #[tokio::test]
    async fn test_declaration_shape() {
        assert_eq!(
            validate("enrich", "function other($record) { return $record; }").await.message,
            "Function 'enrich' declaration not found in code. Make sure the function name in your code matches 'enrich'."
        );
        assert_eq!(
            validate("f", "function f($record) { return 1; }\nfunction F($record) { return 2; }")
                .await
                .message,
            "Function 'f' is declared more than once."
        );
        assert_eq!(
            validate("f", "function f($row) { return $row; }").await.message,
            "Function must accept a $record parameter as the first argument."
        );
        assert_eq!(
            validate("f", "function f($record) { $record['a'] = 1; }").await.message,
            "Function must include at least one return statement."
        );
    }

    #[tokio::test]
    async fn test_commented_declaration_is_not_admitted() {
        let result = validate("f", "function g($record) { return 1; } /* function f($record) */").await;
        assert!(!result.valid);
        assert_eq!(
            result.message,
            "Function declaration for 'f' not found in code. Make sure your function is properly defined."
        );
        assert_eq!(result.checked_by, Some(SyntaxLayer::Parser));
    }

    #[tokio::test]
    async fn test_syntax_failure_surfaces() {
        let result = validate("f", "function f($record) { $x = ; return $record; }").await;
        assert!(!result.valid);
        assert!(result.message.starts_with("Syntax error: "), "{}", result.message);
        assert_eq!(result.checked_by, Some(SyntaxLayer::Parser));
    }

    #[tokio::test]
    async fn test_verdict_is_stable() {
        let code = "function f($record) { return array_map_keys($record); }";
        assert_eq!(validate("f", code).await, validate("f", code).await);
    }
}
