// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Static safety policy for R fragments.
//!
//! Every check here is a pattern or structural check over the fragment
//! text; nothing is ever executed. The first violation wins. The policy is
//! a best-effort filter against session corruption, not a sandbox.

use crate::error::{BridgeError, BridgeResult};
use regex::Regex;
use std::sync::OnceLock;

/// Patterns blocked for every capability role: scoped assignment into
/// enclosing environments and calls that mutate the session, the
/// filesystem view, or the process itself.
const COMMON_BLOCKED_PATTERNS: &[&str] = &[
    r"<<-",
    r"->>",
    r"(?im)(^|[^A-Za-z0-9_.])(save|saveRDS|load|setwd|options|Sys\.setenv|library|require|attach|detach|sink|system|system2)\s*\(",
    r"(?im)(^|[^A-Za-z0-9_.])(q|quit)\s*\(",
];

/// Additionally blocked for appended code: file writers and graphics
/// device openers. Appends run repeatedly and must stay side-effect free.
const APPEND_FILE_BLOCKED_PATTERNS: &[&str] = &[
    r"(?im)(^|[^A-Za-z0-9_.])(write|writeLines|write\.csv|write\.csv2|write\.delim|write\.delim2|write\.table|fwrite|cat|saveRDS|save|load|file\.create|dir\.create|unlink|file\.remove|file\.rename|file\.copy|file\.append|download\.file|png|jpeg|svg|bmp|tiff|pdf|postscript|quartz|x11)\s*\(",
];

fn common_blocklist() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        COMMON_BLOCKED_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("static policy pattern"))
            .collect()
    })
}

fn append_file_blocklist() -> &'static Vec<Regex> {
    static SET: OnceLock<Vec<Regex>> = OnceLock::new();
    SET.get_or_init(|| {
        APPEND_FILE_BLOCKED_PATTERNS
            .iter()
            .map(|p| Regex::new(p).expect("static policy pattern"))
            .collect()
    })
}

fn pattern(src: &'static str, cell: &'static OnceLock<Regex>) -> &'static Regex {
    cell.get_or_init(|| Regex::new(src).expect("static policy pattern"))
}

fn source_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"(?im)(^|[^A-Za-z0-9_.])source\s*\(", &RE)
}

fn source_local_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"(?im)source\s*\([^)]*local\s*=", &RE)
}

fn source_local_false_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"(?im)source\s*\([^)]*local\s*=\s*FALSE", &RE)
}

fn global_env_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"(?im)(^|[^A-Za-z0-9_.])(\.GlobalEnv|globalenv\s*\()", &RE)
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"^[A-Za-z.][A-Za-z0-9._]*$", &RE)
}

fn trailing_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(r"(?m)(<-|->|=)\s*$", &RE)
}

/// Check a fragment against the common blocklist, including the
/// `source(...)` rule: loading an external file is only allowed when it
/// is explicitly scoped with `local=` and never with `local = FALSE`.
pub fn validate_common_blocklist(code: &str, label: &str) -> BridgeResult<()> {
    for (regex, src) in common_blocklist().iter().zip(COMMON_BLOCKED_PATTERNS) {
        if regex.is_match(code) {
            return Err(BridgeError::policy(format!(
                "{label} contains blocked pattern ({src})."
            )));
        }
    }

    if source_call_re().is_match(code) {
        if !source_local_re().is_match(code) {
            return Err(BridgeError::policy(format!(
                "{label} uses source(...) without local= explicitly set."
            )));
        }
        if source_local_false_re().is_match(code) {
            return Err(BridgeError::policy(format!(
                "{label} uses source(..., local = FALSE), which is not allowed."
            )));
        }
    }

    Ok(())
}

/// Reject left- and right-arrow assignment in expression roles.
pub fn validate_assignment_free(code: &str, label: &str) -> BridgeResult<()> {
    if code.contains("<-") {
        return Err(BridgeError::policy(format!(
            "{label} cannot contain '<-' assignment."
        )));
    }
    if code.contains("->") {
        return Err(BridgeError::policy(format!(
            "{label} cannot contain right-arrow assignment."
        )));
    }
    Ok(())
}

/// Appended code runs inside a scratch environment; it must stay
/// write-free and must not reach for the global environment by name.
pub fn validate_append_fragment(code: &str) -> BridgeResult<()> {
    if code.trim().is_empty() {
        return Err(BridgeError::malformed("append cannot be empty."));
    }
    validate_common_blocklist(code, "Appended code")?;
    if global_env_re().is_match(code) {
        return Err(BridgeError::policy(
            "Appended code cannot directly target .GlobalEnv.",
        ));
    }
    for (regex, _) in append_file_blocklist().iter().zip(APPEND_FILE_BLOCKED_PATTERNS) {
        if regex.is_match(code) {
            return Err(BridgeError::policy("append may not write files."));
        }
    }
    Ok(())
}

pub fn validate_result_expr(expr: &str) -> BridgeResult<()> {
    validate_single_line_expr(expr, "result", "Result expression")
}

pub fn validate_export_expr(expr: &str) -> BridgeResult<()> {
    validate_single_line_expr(expr, "export", "Export expression")
}

fn validate_single_line_expr(expr: &str, role: &str, label: &str) -> BridgeResult<()> {
    if expr.trim().is_empty() {
        return Err(BridgeError::malformed(format!("{role} cannot be empty.")));
    }
    if expr.contains('\n') {
        return Err(BridgeError::malformed(format!("{role} must be one line.")));
    }
    validate_common_blocklist(expr, label)?;
    validate_assignment_free(expr, label)
}

/// Global-modify fragments are evaluated against the global environment
/// on purpose, so only the common blocklist applies.
pub fn validate_modify_fragment(code: &str) -> BridgeResult<()> {
    if code.trim().is_empty() {
        return Err(BridgeError::malformed("modify cannot be empty."));
    }
    validate_common_blocklist(code, "Global-modify code")
}

pub fn validate_identifier(value: &str, label: &str) -> BridgeResult<()> {
    if !identifier_re().is_match(value) {
        return Err(BridgeError::malformed(format!(
            "{label} '{value}' is not a valid identifier."
        )));
    }
    Ok(())
}

/// Split and validate a `<name>:=<expr>` create spec. Returns the
/// trimmed name and expression.
pub fn parse_create_spec(spec: &str, label: &str) -> BridgeResult<(String, String)> {
    let Some((name_part, expr_part)) = spec.split_once(":=") else {
        return Err(BridgeError::malformed(format!(
            "{label} requires '<name>:=<expr>'."
        )));
    };

    let name = name_part.trim().to_string();
    let expr = expr_part.trim().to_string();
    if name.is_empty() || expr.is_empty() {
        return Err(BridgeError::malformed(format!(
            "{label} requires non-empty name and expression."
        )));
    }

    validate_identifier(&name, &format!("{label} name"))?;
    if trailing_assign_re().is_match(&expr) {
        return Err(BridgeError::malformed(format!(
            "{label} expression for '{name}' looks incomplete."
        )));
    }

    let expr_label = format!("{label} expression '{name}'");
    validate_common_blocklist(&expr, &expr_label)?;
    validate_assignment_free(&expr, &expr_label)?;
    Ok((name, expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_policy(err: &BridgeError) -> bool {
        matches!(err, BridgeError::Policy(_))
    }

    fn is_malformed(err: &BridgeError) -> bool {
        matches!(err, BridgeError::MalformedRequest(_))
    }

    #[test]
    fn arrow_assignment_rejected_in_every_role() {
        let err = validate_result_expr("x <- 1").unwrap_err();
        assert!(is_policy(&err));
        let err = validate_export_expr("1 -> x").unwrap_err();
        assert!(is_policy(&err));
        let err = validate_append_fragment("y <<- 2").unwrap_err();
        assert!(is_policy(&err));
        let err = validate_modify_fragment("2 ->> y").unwrap_err();
        assert!(is_policy(&err));
        let err = parse_create_spec("x:=a <<- 1", "create").unwrap_err();
        assert!(is_policy(&err));
    }

    #[test]
    fn session_mutating_calls_rejected() {
        for code in [
            "setwd(\"/tmp\")",
            "library(dplyr)",
            "system(\"ls\")",
            "Sys.setenv(FOO = \"1\")",
            "quit()",
        ] {
            let err = validate_modify_fragment(code).unwrap_err();
            assert!(is_policy(&err), "{code} should be blocked");
        }
    }

    #[test]
    fn blocklist_matches_are_word_boundary_aware() {
        // mysave() and df$load() are not the blocked primitives
        validate_modify_fragment("mysave(1)").unwrap();
        validate_modify_fragment("obj.load(1)").unwrap();
    }

    #[test]
    fn source_requires_explicit_local_scope() {
        let err = validate_modify_fragment("source(\"f.R\")").unwrap_err();
        assert!(is_policy(&err));
        let err = validate_modify_fragment("source(\"f.R\", local = FALSE)").unwrap_err();
        assert!(is_policy(&err));
        validate_modify_fragment("source(\"f.R\", local = TRUE)").unwrap();
    }

    #[test]
    fn append_blocks_file_writers_and_devices() {
        for code in ["write.csv(df, \"x.csv\")", "png(\"p.png\")", "unlink(\"x\")"] {
            let err = validate_append_fragment(code).unwrap_err();
            assert!(is_policy(&err), "{code} should be blocked");
        }
        validate_append_fragment("z <- head(mtcars)").unwrap();
    }

    #[test]
    fn append_cannot_target_global_env() {
        let err = validate_append_fragment("assign(\"x\", 1, envir = .GlobalEnv)").unwrap_err();
        assert!(is_policy(&err));
        let err = validate_append_fragment("ls(globalenv())").unwrap_err();
        assert!(is_policy(&err));
    }

    #[test]
    fn result_must_be_single_nonempty_line() {
        assert!(is_malformed(&validate_result_expr("  ").unwrap_err()));
        assert!(is_malformed(&validate_result_expr("1 +\n1").unwrap_err()));
        validate_result_expr("sum(1:10)").unwrap();
    }

    #[test]
    fn create_spec_requires_name_and_expr() {
        assert!(is_malformed(&parse_create_spec("x = 5", "create").unwrap_err()));
        assert!(is_malformed(&parse_create_spec(":=5", "create").unwrap_err()));
        assert!(is_malformed(&parse_create_spec("x:=", "create").unwrap_err()));
        assert!(is_malformed(
            &parse_create_spec("1x:=5", "create").unwrap_err()
        ));

        let (name, expr) = parse_create_spec(" .x1 := rnorm(3) ", "create").unwrap();
        assert_eq!(name, ".x1");
        assert_eq!(expr, "rnorm(3)");
    }

    #[test]
    fn create_expr_must_not_look_truncated() {
        assert!(is_malformed(
            &parse_create_spec("x:=foo =", "create").unwrap_err()
        ));
        assert!(is_policy(
            &parse_create_spec("x:=bar <- 1", "create").unwrap_err()
        ));
    }
}
