//! Variable interpolation for strings
//!
//! Replaces `${VAR}` references in declared environment values. Lookups go to
//! the supplied variables first, then to the orchestrator's environment.

use crate::error::{TemplateError, TemplateResult};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::env;
use std::sync::OnceLock;

const MAX_DEPTH: usize = 16;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

fn lookup(name: &str, vars: &HashMap<String, String>) -> Option<String> {
    vars.get(name).cloned().or_else(|| env::var(name).ok())
}

/// Interpolate variables in a string, leaving unknown references untouched
pub fn interpolate(s: &str, vars: &HashMap<String, String>) -> TemplateResult<String> {
    expand(s, vars, 0)
}

fn expand(s: &str, vars: &HashMap<String, String>, depth: usize) -> TemplateResult<String> {
    if depth > MAX_DEPTH {
        return Err(TemplateError::RecursiveInterpolation);
    }

    let mut error = None;
    let result = variable_pattern().replace_all(s, |caps: &Captures| {
        let name = &caps[1];
        match lookup(name, vars) {
            Some(value) if variable_pattern().is_match(&value) => {
                match expand(&value, vars, depth + 1) {
                    Ok(expanded) => expanded,
                    Err(e) => {
                        error.get_or_insert(e);
                        String::new()
                    }
                }
            }
            Some(value) => value,
            None => caps[0].to_string(),
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(result.into_owned()),
    }
}
