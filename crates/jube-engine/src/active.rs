//! Evaluation of an `active` boolean expression (§3: `Operation`/`Step::active`).
//!
//! `active` is substituted textually like any other template string; the common
//! case is a literal `"true"`/`"false"` left over after substitution, but the
//! original grammar allows an arbitrary boolean expression, so anything else falls
//! back to the same scripted-evaluation path `jube_core::parameter` uses for
//! `python`-mode parameters.

use std::collections::HashMap;
use std::process::Command;

use jube_core::parameter::substitute_text;

use crate::error::{EngineError, Result};

#[must_use]
fn trivially_true_or_false(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Resolved per §9's open question: op-level `active` gates the operation only;
/// step-level `active` gates workpackage *creation* (an inactive step is skipped
/// entirely, never becoming a dependency root or target).
pub fn evaluate(expr: &str, parameters: &HashMap<String, String>) -> Result<bool> {
    let substituted = substitute_text(expr, parameters);
    let trimmed = substituted.trim();
    if let Some(value) = trivially_true_or_false(trimmed) {
        return Ok(value);
    }

    let output = Command::new("python3")
        .arg("-c")
        .arg(format!("print(bool({trimmed}))"))
        .output()
        .map_err(|e| EngineError::Persistence(format!("failed to evaluate active expression \"{trimmed}\": {e}")))?;

    if !output.status.success() {
        return Err(EngineError::Persistence(format!(
            "active expression \"{trimmed}\" did not evaluate: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_true_and_false() {
        let params = HashMap::new();
        assert!(evaluate("true", &params).unwrap());
        assert!(!evaluate("false", &params).unwrap());
    }

    #[test]
    fn substitutes_before_evaluating() {
        let mut params = HashMap::new();
        params.insert("flag".to_string(), "true".to_string());
        assert!(evaluate("$flag", &params).unwrap());
    }
}
