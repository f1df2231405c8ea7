//! Shared value types for the parameter and step model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A workpackage identifier: a monotonic counter scoped to one benchmark run.
///
/// Unlike request- or run-scoped ids elsewhere in this kind of system, JUBE ids are
/// small dense integers because they double as the on-disk directory suffix
/// (`<6-digit-id>_<step>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkpackageId(pub u64);

impl WorkpackageId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Zero-padded directory component, e.g. `000042`.
    #[must_use]
    pub fn padded(self) -> String {
        format!("{:06}", self.0)
    }
}

impl fmt::Display for WorkpackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declared content type of a parameter's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    String,
    Int,
    Float,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::String
    }
}

/// Evaluation mode of a parameter's raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterMode {
    /// Plain textual substitution, no code evaluation.
    Text,
    /// Value is a shell expression, evaluated once all references are static.
    Shell,
    /// Value is a Python expression, evaluated the same way via a `python3` subprocess.
    Python,
}

impl ParameterMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Shell => "shell",
            Self::Python => "python",
        }
    }

    #[must_use]
    pub fn is_scripted(self) -> bool {
        matches!(self, Self::Shell | Self::Python)
    }
}

impl Default for ParameterMode {
    fn default() -> Self {
        Self::Text
    }
}

/// The phase at which a parameter is permitted to re-evaluate.
///
/// Ordered `Jube < Use < Step < Cycle < Always`; `rank()` gives the total order used by
/// `ParameterSet::get_updatable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Never,
    Jube,
    Use,
    Step,
    Cycle,
    Always,
}

impl UpdateMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Jube => "jube",
            Self::Use => "use",
            Self::Step => "step",
            Self::Cycle => "cycle",
            Self::Always => "always",
        }
    }

    /// Total order used to decide whether this mode is due at `phase`.
    ///
    /// A parameter is updatable at `phase` iff `self.rank() <= phase.rank()` and
    /// `self != Never`.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Never => 0,
            Self::Jube => 1,
            Self::Use => 2,
            Self::Step => 3,
            Self::Cycle => 4,
            Self::Always => 5,
        }
    }

    #[must_use]
    pub fn is_due_at(self, phase: Self) -> bool {
        self != Self::Never && self.rank() <= phase.rank()
    }
}

impl Default for UpdateMode {
    fn default() -> Self {
        Self::Use
    }
}

/// Conflict-resolution policy applied when a name is added twice to the same set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Last write wins.
    Replace,
    /// Template values from both sides are concatenated (requires equal options).
    Concat,
    /// Raise on any redefinition.
    Error,
    /// Accept only if the new definition is structurally identical to the existing one.
    None,
}

impl DuplicatePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Concat => "concat",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self::Replace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workpackage_id_padding() {
        assert_eq!(WorkpackageId(0).padded(), "000000");
        assert_eq!(WorkpackageId(42).padded(), "000042");
        assert_eq!(WorkpackageId(123_456).padded(), "123456");
    }

    #[test]
    fn workpackage_id_next_is_monotonic() {
        let a = WorkpackageId(5);
        assert_eq!(a.next(), WorkpackageId(6));
    }

    #[test]
    fn update_mode_ordering() {
        assert!(UpdateMode::Jube.rank() < UpdateMode::Use.rank());
        assert!(UpdateMode::Use.rank() < UpdateMode::Step.rank());
        assert!(UpdateMode::Step.rank() < UpdateMode::Cycle.rank());
        assert!(UpdateMode::Cycle.rank() < UpdateMode::Always.rank());
    }

    #[test]
    fn update_mode_due_at_respects_never() {
        assert!(!UpdateMode::Never.is_due_at(UpdateMode::Always));
    }

    #[test]
    fn update_mode_due_at_is_monotonic_in_phase() {
        assert!(UpdateMode::Step.is_due_at(UpdateMode::Cycle));
        assert!(!UpdateMode::Cycle.is_due_at(UpdateMode::Step));
    }
}
