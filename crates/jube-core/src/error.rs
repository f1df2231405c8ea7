//! Model- and parameter-level errors (spec errors and consistency errors, per the
//! engine's error-kind table: these are fatal before a benchmark ever starts running).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parameter \"{name}\" references unresolved name \"{reference}\"")]
    UnresolvedParameter { name: String, reference: String },

    #[error("substitution of parameter set did not converge after {max_passes} passes; unresolved: {remaining:?}")]
    SubstitutionDidNotConverge {
        max_passes: usize,
        remaining: Vec<String>,
    },

    #[error("use group is internally incompatible: \"{name}\" is redefined with conflicting options")]
    IncompatibleUse { name: String },

    #[error("duplicate policy conflict on parameter \"{name}\": existing policy {existing}, new policy {new}")]
    DuplicatePolicyConflict {
        name: String,
        existing: &'static str,
        new: &'static str,
    },

    #[error("parameter \"{name}\" added twice under duplicate policy \"error\"")]
    DuplicateError { name: String },

    #[error("parameter \"{name}\" added twice under duplicate policy \"none\" with differing definitions")]
    DuplicateNotIdentical { name: String },

    #[error("cannot concat parameter \"{name}\": options differ between the two definitions")]
    ConcatOptionMismatch { name: String },

    #[error("cyclic dependency detected among steps: {cycle:?}")]
    CyclicDependency { cycle: Vec<String> },

    #[error("duplicate set name \"{name}\"")]
    DuplicateSetName { name: String },

    #[error("unknown step \"{name}\" referenced as a dependency")]
    UnknownStep { name: String },

    #[error("scripted parameter \"{name}\" uses unsupported mode \"{mode}\"")]
    UnsupportedScriptMode { name: String, mode: &'static str },

    #[error("failed to evaluate scripted parameter \"{name}\": {message}")]
    ScriptEvaluationFailed { name: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
