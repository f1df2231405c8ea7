//! Scheduling, execution and persistence errors (runtime op failures, I/O errors on
//! state writes, version mismatches) — the error kinds that only ever arise once a
//! benchmark has started running, as opposed to `jube_core::Error`'s spec/consistency
//! errors which are always fatal before running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] jube_core::Error),

    #[error("operation \"{do_string}\" failed in {work_dir}\n--- stderr tail ---\n{stderr_tail}")]
    OperationFailed {
        do_string: String,
        work_dir: String,
        stderr_tail: String,
    },

    #[error("operation \"{do_string}\" reported an error file: {error_file}")]
    ErrorFileDetected { do_string: String, error_file: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("benchmark format version {found} is newer than the {supported} this engine supports")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("unknown workpackage id {0}")]
    UnknownWorkpackage(u64),
}

pub type Result<T> = std::result::Result<T, EngineError>;
