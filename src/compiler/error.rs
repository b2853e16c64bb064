//! Compiler and artifact cache errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Module contains no operations")]
    EmptyModule,

    #[error("Compiler {compiler} failed (status {status:?}): {stderr}")]
    CompilerFailed {
        compiler: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Compiler produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hash mismatch for artifact {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid artifact metadata: {0}")]
    InvalidMetadata(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Compile task failed: {0}")]
    TaskFailed(String),
}

impl CompileError {
    /// True for on-disk entries that should be discarded and rebuilt.
    pub fn is_corrupt_artifact(&self) -> bool {
        matches!(self, Self::HashMismatch { .. } | Self::InvalidMetadata(_))
    }
}
