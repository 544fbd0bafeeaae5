//! Error types for sandbox operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while running an installer.
///
/// Installer failures are not errors: a non-zero exit, a timeout, or a
/// cancellation are all reported through [`crate::RunOutcome`]. These variants
/// cover faults of the engine itself.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The program could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// The per-job log could not be opened or written.
    #[error("job log {path}: {source}")]
    Log {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The child's exit status could not be collected.
    #[error("failed to wait for child process: {0}")]
    Wait(std::io::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
