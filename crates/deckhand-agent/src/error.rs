//! Error types for the job pipeline and its collaborators.

use std::time::Duration;

use chrono::{DateTime, Utc};
use deckhand_types::{ExecutionResult, FailureKind, JobId};
use thiserror::Error;

use crate::path_guard::PathGuardError;
use crate::platform::PlatformError;
use crate::signature::SignatureError;
use crate::validator::ValidationError;

/// Why a job did not succeed.
///
/// Every variant maps onto exactly one [`FailureKind`]; the `Display` text is
/// the detail that follows the kind's label in the result's `error` string.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    Authentication(#[from] SignatureError),

    #[error("no contract for application '{0}'")]
    ContractNotFound(String),

    #[error("contract for '{app_id}' is invalid: {message}")]
    ContractInvalid { app_id: String, message: String },

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    UnsafePath(#[from] PathGuardError),

    #[error("{0}")]
    UnsupportedPlatform(#[from] PlatformError),

    /// Installer exited 1: it refused the inputs it was given.
    #[error("installer rejected its inputs (exit code {0})")]
    InputsRejected(i32),

    #[error("installer failed with exit code {0}")]
    Installation(i32),

    #[error("installer reported a configuration problem (exit code {0})")]
    Configuration(i32),

    #[error("installer exceeded its {}s timeout", .0.as_secs())]
    Timeout(Duration),

    #[error("agent shut down while the installer was running")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Authentication(_) => FailureKind::Authentication,
            Self::ContractNotFound(_) => FailureKind::ContractNotFound,
            Self::ContractInvalid { .. } => FailureKind::ContractInvalid,
            Self::Validation(_) | Self::InputsRejected(_) => FailureKind::Validation,
            Self::UnsafePath(_) => FailureKind::UnsafePath,
            Self::UnsupportedPlatform(_) => FailureKind::UnsupportedPlatform,
            Self::Installation(_) => FailureKind::Installation,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Extended description for the result's `output`.
    pub fn details(&self) -> String {
        match self {
            Self::Validation(e) => e.details(),
            _ => String::new(),
        }
    }

    /// Result for a job stopped before execution.
    pub fn into_result(self, job_id: JobId, started_at: DateTime<Utc>) -> ExecutionResult {
        let details = self.details();
        ExecutionResult::failed(job_id, self.kind(), &self, details, started_at)
    }
}

impl From<ContractError> for PipelineError {
    fn from(err: ContractError) -> Self {
        match err {
            ContractError::NotFound(app_id) => Self::ContractNotFound(app_id),
            ContractError::Invalid { app_id, message } => Self::ContractInvalid { app_id, message },
        }
    }
}

/// Result type for pipeline stages.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Contract lookup failures.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("invalid contract for {app_id}: {message}")]
    Invalid { app_id: String, message: String },
}

/// Queue transport failures.
#[derive(Debug, Error)]
pub enum QueueError {
    /// One delivery could not be decoded; the queue itself is healthy.
    #[error("malformed delivery {origin}: {message}")]
    Malformed { origin: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result publication failures.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
