//! Execution results and status records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Exit code recorded for jobs rejected before execution on request grounds.
pub const EXIT_REJECTED: i32 = 1;

/// Exit code recorded for jobs rejected on operator-side grounds.
pub const EXIT_MISCONFIGURED: i32 = 3;

/// Reserved exit code for an attempt killed at its deadline.
pub const EXIT_TIMEOUT: i32 = 124;

/// Reserved exit code for an attempt terminated by agent shutdown.
pub const EXIT_CANCELLED: i32 = 130;

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Terminal category of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Success,
    ValidationError,
    InstallationError,
    ConfigurationError,
    Timeout,
}

impl ExecutionStatus {
    /// Coarse wire state for this status.
    pub fn job_state(self) -> JobState {
        match self {
            Self::Success => JobState::Success,
            _ => JobState::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ValidationError => "validation-error",
            Self::InstallationError => "installation-error",
            Self::ConfigurationError => "configuration-error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state as exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobState {
    /// Whether no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Failure Kinds
// ─────────────────────────────────────────────────────────────────────────────

/// Why a job did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Authentication,
    ContractNotFound,
    ContractInvalid,
    Validation,
    UnsafePath,
    UnsupportedPlatform,
    Installation,
    Configuration,
    Timeout,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Result status this failure is reported under.
    pub fn status(self) -> ExecutionStatus {
        match self {
            Self::Authentication | Self::ContractNotFound | Self::Validation => {
                ExecutionStatus::ValidationError
            }
            Self::ContractInvalid
            | Self::UnsafePath
            | Self::UnsupportedPlatform
            | Self::Configuration => ExecutionStatus::ConfigurationError,
            Self::Installation | Self::Cancelled | Self::Internal => {
                ExecutionStatus::InstallationError
            }
            Self::Timeout => ExecutionStatus::Timeout,
        }
    }

    /// Exit code recorded when the failure happened without an installer exit.
    pub fn default_exit_code(self) -> i32 {
        match self.status() {
            ExecutionStatus::ConfigurationError => EXIT_MISCONFIGURED,
            ExecutionStatus::Timeout => EXIT_TIMEOUT,
            _ if self == Self::Cancelled => EXIT_CANCELLED,
            _ => EXIT_REJECTED,
        }
    }

    /// Failures that point at a forged request or a tampered installer tree.
    pub fn is_security_relevant(self) -> bool {
        matches!(self, Self::Authentication | Self::UnsafePath)
    }

    /// Prefix used in the result's `error` string.
    pub fn label(self) -> &'static str {
        match self {
            Self::Authentication => "AuthenticationError",
            Self::ContractNotFound => "ContractNotFound",
            Self::ContractInvalid => "ContractInvalid",
            Self::Validation => "ValidationError",
            Self::UnsafePath => "UnsafePath",
            Self::UnsupportedPlatform => "UnsupportedPlatform",
            Self::Installation => "InstallationError",
            Self::Configuration => "ConfigurationError",
            Self::Timeout => "TimeoutExceeded",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Result
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of one pipeline run for one envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub status: ExecutionStatus,
    /// Set whenever `status` is not `Success`.
    pub failure: Option<FailureKind>,
    pub exit_code: i32,
    /// Combined output of every attempt, or the rejection details.
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Installer attempts made (0 when rejected before execution).
    pub attempts: u32,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result for a job stopped before (or instead of) a normal installer exit.
    pub fn failed(
        job_id: JobId,
        failure: FailureKind,
        detail: impl fmt::Display,
        output: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            status: failure.status(),
            failure: Some(failure),
            exit_code: failure.default_exit_code(),
            output,
            started_at,
            completed_at: Utc::now(),
            attempts: 0,
            error: Some(format!("{}: {}", failure.label(), detail)),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire Record
// ─────────────────────────────────────────────────────────────────────────────

/// Published job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: JobId,
    pub status: JobState,
    /// Detailed status; absent while the job is still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ExecutionStatus>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl ResultRecord {
    /// Record announcing that an admitted job has started.
    pub fn running(job_id: JobId, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobState::Running,
            category: None,
            exit_code: None,
            output: String::new(),
            started_at: Some(started_at),
            completed_at: None,
            error: None,
            attempts: 0,
        }
    }
}

impl From<&ExecutionResult> for ResultRecord {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            job_id: result.job_id.clone(),
            status: result.status.job_state(),
            category: Some(result.status),
            exit_code: Some(result.exit_code),
            output: result.output.clone(),
            started_at: Some(result.started_at),
            completed_at: Some(result.completed_at),
            error: result.error.clone(),
            attempts: result.attempts,
        }
    }
}
