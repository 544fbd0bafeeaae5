//! Installer outcome classification.
//!
//! | exit | status | retry |
//! |---|---|---|
//! | 0 | success | - |
//! | 1 | validation-error | no |
//! | 2 | installation-error | yes |
//! | 3 | configuration-error | no |
//! | other, signal | installation-error | yes |
//! | deadline | timeout (124) | no |
//! | shutdown | installation-error (130) | no |
//!
//! An installer that itself exits 124 or 130 falls under "other": it is a
//! retryable installation error reported with that exit code. Only
//! `failure` (`timeout`, `cancelled`) tells it apart from the reserved codes.

use std::time::Duration;

use deckhand_sandbox::ExitKind;
use deckhand_types::{ExecutionStatus, FailureKind};

use crate::PipelineError;

/// Classified attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub exit: ExitKind,
    pub status: ExecutionStatus,
    pub failure: Option<FailureKind>,
    pub retryable: bool,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Error describing a failed outcome; `None` on success.
    pub fn error(&self, timeout: Duration) -> Option<PipelineError> {
        let code = self.exit_code();
        self.failure.map(|kind| match kind {
            FailureKind::Validation => PipelineError::InputsRejected(code),
            FailureKind::Configuration => PipelineError::Configuration(code),
            FailureKind::Timeout => PipelineError::Timeout(timeout),
            FailureKind::Cancelled => PipelineError::Cancelled,
            _ => PipelineError::Installation(code),
        })
    }
}

/// Map an attempt's exit onto status and retryability.
pub fn classify(exit: ExitKind) -> Outcome {
    let (status, failure, retryable) = match exit {
        ExitKind::Exited(0) => (ExecutionStatus::Success, None, false),
        ExitKind::Exited(1) => (
            ExecutionStatus::ValidationError,
            Some(FailureKind::Validation),
            false,
        ),
        ExitKind::Exited(3) => (
            ExecutionStatus::ConfigurationError,
            Some(FailureKind::Configuration),
            false,
        ),
        ExitKind::Exited(_) | ExitKind::Signaled(_) => (
            ExecutionStatus::InstallationError,
            Some(FailureKind::Installation),
            true,
        ),
        ExitKind::TimedOut => (ExecutionStatus::Timeout, Some(FailureKind::Timeout), false),
        ExitKind::Cancelled => (
            ExecutionStatus::InstallationError,
            Some(FailureKind::Cancelled),
            false,
        ),
    };
    Outcome {
        exit,
        status,
        failure,
        retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_contract() {
        assert!(classify(ExitKind::Exited(0)).is_success());

        let rejected = classify(ExitKind::Exited(1));
        assert_eq!(rejected.status, ExecutionStatus::ValidationError);
        assert!(!rejected.retryable);

        let transient = classify(ExitKind::Exited(2));
        assert_eq!(transient.status, ExecutionStatus::InstallationError);
        assert!(transient.retryable);

        let misconfigured = classify(ExitKind::Exited(3));
        assert_eq!(misconfigured.status, ExecutionStatus::ConfigurationError);
        assert!(!misconfigured.retryable);

        let other = classify(ExitKind::Exited(42));
        assert_eq!(other.failure, Some(FailureKind::Installation));
        assert!(other.retryable);
    }

    #[test]
    fn test_signal_is_retryable_installation_error() {
        let killed = classify(ExitKind::Signaled(9));
        assert_eq!(killed.status, ExecutionStatus::InstallationError);
        assert_eq!(killed.exit_code(), 137);
        assert!(killed.retryable);
    }

    #[test]
    fn test_timeout_and_cancel_are_terminal() {
        let timed_out = classify(ExitKind::TimedOut);
        assert_eq!(timed_out.status, ExecutionStatus::Timeout);
        assert_eq!(timed_out.exit_code(), 124);
        assert!(!timed_out.retryable);

        let cancelled = classify(ExitKind::Cancelled);
        assert_eq!(cancelled.status, ExecutionStatus::InstallationError);
        assert_eq!(cancelled.failure, Some(FailureKind::Cancelled));
        assert_eq!(cancelled.exit_code(), 130);
        assert!(!cancelled.retryable);
    }

    #[test]
    fn test_installer_reserved_codes_stay_installation_errors() {
        for code in [124, 130] {
            let own = classify(ExitKind::Exited(code));
            assert_eq!(own.status, ExecutionStatus::InstallationError);
            assert_eq!(own.failure, Some(FailureKind::Installation));
            assert_eq!(own.exit_code(), code);
            assert!(own.retryable);
        }
        assert_ne!(
            classify(ExitKind::Exited(124)).failure,
            classify(ExitKind::TimedOut).failure
        );
        assert_ne!(
            classify(ExitKind::Exited(130)).failure,
            classify(ExitKind::Cancelled).failure
        );
    }

    #[test]
    fn test_error_text() {
        let timeout = Duration::from_secs(60);
        assert!(classify(ExitKind::Exited(0)).error(timeout).is_none());
        assert_eq!(
            classify(ExitKind::Exited(2)).error(timeout).unwrap().to_string(),
            "installer failed with exit code 2"
        );
        assert_eq!(
            classify(ExitKind::TimedOut).error(timeout).unwrap().to_string(),
            "installer exceeded its 60s timeout"
        );
        let rejected = classify(ExitKind::Exited(1)).error(timeout).unwrap();
        assert_eq!(rejected.kind(), FailureKind::Validation);
        assert_eq!(rejected.to_string(), "installer rejected its inputs (exit code 1)");
    }
}
