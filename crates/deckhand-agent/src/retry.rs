//! Retry controller.
//!
//! Attempts are re-run only while the classified outcome is retryable and the
//! contract is idempotent. The delay before attempt `n + 1` is
//! `base_delay * 2^(n - 1)`, capped at `max_delay`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_config::RetryConfig;
use deckhand_sandbox::{RunOutcome, SandboxError};
use tokio_util::sync::CancellationToken;

use crate::classify::{Outcome, classify};

/// Attempt budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
    }

    /// Delay between attempt `attempt` and the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff State
// ─────────────────────────────────────────────────────────────────────────────

/// Where a job is in its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    attempt: u32,
    next_delay: Duration,
    policy: RetryPolicy,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempt: 1,
            next_delay: policy.delay_after(1),
            policy,
        }
    }

    /// Current attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait if the current attempt fails.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    pub fn has_budget(&self) -> bool {
        self.attempt < self.policy.max_attempts
    }

    /// Move to the next attempt, returning the delay to wait before it.
    /// `None` once the budget is spent.
    pub fn advance(&mut self) -> Option<Duration> {
        if !self.has_budget() {
            return None;
        }
        let delay = self.next_delay;
        self.attempt += 1;
        self.next_delay = self.policy.delay_after(self.attempt);
        Some(delay)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

/// Runs one attempt of a job.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(
        &self,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, SandboxError>;
}

/// Final state of a retried job.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    /// Classification of the last attempt.
    pub outcome: Outcome,
    pub attempts: u32,
    /// Start of the first attempt.
    pub started_at: DateTime<Utc>,
    /// End of the last attempt.
    pub completed_at: DateTime<Utc>,
    /// Shutdown arrived while waiting to retry.
    pub abandoned: bool,
}

/// Drives attempts through a [`Backoff`].
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run until success, a terminal outcome, an exhausted budget, or shutdown.
    ///
    /// Backoff sleeps end early when `cancel` fires; the last attempt's
    /// outcome is returned with `abandoned` set.
    pub async fn run<R>(
        &self,
        runner: &R,
        idempotent: bool,
        cancel: &CancellationToken,
    ) -> Result<RetryOutcome, SandboxError>
    where
        R: AttemptRunner + ?Sized,
    {
        let mut backoff = Backoff::new(self.policy.clone());
        let mut first_started = None;

        loop {
            let attempt = backoff.attempt();
            let run = runner.run_attempt(attempt, cancel).await?;
            let started_at = *first_started.get_or_insert(run.started_at);
            let outcome = classify(run.exit);

            tracing::info!(
                attempt,
                exit_code = outcome.exit_code(),
                status = %outcome.status,
                retryable = outcome.retryable,
                "Attempt finished"
            );

            let finish = |abandoned| RetryOutcome {
                outcome,
                attempts: attempt,
                started_at,
                completed_at: run.completed_at,
                abandoned,
            };

            if !outcome.retryable {
                return Ok(finish(false));
            }
            if !idempotent {
                tracing::info!(attempt, "Installer is not idempotent, not retrying");
                return Ok(finish(false));
            }
            let Some(delay) = backoff.advance() else {
                tracing::warn!(attempts = attempt, "Retry budget exhausted");
                return Ok(finish(false));
            };

            tracing::info!(
                next_attempt = backoff.attempt(),
                delay_secs = delay.as_secs_f64(),
                "Retrying after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    tracing::info!(attempt, "Shutdown during backoff, abandoning retries");
                    return Ok(finish(true));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_sandbox::ExitKind;
    use deckhand_types::ExecutionStatus;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Replays a fixed list of exits and records when each attempt started.
    struct ScriptedRunner {
        exits: Mutex<VecDeque<ExitKind>>,
        calls: Mutex<Vec<(u32, Instant)>>,
    }

    impl ScriptedRunner {
        fn new(exits: &[i32]) -> Self {
            Self::with_exits(exits.iter().map(|&c| ExitKind::Exited(c)).collect())
        }

        fn with_exits(exits: VecDeque<ExitKind>) -> Self {
            Self {
                exits: Mutex::new(exits),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock();
            calls.windows(2).map(|w| w[1].1 - w[0].1).collect()
        }

        fn attempts(&self) -> Vec<u32> {
            self.calls.lock().iter().map(|(n, _)| *n).collect()
        }
    }

    #[async_trait]
    impl AttemptRunner for ScriptedRunner {
        async fn run_attempt(
            &self,
            attempt: u32,
            _cancel: &CancellationToken,
        ) -> Result<RunOutcome, SandboxError> {
            self.calls.lock().push((attempt, Instant::now()));
            let exit = self.exits.lock().pop_front().unwrap_or(ExitKind::Exited(0));
            Ok(RunOutcome {
                exit,
                started_at: Utc::now(),
                completed_at: Utc::now(),
                elapsed: Duration::ZERO,
                output_truncated: false,
            })
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl AttemptRunner for FailingRunner {
        async fn run_attempt(
            &self,
            _attempt: u32,
            _cancel: &CancellationToken,
        ) -> Result<RunOutcome, SandboxError> {
            Err(SandboxError::Spawn {
                program: "/bin/bash".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    fn controller(max_attempts: u32) -> RetryController {
        RetryController::new(RetryPolicy::new(
            max_attempts,
            Duration::from_secs(10),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn test_delay_curve() {
        let policy = RetryPolicy::new(10, Duration::from_secs(10), Duration::from_secs(300));
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_after(n).as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(policy.delay_after(200), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_state_machine() {
        let mut backoff = Backoff::new(RetryPolicy::default());
        assert_eq!(backoff.attempt(), 1);
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));

        assert_eq!(backoff.advance(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.attempt(), 2);
        assert_eq!(backoff.advance(), Some(Duration::from_secs(20)));
        assert_eq!(backoff.attempt(), 3);
        assert!(!backoff.has_budget());
        assert_eq!(backoff.advance(), None);
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exit_uses_full_budget_with_growing_delays() {
        let runner = ScriptedRunner::new(&[2, 2, 2, 2]);
        let result = controller(4)
            .run(&runner, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.attempts, 4);
        assert_eq!(result.outcome.status, ExecutionStatus::InstallationError);
        assert_eq!(result.outcome.exit_code(), 2);
        assert!(!result.abandoned);
        assert_eq!(runner.attempts(), vec![1, 2, 3, 4]);

        let gaps = runner.gaps();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries() {
        let runner = ScriptedRunner::new(&[2, 2, 0]);
        let result = controller(3)
            .run(&runner, true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_exits_not_retried() {
        for code in [0, 1, 3] {
            let runner = ScriptedRunner::new(&[code, 0, 0]);
            let result = controller(3)
                .run(&runner, true, &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(result.attempts, 1, "exit {code} was retried");
            assert_eq!(result.outcome.exit_code(), code);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried() {
        let runner = ScriptedRunner::with_exits(VecDeque::from([ExitKind::TimedOut]));
        let result = controller(3)
            .run(&runner, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(result.outcome.status, ExecutionStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_death_is_retried() {
        let runner = ScriptedRunner::with_exits(VecDeque::from([
            ExitKind::Signaled(9),
            ExitKind::Exited(0),
        ]));
        let result = controller(3)
            .run(&runner, true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert!(result.outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_idempotent_never_retried() {
        let runner = ScriptedRunner::new(&[2, 0]);
        let result = controller(3)
            .run(&runner, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(result.outcome.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let runner = ScriptedRunner::new(&[2, 0]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = controller(3).run(&runner, true, &cancel).await.unwrap();
        assert!(result.abandoned);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.outcome.exit_code(), 2);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_runner_fault_propagates() {
        let err = controller(3)
            .run(&FailingRunner, true, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }
}
