//! Agent main loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deckhand_types::{ExecutionResult, JobEnvelope, ResultRecord};
use tokio_util::sync::CancellationToken;

use crate::pipeline::JobPipeline;
use crate::publisher::ResultPublisher;
use crate::queue::JobSource;
use crate::QueueError;

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Deliveries of jobs that already have a terminal record.
    pub duplicates: u64,
    /// Deliveries that could not be decoded.
    pub malformed: u64,
}

/// Pulls envelopes one at a time and drives each through the pipeline.
pub struct Poller<S> {
    agent_id: String,
    source: S,
    pipeline: Arc<JobPipeline>,
    publisher: Arc<dyn ResultPublisher>,
    retry_interval: Duration,
}

impl<S: JobSource> Poller<S> {
    pub fn new(
        agent_id: impl Into<String>,
        source: S,
        pipeline: Arc<JobPipeline>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            source,
            pipeline,
            publisher,
            retry_interval: Duration::from_secs(5),
        }
    }

    /// Wait after a queue error before trying again.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Run until `cancel` fires or the source closes.
    ///
    /// A job in flight when `cancel` fires is terminated and its result
    /// published before this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> PollerStats {
        let mut stats = PollerStats::default();
        tracing::info!(agent_id = %self.agent_id, "Waiting for jobs");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.source.next() => next,
            };

            match next {
                Ok(Some(envelope)) => self.handle(envelope, &cancel, &mut stats).await,
                Ok(None) => {
                    tracing::info!(agent_id = %self.agent_id, "Job source closed");
                    break;
                }
                Err(QueueError::Malformed { origin, message }) => {
                    stats.malformed += 1;
                    tracing::warn!(origin = %origin, error = %message, "Dropped undecodable delivery");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        retry_secs = self.retry_interval.as_secs_f64(),
                        "Queue error"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry_interval) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }

        tracing::info!(
            agent_id = %self.agent_id,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Poller stopped"
        );
        stats
    }

    async fn handle(
        &mut self,
        envelope: JobEnvelope,
        cancel: &CancellationToken,
        stats: &mut PollerStats,
    ) {
        let job_id = envelope.job_id().clone();
        match self.publisher.has_terminal(&job_id).await {
            Ok(true) => {
                stats.duplicates += 1;
                tracing::warn!(job_id = %job_id, "Job already completed, ignoring duplicate delivery");
                return;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not check for an earlier result"),
        }

        let started_at = Utc::now();
        let result = match self.pipeline.admit(&envelope).await {
            Ok(job) => {
                let running = ResultRecord::running(job_id.clone(), job.admitted_at);
                if let Err(e) = self.publisher.publish_status(&running).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to publish running status");
                }
                self.pipeline.execute(job, cancel).await
            }
            Err(e) => self.pipeline.reject(job_id, e, started_at),
        };

        stats.processed += 1;
        if result.is_success() {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
        self.publish(&result).await;
    }

    async fn publish(&self, result: &ExecutionResult) {
        if let Err(e) = self.publisher.publish(result).await {
            tracing::error!(job_id = %result.job_id, error = %e, "Failed to publish result");
        }
    }
}
