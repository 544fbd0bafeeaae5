//! Result publication.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use deckhand_types::{ExecutionResult, FailureKind, JobId, ResultRecord};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::PublishError;

/// Capacity of the status broadcast channel.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Destination of job status records.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Publish an intermediate status (e.g. `running`).
    async fn publish_status(&self, record: &ResultRecord) -> Result<(), PublishError>;

    /// Publish a job's final result.
    async fn publish(&self, result: &ExecutionResult) -> Result<(), PublishError> {
        self.publish_status(&ResultRecord::from(result)).await
    }

    /// Whether a terminal record already exists for `job_id`.
    async fn has_terminal(&self, job_id: &JobId) -> Result<bool, PublishError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// File Store
// ─────────────────────────────────────────────────────────────────────────────

/// One JSON record per job under a results directory.
///
/// Layout:
/// - `{dir}/{job_id}.json` for authenticated jobs
/// - `{dir}/rejected/{job_id}.json` for envelopes that failed authentication
///
/// Writes go to a temporary file first and are renamed into place, so readers
/// never observe a partial record.
#[derive(Debug)]
pub struct FileResultStore {
    dir: PathBuf,
    events: broadcast::Sender<ResultRecord>,
}

impl FileResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            dir: dir.into(),
            events,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Receive every record this store publishes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ResultRecord> {
        self.events.subscribe()
    }

    pub fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    pub fn rejected_path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join("rejected").join(format!("{job_id}.json"))
    }

    /// Read the stored record for `job_id`.
    pub async fn load(&self, job_id: &JobId) -> Result<Option<ResultRecord>, PublishError> {
        match tokio::fs::read(self.record_path(job_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, record: &ResultRecord) -> Result<(), PublishError> {
        let parent = path
            .parent()
            .ok_or_else(|| PublishError::Unavailable(format!("{} has no parent", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let json = serde_json::to_vec_pretty(record)?;
        let tmp = parent.join(format!(".{}.{}.tmp", record.job_id, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &json).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::debug!(job_id = %record.job_id, status = ?record.status, path = %path.display(), "Stored result record");
        // No subscribers is fine.
        let _ = self.events.send(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultPublisher for FileResultStore {
    async fn publish_status(&self, record: &ResultRecord) -> Result<(), PublishError> {
        self.write(&self.record_path(&record.job_id), record).await
    }

    async fn publish(&self, result: &ExecutionResult) -> Result<(), PublishError> {
        let record = ResultRecord::from(result);
        let path = if result.failure == Some(FailureKind::Authentication) {
            self.rejected_path(&result.job_id)
        } else {
            self.record_path(&result.job_id)
        };
        self.write(&path, &record).await
    }

    async fn has_terminal(&self, job_id: &JobId) -> Result<bool, PublishError> {
        Ok(self
            .load(job_id)
            .await?
            .is_some_and(|record| record.status.is_terminal()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory publisher for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    records: Mutex<Vec<ResultRecord>>,
    results: Mutex<Vec<ExecutionResult>>,
    unavailable: Mutex<bool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`PublishError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// Every record published, in order.
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().clone()
    }

    /// Every final result published, in order.
    pub fn results(&self) -> Vec<ExecutionResult> {
        self.results.lock().clone()
    }

    fn check_available(&self) -> Result<(), PublishError> {
        if *self.unavailable.lock() {
            Err(PublishError::Unavailable("memory publisher disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ResultPublisher for MemoryPublisher {
    async fn publish_status(&self, record: &ResultRecord) -> Result<(), PublishError> {
        self.check_available()?;
        self.records.lock().push(record.clone());
        Ok(())
    }

    async fn publish(&self, result: &ExecutionResult) -> Result<(), PublishError> {
        self.check_available()?;
        self.results.lock().push(result.clone());
        self.records.lock().push(ResultRecord::from(result));
        Ok(())
    }

    async fn has_terminal(&self, job_id: &JobId) -> Result<bool, PublishError> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .iter()
            .any(|r| &r.job_id == job_id && r.status.is_terminal()))
    }
}
