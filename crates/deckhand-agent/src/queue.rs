//! Job delivery.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use deckhand_types::JobEnvelope;
use tokio::sync::mpsc;

use crate::QueueError;

/// Source of envelopes for one agent.
#[async_trait]
pub trait JobSource: Send {
    /// Wait for the next envelope. `Ok(None)` once the source is closed.
    ///
    /// Implementations must be cancel-safe: dropping the future never loses
    /// an envelope that was not returned.
    async fn next(&mut self) -> Result<Option<JobEnvelope>, QueueError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Spool Directory
// ─────────────────────────────────────────────────────────────────────────────

/// Directory inbox: `{spool}/{agent_id}/*.json`, consumed oldest first.
///
/// Issuers write `.<name>.tmp` and rename it into place; dotfiles are never
/// picked up. Each file is removed as it is claimed, so an envelope is
/// delivered once. Undecodable files are moved to `rejected/`.
#[derive(Debug, Clone)]
pub struct SpoolQueue {
    dir: PathBuf,
    poll_interval: Duration,
}

impl SpoolQueue {
    pub fn new(spool_root: &Path, agent_id: &str, poll_interval: Duration) -> Self {
        Self {
            dir: spool_root.join(agent_id),
            poll_interval,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.dir.join("rejected")
    }

    /// Drop `envelope` into `agent_id`'s spool.
    pub fn enqueue(
        spool_root: &Path,
        agent_id: &str,
        envelope: &JobEnvelope,
    ) -> Result<PathBuf, QueueError> {
        let dir = spool_root.join(agent_id);
        std::fs::create_dir_all(&dir)?;
        let name = format!("{}.json", envelope.job_id());
        let tmp = dir.join(format!(".{name}.tmp"));
        let path = dir.join(&name);
        std::fs::write(&tmp, envelope.to_json().map_err(types_error)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Oldest pending files first, ties broken by name.
    fn pending(&self) -> Result<Vec<PathBuf>, QueueError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((modified, entry.path()));
        }
        entries.sort();
        Ok(entries.into_iter().map(|(_, path)| path).collect())
    }

    /// Claim the oldest envelope, if any. Never awaits.
    fn claim(&self) -> Result<Option<JobEnvelope>, QueueError> {
        for path in self.pending()? {
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                // Claimed by someone else in between.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match JobEnvelope::from_json(&bytes) {
                Ok(envelope) => {
                    std::fs::remove_file(&path)?;
                    tracing::debug!(job_id = %envelope.job_id(), path = %path.display(), "Claimed envelope");
                    return Ok(Some(envelope));
                }
                Err(e) => {
                    let rejected = self.rejected_dir();
                    std::fs::create_dir_all(&rejected)?;
                    let target = rejected.join(path.file_name().unwrap_or_default());
                    std::fs::rename(&path, &target)?;
                    return Err(QueueError::Malformed {
                        origin: path.display().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(None)
    }
}

fn types_error(e: deckhand_types::TypesError) -> QueueError {
    match e {
        deckhand_types::TypesError::Json(e) => QueueError::Serde(e),
        other => QueueError::Malformed {
            origin: "envelope".to_string(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl JobSource for SpoolQueue {
    async fn next(&mut self) -> Result<Option<JobEnvelope>, QueueError> {
        std::fs::create_dir_all(&self.dir)?;
        loop {
            if let Some(envelope) = self.claim()? {
                return Ok(Some(envelope));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process Channel
// ─────────────────────────────────────────────────────────────────────────────

/// Envelopes pushed through a `tokio::sync::mpsc` channel.
#[derive(Debug)]
pub struct ChannelQueue {
    rx: mpsc::Receiver<JobEnvelope>,
}

impl ChannelQueue {
    /// New queue and the sender that feeds it. Dropping every sender closes it.
    pub fn new(capacity: usize) -> (mpsc::Sender<JobEnvelope>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl JobSource for ChannelQueue {
    async fn next(&mut self) -> Result<Option<JobEnvelope>, QueueError> {
        Ok(self.rx.recv().await)
    }
}
