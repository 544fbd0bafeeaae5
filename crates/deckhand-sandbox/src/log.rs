//! Per-job output log.
//!
//! Every attempt of a job appends to `<log_dir>/<job_id>.log`. The same bytes
//! are kept in memory, bounded to the most recent `max_bytes`, so the result
//! can carry the output without re-reading the file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deckhand_types::JobId;
use parking_lot::Mutex;

use crate::{SandboxError, SandboxResult};

struct LogState {
    file: File,
    tail: Vec<u8>,
    max_bytes: usize,
    omitted: usize,
    write_failed: bool,
}

/// Append-only job log shared between the engine and its output reader.
#[derive(Clone)]
pub struct JobLog {
    path: PathBuf,
    state: Arc<Mutex<LogState>>,
}

impl JobLog {
    /// Open (or create) the log for `job_id` under `dir`.
    pub fn open(dir: &Path, job_id: &JobId, max_bytes: usize) -> SandboxResult<Self> {
        let path = dir.join(format!("{job_id}.log"));
        let log_err = |source| SandboxError::Log {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(log_err)?;
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o640);
        }
        let file = options.open(&path).map_err(log_err)?;

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(LogState {
                file,
                tail: Vec::new(),
                max_bytes,
                omitted: 0,
                write_failed: false,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new titled section, e.g. one per attempt.
    pub fn section(&self, title: &str) {
        let header = {
            let state = self.state.lock();
            if state.tail.is_empty() && state.omitted == 0 {
                format!("=== {title} ===\n")
            } else if state.tail.ends_with(b"\n") {
                format!("\n=== {title} ===\n")
            } else {
                format!("\n\n=== {title} ===\n")
            }
        };
        self.append(header.as_bytes());
    }

    /// Append one agent-written line, starting on a fresh line.
    pub fn note(&self, line: &str) {
        let needs_break = {
            let state = self.state.lock();
            !state.tail.is_empty() && !state.tail.ends_with(b"\n")
        };
        let text = if needs_break {
            format!("\n[{line}]\n")
        } else {
            format!("[{line}]\n")
        };
        self.append(text.as_bytes());
    }

    /// Append raw output.
    ///
    /// A failing log file does not stop the job; the first failure is logged
    /// and the in-memory copy keeps accumulating.
    pub fn append(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        if !state.write_failed
            && let Err(e) = state.file.write_all(bytes)
        {
            state.write_failed = true;
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write job log");
        }

        state.tail.extend_from_slice(bytes);
        if state.tail.len() > state.max_bytes {
            let excess = state.tail.len() - state.max_bytes;
            state.tail.drain(..excess);
            state.omitted += excess;
        }
    }

    /// Output captured so far, lossily decoded.
    ///
    /// When older bytes were dropped from memory a marker line pointing at the
    /// log file is prepended.
    pub fn output(&self) -> String {
        let state = self.state.lock();
        let text = String::from_utf8_lossy(&state.tail);
        if state.omitted == 0 {
            text.into_owned()
        } else {
            format!(
                "[{} earlier bytes omitted, full output in {}]\n{}",
                state.omitted,
                self.path.display(),
                text
            )
        }
    }

    /// Total bytes dropped from the in-memory copy.
    pub fn omitted_bytes(&self) -> usize {
        self.state.lock().omitted
    }
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, max: usize) -> JobLog {
        JobLog::open(dir.path(), &JobId::new("job-1").unwrap(), max).unwrap()
    }

    #[test]
    fn test_sections_and_file() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024);
        log.section("attempt 1");
        log.append(b"hello");
        log.section("attempt 2");
        log.append(b"world\n");

        let expected = "=== attempt 1 ===\nhello\n\n=== attempt 2 ===\nworld\n";
        assert_eq!(log.output(), expected);
        let on_disk = std::fs::read_to_string(dir.path().join("job-1.log")).unwrap();
        assert_eq!(on_disk, expected);
    }

    #[test]
    fn test_note_starts_on_new_line() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 1024);
        log.append(b"no newline");
        log.note("exit code 2");
        assert_eq!(log.output(), "no newline\n[exit code 2]\n");
    }

    #[test]
    fn test_tail_is_bounded() {
        let dir = TempDir::new().unwrap();
        let log = open(&dir, 8);
        log.append(b"0123456789abcdef");

        assert_eq!(log.omitted_bytes(), 8);
        let output = log.output();
        assert!(output.starts_with("[8 earlier bytes omitted"));
        assert!(output.ends_with("89abcdef"));

        let on_disk = std::fs::read(log.path()).unwrap();
        assert_eq!(on_disk.len(), 16);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        open(&dir, 64).append(b"first\n");
        open(&dir, 64).append(b"second\n");
        let on_disk = std::fs::read_to_string(dir.path().join("job-1.log")).unwrap();
        assert_eq!(on_disk, "first\nsecond\n");
    }

    #[test]
    fn test_creates_missing_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        let log = JobLog::open(&nested, &JobId::new("job-2").unwrap(), 64).unwrap();
        assert!(log.path().starts_with(&nested));
        assert!(log.path().exists());
    }
}
