//! Bounded execution of installer programs.
//!
//! The engine runs one external program per call and always yields a
//! deterministic outcome:
//!
//! - **Environment**: cleared, then rebuilt from an allowlist, the job's
//!   inputs, and fixed non-interactive markers ([`ChildEnv`])
//! - **Process group**: the child leads its own group so the whole tree can
//!   be signalled together ([`ProcessTree`])
//! - **Deadline**: SIGTERM to the group, a grace interval, then SIGKILL
//! - **Output**: stdout and stderr share one pipe, appended to the per-job
//!   log and kept in memory ([`JobLog`])
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use deckhand_sandbox::{ChildEnv, EngineConfig, ExecSpec, ExecutionEngine, JobLog};
//! use deckhand_types::JobId;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let job_id = JobId::new("job-42")?;
//! let log = JobLog::open("/var/log/provisioning".as_ref(), &job_id, 1024 * 1024)?;
//! let env = ChildEnv::builder(&["PATH".to_string()]).job(&job_id, 1).build();
//! let spec = ExecSpec::new("/bin/bash", "/opt/provisioning/installers/nginx", env)
//!     .arg("/opt/provisioning/installers/nginx/install.sh")
//!     .with_timeout(Duration::from_secs(600));
//!
//! let engine = ExecutionEngine::new(EngineConfig::default());
//! let outcome = engine.run(&spec, &log, &CancellationToken::new()).await?;
//! println!("exit code {}", outcome.exit.code());
//! # Ok(())
//! # }
//! ```

mod engine;
mod env;
mod error;
mod log;
mod process;

pub use engine::{EngineConfig, ExecSpec, ExecutionEngine, ExitKind, RunOutcome};
pub use env::{ChildEnv, ChildEnvBuilder, DEFAULT_PATH, NONINTERACTIVE_MARKER};
pub use error::{SandboxError, SandboxResult};
pub use log::JobLog;
pub use process::ProcessTree;
