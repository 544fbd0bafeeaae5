//! Agent-side job pipeline.
//!
//! An envelope delivered by a [`JobSource`] goes through these stages:
//!
//! 1. [`SignatureVerifier`]: HMAC-SHA256 over the canonical envelope
//! 2. [`ContractLoader`]: the whitelisted application contract
//! 3. [`InputValidator`]: inputs re-checked against the contract
//! 4. [`PathGuard`]: the installer script stays inside the installer root
//! 5. [`platform`]: the host matches the contract's OS requirements
//! 6. [`RetryController`] around the sandboxed execution engine
//! 7. [`ResultPublisher`]: exactly one terminal record per job
//!
//! [`Poller`] drives the loop; [`JobPipeline`] holds stages 1-6.

pub mod classify;
pub mod contract;
pub mod error;
pub mod path_guard;
pub mod pipeline;
pub mod platform;
pub mod poller;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod signature;
pub mod validator;

pub use classify::{Outcome, classify};
pub use contract::{ContractLoader, ManifestLoader};
pub use error::{ContractError, PipelineError, PublishError, QueueError, Result};
pub use path_guard::{PathGuard, PathGuardError, SafeScript};
pub use pipeline::{AdmittedJob, JobPipeline, PipelineSettings, SECURITY_TARGET};
pub use platform::{HostPlatform, PlatformError};
pub use poller::{Poller, PollerStats};
pub use publisher::{FileResultStore, MemoryPublisher, ResultPublisher};
pub use queue::{ChannelQueue, JobSource, SpoolQueue};
pub use retry::{AttemptRunner, Backoff, RetryController, RetryOutcome, RetryPolicy};
pub use signature::{SignatureError, SignatureVerifier};
pub use validator::{FieldError, FieldProblem, InputValidator, ResolvedInputs, ValidationError};
