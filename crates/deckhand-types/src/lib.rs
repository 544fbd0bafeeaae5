//! Shared types for the deckhand provisioning agent.
//!
//! - [`envelope`]: the signed, immutable job request and its canonical encoding
//! - [`contract`]: the declared input schema and constraints for one installable application
//! - [`result`]: execution results and the wire record published for each job

pub mod contract;
pub mod envelope;
pub mod error;
pub mod result;

pub use contract::{
    Contract, ContractDef, FieldDef, FieldKind, FieldSpec, NumericRules, OsFamily, OsRequirement,
    Pattern, RESERVED_ENV_NAMES, TextRules, ValidationDef,
};
pub use envelope::{EnvelopeBody, JobEnvelope, JobId};
pub use error::{Result, TypesError};
pub use result::{
    EXIT_CANCELLED, EXIT_MISCONFIGURED, EXIT_REJECTED, EXIT_TIMEOUT, ExecutionResult,
    ExecutionStatus, FailureKind, JobState, ResultRecord,
};
