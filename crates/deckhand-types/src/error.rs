//! Error types for parsing envelopes and contracts.

use thiserror::Error;

/// Result type alias for type construction and parsing.
pub type Result<T> = std::result::Result<T, TypesError>;

/// Errors raised while constructing or decoding shared types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Job identifier is empty, too long, or contains unsafe characters.
    #[error("invalid job id '{0}': expected 1-128 of [A-Za-z0-9._-], not starting with '.'")]
    InvalidJobId(String),

    /// Contract violates a structural rule.
    #[error("invalid contract: {0}")]
    InvalidContract(String),

    /// Envelope or record JSON could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
