//! Job envelopes.
//!
//! An envelope is the signed request an issuer hands to one agent. The
//! authentication tag covers [`EnvelopeBody::canonical_bytes`], so every field
//! of the body is fixed once the envelope is built; there are no mutable
//! accessors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, TypesError};

/// Domain tag prefixed to every canonical encoding.
const CANONICAL_TAG: &[u8] = b"deckhand-envelope-v1";

/// Maximum job identifier length in bytes.
const MAX_JOB_ID_LEN: usize = 128;

// ─────────────────────────────────────────────────────────────────────────────
// Job ID
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque job identifier.
///
/// Restricted to `[A-Za-z0-9._-]` because it names the per-job log file and
/// the persisted result record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap a job identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_JOB_ID_LEN
            && !id.starts_with('.')
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
        if valid {
            Ok(Self(id))
        } else {
            Err(TypesError::InvalidJobId(id))
        }
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Every signed field of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeBody {
    /// Unique job identifier.
    pub job_id: JobId,
    /// Application to install.
    pub app_id: String,
    /// Target server.
    pub server_id: String,
    /// Operator who requested the job.
    pub user_id: String,
    /// Submitted input values, keyed by field name.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Issuance time (Unix seconds on the wire).
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl EnvelopeBody {
    /// Canonical byte encoding covered by the authentication tag.
    ///
    /// Layout: domain tag, then `job_id`, `app_id`, `server_id`, `user_id` as
    /// length-prefixed strings, then the input count followed by each
    /// key/value pair in ascending key order, then `created_at` as an `i64`.
    /// All integers are big-endian; every string is prefixed with its `u32`
    /// byte length, which keeps the encoding injective.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(CANONICAL_TAG);
        put_str(&mut out, self.job_id.as_str());
        put_str(&mut out, &self.app_id);
        put_str(&mut out, &self.server_id);
        put_str(&mut out, &self.user_id);
        put_len(&mut out, self.inputs.len());
        // BTreeMap<String, _> iterates in byte order of the keys.
        for (key, value) in &self.inputs {
            put_str(&mut out, key);
            put_str(&mut out, value);
        }
        out.extend_from_slice(&self.created_at.timestamp().to_be_bytes());
        out
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    // Lengths beyond u32 cannot arrive through a JSON queue payload.
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

/// A signed job request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(flatten)]
    body: EnvelopeBody,
    signature: String,
}

impl JobEnvelope {
    /// Assemble an envelope from a body and its authentication tag.
    pub fn new(body: EnvelopeBody, signature: impl Into<String>) -> Self {
        Self {
            body,
            signature: signature.into(),
        }
    }

    /// Decode an envelope from its JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode the envelope to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn body(&self) -> &EnvelopeBody {
        &self.body
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn job_id(&self) -> &JobId {
        &self.body.job_id
    }

    pub fn app_id(&self) -> &str {
        &self.body.app_id
    }

    pub fn inputs(&self) -> &BTreeMap<String, String> {
        &self.body.inputs
    }
}
