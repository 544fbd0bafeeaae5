//! Envelope authentication.
//!
//! The tag is lowercase hex HMAC-SHA256 over
//! [`EnvelopeBody::canonical_bytes`], keyed with the secret shared by the
//! issuer and the agent. Verification compares in constant time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use deckhand_config::SigningKey;
use deckhand_types::{EnvelopeBody, JobEnvelope};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-encoded SHA-256 tag.
const TAG_HEX_LEN: usize = 64;

/// How far into the future `created_at` may lie when freshness is enforced.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Authentication failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not a {TAG_HEX_LEN}-character hex string")]
    Malformed,

    #[error("signature does not match envelope")]
    Mismatch,

    #[error("envelope issued {age_secs}s ago, limit is {max_secs}s")]
    Expired { age_secs: u64, max_secs: u64 },

    #[error("envelope issued {ahead_secs}s in the future")]
    NotYetValid { ahead_secs: u64 },

    #[error("signing key rejected: {0}")]
    Key(String),
}

/// Signs and verifies envelopes with one shared key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: SigningKey,
    max_age: Option<Duration>,
}

impl SignatureVerifier {
    pub fn new(key: SigningKey) -> Self {
        Self { key, max_age: None }
    }

    /// Also reject envelopes older than `max_age` (disabled with `None`).
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    fn mac(&self, body: &EnvelopeBody) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| SignatureError::Key(e.to_string()))?;
        mac.update(&body.canonical_bytes());
        Ok(mac)
    }

    /// Hex tag for `body`.
    pub fn sign(&self, body: &EnvelopeBody) -> Result<String, SignatureError> {
        Ok(hex::encode(self.mac(body)?.finalize().into_bytes()))
    }

    /// Build a signed envelope.
    pub fn seal(&self, body: EnvelopeBody) -> Result<JobEnvelope, SignatureError> {
        let signature = self.sign(&body)?;
        Ok(JobEnvelope::new(body, signature))
    }

    /// Check the envelope's tag and, when configured, its freshness.
    pub fn verify(&self, envelope: &JobEnvelope) -> Result<(), SignatureError> {
        self.verify_at(envelope, Utc::now())
    }

    /// [`verify`](Self::verify) against an explicit clock.
    pub fn verify_at(&self, envelope: &JobEnvelope, now: DateTime<Utc>) -> Result<(), SignatureError> {
        let tag = envelope.signature();
        if tag.len() != TAG_HEX_LEN {
            return Err(SignatureError::Malformed);
        }
        let provided = hex::decode(tag).map_err(|_| SignatureError::Malformed)?;

        self.mac(envelope.body())?
            .verify_slice(&provided)
            .map_err(|_| SignatureError::Mismatch)?;

        // Only authenticated timestamps are worth looking at.
        if let Some(max_age) = self.max_age {
            let created_at = envelope.body().created_at;
            let age = now.signed_duration_since(created_at);
            if age.num_seconds() < 0 {
                let ahead_secs = age.num_seconds().unsigned_abs();
                if ahead_secs > MAX_CLOCK_SKEW.as_secs() {
                    return Err(SignatureError::NotYetValid { ahead_secs });
                }
            } else if age.num_seconds().unsigned_abs() > max_age.as_secs() {
                return Err(SignatureError::Expired {
                    age_secs: age.num_seconds().unsigned_abs(),
                    max_secs: max_age.as_secs(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use deckhand_types::JobId;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const KEY: &str = "test-signing-key-0123456789";

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SigningKey::new(KEY).unwrap())
    }

    fn body() -> EnvelopeBody {
        EnvelopeBody {
            job_id: JobId::new("job-123").unwrap(),
            app_id: "nginx".to_string(),
            server_id: "web-01".to_string(),
            user_id: "alice".to_string(),
            inputs: BTreeMap::from([
                ("server_name".to_string(), "example.com".to_string()),
                ("port".to_string(), "80".to_string()),
            ]),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let v = verifier();
        let envelope = v.seal(body()).unwrap();
        assert_eq!(envelope.signature().len(), 64);
        assert!(envelope.signature().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(v.verify(&envelope), Ok(()));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let envelope = verifier().seal(body()).unwrap();
        let other = SignatureVerifier::new(SigningKey::new("another-key-abcdefghij").unwrap());
        assert_eq!(other.verify(&envelope), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_tampered_input_rejected() {
        let v = verifier();
        let envelope = v.seal(body()).unwrap();
        let mut tampered = body();
        tampered.inputs.insert("port".to_string(), "8080".to_string());
        let forged = JobEnvelope::new(tampered, envelope.signature());
        assert_eq!(v.verify(&forged), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_malformed_tags() {
        let v = verifier();
        let not_hex = "zz".repeat(32);
        let too_long = "a".repeat(66);
        for tag in ["", "abc", not_hex.as_str(), too_long.as_str()] {
            let envelope = JobEnvelope::new(body(), tag);
            assert_eq!(v.verify(&envelope), Err(SignatureError::Malformed), "tag {tag:?}");
        }
    }

    #[test]
    fn test_freshness_window() {
        let v = verifier().with_max_age(Some(Duration::from_secs(3600)));
        let envelope = v.seal(body()).unwrap();
        let created = body().created_at;

        assert_eq!(v.verify_at(&envelope, created + chrono::Duration::seconds(60)), Ok(()));
        assert!(matches!(
            v.verify_at(&envelope, created + chrono::Duration::seconds(7200)),
            Err(SignatureError::Expired { age_secs: 7200, max_secs: 3600 })
        ));
        assert!(matches!(
            v.verify_at(&envelope, created - chrono::Duration::seconds(900)),
            Err(SignatureError::NotYetValid { ahead_secs: 900 })
        ));
        // Small skew is tolerated.
        assert_eq!(v.verify_at(&envelope, created - chrono::Duration::seconds(30)), Ok(()));
    }

    #[test]
    fn test_freshness_disabled_by_default() {
        let v = verifier();
        let envelope = v.seal(body()).unwrap();
        let far_future = body().created_at + chrono::Duration::days(365);
        assert_eq!(v.verify_at(&envelope, far_future), Ok(()));
    }

    proptest! {
        /// Flipping any byte of the canonical payload or the tag breaks verification.
        #[test]
        fn any_flipped_byte_fails(index in 0usize..4096, bit in 0u8..8) {
            let v = verifier();
            let envelope = v.seal(body()).unwrap();

            // Tag side: flip one hex digit to another hex digit.
            let mut tag: Vec<u8> = envelope.signature().bytes().collect();
            let i = index % tag.len();
            tag[i] = if tag[i] == b'0' { b'1' } else { b'0' };
            let forged = JobEnvelope::new(body(), String::from_utf8(tag).unwrap());
            prop_assert!(v.verify(&forged).is_err());

            // Payload side: flip one bit of the canonical bytes and check
            // the resulting MAC differs from the original tag.
            let mut payload = body().canonical_bytes();
            let j = index % payload.len();
            payload[j] ^= 1 << bit;
            let mut mac = HmacSha256::new_from_slice(KEY.as_bytes()).unwrap();
            mac.update(&payload);
            let provided = hex::decode(envelope.signature()).unwrap();
            prop_assert!(mac.verify_slice(&provided).is_err());
        }

        /// Changing any envelope field invalidates the tag.
        #[test]
        fn any_field_change_fails(field in 0usize..6, value in "[a-z0-9]{1,12}") {
            let v = verifier();
            let envelope = v.seal(body()).unwrap();
            let mut changed = body();
            match field {
                0 => changed.job_id = JobId::new(format!("x{value}")).unwrap(),
                1 => changed.app_id = format!("x{value}"),
                2 => changed.server_id = format!("x{value}"),
                3 => changed.user_id = format!("x{value}"),
                4 => { changed.inputs.insert(format!("x{value}"), value.clone()); }
                _ => changed.created_at += chrono::Duration::seconds(1),
            }
            let forged = JobEnvelope::new(changed, envelope.signature());
            prop_assert_eq!(v.verify(&forged), Err(SignatureError::Mismatch));
        }
    }
}
