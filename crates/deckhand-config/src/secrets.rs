//! Signing key resolution.
//!
//! Resolution order:
//! 1. `DECKHAND_SIGNING_KEY` environment variable
//! 2. `security.signing_key_file`
//! 3. `security.signing_key` (plaintext, with warning)
//!
//! The key is resolved once at startup and handed to the signature verifier
//! as an explicit dependency.

use std::fmt;
use std::path::Path;

use crate::{ConfigError, Result, SecurityConfig};

/// Env var holding the signing key.
pub const SIGNING_KEY_ENV: &str = "DECKHAND_SIGNING_KEY";

/// Shortest accepted key, in bytes.
const MIN_KEY_LEN: usize = 16;

/// Shared secret used to authenticate envelopes.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    /// Wrap raw key bytes, enforcing the minimum length.
    pub fn new(bytes: impl Into<Vec<u8>>) -> std::result::Result<Self, String> {
        let bytes = bytes.into();
        if bytes.len() < MIN_KEY_LEN {
            return Err(format!(
                "key is {} bytes, at least {MIN_KEY_LEN} required",
                bytes.len()
            ));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey(<{} bytes redacted>)", self.0.len())
    }
}

/// Where the signing key was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Environment variable.
    EnvVar(String),
    /// Dedicated key file.
    KeyFile(String),
    /// Config file (plaintext, discouraged).
    ConfigFile,
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::EnvVar(var) => write!(f, "env var {}", var),
            SecretSource::KeyFile(path) => write!(f, "key file {}", path),
            SecretSource::ConfigFile => write!(f, "config file (plaintext)"),
        }
    }
}

/// Resolve the signing key using the full resolution chain.
pub fn resolve_signing_key(security: &SecurityConfig) -> Result<(SigningKey, SecretSource)> {
    // 1. Environment variable
    if let Ok(value) = std::env::var(SIGNING_KEY_ENV)
        && !value.is_empty()
    {
        let source = SecretSource::EnvVar(SIGNING_KEY_ENV.to_string());
        return Ok((build_key(value.into_bytes(), &source)?, source));
    }

    // 2. Key file
    if let Some(path) = &security.signing_key_file {
        let source = SecretSource::KeyFile(path.display().to_string());
        let contents = std::fs::read(path).map_err(|e| ConfigError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;
        warn_if_exposed(path);
        return Ok((build_key(trim_trailing_whitespace(contents), &source)?, source));
    }

    // 3. Config file
    if let Some(value) = &security.signing_key {
        tracing::warn!(
            "Signing key is stored in plaintext in the config file; prefer {} or security.signing_key_file",
            SIGNING_KEY_ENV
        );
        let source = SecretSource::ConfigFile;
        return Ok((build_key(value.clone().into_bytes(), &source)?, source));
    }

    Err(ConfigError::SigningKeyNotFound {
        env_var: SIGNING_KEY_ENV.to_string(),
    })
}

fn build_key(bytes: Vec<u8>, source: &SecretSource) -> Result<SigningKey> {
    SigningKey::new(bytes).map_err(|message| ConfigError::InvalidSigningKey {
        source_name: source.to_string(),
        message,
    })
}

fn trim_trailing_whitespace(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last().is_some_and(|b| b.is_ascii_whitespace()) {
        bytes.pop();
    }
    bytes
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path)
        && meta.permissions().mode() & 0o077 != 0
    {
        tracing::warn!(
            path = %path.display(),
            mode = %format!("{:o}", meta.permissions().mode() & 0o777),
            "Signing key file is readable by group or others"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn clear_env() {
        // SAFETY: tests touching this variable are serialized.
        unsafe { std::env::remove_var(SIGNING_KEY_ENV) };
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SigningKey::new(KEY).unwrap();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains("0123"));
        assert!(rendered.contains("32 bytes"));
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(SigningKey::new("change-me").is_err());
    }

    #[test]
    #[serial]
    fn test_env_takes_priority() {
        clear_env();
        // SAFETY: serialized test.
        unsafe { std::env::set_var(SIGNING_KEY_ENV, KEY) };
        let security = SecurityConfig {
            signing_key: Some("ffffffffffffffffffffffff".to_string()),
            ..Default::default()
        };
        let (key, source) = resolve_signing_key(&security).unwrap();
        clear_env();

        assert_eq!(key.as_bytes(), KEY.as_bytes());
        assert_eq!(source, SecretSource::EnvVar(SIGNING_KEY_ENV.to_string()));
    }

    #[test]
    #[serial]
    fn test_key_file_trims_newline() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        std::fs::write(&path, format!("{KEY}\n")).unwrap();

        let security = SecurityConfig {
            signing_key_file: Some(path),
            ..Default::default()
        };
        let (key, source) = resolve_signing_key(&security).unwrap();
        assert_eq!(key.as_bytes(), KEY.as_bytes());
        assert!(matches!(source, SecretSource::KeyFile(_)));
    }

    #[test]
    #[serial]
    fn test_plaintext_fallback() {
        clear_env();
        let security = SecurityConfig {
            signing_key: Some(KEY.to_string()),
            ..Default::default()
        };
        let (_, source) = resolve_signing_key(&security).unwrap();
        assert_eq!(source, SecretSource::ConfigFile);
    }

    #[test]
    #[serial]
    fn test_missing_key() {
        clear_env();
        let err = resolve_signing_key(&SecurityConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::SigningKeyNotFound { .. }));
    }

    #[test]
    #[serial]
    fn test_short_key_reports_source() {
        clear_env();
        let security = SecurityConfig {
            signing_key: Some("short".to_string()),
            ..Default::default()
        };
        let err = resolve_signing_key(&security).unwrap_err();
        assert!(err.to_string().contains("config file"));
    }
}
