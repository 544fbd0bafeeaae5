//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [agent]        # identity
//! [paths]        # installer root, logs, results, spool
//! [execution]    # interpreter, environment allowlist, termination grace
//! [retry]        # attempt budget and backoff
//! [security]     # signing key, envelope freshness
//! [queue]        # spool polling
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// Every section has defaults so that a partial file (or no file at all) can
/// be loaded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub paths: PathsConfig,
    pub execution: ExecutionConfig,
    pub retry: RetryConfig,
    pub security: SecurityConfig,
    pub queue: QueueConfig,
}

impl AgentConfig {
    /// Create a config with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every value is inside its accepted range.
    pub fn validate(&self) -> Result<()> {
        if self.agent.id.trim().is_empty() {
            return Err(ConfigError::invalid("agent.id", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            return Err(ConfigError::invalid(
                "retry.max_delay_secs",
                "must not be smaller than retry.base_delay_secs",
            ));
        }
        if self.execution.max_output_bytes == 0 {
            return Err(ConfigError::invalid(
                "execution.max_output_bytes",
                "must be greater than zero",
            ));
        }
        if !self.execution.interpreter.is_absolute() {
            return Err(ConfigError::invalid(
                "execution.interpreter",
                "must be an absolute path",
            ));
        }
        if self.execution.script_extension.contains('.') {
            return Err(ConfigError::invalid(
                "execution.script_extension",
                "give the extension without a dot (e.g. \"sh\")",
            ));
        }
        if self.queue.poll_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "queue.poll_interval_secs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Agent identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Identity that job assignment is sharded by.
    pub id: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: "agent-001".to_string(),
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Whitelisted installer root (`<installers>/<app_id>/manifest.yml`).
    pub installers: PathBuf,
    /// Per-job logs and the agent's own log.
    pub logs: PathBuf,
    /// Persisted result records.
    pub results: PathBuf,
    /// Spool directory the agent dequeues envelopes from.
    pub spool: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            installers: PathBuf::from("/opt/provisioning/installers"),
            logs: PathBuf::from("/var/log/provisioning"),
            results: PathBuf::from("/var/lib/provisioning/results"),
            spool: PathBuf::from("/var/lib/provisioning/spool"),
        }
    }
}

/// Installer execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Program that runs installer scripts.
    pub interpreter: PathBuf,
    /// Required installer script extension.
    pub script_extension: String,
    /// Seconds between SIGTERM and SIGKILL when terminating a process group.
    pub termination_grace_secs: u64,
    /// In-memory output retained per job (the log file keeps everything).
    pub max_output_bytes: usize,
    /// Agent environment variables passed through to installers.
    pub env_allowlist: Vec<String>,
    /// Reject contracts whose OS requirements don't match this host.
    pub enforce_os_requirements: bool,
}

impl ExecutionConfig {
    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("/bin/bash"),
            script_extension: "sh".to_string(),
            termination_grace_secs: 5,
            max_output_bytes: 1024 * 1024,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "TZ"]
                .into_iter()
                .map(String::from)
                .collect(),
            enforce_os_requirements: true,
        }
    }
}

/// Retry budget for retryable installer failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt.
    pub base_delay_secs: u64,
    /// Upper bound for any single delay.
    pub max_delay_secs: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 10,
            max_delay_secs: 300,
        }
    }
}

/// Envelope authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// File holding the shared signing key.
    pub signing_key_file: Option<PathBuf>,
    /// Plaintext signing key (discouraged; a warning is emitted).
    pub signing_key: Option<String>,
    /// Reject envelopes issued longer ago than this (disabled when unset).
    pub max_envelope_age_secs: Option<u64>,
}

impl SecurityConfig {
    pub fn max_envelope_age(&self) -> Option<Duration> {
        self.max_envelope_age_secs.map(Duration::from_secs)
    }
}

/// Spool queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Seconds between spool scans while idle, and after queue errors.
    pub poll_interval_secs: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AgentConfig::from_toml("").unwrap();
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(10));
        assert_eq!(config.execution.termination_grace(), Duration::from_secs(5));
        assert!(config.execution.env_allowlist.contains(&"PATH".to_string()));
        assert!(config.security.max_envelope_age().is_none());
    }

    #[test]
    fn test_partial_config() {
        let config = AgentConfig::from_toml(
            r#"
[agent]
id = "web-01"

[paths]
installers = "/srv/installers"

[retry]
max_attempts = 5
base_delay_secs = 2

[security]
signing_key_file = "/etc/deckhand/key"
max_envelope_age_secs = 3600
"#,
        )
        .unwrap();

        assert_eq!(config.agent.id, "web-01");
        assert_eq!(config.paths.installers, PathBuf::from("/srv/installers"));
        assert_eq!(config.paths.logs, PathBuf::from("/var/log/provisioning"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_secs, 300);
        assert_eq!(
            config.security.max_envelope_age(),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = AgentConfig::default();
        let parsed = AgentConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(AgentConfig::from_toml("[retry]\nmax_attempts = 0\n").is_err());
        assert!(AgentConfig::from_toml("[agent]\nid = \"  \"\n").is_err());
        assert!(AgentConfig::from_toml("[execution]\ninterpreter = \"bash\"\n").is_err());
        assert!(AgentConfig::from_toml("[execution]\nscript_extension = \".sh\"\n").is_err());
        assert!(
            AgentConfig::from_toml("[retry]\nbase_delay_secs = 60\nmax_delay_secs = 10\n").is_err()
        );
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = AgentConfig::from_toml("[retry\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
