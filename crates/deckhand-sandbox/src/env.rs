//! Child process environment.
//!
//! Installers never inherit the agent's environment. The variables they see
//! are, in order of precedence:
//!
//! 1. fixed markers (`PROVISIONING_JOB`, `DEBIAN_FRONTEND`, job id, attempt)
//! 2. the job's resolved inputs, upper-cased
//! 3. allowlisted agent variables (`PATH` falls back to [`DEFAULT_PATH`])

use std::collections::BTreeMap;
use std::fmt;

use deckhand_types::JobId;

/// `PATH` used when the agent itself has none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Marker telling installers they run unattended under the agent.
pub const NONINTERACTIVE_MARKER: &str = "PROVISIONING_JOB";

const ATTEMPT_VAR: &str = "PROVISIONING_ATTEMPT";

#[derive(Clone)]
struct EnvValue {
    value: String,
    sensitive: bool,
}

impl fmt::Debug for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            f.write_str("\"<redacted>\"")
        } else {
            fmt::Debug::fmt(&self.value, f)
        }
    }
}

/// The complete environment of one installer attempt.
///
/// `Debug` prints sensitive values as `<redacted>`.
#[derive(Clone, Default)]
pub struct ChildEnv {
    vars: BTreeMap<String, EnvValue>,
}

impl ChildEnv {
    /// Start from the given allowlist of agent variables.
    pub fn builder(allowlist: &[String]) -> ChildEnvBuilder {
        ChildEnvBuilder::new(allowlist)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(|v| v.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Name/value pairs for the child command.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.value.as_str()))
    }

    /// Copy of this environment for a later attempt.
    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut env = self.clone();
        env.vars.insert(
            ATTEMPT_VAR.to_string(),
            EnvValue {
                value: attempt.to_string(),
                sensitive: false,
            },
        );
        env
    }
}

impl fmt::Debug for ChildEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(&self.vars).finish()
    }
}

/// Builder for [`ChildEnv`].
#[derive(Debug, Clone)]
pub struct ChildEnvBuilder {
    base: BTreeMap<String, String>,
    inputs: BTreeMap<String, EnvValue>,
    markers: BTreeMap<String, String>,
}

impl ChildEnvBuilder {
    fn new(allowlist: &[String]) -> Self {
        let mut base = BTreeMap::new();
        for name in allowlist {
            if let Ok(value) = std::env::var(name) {
                base.insert(name.clone(), value);
            }
        }
        base.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());

        let mut markers = BTreeMap::new();
        markers.insert(NONINTERACTIVE_MARKER.to_string(), "true".to_string());
        markers.insert("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string());

        Self {
            base,
            inputs: BTreeMap::new(),
            markers,
        }
    }

    /// Override an allowlisted variable (tests, fixed locales).
    pub fn base_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.base.insert(name.into(), value.into());
        self
    }

    /// Add one resolved input. The name is upper-cased.
    pub fn input(mut self, name: &str, value: impl Into<String>, sensitive: bool) -> Self {
        self.inputs.insert(
            name.to_ascii_uppercase(),
            EnvValue {
                value: value.into(),
                sensitive,
            },
        );
        self
    }

    /// Set the job id and attempt markers.
    pub fn job(mut self, job_id: &JobId, attempt: u32) -> Self {
        self.markers
            .insert("PROVISIONING_JOB_ID".to_string(), job_id.to_string());
        self.markers
            .insert(ATTEMPT_VAR.to_string(), attempt.to_string());
        self
    }

    pub fn build(self) -> ChildEnv {
        let mut vars: BTreeMap<String, EnvValue> = self
            .base
            .into_iter()
            .map(|(k, value)| {
                (
                    k,
                    EnvValue {
                        value,
                        sensitive: false,
                    },
                )
            })
            .collect();
        vars.extend(self.inputs);
        vars.extend(self.markers.into_iter().map(|(k, value)| {
            (
                k,
                EnvValue {
                    value,
                    sensitive: false,
                },
            )
        }));
        ChildEnv { vars }
    }
}
