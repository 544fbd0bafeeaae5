//! Config file discovery.
//!
//! Resolution order (first hit wins):
//! 1. Explicit path (`--config`)
//! 2. `DECKHAND_CONFIG` env var
//! 3. `/etc/deckhand/agent.toml`
//! 4. `~/.config/deckhand/agent.toml` (XDG user config)
//!
//! With no file found the defaults are used. `DECKHAND_AGENT_ID` overrides
//! `agent.id` in every case.

use std::path::{Path, PathBuf};

use crate::{AgentConfig, ConfigError, Result};

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "DECKHAND_CONFIG";

/// Env var overriding the agent identity.
pub const AGENT_ID_ENV: &str = "DECKHAND_AGENT_ID";

/// Config filename.
const CONFIG_FILE: &str = "agent.toml";

/// System-wide config location.
const SYSTEM_CONFIG_PATH: &str = "/etc/deckhand/agent.toml";

/// Application name for XDG directory resolution.
const APP_NAME: &str = "deckhand";

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The effective configuration.
    pub config: AgentConfig,
    /// File the configuration was read from, if any.
    pub source: Option<PathBuf>,
    /// Candidate paths that were checked, in order.
    pub searched: Vec<PathBuf>,
}

/// Discover and load the agent configuration.
///
/// An explicit path (argument or env var) must exist; the implicit locations
/// are skipped when absent.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let explicit = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

    let mut searched = Vec::new();
    let mut loaded = None;

    if let Some(path) = explicit {
        searched.push(path.clone());
        loaded = Some((load_config_file(&path)?, path));
    } else {
        let candidates = std::iter::once(PathBuf::from(SYSTEM_CONFIG_PATH)).chain(xdg_config_path());
        for path in candidates {
            searched.push(path.clone());
            if path.is_file() {
                loaded = Some((load_config_file(&path)?, path));
                break;
            }
        }
    }

    let (mut config, source) = match loaded {
        Some((config, path)) => {
            tracing::debug!(path = %path.display(), "Loaded agent config");
            (config, Some(path))
        }
        None => {
            tracing::debug!(searched = ?searched, "No config file found, using defaults");
            (AgentConfig::default(), None)
        }
    };

    if let Ok(id) = std::env::var(AGENT_ID_ENV)
        && !id.trim().is_empty()
    {
        config.agent.id = id;
    }
    config.validate()?;

    Ok(LoadedConfig {
        config,
        source,
        searched,
    })
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    AgentConfig::from_toml(&contents)
}

/// XDG config file path (`~/.config/deckhand/agent.toml`).
pub fn xdg_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(CONFIG_FILE))
}
