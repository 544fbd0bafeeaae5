//! Configuration system for the deckhand agent.
//!
//! Provides TOML-based configuration with:
//! - One `agent.toml` discovered from an explicit path, `DECKHAND_CONFIG`,
//!   `/etc/deckhand/agent.toml`, or the XDG config directory
//! - Defaults for every field so a partial file is always usable
//! - Signing key resolution (env var → key file → config file)

pub mod discovery;
pub mod error;
pub mod secrets;
pub mod types;

pub use discovery::{
    load_config, load_config_file, xdg_config_path, LoadedConfig, AGENT_ID_ENV, CONFIG_PATH_ENV,
};
pub use error::{ConfigError, Result};
pub use secrets::{resolve_signing_key, SecretSource, SigningKey, SIGNING_KEY_ENV};
pub use types::*;
