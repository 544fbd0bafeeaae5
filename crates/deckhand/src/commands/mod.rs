//! CLI command handlers.

use std::path::PathBuf;

use deckhand_config::AgentConfig;

pub mod check;
pub mod run;
pub mod sign;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Effective configuration.
    pub config: AgentConfig,
    /// File the configuration came from, if any.
    pub config_source: Option<PathBuf>,
    /// Verbose output enabled.
    pub verbose: bool,
}
