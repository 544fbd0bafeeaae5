//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration loading and resolution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize config.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its accepted range.
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// No signing key through any resolution method.
    #[error(
        "signing key not found. Set {env_var}, security.signing_key_file, or security.signing_key"
    )]
    SigningKeyNotFound { env_var: String },

    /// Signing key present but unusable.
    #[error("signing key from {source_name} is invalid: {message}")]
    InvalidSigningKey {
        source_name: String,
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
