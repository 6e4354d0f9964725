//! Error types for configuration loading.

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Source merging or deserialization failure.
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),

    /// No usable home/config directory on this system.
    #[error("cannot determine a configuration directory")]
    NoConfigDir,

    /// A value that parsed but cannot work.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
