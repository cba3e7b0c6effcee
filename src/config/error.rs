//! Error types for configuration loading.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    ReadError {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML content.
    #[error("Failed to parse config file {path:?}: {source}")]
    ParseError {
        /// Path that failed to parse.
        path: PathBuf,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A configured value is out of its valid range.
    #[error("Invalid config value for '{key}': {message}")]
    InvalidValue {
        /// Dotted key of the offending option.
        key: &'static str,
        /// Description of the problem.
        message: String,
    },
}
