//! Error types shared across the keel crates.

use thiserror::Error;

/// Configuration and logging setup failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// An environment variable was present but could not be parsed
    #[error("Invalid value {value:?} for environment variable {key}")]
    InvalidEnv { key: &'static str, value: String },

    /// Logging could not be installed (usually a second global subscriber)
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;
