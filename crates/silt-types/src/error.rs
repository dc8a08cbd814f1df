//! Error types for shared domain types.

use thiserror::Error;

/// Errors from parsing or validating shared types
#[derive(Error, Debug)]
pub enum TypesError {
    /// Etag parse failure
    #[error("Invalid etag: {0}")]
    InvalidEtag(String),

    /// Configuration loading failure
    #[error("Config error: {0}")]
    Config(String),

    /// Configuration validation failure
    #[error("Invalid config: {0}")]
    Validation(String),
}

impl From<config::ConfigError> for TypesError {
    fn from(err: config::ConfigError) -> Self {
        TypesError::Config(err.to_string())
    }
}
