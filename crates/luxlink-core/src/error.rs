/*!
 * Error types for the LuxLink core crate.
 *
 * This module defines the error type shared by configuration, logging and
 * other foundation concerns. Device-level errors live in `luxlink-devices`.
 */
use thiserror::Error;

/// Error type for core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or rejected configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Runtime/initialization error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime(message.into())
    }

    /// Create an uncategorized error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
