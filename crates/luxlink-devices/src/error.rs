/*!
 * Error types for device sessions and discovery.
 */
use std::time::Duration;

use thiserror::Error;

use luxlink_core::error::Error as CoreError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The session has no open connection
    #[error("Device not connected")]
    NotConnected,

    /// I/O failure on the connection (reset, refused, broken pipe)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A network operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The peer sent bytes that could not be decoded as a protocol frame
    #[error("Protocol decode error: {0}")]
    Decode(String),

    /// No correlated response arrived within the attempt budget
    #[error("No matching response after {attempts} attempts")]
    NoResponse {
        /// Number of read attempts made
        attempts: u32,
    },

    /// The handshake response was missing required identity fields
    #[error("Malformed handshake response: {0}")]
    MalformedHandshake(String),

    /// Two addresses claim the same device id
    #[error("Duplicate device id: {0}")]
    DuplicateDevice(String),

    /// The device id is not present in the registry
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl DeviceError {
    /// Whether the error is expected to resolve on a later health sweep.
    ///
    /// Decode failures count as transient: a misbehaving device is
    /// indistinguishable from a flaky link at this layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::Io(_)
                | DeviceError::Timeout(_)
                | DeviceError::Decode(_)
                | DeviceError::NoResponse { .. }
                | DeviceError::NotConnected
        )
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;
