//! Device error types.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`Connection`](crate::Connection) or [`Device`](crate::Device).
///
/// Messages are written to be shown to script authors as-is, e.g.
/// `read() failed: read timed out after 5000ms`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// A service, characteristic or descriptor does not exist.
    #[error("{kind} \"{id}\" not found")]
    NotFound { kind: &'static str, id: String },

    /// The device is not connected.
    #[error("device not connected")]
    NotConnected,

    /// The device is already connected.
    #[error("device already connected")]
    AlreadyConnected,

    /// The operation did not complete in time.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The characteristic does not support the requested operation.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// The characteristic cannot deliver notifications or indications.
    #[error("characteristic {0} does not support notifications")]
    NotNotifiable(String),

    /// Transport-level failure.
    #[error("{0}")]
    Transport(String),
}

impl DeviceError {
    /// Creates a not-found error for a service.
    pub fn service_not_found(uuid: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "service",
            id: uuid.into(),
        }
    }

    /// Creates a not-found error for a characteristic.
    pub fn characteristic_not_found(uuid: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "characteristic",
            id: uuid.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// Returns `true` if retrying the same operation may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport(_))
    }
}
