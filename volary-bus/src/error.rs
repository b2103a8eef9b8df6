//! Error types for the bus boundary.

use thiserror::Error;

/// Errors reported by the messaging-bus client.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    /// A bus address could not be parsed.
    #[error("invalid bus address: {0}")]
    InvalidJid(String),

    /// The session is not connected.
    #[error("bus session is disconnected")]
    Disconnected,

    /// A peer did not answer a request.
    #[error("no response from {0}")]
    NoResponse(String),

    /// The peer answered with something unusable.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
