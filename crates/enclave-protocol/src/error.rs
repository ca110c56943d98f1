//! Error types for the wire protocol and the collaborator ports.

use thiserror::Error;

/// Errors raised while framing, decoding, or validating boundary data.
///
/// Protocol errors are fatal to the connection that produced them and are
/// never retried. [`ProtocolError::Disconnected`] is kept distinct so callers
/// can tell a peer that vanished mid-frame from one that finished cleanly.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared length exceeds the maximum. Detected before any allocation.
    #[error("payload too large: {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown message type: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        expected: &'static str,
        actual: &'static str,
    },

    /// The peer closed the connection before a full frame arrived.
    #[error("disconnected during read: got {received} of {expected} bytes")]
    Disconnected { received: usize, expected: usize },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid {kind}: {value:?}")]
    InvalidIdentifier { kind: &'static str, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidPayload(error.to_string())
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors reported by collaborator port implementations.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("capability denied: {0}")]
    Denied(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("action failed: {0}")]
    Action(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl From<std::io::Error> for PortError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for PortError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<ProtocolError> for PortError {
    fn from(error: ProtocolError) -> Self {
        Self::Validation(error.to_string())
    }
}

pub type PortResult<T> = Result<T, PortError>;
