//! Error types for advertisement payload parsing

use thiserror::Error;

/// Errors that can occur while parsing a structured payload layout
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Payload is shorter than the layout requires
    #[error("truncated payload: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Bridge message type nibble is not a known value
    #[error("unknown bridge message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// Hex text could not be decoded
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}
