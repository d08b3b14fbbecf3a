//! Error types for the upstream engine

use thiserror::Error;

/// Errors surfaced to callers of the upstream service and gateway
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No connection token has been supplied
    #[error("missing connection token")]
    MissingToken,

    /// A connection attempt is already in progress
    #[error("gateway is already connecting")]
    AlreadyConnecting,

    /// The gateway is already connected
    #[error("gateway is already connected")]
    AlreadyConnected,

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope serialization failed
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// An actor went away before answering
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The service is already running
    #[error("service is already started")]
    AlreadyStarted,
}

/// Failures reported by the identity resolver
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("bad status code: {0}")]
    BadStatusCode(u16),

    #[error("bad status code: {0}, message: {1}")]
    BadStatusCodeWithMessage(u16, String),

    /// The resolver permanently refuses this payload's owner
    #[error("resolve denied")]
    ResolveDenied,

    /// Resolver could not be reached
    #[error("resolver unavailable: {0}")]
    Unavailable(String),
}

impl ResolveError {
    /// Whether further resolves for the same source should be skipped
    pub fn is_permanent(&self) -> bool {
        matches!(self, ResolveError::ResolveDenied)
    }
}

/// Failures reported by a publish/subscribe transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection token is expiring")]
    ExpiringToken,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("not connected")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(String),
}
