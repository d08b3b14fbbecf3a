//! Shared state types for the upstream engine

use std::time::{SystemTime, UNIX_EPOCH};

use beacon_protocol::DecodedFrame;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

/// Key that pairs a side-info frame with its tag frame(s)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub source_id: Uuid,
    pub suffix_hex: String,
}

impl CorrelationKey {
    /// Key for a frame, `None` when the payload has no trailing packet id
    pub fn for_frame(frame: &DecodedFrame) -> Option<Self> {
        Some(Self {
            source_id: frame.source_id,
            suffix_hex: frame.suffix_hex()?,
        })
    }
}

/// Connection state of the gateway
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Preparing,
    Connecting,
    Connected,
    Disconnecting,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Connecting or connected, where a second start is refused
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Coarse status reported to embedding applications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamStatus {
    #[default]
    Inactive,
    Prepared,
    Connecting,
    Connected,
    Failure(String),
}

impl From<&ConnectionState> for UpstreamStatus {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Idle => UpstreamStatus::Inactive,
            ConnectionState::Preparing => UpstreamStatus::Prepared,
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                UpstreamStatus::Connecting
            }
            ConnectionState::Connected => UpstreamStatus::Connected,
            ConnectionState::Failed(reason) => UpstreamStatus::Failure(reason.clone()),
        }
    }
}

/// Network the embedding application prefers for the upstream connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PreferredConnectionType {
    #[default]
    None,
    Cellular,
    WirelessOrEthernet,
}
