//! Unified event stream for upstream activity
//!
//! Every outward notification (connection changes, bridge discovery,
//! resolution results, delivery) is emitted through a single event channel,
//! so embedding applications observe the whole pipeline in one place.

use uuid::Uuid;

use crate::resolver::ResolvedIdentity;
use crate::state::{ConnectionState, UpstreamStatus};

#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    // -------------------------------------------------------------------------
    // Connection events
    // -------------------------------------------------------------------------
    /// Coarse service status changed
    StatusChanged(UpstreamStatus),

    /// Gateway connection state changed
    ConnectionStateChanged(ConnectionState),

    /// Frame intake started or stopped
    ListeningChanged(bool),

    // -------------------------------------------------------------------------
    // Radio events
    // -------------------------------------------------------------------------
    /// A bridge announced itself with a heartbeat or interface version
    BridgeDiscovered {
        /// Bridge id from the message body
        bridge_id: String,
        /// Peripheral the message came from
        source_id: Uuid,
    },

    /// Fresh signal strength for a resolved tag
    PixelRssi { external_id: String, rssi: i32 },

    /// A tag payload resolved to an external identity
    IdentityResolved {
        source_id: Uuid,
        identity: ResolvedIdentity,
    },

    // -------------------------------------------------------------------------
    // Delivery events
    // -------------------------------------------------------------------------
    /// A data batch was serialized and queued for delivery
    BatchQueued {
        /// Number of records in the batch
        records: usize,
        /// Sequence id stamped on the first record
        first_sequence_id: i64,
    },

    /// A queued message was handed to the transport
    MessagePublished { topic: String },

    /// Error in a component
    Error {
        /// Component name
        source: String,
        /// Error message
        message: String,
    },
}

impl UpstreamEvent {
    /// Returns true if this is a connection event
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            UpstreamEvent::StatusChanged(_)
                | UpstreamEvent::ConnectionStateChanged(_)
                | UpstreamEvent::ListeningChanged(_)
        )
    }

    /// Returns true if this is a resolution event
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            UpstreamEvent::PixelRssi { .. } | UpstreamEvent::IdentityResolved { .. }
        )
    }
}
