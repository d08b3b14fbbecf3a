//! Beacon Protocol Library
//!
//! This crate classifies raw Bluetooth advertisement payloads captured from
//! battery-free tags ("pixels"), relay bridges and third-party sensors, and
//! extracts the fields the upstream gateway needs:
//!
//! - **Bridge messages**: bridge-to-gateway status frames (heartbeats,
//!   module interface versions) and gateway-to-bridge commands
//! - **Side info**: bridge-observed metadata (MAC, packet counter, RSSI)
//!   about a tag transmission, to be coupled with the tag frame itself
//! - **Combined**: self-contained bridge frames that need no coupling
//! - **Third-party sensor**: sensor data frames, coupled with a sensor
//!   side-info frame
//! - **Pixel**: anything else, a tag frame that must be resolved
//!
//! # Frame Layout
//! ```text
//! [service:2] [group id:3] [bridge MAC:6] [counter:2] [rssi:1] ... [packet id:4]
//! ```
//!
//! All functions are pure. Frames too short for a field yield `None`
//! rather than an error; callers drop them silently.
//!
//! # Example
//!
//! ```rust
//! use beacon_protocol::{classify, PacketKind};
//!
//! let mut payload = vec![0xFC, 0xC6, 0x00, 0x00, 0xEC];
//! payload.extend_from_slice(&[0u8; 24]);
//!
//! assert_eq!(classify(&payload), PacketKind::SideInfo);
//! ```

pub mod bridge;
pub mod error;
pub mod frame;
pub mod reader;
pub mod sensor;

pub use bridge::{
    bridge_source_mac, connectable_bridge_id, heartbeat_api_version, is_heartbeat,
    is_module_ifv, message_type, BridgeMessageType,
};
pub use error::ParseError;
pub use frame::{to_hex_upper, DecodedFrame};
pub use reader::{bridge_mac, number_of_packets, rssi_byte, tag_suffix};
pub use sensor::{SensorFlags, SensorSideInfo};

/// Kind of advertisement payload, derived purely from byte inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketKind {
    /// Command from a gateway to a bridge (never forwarded)
    GatewayToBridge,
    /// Status message from a bridge to the gateway
    BridgeToGateway,
    /// Self-contained bridge frame
    Combined,
    /// Bridge-observed metadata about a tag transmission
    SideInfo,
    /// Bridge-observed metadata about a third-party sensor transmission
    SideInfoThirdParty,
    /// Third-party sensor data frame
    ThirdPartySensor,
    /// Tag frame to be resolved
    Pixel,
}

impl PacketKind {
    /// Returns a human-readable name for the packet kind
    pub fn name(&self) -> &'static str {
        match self {
            PacketKind::GatewayToBridge => "Gateway to Bridge",
            PacketKind::BridgeToGateway => "Bridge to Gateway",
            PacketKind::Combined => "Combined",
            PacketKind::SideInfo => "Side Info",
            PacketKind::SideInfoThirdParty => "Side Info (3rd party)",
            PacketKind::ThirdPartySensor => "3rd Party Sensor",
            PacketKind::Pixel => "Pixel",
        }
    }

    /// Whether frames of this kind carry side info to be coupled
    pub fn is_side_info(&self) -> bool {
        matches!(self, PacketKind::SideInfo | PacketKind::SideInfoThirdParty)
    }
}

/// Classify a payload
///
/// Checks run in a fixed order so that overlapping prefixes resolve the same
/// way every time: bridge messages first, then combined frames, side info,
/// third-party sensor data, and finally pixels.
pub fn classify(payload: &[u8]) -> PacketKind {
    if reader::is_gateway_to_bridge(payload) {
        PacketKind::GatewayToBridge
    } else if reader::is_bridge_to_gateway(payload) {
        PacketKind::BridgeToGateway
    } else if reader::is_combined(payload) {
        PacketKind::Combined
    } else if reader::is_side_info_third_party(payload) {
        PacketKind::SideInfoThirdParty
    } else if reader::is_side_info(payload) {
        PacketKind::SideInfo
    } else if reader::is_third_party_sensor(payload) {
        PacketKind::ThirdPartySensor
    } else {
        PacketKind::Pixel
    }
}
