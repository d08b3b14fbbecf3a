//! Prefix predicates and field extractors
//!
//! Every function here tolerates arbitrary input: a payload too short for
//! the field being read yields `None` (or `false` for predicates).

use crate::frame::to_hex_upper;

/// Primary bridge service prefix
pub const SERVICE_BRIDGE: [u8; 2] = [0xFC, 0xC6];
/// Legacy bridge service prefix
pub const SERVICE_BRIDGE_LEGACY: [u8; 2] = [0xAF, 0xFD];
/// Service prefix accepted for side-info frames only
pub const SERVICE_SIDE_INFO: [u8; 2] = [0xFD, 0xAF];
/// Third-party sensor service prefix
pub const SERVICE_THIRD_PARTY: [u8; 2] = [0xFC, 0x90];

/// Group id of third-party sensor side info
pub const GROUP_SIDE_INFO_THIRD_PARTY: [u8; 3] = [0x00, 0x00, 0xEB];
/// Group id of tag side info
pub const GROUP_SIDE_INFO: [u8; 3] = [0x00, 0x00, 0xEC];
/// Group id of gateway-to-bridge commands
pub const GROUP_GATEWAY_TO_BRIDGE: [u8; 3] = [0x00, 0x00, 0xED];
/// Group id of bridge-to-gateway messages
pub const GROUP_BRIDGE_TO_GATEWAY: [u8; 3] = [0x00, 0x00, 0xEE];

/// Mask applied to byte 4 to detect combined frames
pub const COMBINED_MASK: u8 = 0x3F;
/// Exact length of a third-party sensor data frame
pub const THIRD_PARTY_FRAME_LEN: usize = 29;
/// Length of the trailing packet id
pub const SUFFIX_LEN: usize = 4;

fn service(payload: &[u8]) -> Option<[u8; 2]> {
    payload.get(0..2)?.try_into().ok()
}

fn group(payload: &[u8]) -> Option<[u8; 3]> {
    payload.get(2..5)?.try_into().ok()
}

fn is_bridge_service(payload: &[u8]) -> bool {
    matches!(service(payload), Some(SERVICE_BRIDGE) | Some(SERVICE_BRIDGE_LEGACY))
}

/// Gateway-to-bridge command frame
pub fn is_gateway_to_bridge(payload: &[u8]) -> bool {
    is_bridge_service(payload) && group(payload) == Some(GROUP_GATEWAY_TO_BRIDGE)
}

/// Bridge-to-gateway message frame
pub fn is_bridge_to_gateway(payload: &[u8]) -> bool {
    is_bridge_service(payload) && group(payload) == Some(GROUP_BRIDGE_TO_GATEWAY)
}

/// Self-contained bridge frame
pub fn is_combined(payload: &[u8]) -> bool {
    payload.len() > 4
        && service(payload) == Some(SERVICE_BRIDGE)
        && payload[4] & COMBINED_MASK == COMBINED_MASK
}

/// Tag side-info frame
pub fn is_side_info(payload: &[u8]) -> bool {
    let prefix_ok = matches!(
        service(payload),
        Some(SERVICE_BRIDGE) | Some(SERVICE_BRIDGE_LEGACY) | Some(SERVICE_SIDE_INFO)
    );
    prefix_ok && group(payload) == Some(GROUP_SIDE_INFO)
}

/// Third-party sensor side-info frame
pub fn is_side_info_third_party(payload: &[u8]) -> bool {
    let prefix_ok = matches!(
        service(payload),
        Some(SERVICE_BRIDGE) | Some(SERVICE_BRIDGE_LEGACY) | Some(SERVICE_SIDE_INFO)
    );
    prefix_ok && group(payload) == Some(GROUP_SIDE_INFO_THIRD_PARTY)
}

/// Third-party sensor data frame
pub fn is_third_party_sensor(payload: &[u8]) -> bool {
    payload.len() == THIRD_PARTY_FRAME_LEN && service(payload) == Some(SERVICE_THIRD_PARTY)
}

/// Packet counter carried in bytes 11..13, big-endian
pub fn number_of_packets(payload: &[u8]) -> Option<u32> {
    let bytes = payload.get(11..13)?;
    Some(u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
}

/// Raw RSSI byte at offset 13
pub fn rssi_byte(payload: &[u8]) -> Option<u8> {
    payload.get(13).copied()
}

/// Bridge MAC in bytes 5..11 as uppercase hex
pub fn bridge_mac(payload: &[u8]) -> Option<String> {
    payload.get(5..11).map(to_hex_upper)
}

/// Trailing 4-byte packet id as uppercase hex
pub fn tag_suffix(payload: &[u8]) -> Option<String> {
    suffix_bytes(payload).map(to_hex_upper)
}

/// Trailing 4-byte packet id
pub fn suffix_bytes(payload: &[u8]) -> Option<&[u8]> {
    let start = payload.len().checked_sub(SUFFIX_LEN)?;
    payload.get(start..)
}
