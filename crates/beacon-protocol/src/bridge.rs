//! Bridge-to-gateway message inspection
//!
//! Bridge messages share the bridge frame prefix. Byte 5 carries the message
//! type in its low nibble and flag bits in its high nibble:
//!
//! ```text
//! [service:2] [group id:3] [type:1] [api version:1] [..] [source MAC:6] ...
//! ```

use crate::error::ParseError;
use crate::frame::to_hex_upper;
use crate::reader::is_bridge_to_gateway;

/// Low nibble of byte 5 on a heartbeat message
const HEARTBEAT: u8 = 0x02;
/// Byte 5 flag set on module interface version messages
const MODULE_IFV_FLAG: u8 = 0x10;

/// Advertised local name prefixes of connectable bridges
const CONNECTABLE_PREFIXES: [&str; 2] = ["wiliot_", "wlt_"];

/// Bridge message type from the low nibble of byte 5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BridgeMessageType {
    Empty = 0x00,
    Assign = 0x01,
    Heartbeat = 0x02,
    LedBlink = 0x04,
    ConfigSet = 0x05,
    ConfigGet = 0x06,
}

impl TryFrom<u8> for BridgeMessageType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x0F {
            0x00 => Ok(BridgeMessageType::Empty),
            0x01 => Ok(BridgeMessageType::Assign),
            HEARTBEAT => Ok(BridgeMessageType::Heartbeat),
            0x04 => Ok(BridgeMessageType::LedBlink),
            0x05 => Ok(BridgeMessageType::ConfigSet),
            0x06 => Ok(BridgeMessageType::ConfigGet),
            other => Err(ParseError::UnknownMessageType(other)),
        }
    }
}

/// Message type of a bridge-to-gateway frame
pub fn message_type(payload: &[u8]) -> Result<BridgeMessageType, ParseError> {
    let byte = payload.get(5).copied().ok_or(ParseError::Truncated {
        needed: 6,
        actual: payload.len(),
    })?;
    BridgeMessageType::try_from(byte)
}

/// Heartbeat by message type; flag bits in the high nibble are ignored
pub fn is_heartbeat(payload: &[u8]) -> bool {
    is_bridge_to_gateway(payload) && message_type(payload) == Ok(BridgeMessageType::Heartbeat)
}

/// API version announced by a heartbeat, `None` for any other frame
pub fn heartbeat_api_version(payload: &[u8]) -> Option<u8> {
    if is_heartbeat(payload) {
        payload.get(6).copied()
    } else {
        None
    }
}

/// Module interface version message
pub fn is_module_ifv(payload: &[u8]) -> bool {
    is_bridge_to_gateway(payload)
        && payload
            .get(5)
            .is_some_and(|b| b & MODULE_IFV_FLAG == MODULE_IFV_FLAG)
}

/// Bridge id carried in bytes 8..14, uppercase hex
pub fn bridge_source_mac(payload: &[u8]) -> Option<String> {
    payload.get(8..14).map(to_hex_upper)
}

/// Bridge id from an advertised local name such as `wlt_0a1b2c`
pub fn connectable_bridge_id(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    CONNECTABLE_PREFIXES.iter().find_map(|prefix| {
        lower
            .strip_prefix(prefix)
            .filter(|rest| !rest.is_empty())
            .map(|_| name[prefix.len()..].to_ascii_uppercase())
    })
}
