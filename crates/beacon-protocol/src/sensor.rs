//! Third-party sensor side-info layout
//!
//! After the optional 5-byte header (service + group id) the body reads:
//!
//! ```text
//! [bridge MAC:6] [counter:2 LE] [rssi:1] [reserved:1] [sensor MAC:6] [service id:3] ... [flags:1] [packet id:4]
//! ```

use crate::error::ParseError;
use crate::frame::to_hex_upper;
use crate::reader::{
    GROUP_SIDE_INFO_THIRD_PARTY, SERVICE_BRIDGE, SERVICE_BRIDGE_LEGACY, SERVICE_SIDE_INFO,
    SERVICE_THIRD_PARTY, SUFFIX_LEN,
};

const HEADER_LEN: usize = 5;
/// Fixed fields plus the flags byte and trailing packet id
const MIN_BODY_LEN: usize = 19 + 1 + SUFFIX_LEN;

const FLAG_SENSOR: u8 = 0x01;
const FLAG_EMBEDDED: u8 = 0x02;
const FLAG_SCRAMBLED: u8 = 0x04;

/// Sensor flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorFlags {
    pub is_sensor: bool,
    pub is_embedded: bool,
    pub is_scrambled: bool,
}

impl From<u8> for SensorFlags {
    fn from(byte: u8) -> Self {
        Self {
            is_sensor: byte & FLAG_SENSOR != 0,
            is_embedded: byte & FLAG_EMBEDDED != 0,
            is_scrambled: byte & FLAG_SCRAMBLED != 0,
        }
    }
}

/// Bridge-observed metadata about a third-party sensor transmission
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorSideInfo {
    pub bridge_mac: String,
    pub packet_counter: u16,
    pub rssi: u8,
    pub sensor_mac: String,
    pub sensor_service_id: String,
    pub flags: SensorFlags,
}

impl SensorSideInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let body = strip_header(payload);
        if body.len() < MIN_BODY_LEN {
            return Err(ParseError::Truncated {
                needed: MIN_BODY_LEN + (payload.len() - body.len()),
                actual: payload.len(),
            });
        }

        let flags_at = body.len() - SUFFIX_LEN - 1;
        Ok(Self {
            bridge_mac: to_hex_upper(&body[0..6]),
            packet_counter: u16::from_le_bytes([body[6], body[7]]),
            rssi: body[8],
            sensor_mac: to_hex_upper(&body[10..16]),
            sensor_service_id: to_hex_upper(&body[16..19]),
            flags: SensorFlags::from(body[flags_at]),
        })
    }
}

fn strip_header(payload: &[u8]) -> &[u8] {
    let has_header = matches!(
        payload.get(0..2),
        Some(s) if s == SERVICE_BRIDGE
            || s == SERVICE_BRIDGE_LEGACY
            || s == SERVICE_SIDE_INFO
            || s == SERVICE_THIRD_PARTY
    ) && payload.get(2..HEADER_LEN) == Some(&GROUP_SIDE_INFO_THIRD_PARTY[..]);

    if has_header {
        &payload[HEADER_LEN..]
    } else {
        payload
    }
}
