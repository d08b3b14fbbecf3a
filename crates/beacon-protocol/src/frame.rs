//! Decoded advertisement frames as handed over by the radio scanner

use uuid::Uuid;

use crate::error::ParseError;
use crate::reader;
use crate::{classify, PacketKind};

/// Encode bytes as uppercase hex
pub fn to_hex_upper(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Decode hex text (either case) into bytes
pub fn from_hex(text: &str) -> Result<Vec<u8>, ParseError> {
    hex::decode(text).map_err(|e| ParseError::InvalidHex(e.to_string()))
}

/// One qualifying advertisement observed by the scanner
///
/// Frames are immutable once produced. Kind and fields are recomputed from
/// the payload on demand rather than cached.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "camelCase")
)]
pub struct DecodedFrame {
    /// Identifier the scanner assigned to the transmitting peripheral
    pub source_id: Uuid,
    /// Received signal strength
    pub rssi: i32,
    /// Raw service data payload
    #[cfg_attr(feature = "serde", serde(with = "hex_payload"))]
    pub payload: Vec<u8>,
    /// Capture time in milliseconds since the Unix epoch
    pub captured_at_ms: f64,
    /// True when the payload came from manufacturer data rather than service data
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_manufacturer_frame: bool,
}

impl DecodedFrame {
    pub fn new(source_id: Uuid, rssi: i32, payload: Vec<u8>, captured_at_ms: f64) -> Self {
        Self {
            source_id,
            rssi,
            payload,
            captured_at_ms,
            is_manufacturer_frame: false,
        }
    }

    pub fn kind(&self) -> PacketKind {
        classify(&self.payload)
    }

    pub fn payload_hex(&self) -> String {
        to_hex_upper(&self.payload)
    }

    /// Hex of the trailing packet id, `None` for frames shorter than 4 bytes
    pub fn suffix_hex(&self) -> Option<String> {
        reader::tag_suffix(&self.payload)
    }
}

#[cfg(feature = "serde")]
mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex_upper(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::from_hex(&text).map_err(serde::de::Error::custom)
    }
}
