//! Outgoing tag packet records
//!
//! Each record family carries only the fields that apply to it. On the wire
//! all families share one flat JSON object with absent fields omitted:
//!
//! ```text
//! {"payload":"..","timestamp":..,"bridgeId":..,"sequenceId":..,"nfpkt":..,"rssi":..}
//! ```

use serde::{Serialize, Serializer};

/// Family-specific fields of an outgoing record
#[derive(Debug, Clone, PartialEq)]
pub enum RecordKind {
    /// Uncoupled tag frame that went through pacing
    Paced { rssi: i32, nfpkt: Option<u32> },
    /// Tag frame glued with bridge side info
    PlainGlued {
        bridge_id: String,
        nfpkt: u32,
        rssi: i32,
    },
    /// Third-party sensor frame glued with sensor side info
    ThirdPartyGlued {
        bridge_id: String,
        nfpkt: u32,
        rssi: i32,
        is_sensor: bool,
        sensor_service_id: String,
        sensor_id: String,
        is_scrambled: bool,
        is_embedded: bool,
    },
    /// Bridge-to-gateway message, forwarded as-is
    BridgeMessage { rssi: i32, alias_bridge_id: String },
    /// Self-contained bridge frame
    Combined { rssi: i32, alias_bridge_id: String },
}

/// One record in an upstream data envelope
#[derive(Debug, Clone, PartialEq)]
pub struct TagPacket {
    /// Uppercase hex payload
    pub payload: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: f64,
    /// Assigned by the gateway when the record is queued for sending
    pub sequence_id: Option<i64>,
    pub kind: RecordKind,
}

impl TagPacket {
    pub fn new(payload: String, timestamp_ms: f64, kind: RecordKind) -> Self {
        Self {
            payload,
            timestamp_ms,
            sequence_id: None,
            kind,
        }
    }

    pub fn rssi(&self) -> i32 {
        match &self.kind {
            RecordKind::Paced { rssi, .. }
            | RecordKind::PlainGlued { rssi, .. }
            | RecordKind::ThirdPartyGlued { rssi, .. }
            | RecordKind::BridgeMessage { rssi, .. }
            | RecordKind::Combined { rssi, .. } => *rssi,
        }
    }

    pub fn nfpkt(&self) -> Option<u32> {
        match &self.kind {
            RecordKind::Paced { nfpkt, .. } => *nfpkt,
            RecordKind::PlainGlued { nfpkt, .. } | RecordKind::ThirdPartyGlued { nfpkt, .. } => {
                Some(*nfpkt)
            }
            RecordKind::BridgeMessage { .. } | RecordKind::Combined { .. } => None,
        }
    }

    /// Overwrite the replay counter; bridge and combined records carry none
    pub fn set_nfpkt(&mut self, value: u32) {
        match &mut self.kind {
            RecordKind::Paced { nfpkt, .. } => *nfpkt = Some(value),
            RecordKind::PlainGlued { nfpkt, .. } | RecordKind::ThirdPartyGlued { nfpkt, .. } => {
                *nfpkt = value
            }
            RecordKind::BridgeMessage { .. } | RecordKind::Combined { .. } => {}
        }
    }

    pub fn bridge_id(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::PlainGlued { bridge_id, .. }
            | RecordKind::ThirdPartyGlued { bridge_id, .. } => Some(bridge_id),
            _ => None,
        }
    }

    /// Suffix of the hex payload covering the trailing 4-byte packet id
    pub fn suffix_hex(&self) -> &str {
        let start = self.payload.len().saturating_sub(8);
        self.payload.get(start..).unwrap_or_default()
    }

    fn wire(&self) -> WireRecord<'_> {
        let mut wire = WireRecord {
            payload: &self.payload,
            timestamp: self.timestamp_ms,
            bridge_id: None,
            sequence_id: self.sequence_id,
            nfpkt: self.nfpkt(),
            rssi: Some(self.rssi()),
            is_sensor: None,
            sensor_service_id: None,
            sensor_id: None,
            is_scrambled: None,
            is_embedded: None,
            alias_bridge_id: None,
        };
        match &self.kind {
            RecordKind::Paced { .. } => {}
            RecordKind::PlainGlued { bridge_id, .. } => wire.bridge_id = Some(bridge_id),
            RecordKind::ThirdPartyGlued {
                bridge_id,
                is_sensor,
                sensor_service_id,
                sensor_id,
                is_scrambled,
                is_embedded,
                ..
            } => {
                wire.bridge_id = Some(bridge_id);
                wire.is_sensor = Some(*is_sensor);
                wire.sensor_service_id = Some(sensor_service_id);
                wire.sensor_id = Some(sensor_id);
                wire.is_scrambled = Some(*is_scrambled);
                wire.is_embedded = Some(*is_embedded);
            }
            RecordKind::BridgeMessage {
                alias_bridge_id, ..
            }
            | RecordKind::Combined {
                alias_bridge_id, ..
            } => wire.alias_bridge_id = Some(alias_bridge_id),
        }
        wire
    }
}

impl Serialize for TagPacket {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.wire().serialize(serializer)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    payload: &'a str,
    timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    bridge_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nfpkt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_sensor: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensor_service_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sensor_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_scrambled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_embedded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alias_bridge_id: Option<&'a str>,
}
