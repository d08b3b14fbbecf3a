//! JSON envelopes published upstream

use serde::{Deserialize, Serialize, Serializer};

use crate::error::UpstreamError;
use crate::record::TagPacket;

/// Gateway type announced in every envelope
pub const GATEWAY_TYPE: &str = "mobile";
/// Gateway configuration API version announced in capabilities
pub const API_VERSION: u32 = 202;

/// Serialize an outgoing message as compact JSON
pub fn encode<T: Serialize>(message: &T) -> Result<String, UpstreamError> {
    Ok(serde_json::to_string(message)?)
}

/// Last known location fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(serialize_with = "five_decimals")]
    pub lat: f64,
    #[serde(serialize_with = "five_decimals")]
    pub lng: f64,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

fn five_decimals<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64((value * 100_000.0).round() / 100_000.0)
}

/// Batch of records sent on the data topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataEnvelope<'a> {
    pub gateway_id: &'a str,
    pub gateway_type: &'static str,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub packets: &'a [TagPacket],
}

/// Latest tag payloads sent on the status topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEnvelope<'a> {
    pub gateway_id: &'a str,
    pub gateway_type: &'static str,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub gateway_logs: &'a [String],
}

/// Capability announcement sent once per connection on the status topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesMessage {
    pub bridge_ota_upgrade_supported: bool,
    pub downlink_supported: bool,
    pub gateway_conf: GatewayConf,
    pub gateway_type: &'static str,
    pub mel_ota_upgrade_supported: bool,
    pub tag_metadata_coupling_supported: bool,
    pub fw_upgrade_supported: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConf {
    pub additional: AdditionalConf,
    pub api_version: u32,
    pub gateway_version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalConf {
    pub pacing_period: u32,
    pub version_name: String,
}

impl CapabilitiesMessage {
    pub fn new(app_version: &str, pacing_period: u32) -> Self {
        Self {
            bridge_ota_upgrade_supported: false,
            downlink_supported: false,
            gateway_conf: GatewayConf {
                additional: AdditionalConf {
                    pacing_period,
                    version_name: app_version.to_string(),
                },
                api_version: API_VERSION,
                gateway_version: app_version.to_string(),
            },
            gateway_type: GATEWAY_TYPE,
            mel_ota_upgrade_supported: false,
            tag_metadata_coupling_supported: true,
            fw_upgrade_supported: false,
        }
    }
}

/// Publish/subscribe topics for one gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub data: String,
    pub status: String,
}

impl Topics {
    pub fn new(owner_id: &str, gateway_id: &str) -> Self {
        Self {
            data: format!("data/{owner_id}/{gateway_id}"),
            status: format!("status/{owner_id}/{gateway_id}"),
        }
    }
}
