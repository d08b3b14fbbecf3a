//! Identity resolver collaborator
//!
//! The resolver maps a raw tag payload to a stable external identity. It is
//! a network service; the engine only sees this trait.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::envelope::{Location, GATEWAY_TYPE};
use crate::error::ResolveError;

/// One payload to resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadContainer {
    pub payload: String,
    pub timestamp: f64,
}

/// Body of a resolve call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub gateway_id: String,
    pub gateway_type: &'static str,
    /// Request time in whole milliseconds
    pub timestamp: f64,
    pub packets: Vec<PayloadContainer>,
}

impl ResolveRequest {
    /// Build a request, `None` when there is nothing to resolve
    pub fn new(
        gateway_id: &str,
        location: Option<Location>,
        packets: Vec<PayloadContainer>,
        now_ms: f64,
    ) -> Option<Self> {
        if packets.is_empty() {
            return None;
        }
        Some(Self {
            location,
            gateway_id: gateway_id.to_string(),
            gateway_type: GATEWAY_TYPE,
            timestamp: now_ms.round(),
            packets,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetTag {
    pub tag_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCategory {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sku_upc: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Asset a resolved tag can be claimed against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimableAsset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<AssetCategory>,
    #[serde(default)]
    pub tags: Option<Vec<AssetTag>>,
}

/// Identity returned by the resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedIdentity {
    #[serde(default)]
    pub timestamp: i64,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    #[serde(rename = "asset", default, skip_serializing_if = "Option::is_none")]
    pub claimable_asset: Option<ClaimableAsset>,
}

impl ResolvedIdentity {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            timestamp: 0,
            external_id: external_id.into(),
            owner_id: None,
            label_id: None,
            labels: None,
            asset_id: None,
            claimable_asset: None,
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.claimable_asset.is_some()
    }
}

/// Resolves tag payloads to external identities
pub trait Resolver: Send + Sync + 'static {
    fn resolve(
        &self,
        request: ResolveRequest,
    ) -> impl Future<Output = Result<ResolvedIdentity, ResolveError>> + Send;
}
