//! Replay settings

use std::path::{Path, PathBuf};

use anyhow::Context;
use beacon_upstream::{Location, UpstreamConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_upstream")]
    pub upstream: UpstreamConfig,
    /// Connection token handed to the transport
    #[serde(default = "default_token")]
    pub token: String,
    /// Fixed location attached to every envelope
    #[serde(default)]
    pub location: Option<Location>,
    /// Simulated resolver latency
    #[serde(default)]
    pub resolve_delay_ms: u64,
    /// Time to keep running after the last frame so pending batches flush
    #[serde(default = "default_linger")]
    pub linger_ms: u64,
}

fn default_upstream() -> UpstreamConfig {
    UpstreamConfig::new("replay-account", "replay-gateway")
}

fn default_token() -> String {
    "replay".to_string()
}

fn default_linger() -> u64 {
    3000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            token: default_token(),
            location: None,
            resolve_delay_ms: 0,
            linger_ms: default_linger(),
        }
    }
}

impl Settings {
    /// `<config dir>/beacon-gateway/settings.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("beacon-gateway").join("settings.json"))
    }

    /// Load from `path`, or from the default location when `None`
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = match path {
            Some(path) => Self::read(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::read(&path)?,
                _ => Self::default(),
            },
        };
        settings.upstream.validate()?;
        Ok(settings)
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }
}
