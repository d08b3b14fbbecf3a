//! Upstream configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

/// Broker endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8883
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
        }
    }
}

/// Configuration threaded into every upstream component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Owner account, used in topics and as transport username
    pub account_id: String,
    /// Device id, used as client id and in every envelope
    pub gateway_id: String,
    /// Application version announced in capabilities
    pub app_version: String,
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Route uncoupled tag frames through pacing (dropped otherwise)
    #[serde(default = "default_true")]
    pub pacing_enabled: bool,
    /// Pacing window in seconds, announced as `pacingPeriod`
    #[serde(default = "default_pacing_interval")]
    pub pacing_interval_secs: u32,
    /// How long a tag frame waits for its side info
    #[serde(default = "default_coupling_lifetime")]
    pub coupling_lifetime_ms: u64,
    #[serde(default = "default_publish_interval")]
    pub publish_interval_ms: u64,
    #[serde(default = "default_publish_jitter")]
    pub publish_jitter_ms: u64,
    /// Delivery cadence of queued messages
    #[serde(default = "default_delivery_interval")]
    pub delivery_interval_ms: u64,
    /// Bound on waiting for a coupler flush
    #[serde(default = "default_flush_timeout")]
    pub coupler_flush_timeout_ms: u64,
    /// Records older than this are purged from pacing
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
    /// Grace period after force-closing a transport before reopening
    #[serde(default = "default_restart_grace")]
    pub restart_grace_ms: u64,
    /// Oldest queued messages are dropped past this bound
    #[serde(default = "default_max_queued")]
    pub max_queued_messages: usize,
    #[serde(default)]
    pub payload_logging_enabled: bool,
    #[serde(default = "default_payload_log_interval")]
    pub payload_log_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_pacing_interval() -> u32 {
    10
}

fn default_coupling_lifetime() -> u64 {
    3000
}

fn default_publish_interval() -> u64 {
    1000
}

fn default_publish_jitter() -> u64 {
    100
}

fn default_delivery_interval() -> u64 {
    1000
}

fn default_flush_timeout() -> u64 {
    5000
}

fn default_staleness() -> u64 {
    3600
}

fn default_restart_grace() -> u64 {
    500
}

fn default_max_queued() -> usize {
    1024
}

fn default_payload_log_interval() -> u64 {
    1000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            gateway_id: String::new(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            endpoint: Endpoint::default(),
            pacing_enabled: true,
            pacing_interval_secs: default_pacing_interval(),
            coupling_lifetime_ms: default_coupling_lifetime(),
            publish_interval_ms: default_publish_interval(),
            publish_jitter_ms: default_publish_jitter(),
            delivery_interval_ms: default_delivery_interval(),
            coupler_flush_timeout_ms: default_flush_timeout(),
            staleness_secs: default_staleness(),
            restart_grace_ms: default_restart_grace(),
            max_queued_messages: default_max_queued(),
            payload_logging_enabled: false,
            payload_log_interval_ms: default_payload_log_interval(),
        }
    }
}

impl UpstreamConfig {
    pub fn new(account_id: impl Into<String>, gateway_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            gateway_id: gateway_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), UpstreamError> {
        if self.account_id.is_empty() {
            return Err(UpstreamError::InvalidConfig("account_id is empty".into()));
        }
        if self.gateway_id.is_empty() {
            return Err(UpstreamError::InvalidConfig("gateway_id is empty".into()));
        }
        if self.endpoint.host.is_empty() {
            return Err(UpstreamError::InvalidConfig("endpoint host is empty".into()));
        }
        if !(1..=255).contains(&self.pacing_interval_secs) {
            return Err(UpstreamError::InvalidConfig(format!(
                "pacing_interval_secs must be within 1..=255, got {}",
                self.pacing_interval_secs
            )));
        }
        let intervals = [
            ("coupling_lifetime_ms", self.coupling_lifetime_ms),
            ("publish_interval_ms", self.publish_interval_ms),
            ("delivery_interval_ms", self.delivery_interval_ms),
            ("coupler_flush_timeout_ms", self.coupler_flush_timeout_ms),
            ("staleness_secs", self.staleness_secs),
            ("payload_log_interval_ms", self.payload_log_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, v)| *v == 0) {
            return Err(UpstreamError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.max_queued_messages == 0 {
            return Err(UpstreamError::InvalidConfig(
                "max_queued_messages must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Batcher tick period, including the jitter margin
    pub fn publish_period(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms + self.publish_jitter_ms)
    }

    pub fn pacing_period(&self) -> Duration {
        Duration::from_secs(u64::from(self.pacing_interval_secs))
    }

    /// Age after which paced records are evicted
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn delivery_period(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.coupler_flush_timeout_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_millis(self.restart_grace_ms)
    }

    pub fn payload_log_period(&self) -> Duration {
        Duration::from_millis(self.payload_log_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UpstreamConfig::new("acct", "gw");
        assert!(config.validate().is_ok());
        assert_eq!(config.pacing_interval_secs, 10);
        assert_eq!(config.endpoint.port, 8883);
        assert_eq!(config.publish_period(), Duration::from_millis(1100));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            UpstreamConfig::default().validate(),
            Err(UpstreamError::InvalidConfig(_))
        ));

        let mut config = UpstreamConfig::new("acct", "gw");
        config.pacing_interval_secs = 0;
        assert!(config.validate().is_err());

        config.pacing_interval_secs = 256;
        assert!(config.validate().is_err());

        let mut config = UpstreamConfig::new("acct", "gw");
        config.coupling_lifetime_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: UpstreamConfig =
            serde_json::from_str(r#"{"account_id":"a","gateway_id":"g","app_version":"1.0"}"#)
                .unwrap();
        assert!(config.pacing_enabled);
        assert_eq!(config.coupler_flush_timeout_ms, 5000);
        assert_eq!(config.max_queued_messages, 1024);
        assert_eq!(config.endpoint, Endpoint::default());
    }
}
