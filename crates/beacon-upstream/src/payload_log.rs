//! Tag payload log
//!
//! Keeps the latest pixel payload per source in one of two accumulators.
//! Each interval the active accumulator is swapped out and its payloads are
//! published as a log envelope on the status topic. Log envelopes skip the
//! gateway's delivery queue, so they never displace data.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::{encode, Location, LogEnvelope, GATEWAY_TYPE};
use crate::gateway::GatewayHandle;
use crate::state::now_millis;

#[derive(Debug, Default)]
pub struct PayloadLog {
    lines: [HashMap<Uuid, String>; 2],
    active: usize,
}

impl PayloadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, source_id: Uuid, payload_hex: String) {
        self.lines[self.active].insert(source_id, payload_hex);
    }

    /// Swap accumulators, returning the payloads of the one swapped out
    ///
    /// The accumulator becoming active is cleared first.
    pub fn swap(&mut self) -> Vec<String> {
        let previous = self.active;
        self.active = 1 - previous;
        self.lines[self.active].clear();
        self.lines[previous].drain().map(|(_, payload)| payload).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(HashMap::is_empty)
    }
}

#[derive(Debug)]
pub enum PayloadLogCommand {
    Record { source_id: Uuid, payload_hex: String },
    SetEnabled(bool),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct PayloadLogHandle {
    tx: mpsc::Sender<PayloadLogCommand>,
}

impl PayloadLogHandle {
    pub fn new(tx: mpsc::Sender<PayloadLogCommand>) -> Self {
        Self { tx }
    }

    pub async fn record(&self, source_id: Uuid, payload_hex: String) {
        let _ = self
            .tx
            .send(PayloadLogCommand::Record {
                source_id,
                payload_hex,
            })
            .await;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let _ = self.tx.send(PayloadLogCommand::SetEnabled(enabled)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(PayloadLogCommand::Shutdown).await;
    }
}

/// Where log envelopes go
pub struct PayloadLogSink {
    pub gateway_id: String,
    pub location: watch::Receiver<Option<Location>>,
    pub gateway: GatewayHandle,
}

impl PayloadLogSink {
    async fn send(&self, gateway_logs: Vec<String>) {
        let envelope = LogEnvelope {
            gateway_id: &self.gateway_id,
            gateway_type: GATEWAY_TYPE,
            timestamp: now_millis().round(),
            location: *self.location.borrow(),
            gateway_logs: &gateway_logs,
        };
        match encode(&envelope) {
            Ok(message) => {
                debug!("Sending {} tag payload logs", gateway_logs.len());
                self.gateway.publish_status(message).await;
            }
            Err(e) => warn!("Failed to encode payload log: {}", e),
        }
    }
}

pub fn spawn_payload_log(
    sink: PayloadLogSink,
    period: Duration,
    enabled: bool,
) -> (PayloadLogHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let task = tokio::spawn(run_payload_log_actor(sink, period, enabled, rx));
    (PayloadLogHandle::new(tx), task)
}

/// Run the payload log actor
///
/// While disabled, recorded payloads are discarded and nothing is sent.
pub async fn run_payload_log_actor(
    sink: PayloadLogSink,
    period: Duration,
    mut enabled: bool,
    mut cmd_rx: mpsc::Receiver<PayloadLogCommand>,
) {
    info!("Payload log actor started (enabled: {})", enabled);

    let mut log = PayloadLog::new();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    PayloadLogCommand::Record { source_id, payload_hex } => {
                        if enabled {
                            log.record(source_id, payload_hex);
                        }
                    }
                    PayloadLogCommand::SetEnabled(value) => {
                        if enabled != value {
                            info!("Payload logging {}", if value { "enabled" } else { "disabled" });
                        }
                        enabled = value;
                        if !enabled {
                            log = PayloadLog::new();
                        }
                    }
                    PayloadLogCommand::Shutdown => break,
                }
            }

            _ = ticker.tick() => {
                if !enabled || log.is_empty() {
                    continue;
                }
                let payloads = log.swap();
                if !payloads.is_empty() {
                    sink.send(payloads).await;
                }
            }
        }
    }

    info!("Payload log actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayCommand;

    #[test]
    fn test_swap_alternates_accumulators() {
        let mut log = PayloadLog::new();
        let a = Uuid::from_u128(1);
        log.record(a, "AA".into());
        log.record(a, "AB".into());
        log.record(Uuid::from_u128(2), "BB".into());

        let mut first = log.swap();
        first.sort();
        assert_eq!(first, vec!["AB".to_string(), "BB".to_string()]);

        log.record(a, "AC".into());
        assert_eq!(log.swap(), vec!["AC".to_string()]);
        assert!(log.swap().is_empty());
        assert!(log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_sends_log_envelope() {
        let (gw_tx, mut gw_rx) = mpsc::channel(8);
        let (_location_tx, location) = watch::channel(Some(Location::new(1.0, 2.0)));
        let sink = PayloadLogSink {
            gateway_id: "gw-1".into(),
            location,
            gateway: GatewayHandle::new(gw_tx),
        };
        let (handle, _task) = spawn_payload_log(sink, Duration::from_secs(1), true);
        handle.record(Uuid::from_u128(1), "CAFE".into()).await;

        match gw_rx.recv().await {
            Some(GatewayCommand::PublishStatus { message }) => {
                let value: serde_json::Value = serde_json::from_str(&message).unwrap();
                assert_eq!(value["gatewayId"], "gw-1");
                assert_eq!(value["gatewayType"], "mobile");
                assert_eq!(value["gatewayLogs"], serde_json::json!(["CAFE"]));
                assert_eq!(value["location"]["lat"], 1.0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_actor_sends_nothing() {
        let (gw_tx, mut gw_rx) = mpsc::channel(8);
        let (_location_tx, location) = watch::channel(None);
        let sink = PayloadLogSink {
            gateway_id: "gw-1".into(),
            location,
            gateway: GatewayHandle::new(gw_tx),
        };
        let (handle, _task) = spawn_payload_log(sink, Duration::from_secs(1), false);
        handle.record(Uuid::from_u128(1), "CAFE".into()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(gw_rx.try_recv().is_err());

        handle.set_enabled(true).await;
        handle.record(Uuid::from_u128(1), "BEEF".into()).await;
        match gw_rx.recv().await {
            Some(GatewayCommand::PublishStatus { message }) => assert!(message.contains("BEEF")),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
