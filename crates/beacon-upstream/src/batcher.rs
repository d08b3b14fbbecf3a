//! Outbound batcher
//!
//! Collects ready records and hands them to the gateway once per publish
//! tick. Each tick first flushes the coupler: glued records join the batch,
//! uncoupled tag frames go to pacing (or are dropped when pacing is off).
//! Bridge messages and combined frames are appended directly and skip both
//! coupling and pacing.

use std::collections::HashMap;
use std::time::Duration;

use beacon_protocol::DecodedFrame;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::coupler::CouplerHandle;
use crate::gateway::GatewayHandle;
use crate::pacing::PacingHandle;
use crate::record::{RecordKind, TagPacket};

/// Commands sent to the batcher actor
#[derive(Debug)]
pub enum BatcherCommand {
    /// Add a ready record to the next batch
    Append(TagPacket),
    /// Run one tick immediately, answering with the batch size sent
    FlushNow {
        response: oneshot::Sender<usize>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct BatcherHandle {
    tx: mpsc::Sender<BatcherCommand>,
}

impl BatcherHandle {
    pub fn new(tx: mpsc::Sender<BatcherCommand>) -> Self {
        Self { tx }
    }

    pub async fn append(&self, record: TagPacket) {
        let _ = self.tx.send(BatcherCommand::Append(record)).await;
    }

    pub async fn flush_now(&self) -> Option<usize> {
        let (response, rx) = oneshot::channel();
        self.tx.send(BatcherCommand::FlushNow { response }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(BatcherCommand::Shutdown).await;
    }
}

/// Collaborators of one batcher
pub struct Batcher {
    coupler: CouplerHandle,
    pacing: Option<PacingHandle>,
    gateway: GatewayHandle,
    pending: Vec<TagPacket>,
}

impl Batcher {
    pub fn new(coupler: CouplerHandle, pacing: Option<PacingHandle>, gateway: GatewayHandle) -> Self {
        Self {
            coupler,
            pacing,
            gateway,
            pending: Vec::new(),
        }
    }

    async fn tick(&mut self) -> usize {
        let flush = self.coupler.flush().await;
        self.pending.extend(flush.glued);

        if !flush.uncoupled.is_empty() {
            match &self.pacing {
                Some(pacing) => pacing.ingest(paced_records(flush.uncoupled)).await,
                None => debug!(
                    "Pacing disabled, dropping {} uncoupled frames",
                    flush.uncoupled.len()
                ),
            }
        }

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        if count > 0 {
            debug!("Sending batch of {} records", count);
            self.gateway.send_batch(batch).await;
        }
        count
    }
}

/// Uncoupled tag frames as paced records, latest frame per source
pub fn paced_records(frames: Vec<DecodedFrame>) -> HashMap<Uuid, TagPacket> {
    let mut records: HashMap<Uuid, TagPacket> = HashMap::new();
    for frame in frames {
        let newer = records
            .get(&frame.source_id)
            .map_or(true, |existing| frame.captured_at_ms >= existing.timestamp_ms);
        if newer {
            let record = TagPacket::new(
                frame.payload_hex(),
                frame.captured_at_ms,
                RecordKind::Paced {
                    rssi: frame.rssi,
                    nfpkt: None,
                },
            );
            records.insert(frame.source_id, record);
        }
    }
    records
}

pub fn spawn_batcher(batcher: Batcher, period: Duration) -> (BatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let task = tokio::spawn(run_batcher_actor(batcher, period, rx));
    (BatcherHandle::new(tx), task)
}

/// Run the batcher actor
pub async fn run_batcher_actor(
    mut batcher: Batcher,
    period: Duration,
    mut cmd_rx: mpsc::Receiver<BatcherCommand>,
) {
    info!("Batcher actor started (period {}ms)", period.as_millis());

    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    BatcherCommand::Append(record) => batcher.pending.push(record),
                    BatcherCommand::FlushNow { response } => {
                        let _ = response.send(batcher.tick().await);
                    }
                    BatcherCommand::Shutdown => break,
                }
            }

            _ = ticker.tick() => {
                batcher.tick().await;
            }
        }
    }

    info!("Batcher actor stopped");
}
