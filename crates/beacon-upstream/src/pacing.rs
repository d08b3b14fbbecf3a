//! Pacing and deduplication of uncoupled tag records
//!
//! Tags retransmit the same event many times. The store keeps the latest
//! record per source and counts how often that source was seen since the
//! last flush. A periodic flush emits one record per source (or per external
//! identity when several sources resolve to the same one) carrying that
//! count as `nfpkt`.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::gateway::GatewayHandle;
use crate::record::TagPacket;
use crate::state::now_millis;

/// External id the resolver reports for tags it could not identify
pub const UNKNOWN_EXTERNAL_ID: &str = "unknown";

/// Per-source last-value cache
#[derive(Debug, Default)]
pub struct PacingStore {
    records: HashMap<Uuid, TagPacket>,
    replay_counts: HashMap<Uuid, u32>,
    sources_by_external_id: HashMap<String, Vec<Uuid>>,
}

impl PacingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, records: HashMap<Uuid, TagPacket>) {
        for (source_id, record) in records {
            let duplicate = self
                .records
                .get(&source_id)
                .is_some_and(|existing| existing.suffix_hex() == record.suffix_hex());
            if !duplicate {
                self.records.insert(source_id, record);
            }
            *self.replay_counts.entry(source_id).or_insert(0) += 1;
        }
    }

    /// Group sources under the external identity they resolved to
    pub fn map_external_ids(&mut self, mapping: HashMap<String, Uuid>) {
        for (external_id, source_id) in mapping {
            let sources = self.sources_by_external_id.entry(external_id).or_default();
            if !sources.contains(&source_id) {
                sources.push(source_id);
            }
        }
    }

    /// Records newer than `window`, one per source or external identity
    pub fn flush(&mut self, window: Duration, now_ms: f64) -> Vec<TagPacket> {
        let cutoff = now_ms - window.as_secs_f64() * 1000.0;
        let selected: HashSet<Uuid> = self
            .records
            .iter()
            .filter(|(_, record)| record.timestamp_ms > cutoff)
            .map(|(source_id, _)| *source_id)
            .collect();

        let mut emitted: HashSet<Uuid> = HashSet::new();
        let mut out = Vec::new();

        for (external_id, sources) in &self.sources_by_external_id {
            if external_id == UNKNOWN_EXTERNAL_ID {
                continue;
            }
            let latest = sources
                .iter()
                .filter(|id| selected.contains(*id) && !emitted.contains(*id))
                .filter_map(|id| self.records.get(id).map(|record| (*id, record)))
                .max_by(|(_, a), (_, b)| a.timestamp_ms.total_cmp(&b.timestamp_ms));

            if let Some((source_id, record)) = latest {
                out.push(self.stamped(source_id, record));
            }
            emitted.extend(sources.iter().filter(|id| selected.contains(*id)));
        }

        for source_id in &selected {
            if emitted.contains(source_id) {
                continue;
            }
            if let Some(record) = self.records.get(source_id) {
                out.push(self.stamped(*source_id, record));
            }
        }

        for source_id in &selected {
            self.replay_counts.remove(source_id);
        }

        out.sort_by(|a, b| a.timestamp_ms.total_cmp(&b.timestamp_ms));
        out
    }

    /// Drop records older than `staleness` regardless of the pacing window
    pub fn evict_stale(&mut self, staleness: Duration, now_ms: f64) {
        let cutoff = now_ms - staleness.as_secs_f64() * 1000.0;
        let stale: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, record)| record.timestamp_ms <= cutoff)
            .map(|(source_id, _)| *source_id)
            .collect();

        for source_id in &stale {
            self.records.remove(source_id);
            self.replay_counts.remove(source_id);
        }
        if !stale.is_empty() {
            debug!("Evicted {} stale paced records", stale.len());
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn replay_count(&self, source_id: &Uuid) -> u32 {
        self.replay_counts.get(source_id).copied().unwrap_or(0)
    }

    fn stamped(&self, source_id: Uuid, record: &TagPacket) -> TagPacket {
        let mut record = record.clone();
        let count = self.replay_count(&source_id);
        if count > 0 {
            record.set_nfpkt(count);
        }
        record
    }
}

// -----------------------------------------------------------------------------
// Actor
// -----------------------------------------------------------------------------

/// Commands sent to the pacing actor
#[derive(Debug)]
pub enum PacingCommand {
    Ingest(HashMap<Uuid, TagPacket>),
    MapExternalIds(HashMap<String, Uuid>),
    /// Flush immediately instead of waiting for the next tick
    FlushNow {
        response: oneshot::Sender<usize>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct PacingHandle {
    tx: mpsc::Sender<PacingCommand>,
}

impl PacingHandle {
    pub fn new(tx: mpsc::Sender<PacingCommand>) -> Self {
        Self { tx }
    }

    pub async fn ingest(&self, records: HashMap<Uuid, TagPacket>) {
        if !records.is_empty() {
            let _ = self.tx.send(PacingCommand::Ingest(records)).await;
        }
    }

    pub async fn map_external_ids(&self, mapping: HashMap<String, Uuid>) {
        let _ = self.tx.send(PacingCommand::MapExternalIds(mapping)).await;
    }

    /// Flush now and return how many records were handed to the gateway
    pub async fn flush_now(&self) -> Option<usize> {
        let (response, rx) = oneshot::channel();
        self.tx.send(PacingCommand::FlushNow { response }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(PacingCommand::Shutdown).await;
    }
}

/// Timing of the pacing actor
#[derive(Debug, Clone, Copy)]
pub struct PacingTiming {
    pub window: Duration,
    pub staleness: Duration,
}

pub fn spawn_pacing(timing: PacingTiming, gateway: GatewayHandle) -> (PacingHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let task = tokio::spawn(run_pacing_actor(PacingStore::new(), timing, rx, gateway));
    (PacingHandle::new(tx), task)
}

/// Run the pacing actor
///
/// Every window tick evicts stale records, flushes the window and sends the
/// result to the gateway as one batch.
pub async fn run_pacing_actor(
    mut store: PacingStore,
    timing: PacingTiming,
    mut cmd_rx: mpsc::Receiver<PacingCommand>,
    gateway: GatewayHandle,
) {
    info!("Pacing actor started (window {}s)", timing.window.as_secs());

    let mut ticker = interval_at(Instant::now() + timing.window, timing.window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    PacingCommand::Ingest(records) => store.ingest(records),
                    PacingCommand::MapExternalIds(mapping) => store.map_external_ids(mapping),
                    PacingCommand::FlushNow { response } => {
                        let sent = flush_to_gateway(&mut store, timing, &gateway).await;
                        let _ = response.send(sent);
                    }
                    PacingCommand::Shutdown => break,
                }
            }

            _ = ticker.tick() => {
                flush_to_gateway(&mut store, timing, &gateway).await;
            }
        }
    }

    info!("Pacing actor stopped");
}

async fn flush_to_gateway(
    store: &mut PacingStore,
    timing: PacingTiming,
    gateway: &GatewayHandle,
) -> usize {
    let now = now_millis();
    store.evict_stale(timing.staleness, now);
    let batch = store.flush(timing.window, now);
    let count = batch.len();
    if count > 0 {
        debug!("Pacing flush: {} records ({} cached)", count, store.len());
        gateway.send_batch(batch).await;
    }
    count
}
