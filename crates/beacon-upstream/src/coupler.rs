//! Side-info / tag frame coupling
//!
//! A bridge relays a tag transmission as two fragments: the tag frame itself
//! and a side-info frame carrying bridge-observed metadata (bridge MAC,
//! packet counter, RSSI). Both carry the same trailing packet id, so they
//! are paired by [`CorrelationKey`].
//!
//! # Lifecycle of a key
//!
//! - Tag frames for a key are buffered in arrival order.
//! - When both halves are present, every buffered tag frame is glued into a
//!   record and the tag side of the key is cleared. The side-info half stays
//!   so a duplicate side-info frame is recognized and ignored.
//! - Once a key is older than the coupling lifetime, its remaining tag
//!   frames are released as uncoupled and all bookkeeping is dropped.
//!
//! [`Coupler`] is a plain state machine driven with explicit clock values.
//! [`run_coupler_actor`] owns one and serializes every mutation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use beacon_protocol::{
    bridge_mac, number_of_packets, rssi_byte, DecodedFrame, PacketKind, SensorSideInfo,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::record::{RecordKind, TagPacket};
use crate::state::{now_millis, CorrelationKey};

/// Result of one coupler flush
#[derive(Debug, Default)]
pub struct CouplerFlush {
    /// Records glued since the previous flush
    pub glued: Vec<TagPacket>,
    /// Tag frames whose side info never arrived in time
    pub uncoupled: Vec<DecodedFrame>,
}

/// Coupling state
pub struct Coupler {
    lifetime_ms: f64,
    tag_frames: HashMap<CorrelationKey, Vec<DecodedFrame>>,
    side_info: HashMap<CorrelationKey, DecodedFrame>,
    first_seen_ms: HashMap<CorrelationKey, f64>,
    ready: Vec<TagPacket>,
}

impl Coupler {
    pub fn new(lifetime_ms: u64) -> Self {
        Self {
            lifetime_ms: lifetime_ms as f64,
            tag_frames: HashMap::new(),
            side_info: HashMap::new(),
            first_seen_ms: HashMap::new(),
            ready: Vec::new(),
        }
    }

    pub fn receive_side_info(&mut self, frame: DecodedFrame, now_ms: f64) {
        let Some(key) = CorrelationKey::for_frame(&frame) else {
            debug!("Dropping side info without packet id from {}", frame.source_id);
            return;
        };
        if self.side_info.contains_key(&key) {
            return;
        }
        self.first_seen_ms.entry(key.clone()).or_insert(now_ms);
        self.side_info.insert(key.clone(), frame);

        if self.tag_frames.contains_key(&key) {
            self.glue(&key);
        }
    }

    pub fn receive_tag(&mut self, frame: DecodedFrame, now_ms: f64) {
        let Some(key) = CorrelationKey::for_frame(&frame) else {
            debug!("Dropping tag frame without packet id from {}", frame.source_id);
            return;
        };
        self.first_seen_ms.entry(key.clone()).or_insert(now_ms);
        self.tag_frames.entry(key.clone()).or_default().push(frame);

        if self.side_info.contains_key(&key) {
            self.glue(&key);
        }
    }

    /// Drain glued records and release tag frames older than the lifetime
    pub fn flush(&mut self, now_ms: f64) -> CouplerFlush {
        let glued = std::mem::take(&mut self.ready);

        let expired: HashSet<CorrelationKey> = self
            .first_seen_ms
            .iter()
            .filter(|(_, first_seen)| now_ms - **first_seen > self.lifetime_ms)
            .map(|(key, _)| key.clone())
            .collect();

        let mut uncoupled = Vec::new();
        for key in &expired {
            if let Some(frames) = self.tag_frames.remove(key) {
                uncoupled.extend(frames);
            }
            self.side_info.remove(key);
            self.first_seen_ms.remove(key);
        }

        CouplerFlush { glued, uncoupled }
    }

    /// Number of keys currently tracked
    pub fn pending_keys(&self) -> usize {
        self.first_seen_ms.len()
    }

    fn glue(&mut self, key: &CorrelationKey) {
        let Some(side) = self.side_info.get(key) else {
            return;
        };

        let kind_for = match glue_fields(side) {
            Some(fields) => fields,
            None => {
                debug!("Side info for {:?} is malformed, leaving tag frames pending", key);
                return;
            }
        };

        let Some(frames) = self.tag_frames.remove(key) else {
            return;
        };
        for tag in frames {
            let timestamp_ms = tag.captured_at_ms.max(side.captured_at_ms);
            self.ready
                .push(TagPacket::new(tag.payload_hex(), timestamp_ms, kind_for.clone()));
        }
    }
}

/// Record fields taken from a side-info frame
fn glue_fields(side: &DecodedFrame) -> Option<RecordKind> {
    if side.kind() == PacketKind::SideInfoThirdParty {
        let info = SensorSideInfo::parse(&side.payload).ok()?;
        return Some(RecordKind::ThirdPartyGlued {
            bridge_id: info.bridge_mac,
            nfpkt: u32::from(info.packet_counter),
            rssi: i32::from(info.rssi),
            is_sensor: info.flags.is_sensor,
            sensor_service_id: info.sensor_service_id,
            sensor_id: info.sensor_mac,
            is_scrambled: info.flags.is_scrambled,
            is_embedded: info.flags.is_embedded,
        });
    }

    Some(RecordKind::PlainGlued {
        bridge_id: bridge_mac(&side.payload)?,
        nfpkt: number_of_packets(&side.payload)?,
        rssi: i32::from(rssi_byte(&side.payload)?),
    })
}

// -----------------------------------------------------------------------------
// Actor
// -----------------------------------------------------------------------------

/// Commands sent to the coupler actor
#[derive(Debug)]
pub enum CouplerCommand {
    SideInfo(DecodedFrame),
    Tag(DecodedFrame),
    Flush {
        response: oneshot::Sender<CouplerFlush>,
    },
    Shutdown,
}

/// Cloneable handle to a running coupler actor
#[derive(Debug, Clone)]
pub struct CouplerHandle {
    tx: mpsc::Sender<CouplerCommand>,
    flush_timeout: Duration,
}

impl CouplerHandle {
    pub fn new(tx: mpsc::Sender<CouplerCommand>, flush_timeout: Duration) -> Self {
        Self { tx, flush_timeout }
    }

    pub async fn side_info(&self, frame: DecodedFrame) {
        let _ = self.tx.send(CouplerCommand::SideInfo(frame)).await;
    }

    pub async fn tag(&self, frame: DecodedFrame) {
        let _ = self.tx.send(CouplerCommand::Tag(frame)).await;
    }

    /// Flush with a bounded wait
    ///
    /// On timeout the request stays queued and is still processed by the
    /// actor; its result is discarded and an empty flush is returned.
    pub async fn flush(&self) -> CouplerFlush {
        let (response, rx) = oneshot::channel();
        if self.tx.send(CouplerCommand::Flush { response }).await.is_err() {
            return CouplerFlush::default();
        }
        match tokio::time::timeout(self.flush_timeout, rx).await {
            Ok(Ok(flush)) => flush,
            Ok(Err(_)) => CouplerFlush::default(),
            Err(_) => {
                error!(
                    "Coupler flush did not complete within {}ms",
                    self.flush_timeout.as_millis()
                );
                CouplerFlush::default()
            }
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(CouplerCommand::Shutdown).await;
    }
}

/// Spawn a coupler actor and return its handle
pub fn spawn_coupler(lifetime_ms: u64, flush_timeout: Duration) -> (CouplerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let task = tokio::spawn(run_coupler_actor(Coupler::new(lifetime_ms), rx));
    (CouplerHandle::new(tx, flush_timeout), task)
}

/// Run the coupler actor until shutdown or until every handle is dropped
pub async fn run_coupler_actor(mut coupler: Coupler, mut cmd_rx: mpsc::Receiver<CouplerCommand>) {
    info!("Coupler actor started");

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            CouplerCommand::SideInfo(frame) => coupler.receive_side_info(frame, now_millis()),
            CouplerCommand::Tag(frame) => coupler.receive_tag(frame, now_millis()),
            CouplerCommand::Flush { response } => {
                let flush = coupler.flush(now_millis());
                if !flush.glued.is_empty() || !flush.uncoupled.is_empty() {
                    debug!(
                        "Coupler flush: {} glued, {} uncoupled, {} keys pending",
                        flush.glued.len(),
                        flush.uncoupled.len(),
                        coupler.pending_keys()
                    );
                }
                let _ = response.send(flush);
            }
            CouplerCommand::Shutdown => break,
        }
    }

    info!("Coupler actor stopped");
}
