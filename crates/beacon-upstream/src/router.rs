//! Frame router
//!
//! Classifies every decoded frame and dispatches it:
//!
//! - **Gateway to bridge**: dropped
//! - **Bridge to gateway**: appended to the batcher as a bridge message;
//!   heartbeats and interface version messages also announce the bridge
//! - **Combined**: appended to the batcher as-is
//! - **Side info**: coupler, side-info half
//! - **Third-party sensor**: coupler, tag half
//! - **Pixel**: coupler, tag half, and identity resolution
//!
//! At most one resolve call is in flight per source. Resolve calls run on
//! their own tasks and report back through a completion channel, so all
//! bookkeeping is still mutated only by the router task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use beacon_protocol::{
    bridge_source_mac, is_heartbeat, is_module_ifv, message_type, DecodedFrame, PacketKind,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::BatcherHandle;
use crate::coupler::CouplerHandle;
use crate::envelope::Location;
use crate::error::ResolveError;
use crate::events::UpstreamEvent;
use crate::pacing::PacingHandle;
use crate::payload_log::PayloadLogHandle;
use crate::record::{RecordKind, TagPacket};
use crate::resolver::{PayloadContainer, ResolveRequest, ResolvedIdentity, Resolver};
use crate::state::now_millis;

/// What to do with a pixel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveDecision {
    /// Nothing to resolve or report
    Skip,
    /// Identity already known; report signal strength only
    UpdateRssi { external_id: String, rssi: i32 },
    /// Issue a resolve call; the source is now pending
    Resolve,
}

/// Resolution bookkeeping
#[derive(Debug, Default)]
pub struct ResolveTracker {
    pending_sources: HashSet<Uuid>,
    pending_suffixes: HashSet<String>,
    resolved: HashMap<Uuid, ResolvedIdentity>,
    skip_sources: HashSet<Uuid>,
    last_frames: HashMap<Uuid, DecodedFrame>,
}

impl ResolveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_pixel(&mut self, frame: &DecodedFrame, reresolve: bool) -> ResolveDecision {
        let source_id = frame.source_id;
        let suffix = frame.suffix_hex();
        self.last_frames.insert(source_id, frame.clone());

        let source_pending = self.pending_sources.contains(&source_id);
        let suffix_pending = suffix
            .as_ref()
            .is_some_and(|s| self.pending_suffixes.contains(s));

        if source_pending || suffix_pending || self.skip_sources.contains(&source_id) {
            if source_pending {
                return ResolveDecision::Skip;
            }
            return self.rssi_update(&source_id, frame.rssi);
        }

        if !reresolve && self.resolved.contains_key(&source_id) {
            return self.rssi_update(&source_id, frame.rssi);
        }

        self.pending_sources.insert(source_id);
        if let Some(suffix) = suffix {
            self.pending_suffixes.insert(suffix);
        }
        ResolveDecision::Resolve
    }

    /// Record a resolve outcome and return the RSSI updates it releases
    ///
    /// On success the originating frame's RSSI is reported, followed by the
    /// most recent frame's RSSI if a later frame arrived while pending.
    pub fn on_resolved(
        &mut self,
        source_id: Uuid,
        suffix: Option<&str>,
        frame: &DecodedFrame,
        result: &Result<ResolvedIdentity, ResolveError>,
    ) -> Vec<(String, i32)> {
        self.pending_sources.remove(&source_id);
        if let Some(suffix) = suffix {
            self.pending_suffixes.remove(suffix);
        }

        match result {
            Ok(identity) => {
                self.resolved.insert(source_id, identity.clone());
                let mut updates = vec![(identity.external_id.clone(), frame.rssi)];
                if let Some(last) = self.last_frames.get(&source_id) {
                    if last != frame && last.captured_at_ms >= frame.captured_at_ms {
                        updates.push((identity.external_id.clone(), last.rssi));
                    }
                }
                updates
            }
            Err(e) if e.is_permanent() => {
                self.skip_sources.insert(source_id);
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn last_frame(&self, source_id: &Uuid) -> Option<&DecodedFrame> {
        self.last_frames.get(source_id)
    }

    pub fn identity(&self, source_id: &Uuid) -> Option<&ResolvedIdentity> {
        self.resolved.get(source_id)
    }

    pub fn is_pending(&self, source_id: &Uuid) -> bool {
        self.pending_sources.contains(source_id)
    }

    pub fn is_skipped(&self, source_id: &Uuid) -> bool {
        self.skip_sources.contains(source_id)
    }

    fn rssi_update(&self, source_id: &Uuid, rssi: i32) -> ResolveDecision {
        match self.resolved.get(source_id) {
            Some(identity) => ResolveDecision::UpdateRssi {
                external_id: identity.external_id.clone(),
                rssi,
            },
            None => ResolveDecision::Skip,
        }
    }
}

/// Id used as `aliasBridgeId` for records whose sender is the bridge itself
pub fn alias_bridge_id(source_id: &Uuid) -> String {
    source_id.hyphenated().to_string().to_uppercase()
}

// -----------------------------------------------------------------------------
// Actor
// -----------------------------------------------------------------------------

/// Commands sent to the router actor
#[derive(Debug)]
pub enum RouterCommand {
    Frame(DecodedFrame),
    /// Resolve the last frame seen from a source even if already resolved
    Reresolve(Uuid),
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    pub fn new(tx: mpsc::Sender<RouterCommand>) -> Self {
        Self { tx }
    }

    pub async fn route(&self, frame: DecodedFrame) {
        let _ = self.tx.send(RouterCommand::Frame(frame)).await;
    }

    pub async fn reresolve(&self, source_id: Uuid) {
        let _ = self.tx.send(RouterCommand::Reresolve(source_id)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(RouterCommand::Shutdown).await;
    }
}

/// Downstream components a router dispatches into
#[derive(Clone)]
pub struct RouterLinks {
    pub gateway_id: String,
    pub coupler: CouplerHandle,
    pub batcher: BatcherHandle,
    pub pacing: Option<PacingHandle>,
    pub payload_log: Option<PayloadLogHandle>,
    pub location: watch::Receiver<Option<Location>>,
    pub events: mpsc::Sender<UpstreamEvent>,
}

struct ResolveCompletion {
    frame: DecodedFrame,
    suffix: Option<String>,
    result: Result<ResolvedIdentity, ResolveError>,
}

struct Router<R: Resolver> {
    links: RouterLinks,
    resolver: Arc<R>,
    tracker: ResolveTracker,
    completion_tx: mpsc::UnboundedSender<ResolveCompletion>,
}

impl<R: Resolver> Router<R> {
    async fn route(&mut self, frame: DecodedFrame) {
        match frame.kind() {
            PacketKind::GatewayToBridge => {}

            PacketKind::BridgeToGateway => {
                match message_type(&frame.payload) {
                    Ok(kind) => debug!("Bridge message {:?} from {}", kind, frame.source_id),
                    Err(e) => debug!("Bridge message from {}: {}", frame.source_id, e),
                }
                if is_heartbeat(&frame.payload) || is_module_ifv(&frame.payload) {
                    if let Some(bridge_id) = bridge_source_mac(&frame.payload) {
                        debug!("Bridge {} seen via {}", bridge_id, frame.source_id);
                        let _ = self
                            .links
                            .events
                            .send(UpstreamEvent::BridgeDiscovered {
                                bridge_id,
                                source_id: frame.source_id,
                            })
                            .await;
                    }
                }
                let record = TagPacket::new(
                    frame.payload_hex(),
                    frame.captured_at_ms,
                    RecordKind::BridgeMessage {
                        rssi: frame.rssi,
                        alias_bridge_id: alias_bridge_id(&frame.source_id),
                    },
                );
                self.links.batcher.append(record).await;
            }

            PacketKind::Combined => {
                let record = TagPacket::new(
                    frame.payload_hex(),
                    frame.captured_at_ms,
                    RecordKind::Combined {
                        rssi: frame.rssi,
                        alias_bridge_id: alias_bridge_id(&frame.source_id),
                    },
                );
                self.links.batcher.append(record).await;
            }

            PacketKind::SideInfo | PacketKind::SideInfoThirdParty => {
                self.links.coupler.side_info(frame).await;
            }

            PacketKind::ThirdPartySensor => {
                self.links.coupler.tag(frame).await;
            }

            PacketKind::Pixel => {
                if let Some(log) = &self.links.payload_log {
                    log.record(frame.source_id, frame.payload_hex()).await;
                }
                self.resolve(&frame, false).await;
                self.links.coupler.tag(frame).await;
            }
        }
    }

    async fn reresolve(&mut self, source_id: Uuid) {
        match self.tracker.last_frame(&source_id).cloned() {
            Some(frame) => self.resolve(&frame, true).await,
            None => debug!("No frame seen from {}, nothing to re-resolve", source_id),
        }
    }

    async fn resolve(&mut self, frame: &DecodedFrame, reresolve: bool) {
        match self.tracker.on_pixel(frame, reresolve) {
            ResolveDecision::Skip => {}
            ResolveDecision::UpdateRssi { external_id, rssi } => {
                let _ = self
                    .links
                    .events
                    .send(UpstreamEvent::PixelRssi { external_id, rssi })
                    .await;
            }
            ResolveDecision::Resolve => self.spawn_resolve(frame.clone()),
        }
    }

    fn spawn_resolve(&self, frame: DecodedFrame) {
        let location = *self.links.location.borrow();
        let packets = vec![PayloadContainer {
            payload: frame.payload_hex(),
            timestamp: frame.captured_at_ms,
        }];
        let suffix = frame.suffix_hex();
        let Some(request) =
            ResolveRequest::new(&self.links.gateway_id, location, packets, now_millis())
        else {
            return;
        };

        debug!("Resolving payload from {}", frame.source_id);
        let resolver = self.resolver.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(request).await;
            let _ = completion_tx.send(ResolveCompletion {
                frame,
                suffix,
                result,
            });
        });
    }

    async fn on_completion(&mut self, completion: ResolveCompletion) {
        let ResolveCompletion {
            frame,
            suffix,
            result,
        } = completion;
        let source_id = frame.source_id;
        let updates = self
            .tracker
            .on_resolved(source_id, suffix.as_deref(), &frame, &result);

        match result {
            Ok(identity) => {
                info!("Resolved {} to {}", source_id, identity.external_id);
                if let Some(pacing) = &self.links.pacing {
                    pacing
                        .map_external_ids(HashMap::from([(identity.external_id.clone(), source_id)]))
                        .await;
                }
                let _ = self
                    .links
                    .events
                    .send(UpstreamEvent::IdentityResolved {
                        source_id,
                        identity,
                    })
                    .await;
                for (external_id, rssi) in updates {
                    let _ = self
                        .links
                        .events
                        .send(UpstreamEvent::PixelRssi { external_id, rssi })
                        .await;
                }
            }
            Err(ResolveError::ResolveDenied) => {
                warn!(
                    "Resolve denied for {}, payload {}",
                    source_id,
                    frame.payload_hex()
                );
            }
            Err(e) => warn!("Resolve failed for {}: {}", source_id, e),
        }
    }
}

pub fn spawn_router<R: Resolver>(
    links: RouterLinks,
    resolver: Arc<R>,
) -> (RouterHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let task = tokio::spawn(run_router_actor(links, resolver, rx));
    (RouterHandle::new(tx), task)
}

/// Run the router actor
pub async fn run_router_actor<R: Resolver>(
    links: RouterLinks,
    resolver: Arc<R>,
    mut cmd_rx: mpsc::Receiver<RouterCommand>,
) {
    let (completion_tx, mut completion_rx) = mpsc::unbounded_channel();
    let mut router = Router {
        links,
        resolver,
        tracker: ResolveTracker::new(),
        completion_tx,
    };
    info!("Router actor started");

    loop {
        tokio::select! {
            Some(completion) = completion_rx.recv() => {
                router.on_completion(completion).await;
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    RouterCommand::Frame(frame) => router.route(frame).await,
                    RouterCommand::Reresolve(source_id) => router.reresolve(source_id).await,
                    RouterCommand::Shutdown => break,
                }
            }
        }
    }

    info!("Router actor stopped");
}
