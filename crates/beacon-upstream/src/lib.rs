//! Beacon upstream engine
//!
//! This crate turns decoded Bluetooth advertisements into batched JSON
//! envelopes and delivers them to a cloud broker over a pluggable
//! publish/subscribe transport.
//!
//! # Architecture
//!
//! Every stateful component runs as its own Tokio task and is driven through
//! a cloneable handle:
//!
//! - **Router**: classifies frames, dispatches them and resolves pixel
//!   identities with at most one call in flight per source
//! - **Coupler**: glues tag frames to their side-info counterpart
//! - **Pacing**: keeps the latest record per source and re-emits it
//!   once per window with a replay count
//! - **Batcher**: gathers ready records and hands a batch to the gateway
//!   each publish tick
//! - **Gateway**: owns the connection state machine, stamps sequence ids
//!   and drains a FIFO delivery queue at a fixed interval
//!
//! All outward notifications arrive on one [`UpstreamEvent`] channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use beacon_upstream::{UpstreamConfig, UpstreamService};
//! # async fn run<C, R>(connector: C, resolver: R) -> Result<(), beacon_upstream::UpstreamError>
//! # where C: beacon_upstream::TransportConnector, R: beacon_upstream::Resolver {
//! let (events_tx, _events_rx) = tokio::sync::mpsc::channel(256);
//! let (_frames_tx, frames_rx) = tokio::sync::mpsc::channel(1024);
//!
//! let config = UpstreamConfig::new("account", "gateway-1");
//! let mut service = UpstreamService::new(config, connector, resolver, events_tx)?;
//! service.prepare("token").await?;
//! service.start(frames_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod batcher;
pub mod config;
pub mod coupler;
pub mod envelope;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pacing;
pub mod payload_log;
pub mod record;
pub mod resolver;
pub mod router;
pub mod service;
pub mod state;
pub mod transport;

pub use batcher::{spawn_batcher, Batcher, BatcherCommand, BatcherHandle};
pub use config::{Endpoint, UpstreamConfig};
pub use coupler::{spawn_coupler, Coupler, CouplerCommand, CouplerFlush, CouplerHandle};
pub use envelope::{
    encode, CapabilitiesMessage, DataEnvelope, Location, LogEnvelope, Topics, API_VERSION,
    GATEWAY_TYPE,
};
pub use error::{ResolveError, TransportError, UpstreamError};
pub use events::UpstreamEvent;
pub use gateway::{spawn_gateway, Gateway, GatewayCommand, GatewayHandle};
pub use pacing::{
    spawn_pacing, PacingCommand, PacingHandle, PacingStore, PacingTiming, UNKNOWN_EXTERNAL_ID,
};
pub use payload_log::{spawn_payload_log, PayloadLog, PayloadLogHandle, PayloadLogSink};
pub use record::{RecordKind, TagPacket};
pub use resolver::{
    AssetCategory, AssetTag, ClaimableAsset, PayloadContainer, ResolveRequest, ResolvedIdentity,
    Resolver,
};
pub use router::{spawn_router, ResolveDecision, ResolveTracker, RouterHandle, RouterLinks};
pub use service::UpstreamService;
pub use state::{
    now_millis, ConnectionState, CorrelationKey, PreferredConnectionType, UpstreamStatus,
};
pub use transport::{
    ConnectParams, TransportConnector, TransportEvent, TransportEvents, TransportHandle,
};
