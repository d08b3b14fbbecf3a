//! Upstream service
//!
//! Owns the gateway for the lifetime of the service and spins the frame
//! pipeline (coupler, pacing, batcher, payload log, router and the frame
//! pump) up and down around it.

use std::sync::Arc;

use beacon_protocol::DecodedFrame;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batcher::{spawn_batcher, Batcher, BatcherHandle};
use crate::config::UpstreamConfig;
use crate::coupler::{spawn_coupler, CouplerHandle};
use crate::envelope::Location;
use crate::error::UpstreamError;
use crate::events::UpstreamEvent;
use crate::gateway::{spawn_gateway, GatewayHandle};
use crate::pacing::{spawn_pacing, PacingHandle, PacingTiming};
use crate::payload_log::{spawn_payload_log, PayloadLogHandle, PayloadLogSink};
use crate::resolver::Resolver;
use crate::router::{spawn_router, RouterHandle, RouterLinks};
use crate::state::{ConnectionState, PreferredConnectionType};
use crate::transport::TransportConnector;

/// Actors that exist only while the service is listening
struct Pipeline {
    router: RouterHandle,
    batcher: BatcherHandle,
    coupler: CouplerHandle,
    pacing: Option<PacingHandle>,
    payload_log: PayloadLogHandle,
    pump: JoinHandle<()>,
    /// Actor tasks in shutdown order
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Stop every actor and wait for it to exit
    ///
    /// Once this returns no actor can reach the gateway.
    async fn shutdown(mut self) {
        self.pump.abort();
        let _ = (&mut self.pump).await;

        self.router.shutdown().await;
        self.batcher.shutdown().await;
        self.coupler.shutdown().await;
        if let Some(pacing) = &self.pacing {
            pacing.shutdown().await;
        }
        self.payload_log.shutdown().await;

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("{} actor ended abnormally: {}", name, e);
            }
        }
    }
}

/// Frame intake to cloud delivery
///
/// Must be created inside a Tokio runtime; the gateway actor is spawned
/// immediately.
pub struct UpstreamService<R: Resolver> {
    config: UpstreamConfig,
    resolver: Arc<R>,
    events: mpsc::Sender<UpstreamEvent>,
    location_tx: watch::Sender<Option<Location>>,
    gateway: GatewayHandle,
    pipeline: Option<Pipeline>,
    payload_logging_enabled: bool,
}

impl<R: Resolver> UpstreamService<R> {
    pub fn new<C: TransportConnector>(
        config: UpstreamConfig,
        connector: C,
        resolver: R,
        events: mpsc::Sender<UpstreamEvent>,
    ) -> Result<Self, UpstreamError> {
        config.validate()?;
        let (location_tx, location_rx) = watch::channel(None);
        let gateway = spawn_gateway(config.clone(), connector, location_rx, events.clone());
        let payload_logging_enabled = config.payload_logging_enabled;
        Ok(Self {
            config,
            resolver: Arc::new(resolver),
            events,
            location_tx,
            gateway,
            pipeline: None,
            payload_logging_enabled,
        })
    }

    pub fn gateway_id(&self) -> &str {
        &self.config.gateway_id
    }

    pub fn is_listening(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }

    /// Store the connection token to use on `start`
    pub async fn prepare(&self, token: impl Into<String>) -> Result<(), UpstreamError> {
        self.gateway.prepare(token).await
    }

    /// Connect upstream and begin consuming `frames`
    pub async fn start(
        &mut self,
        frames: mpsc::Receiver<DecodedFrame>,
    ) -> Result<(), UpstreamError> {
        if self.pipeline.is_some() {
            return Err(UpstreamError::AlreadyStarted);
        }
        // A token set ahead of start may already have connected the gateway
        match self.gateway.start().await {
            Ok(()) => {}
            Err(UpstreamError::AlreadyConnecting | UpstreamError::AlreadyConnected) => {
                debug!("Gateway already connecting, starting frame intake only");
            }
            Err(e) => return Err(e),
        }

        let (coupler, coupler_task) =
            spawn_coupler(self.config.coupling_lifetime_ms, self.config.flush_timeout());
        let (pacing, pacing_task) = if self.config.pacing_enabled {
            let (handle, task) = spawn_pacing(
                PacingTiming {
                    window: self.config.pacing_period(),
                    staleness: self.config.staleness(),
                },
                self.gateway.clone(),
            );
            (Some(handle), Some(task))
        } else {
            (None, None)
        };
        let (batcher, batcher_task) = spawn_batcher(
            Batcher::new(coupler.clone(), pacing.clone(), self.gateway.clone()),
            self.config.publish_period(),
        );
        let (payload_log, payload_log_task) = spawn_payload_log(
            PayloadLogSink {
                gateway_id: self.config.gateway_id.clone(),
                location: self.location_tx.subscribe(),
                gateway: self.gateway.clone(),
            },
            self.config.payload_log_period(),
            self.payload_logging_enabled,
        );
        let (router, router_task) = spawn_router(
            RouterLinks {
                gateway_id: self.config.gateway_id.clone(),
                coupler: coupler.clone(),
                batcher: batcher.clone(),
                pacing: pacing.clone(),
                payload_log: Some(payload_log.clone()),
                location: self.location_tx.subscribe(),
                events: self.events.clone(),
            },
            self.resolver.clone(),
        );
        let pump = tokio::spawn(pump_frames(frames, router.clone()));

        let mut tasks = vec![
            ("Router", router_task),
            ("Batcher", batcher_task),
            ("Coupler", coupler_task),
        ];
        if let Some(task) = pacing_task {
            tasks.push(("Pacing", task));
        }
        tasks.push(("Payload log", payload_log_task));

        self.pipeline = Some(Pipeline {
            router,
            batcher,
            coupler,
            pacing,
            payload_log,
            pump,
            tasks,
        });
        info!("Upstream service listening");
        let _ = self.events.send(UpstreamEvent::ListeningChanged(true)).await;
        Ok(())
    }

    /// Stop frame intake and disconnect
    ///
    /// Status reaches `Inactive` once the transport confirms disconnection.
    pub async fn stop(&mut self) {
        let Some(pipeline) = self.pipeline.take() else {
            self.gateway.stop().await;
            return;
        };
        pipeline.shutdown().await;
        self.gateway.stop().await;
        info!("Upstream service stopped listening");
        let _ = self.events.send(UpstreamEvent::ListeningChanged(false)).await;
    }

    /// Replace the connection token, restarting the connection if needed
    pub async fn set_connection_token(
        &self,
        token: impl Into<String>,
    ) -> Result<(), UpstreamError> {
        self.gateway.set_auth_token(token).await
    }

    pub async fn set_preferred_connection_type(&self, connection_type: PreferredConnectionType) {
        self.gateway
            .set_preferred_connection_type(connection_type)
            .await;
    }

    pub async fn set_payload_logging_enabled(&mut self, enabled: bool) {
        self.payload_logging_enabled = enabled;
        if let Some(pipeline) = &self.pipeline {
            pipeline.payload_log.set_enabled(enabled).await;
        }
    }

    /// Location attached to every envelope from now on
    pub fn set_location(&self, location: Option<Location>) {
        self.location_tx.send_replace(location);
    }

    /// Resolve the latest frame from `source_id` again
    pub async fn reresolve(&self, source_id: Uuid) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.router.reresolve(source_id).await;
        }
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, UpstreamError> {
        self.gateway.state().await
    }

    /// Stop everything, including the gateway actor
    pub async fn shutdown(mut self) {
        self.stop().await;
        self.gateway.shutdown().await;
    }
}

async fn pump_frames(mut frames: mpsc::Receiver<DecodedFrame>, router: RouterHandle) {
    while let Some(frame) = frames.recv().await {
        router.route(frame).await;
    }
    debug!("Frame source closed");
}
