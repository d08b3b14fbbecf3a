//! Gateway connection state machine and queued delivery
//!
//! The gateway owns the transport handle and the delivery queue. Batches are
//! stamped with sequence ids, wrapped in a data envelope and queued whether
//! or not the transport is connected; connectivity is checked only when a
//! delivery tick takes a message off the queue.
//!
//! # States
//!
//! ```text
//! Idle --prepare--> Preparing --start--> Connecting --connected--> Connected
//! Connected --stop / connection type change--> Disconnecting --disconnected--> Idle
//! any --terminal transport error--> Failed(reason) --start--> Connecting
//! ```
//!
//! A token change while connected disconnects and restarts with the new
//! token once the transport confirms the disconnect. Transport events are
//! tagged with the connection generation they belong to, and events from a
//! replaced connection are ignored.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::UpstreamConfig;
use crate::envelope::{encode, CapabilitiesMessage, DataEnvelope, Location, Topics, GATEWAY_TYPE};
use crate::error::UpstreamError;
use crate::events::UpstreamEvent;
use crate::record::TagPacket;
use crate::state::{now_millis, ConnectionState, PreferredConnectionType, UpstreamStatus};
use crate::transport::{
    ConnectParams, TransportConnector, TransportEvent, TransportEvents, TransportHandle,
};

/// Commands sent to the gateway actor
#[derive(Debug)]
pub enum GatewayCommand {
    /// Store the connection token ahead of `Start`
    Prepare { token: String },
    Start {
        response: oneshot::Sender<Result<(), UpstreamError>>,
    },
    Stop,
    SetAuthToken {
        token: String,
        response: oneshot::Sender<Result<(), UpstreamError>>,
    },
    SetPreferredConnectionType(PreferredConnectionType),
    /// Stamp, encode and queue a batch on the data topic
    SendBatch { records: Vec<TagPacket> },
    /// Publish an already encoded message on the status topic right away
    ///
    /// Bypasses the delivery queue; dropped when not connected.
    PublishStatus { message: String },
    QueryState {
        response: oneshot::Sender<ConnectionState>,
    },
    Shutdown,
}

/// Cloneable handle to a running gateway actor
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<GatewayCommand>,
}

impl GatewayHandle {
    pub fn new(tx: mpsc::Sender<GatewayCommand>) -> Self {
        Self { tx }
    }

    pub async fn prepare(&self, token: impl Into<String>) -> Result<(), UpstreamError> {
        self.tx
            .send(GatewayCommand::Prepare {
                token: token.into(),
            })
            .await
            .map_err(|_| UpstreamError::ChannelClosed("gateway"))
    }

    pub async fn start(&self) -> Result<(), UpstreamError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::Start { response })
            .await
            .map_err(|_| UpstreamError::ChannelClosed("gateway"))?;
        rx.await.map_err(|_| UpstreamError::ChannelClosed("gateway"))?
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(GatewayCommand::Stop).await;
    }

    pub async fn set_auth_token(&self, token: impl Into<String>) -> Result<(), UpstreamError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::SetAuthToken {
                token: token.into(),
                response,
            })
            .await
            .map_err(|_| UpstreamError::ChannelClosed("gateway"))?;
        rx.await.map_err(|_| UpstreamError::ChannelClosed("gateway"))?
    }

    pub async fn set_preferred_connection_type(&self, connection_type: PreferredConnectionType) {
        let _ = self
            .tx
            .send(GatewayCommand::SetPreferredConnectionType(connection_type))
            .await;
    }

    pub async fn send_batch(&self, records: Vec<TagPacket>) {
        let _ = self.tx.send(GatewayCommand::SendBatch { records }).await;
    }

    pub async fn publish_status(&self, message: String) {
        let _ = self.tx.send(GatewayCommand::PublishStatus { message }).await;
    }

    pub async fn state(&self) -> Result<ConnectionState, UpstreamError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(GatewayCommand::QueryState { response })
            .await
            .map_err(|_| UpstreamError::ChannelClosed("gateway"))?;
        rx.await.map_err(|_| UpstreamError::ChannelClosed("gateway"))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(GatewayCommand::Shutdown).await;
    }
}

#[derive(Debug)]
struct QueuedMessage {
    topic: String,
    message: String,
}

/// Gateway state owned by the actor task
pub struct Gateway<C: TransportConnector> {
    config: UpstreamConfig,
    topics: Topics,
    connector: C,
    handle: Option<C::Handle>,
    generation: u64,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    state: ConnectionState,
    token: Option<String>,
    restart_pending: bool,
    preferred_connection_type: PreferredConnectionType,
    queue: VecDeque<QueuedMessage>,
    delivery: Option<Interval>,
    delivery_paused: bool,
    last_sequence_id: i64,
    location: watch::Receiver<Option<Location>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
}

impl<C: TransportConnector> Gateway<C> {
    /// Create a gateway and the receiver its transports report into
    pub fn new(
        config: UpstreamConfig,
        connector: C,
        location: watch::Receiver<Option<Location>>,
        event_tx: mpsc::Sender<UpstreamEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let topics = Topics::new(&config.account_id, &config.gateway_id);
        let gateway = Self {
            config,
            topics,
            connector,
            handle: None,
            generation: 0,
            transport_tx,
            state: ConnectionState::Idle,
            token: None,
            restart_pending: false,
            preferred_connection_type: PreferredConnectionType::None,
            queue: VecDeque::new(),
            delivery: None,
            delivery_paused: false,
            last_sequence_id: 0,
            location,
            event_tx,
        };
        (gateway, transport_rx)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("Gateway state: {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        let status = UpstreamStatus::from(&state);
        let _ = self
            .event_tx
            .send(UpstreamEvent::ConnectionStateChanged(state))
            .await;
        let _ = self.event_tx.send(UpstreamEvent::StatusChanged(status)).await;
    }

    async fn report_error(&self, message: String) {
        let _ = self
            .event_tx
            .send(UpstreamEvent::Error {
                source: "Gateway".to_string(),
                message,
            })
            .await;
    }

    async fn prepare(&mut self, token: String) {
        self.token = Some(token);
        if matches!(self.state, ConnectionState::Idle | ConnectionState::Failed(_)) {
            self.set_state(ConnectionState::Preparing).await;
        }
    }

    async fn start(&mut self) -> Result<(), UpstreamError> {
        let token = match &self.token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => return Err(UpstreamError::MissingToken),
        };
        if self.state.is_active() {
            return Err(if self.state.is_connected() {
                UpstreamError::AlreadyConnected
            } else {
                UpstreamError::AlreadyConnecting
            });
        }

        self.queue.clear();
        if let Some(mut old) = self.handle.take() {
            debug!("Closing previous transport before reconnecting");
            old.disconnect();
            tokio::time::sleep(self.config.restart_grace()).await;
        }

        self.generation += 1;
        let params = ConnectParams {
            client_id: self.config.gateway_id.clone(),
            username: self.config.account_id.clone(),
            token,
            host: self.config.endpoint.host.clone(),
            port: self.config.endpoint.port,
        };
        let events = TransportEvents::new(self.generation, self.transport_tx.clone());

        self.set_state(ConnectionState::Connecting).await;
        match self.connector.connect(params, events) {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!("Transport connect failed: {}", e);
                self.set_state(ConnectionState::Failed(e.to_string())).await;
                Err(e.into())
            }
        }
    }

    async fn stop(&mut self) {
        if self.restart_pending {
            self.delivery_paused = true;
        } else {
            self.delivery = None;
        }
        self.queue.clear();

        if self.handle.is_some() {
            self.set_state(ConnectionState::Disconnecting).await;
            if let Some(handle) = self.handle.as_mut() {
                handle.disconnect();
            }
        } else {
            self.restart_pending = false;
            self.delivery_paused = false;
            self.set_state(ConnectionState::Idle).await;
        }
    }

    async fn set_auth_token(&mut self, token: String) -> Result<(), UpstreamError> {
        if token.is_empty() {
            return Err(UpstreamError::MissingToken);
        }
        self.token = Some(token);
        if self.state.is_connected() {
            info!("Connection token changed, restarting connection");
            self.restart_pending = true;
            self.stop().await;
            Ok(())
        } else {
            self.start().await
        }
    }

    async fn set_preferred_connection_type(&mut self, connection_type: PreferredConnectionType) {
        if connection_type == self.preferred_connection_type {
            return;
        }
        info!(
            "Preferred connection type: {:?} -> {:?}",
            self.preferred_connection_type, connection_type
        );
        self.preferred_connection_type = connection_type;
        if self.state.is_connected() {
            self.stop().await;
        }
    }

    fn next_sequence_id(&mut self) -> i64 {
        if self.last_sequence_id == i64::MAX {
            self.last_sequence_id = 0;
        }
        self.last_sequence_id += 1;
        self.last_sequence_id
    }

    fn push_queue(&mut self, topic: String, message: String) {
        if self.queue.len() >= self.config.max_queued_messages {
            if let Some(dropped) = self.queue.pop_front() {
                warn!("Delivery queue full, dropping oldest message on {}", dropped.topic);
            }
        }
        self.queue.push_back(QueuedMessage { topic, message });
    }

    async fn enqueue_batch(&mut self, mut records: Vec<TagPacket>) {
        if records.is_empty() {
            return;
        }
        let mut first_sequence_id = 0;
        for (i, record) in records.iter_mut().enumerate() {
            let id = self.next_sequence_id();
            if i == 0 {
                first_sequence_id = id;
            }
            record.sequence_id = Some(id);
        }

        let location = *self.location.borrow();
        let envelope = DataEnvelope {
            gateway_id: &self.config.gateway_id,
            gateway_type: GATEWAY_TYPE,
            timestamp: now_millis(),
            location,
            packets: &records,
        };
        match encode(&envelope) {
            Ok(message) => {
                let topic = self.topics.data.clone();
                self.push_queue(topic, message);
                debug!(
                    "Queued batch of {} records (first sequence id {})",
                    records.len(),
                    first_sequence_id
                );
                let _ = self
                    .event_tx
                    .send(UpstreamEvent::BatchQueued {
                        records: records.len(),
                        first_sequence_id,
                    })
                    .await;
            }
            Err(e) => {
                error!("Failed to encode data envelope: {}", e);
                self.report_error(e.to_string()).await;
            }
        }
    }

    async fn publish_status(&mut self, message: String) {
        if !self.is_live() {
            debug!("Not connected, dropping status message");
            return;
        }
        let topic = self.topics.status.clone();
        self.publish(topic, message).await;
    }

    async fn enqueue_capabilities(&mut self) {
        let capabilities =
            CapabilitiesMessage::new(&self.config.app_version, self.config.pacing_interval_secs);
        match encode(&capabilities) {
            Ok(message) => {
                let topic = self.topics.status.clone();
                self.push_queue(topic, message);
            }
            Err(e) => error!("Failed to encode capabilities: {}", e),
        }
    }

    fn start_delivery(&mut self) {
        self.delivery_paused = false;
        if self.delivery.is_none() {
            let period = self.config.delivery_period();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            self.delivery = Some(ticker);
        }
    }

    fn is_live(&self) -> bool {
        self.state.is_connected() && self.handle.as_ref().is_some_and(|h| h.is_connected())
    }

    async fn publish(&mut self, topic: String, message: String) {
        let result = match self.handle.as_mut() {
            Some(handle) => handle.publish(&topic, &message),
            None => return,
        };
        match result {
            Ok(()) => {
                let _ = self
                    .event_tx
                    .send(UpstreamEvent::MessagePublished { topic })
                    .await;
            }
            Err(e) => {
                warn!("Publish on {} failed: {}", topic, e);
                self.report_error(format!("publish failed: {e}")).await;
            }
        }
    }

    /// Take one message off the queue and publish it if connected
    async fn deliver_next(&mut self) {
        let Some(queued) = self.queue.pop_front() else {
            return;
        };
        if !self.is_live() {
            debug!("Not connected, dropping queued message on {}", queued.topic);
            return;
        }
        self.publish(queued.topic, queued.message).await;
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            debug!("Ignoring {:?} from replaced connection", event);
            return;
        }

        match event {
            TransportEvent::Connecting => self.set_state(ConnectionState::Connecting).await,

            TransportEvent::Connected => {
                self.set_state(ConnectionState::Connected).await;
                self.enqueue_capabilities().await;
                self.start_delivery();
            }

            TransportEvent::Disconnected => {
                self.handle = None;
                if self.restart_pending {
                    self.restart_pending = false;
                    if let Err(e) = self.start().await {
                        error!("Restart after token change failed: {}", e);
                        self.report_error(format!("restart failed: {e}")).await;
                    }
                } else {
                    self.delivery = None;
                    self.delivery_paused = false;
                    self.set_state(ConnectionState::Idle).await;
                }
            }

            TransportEvent::DisconnectedWithError {
                reason,
                will_reconnect,
            } => {
                if will_reconnect {
                    warn!("Transport error, reconnecting: {}", reason);
                    self.set_state(ConnectionState::Connecting).await;
                } else {
                    error!("Transport failed: {}", reason);
                    if let Some(mut handle) = self.handle.take() {
                        handle.disconnect();
                    }
                    // Late events from the torn-down connection are stale
                    self.generation += 1;
                    self.restart_pending = false;
                    self.delivery = None;
                    self.delivery_paused = false;
                    self.set_state(ConnectionState::Failed(reason)).await;
                }
            }

            TransportEvent::PublishAcked { topic } => debug!("Publish acknowledged on {}", topic),
        }
    }
}

async fn next_delivery_tick(delivery: &mut Option<Interval>) {
    match delivery {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Spawn a gateway actor for `connector`
pub fn spawn_gateway<C: TransportConnector>(
    config: UpstreamConfig,
    connector: C,
    location: watch::Receiver<Option<Location>>,
    event_tx: mpsc::Sender<UpstreamEvent>,
) -> GatewayHandle {
    let (tx, rx) = mpsc::channel(256);
    let (gateway, transport_rx) = Gateway::new(config, connector, location, event_tx);
    tokio::spawn(run_gateway_actor(gateway, rx, transport_rx));
    GatewayHandle::new(tx)
}

/// Run the gateway actor
///
/// Transport events are handled before commands so that a state query sent
/// after a command observes every transition that command caused.
pub async fn run_gateway_actor<C: TransportConnector>(
    mut gateway: Gateway<C>,
    mut cmd_rx: mpsc::Receiver<GatewayCommand>,
    mut transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
) {
    info!("Gateway actor started for {}", gateway.config.gateway_id);

    loop {
        tokio::select! {
            biased;

            Some((generation, event)) = transport_rx.recv() => {
                gateway.on_transport_event(generation, event).await;
            }

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break; };
                match cmd {
                    GatewayCommand::Prepare { token } => gateway.prepare(token).await,
                    GatewayCommand::Start { response } => {
                        let _ = response.send(gateway.start().await);
                    }
                    GatewayCommand::Stop => {
                        gateway.restart_pending = false;
                        gateway.stop().await;
                    }
                    GatewayCommand::SetAuthToken { token, response } => {
                        let _ = response.send(gateway.set_auth_token(token).await);
                    }
                    GatewayCommand::SetPreferredConnectionType(connection_type) => {
                        gateway.set_preferred_connection_type(connection_type).await;
                    }
                    GatewayCommand::SendBatch { records } => gateway.enqueue_batch(records).await,
                    GatewayCommand::PublishStatus { message } => {
                        gateway.publish_status(message).await;
                    }
                    GatewayCommand::QueryState { response } => {
                        let _ = response.send(gateway.state.clone());
                    }
                    GatewayCommand::Shutdown => break,
                }
            }

            _ = next_delivery_tick(&mut gateway.delivery) => {
                if !gateway.delivery_paused {
                    gateway.deliver_next().await;
                }
            }
        }
    }

    if let Some(mut handle) = gateway.handle.take() {
        handle.disconnect();
    }
    info!("Gateway actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::record::RecordKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Broker {
        connects: Vec<ConnectParams>,
        published: Vec<(String, String)>,
        sinks: Vec<TransportEvents>,
        connected: bool,
    }

    struct MockConnector {
        broker: Arc<Mutex<Broker>>,
        accepted_token: Option<String>,
    }

    struct MockHandle {
        broker: Arc<Mutex<Broker>>,
        events: TransportEvents,
    }

    impl TransportConnector for MockConnector {
        type Handle = MockHandle;

        fn connect(
            &mut self,
            params: ConnectParams,
            events: TransportEvents,
        ) -> Result<MockHandle, TransportError> {
            let accepted = self
                .accepted_token
                .as_ref()
                .map_or(true, |t| *t == params.token);
            let mut broker = self.broker.lock().unwrap();
            broker.connects.push(params);
            broker.sinks.push(events.clone());
            events.emit(TransportEvent::Connecting);
            if accepted {
                broker.connected = true;
                events.emit(TransportEvent::Connected);
            } else {
                events.emit(TransportEvent::DisconnectedWithError {
                    reason: "invalid credentials".into(),
                    will_reconnect: false,
                });
            }
            Ok(MockHandle {
                broker: self.broker.clone(),
                events,
            })
        }
    }

    impl TransportHandle for MockHandle {
        fn publish(&mut self, topic: &str, message: &str) -> Result<(), TransportError> {
            let mut broker = self.broker.lock().unwrap();
            if !broker.connected {
                return Err(TransportError::NotConnected);
            }
            broker.published.push((topic.to_string(), message.to_string()));
            Ok(())
        }

        fn disconnect(&mut self) {
            self.broker.lock().unwrap().connected = false;
            self.events.emit(TransportEvent::Disconnected);
        }

        fn is_connected(&self) -> bool {
            self.broker.lock().unwrap().connected
        }
    }

    struct Harness {
        gateway: GatewayHandle,
        broker: Arc<Mutex<Broker>>,
        _events: mpsc::Receiver<UpstreamEvent>,
        _location: watch::Sender<Option<Location>>,
    }

    fn harness(accepted_token: Option<&str>, configure: impl FnOnce(&mut UpstreamConfig)) -> Harness {
        let broker = Arc::new(Mutex::new(Broker::default()));
        let connector = MockConnector {
            broker: broker.clone(),
            accepted_token: accepted_token.map(str::to_string),
        };
        let mut config = UpstreamConfig::new("owner", "gw-1");
        configure(&mut config);
        let (event_tx, events) = mpsc::channel(1024);
        let (location_tx, location_rx) = watch::channel(None);
        let gateway = spawn_gateway(config, connector, location_rx, event_tx);
        Harness {
            gateway,
            broker,
            _events: events,
            _location: location_tx,
        }
    }

    fn records(n: usize) -> Vec<TagPacket> {
        (0..n)
            .map(|i| {
                TagPacket::new(
                    format!("AABBCCDD{i:02X}"),
                    i as f64,
                    RecordKind::Paced { rssi: -60, nfpkt: None },
                )
            })
            .collect()
    }

    fn published_on(broker: &Arc<Mutex<Broker>>, prefix: &str) -> Vec<serde_json::Value> {
        broker
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(topic, _)| topic.starts_with(prefix))
            .map(|(_, message)| serde_json::from_str(message).unwrap())
            .collect()
    }

    async fn wait(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_token_fails() {
        let h = harness(None, |_| {});
        let result = h.gateway.start().await;
        assert!(matches!(result, Err(UpstreamError::MissingToken)));
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Idle);
        assert!(h.broker.lock().unwrap().connects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_announces_capabilities() {
        let h = harness(None, |_| {});
        h.gateway.prepare("token-1").await.unwrap();
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Preparing);

        h.gateway.start().await.unwrap();
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connected);
        assert!(matches!(
            h.gateway.start().await,
            Err(UpstreamError::AlreadyConnected)
        ));

        {
            let broker = h.broker.lock().unwrap();
            let params = &broker.connects[0];
            assert_eq!(params.client_id, "gw-1");
            assert_eq!(params.username, "owner");
            assert_eq!(params.token, "token-1");
            assert_eq!(params.port, 8883);
        }

        wait(1100).await;
        let status = published_on(&h.broker, "status/owner/gw-1");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0]["tagMetadataCouplingSupported"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_ids_span_batches() {
        let h = harness(None, |_| {});
        h.gateway.prepare("token").await.unwrap();
        h.gateway.start().await.unwrap();

        h.gateway.send_batch(records(2)).await;
        h.gateway.send_batch(records(0)).await;
        h.gateway.send_batch(records(3)).await;

        // Capabilities plus two data messages, one per tick
        wait(3500).await;
        let data = published_on(&h.broker, "data/owner/gw-1");
        assert_eq!(data.len(), 2);

        let ids: Vec<Vec<i64>> = data
            .iter()
            .map(|envelope| {
                envelope["packets"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|p| p["sequenceId"].as_i64().unwrap())
                    .collect()
            })
            .collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4, 5]]);
        assert_eq!(data[0]["gatewayId"], "gw-1");
        assert_eq!(data[0]["gatewayType"], "mobile");
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_then_new_token_recovers() {
        let h = harness(Some("good"), |_| {});
        h.gateway.prepare("bad").await.unwrap();
        h.gateway.start().await.unwrap();
        assert_eq!(
            h.gateway.state().await.unwrap(),
            ConnectionState::Failed("invalid credentials".into())
        );

        h.gateway.set_auth_token("good").await.unwrap();
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connected);
        assert_eq!(h.broker.lock().unwrap().connects.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_change_while_connected_restarts() {
        let h = harness(None, |_| {});
        h.gateway.prepare("first").await.unwrap();
        h.gateway.start().await.unwrap();
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connected);

        h.gateway.set_auth_token("second").await.unwrap();
        wait(600).await;
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connected);

        let broker = h.broker.lock().unwrap();
        let tokens: Vec<&str> = broker.connects.iter().map(|p| p.token.as_str()).collect();
        assert_eq!(tokens, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_error_keeps_connecting_and_drops_deliveries() {
        let h = harness(None, |_| {});
        h.gateway.prepare("token").await.unwrap();
        h.gateway.start().await.unwrap();

        let sink = h.broker.lock().unwrap().sinks[0].clone();
        h.broker.lock().unwrap().connected = false;
        sink.emit(TransportEvent::DisconnectedWithError {
            reason: "network lost".into(),
            will_reconnect: true,
        });
        h.gateway.send_batch(records(1)).await;
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connecting);

        wait(2500).await;
        assert!(h.broker.lock().unwrap().published.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_events_are_ignored() {
        let h = harness(None, |_| {});
        h.gateway.prepare("first").await.unwrap();
        h.gateway.start().await.unwrap();
        h.gateway.set_auth_token("second").await.unwrap();
        wait(600).await;

        let old_sink = h.broker.lock().unwrap().sinks[0].clone();
        old_sink.emit(TransportEvent::DisconnectedWithError {
            reason: "old connection".into(),
            will_reconnect: false,
        });
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_connection_type_change() {
        let h = harness(None, |_| {});
        h.gateway.prepare("token").await.unwrap();
        h.gateway.start().await.unwrap();

        h.gateway
            .set_preferred_connection_type(PreferredConnectionType::Cellular)
            .await;
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Idle);

        h.gateway.start().await.unwrap();
        h.gateway.stop().await;
        assert_eq!(h.gateway.state().await.unwrap(), ConnectionState::Idle);
        assert_eq!(h.broker.lock().unwrap().connects.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drops_oldest_past_bound() {
        let h = harness(None, |config| config.max_queued_messages = 2);
        h.gateway.prepare("token").await.unwrap();
        h.gateway.start().await.unwrap();

        // Capabilities and the first batch are pushed out by later batches
        h.gateway.send_batch(records(1)).await;
        h.gateway.send_batch(records(1)).await;
        h.gateway.send_batch(records(1)).await;

        wait(5500).await;
        assert!(published_on(&h.broker, "status/").is_empty());
        let data = published_on(&h.broker, "data/");
        let ids: Vec<i64> = data
            .iter()
            .map(|e| e["packets"][0]["sequenceId"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_messages_bypass_delivery_queue() {
        let h = harness(None, |config| config.max_queued_messages = 3);
        h.gateway.prepare("token").await.unwrap();
        h.gateway.start().await.unwrap();

        h.gateway.send_batch(records(1)).await;
        for i in 0..5 {
            h.gateway.publish_status(format!("{{\"log\":{i}}}")).await;
        }
        h.gateway.send_batch(records(1)).await;

        // Logs are out before the first delivery tick
        h.gateway.state().await.unwrap();
        assert_eq!(published_on(&h.broker, "status/").len(), 5);
        assert!(published_on(&h.broker, "data/").is_empty());

        // Capabilities plus both batches still fit the queue
        wait(3500).await;
        assert_eq!(published_on(&h.broker, "status/").len(), 6);
        let ids: Vec<i64> = published_on(&h.broker, "data/")
            .iter()
            .map(|e| e["packets"][0]["sequenceId"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);

        h.gateway.stop().await;
        h.gateway.publish_status("{}".to_string()).await;
        h.gateway.state().await.unwrap();
        assert_eq!(published_on(&h.broker, "status/").len(), 6);
    }

    #[test]
    fn test_actor_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let connector = MockConnector {
            broker: Arc::new(Mutex::new(Broker::default())),
            accepted_token: None,
        };
        let (event_tx, _events) = mpsc::channel(8);
        let (_location_tx, location_rx) = watch::channel(None);
        let (gateway, transport_rx) =
            Gateway::new(UpstreamConfig::new("o", "g"), connector, location_rx, event_tx);
        let (_cmd_tx, cmd_rx) = mpsc::channel(1);
        let actor = run_gateway_actor(gateway, cmd_rx, transport_rx);
        assert_send(&actor);
    }

    #[test]
    fn test_sequence_wraps_past_max() {
        let broker = Arc::new(Mutex::new(Broker::default()));
        let connector = MockConnector {
            broker,
            accepted_token: None,
        };
        let (event_tx, _events) = mpsc::channel(8);
        let (_location_tx, location_rx) = watch::channel(None);
        let (mut gateway, _transport_rx) =
            Gateway::new(UpstreamConfig::new("o", "g"), connector, location_rx, event_tx);

        gateway.last_sequence_id = i64::MAX - 1;
        assert_eq!(gateway.next_sequence_id(), i64::MAX);
        assert_eq!(gateway.next_sequence_id(), 1);
        assert_eq!(gateway.queued(), 0);
    }
}
