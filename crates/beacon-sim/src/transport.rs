//! Simulated publish/subscribe broker
//!
//! [`SimBroker`] is shared between a test and the [`SimTransport`] it hands
//! to the gateway. Connections complete immediately unless auto-connect is
//! turned off, and every accepted publish is recorded.

use std::sync::{Arc, Mutex, MutexGuard};

use beacon_upstream::{
    ConnectParams, TransportConnector, TransportError, TransportEvent, TransportEvents,
    TransportHandle,
};
use tracing::debug;

/// One message accepted by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub message: String,
}

#[derive(Debug)]
struct BrokerState {
    connects: Vec<ConnectParams>,
    sinks: Vec<TransportEvents>,
    published: Vec<PublishedMessage>,
    /// Index of the connection currently up
    active: Option<usize>,
    auto_connect: bool,
    accepted_token: Option<String>,
}

/// Shared view of the simulated broker
#[derive(Debug, Clone)]
pub struct SimBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                connects: Vec::new(),
                sinks: Vec::new(),
                published: Vec::new(),
                active: None,
                auto_connect: true,
                accepted_token: None,
            })),
        }
    }

    /// Reject connections whose token differs from `token`
    pub fn accept_only(self, token: impl Into<String>) -> Self {
        self.lock().accepted_token = Some(token.into());
        self
    }

    /// When off, connections stay pending until [`SimBroker::complete_connect`]
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.lock().auto_connect = auto_connect;
    }

    pub fn transport(&self) -> SimTransport {
        SimTransport {
            broker: self.clone(),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects.len()
    }

    pub fn connects(&self) -> Vec<ConnectParams> {
        self.lock().connects.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Messages whose topic starts with `prefix`, e.g. `"data/"`
    pub fn published_on(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Bring the most recent pending connection up
    pub fn complete_connect(&self) {
        let mut state = self.lock();
        let Some(index) = state.sinks.len().checked_sub(1) else {
            return;
        };
        state.active = Some(index);
        state.sinks[index].emit(TransportEvent::Connected);
    }

    /// Drop the live connection with an error
    pub fn drop_connection(&self, reason: &str, will_reconnect: bool) {
        let mut state = self.lock();
        let Some(index) = state.active.take() else {
            return;
        };
        debug!("Sim broker dropping connection {}: {}", index, reason);
        state.sinks[index].emit(TransportEvent::DisconnectedWithError {
            reason: reason.to_string(),
            will_reconnect,
        });
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Connector backed by a [`SimBroker`]
#[derive(Debug, Clone)]
pub struct SimTransport {
    broker: SimBroker,
}

impl TransportConnector for SimTransport {
    type Handle = SimConnection;

    fn connect(
        &mut self,
        params: ConnectParams,
        events: TransportEvents,
    ) -> Result<SimConnection, TransportError> {
        let mut state = self.broker.lock();
        let rejected = state
            .accepted_token
            .as_ref()
            .is_some_and(|accepted| *accepted != params.token);
        state.connects.push(params);
        if rejected {
            return Err(TransportError::InvalidCredentials);
        }

        let index = state.sinks.len();
        events.emit(TransportEvent::Connecting);
        if state.auto_connect {
            state.active = Some(index);
            events.emit(TransportEvent::Connected);
        }
        state.sinks.push(events);
        Ok(SimConnection {
            broker: self.broker.clone(),
            index,
        })
    }
}

/// One simulated connection
#[derive(Debug)]
pub struct SimConnection {
    broker: SimBroker,
    index: usize,
}

impl TransportHandle for SimConnection {
    fn publish(&mut self, topic: &str, message: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if state.active != Some(self.index) {
            return Err(TransportError::NotConnected);
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.broker.lock();
        if state.active == Some(self.index) {
            state.active = None;
        }
        state.sinks[self.index].emit(TransportEvent::Disconnected);
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().active == Some(self.index)
    }
}
