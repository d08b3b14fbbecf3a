//! Publish/subscribe transport collaborator
//!
//! A transport library owns the wire protocol. The gateway opens a
//! connection through a [`TransportConnector`] and then observes the
//! connection only through [`TransportEvent`]s pushed into the
//! [`TransportEvents`] sink it handed over, so every state change is
//! processed on the gateway's own task.

use tokio::sync::mpsc;

use crate::error::TransportError;

/// Credentials and address of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub client_id: String,
    pub username: String,
    pub token: String,
    pub host: String,
    pub port: u16,
}

/// Connection notifications delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
    DisconnectedWithError {
        reason: String,
        /// The transport retries on its own and will report `Connected` again
        will_reconnect: bool,
    },
    /// The broker acknowledged a publish
    PublishAcked { topic: String },
}

/// Sink a transport uses to report on one connection
///
/// Each sink is bound to a connection generation. Events from a connection
/// the gateway has already replaced are discarded on arrival.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Report an event; returns false once the gateway is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// Live connection handle
///
/// The gateway actor holds its handle across awaits on a spawned task, so
/// handles must be shareable between threads.
pub trait TransportHandle: Send + Sync + 'static {
    /// Hand one message to the transport for delivery
    fn publish(&mut self, topic: &str, message: &str) -> Result<(), TransportError>;

    /// Request disconnection; completion arrives as [`TransportEvent::Disconnected`]
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
}

/// Opens transport connections
pub trait TransportConnector: Send + Sync + 'static {
    type Handle: TransportHandle;

    /// Begin connecting; progress arrives on `events`
    fn connect(
        &mut self,
        params: ConnectParams,
        events: TransportEvents,
    ) -> Result<Self::Handle, TransportError>;
}
