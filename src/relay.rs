//! Process-wide relay state shared by every connection.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    event::Event,
    message::RelayMessage,
    registry::{ConnectionId, Registry},
    service::Services,
    session::Session,
};

/// Capacity of each connection's outbound frame queue.
pub const WRITER_CAPACITY: usize = 256;

/// Default capacity of a subscription outbox.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("kind {0} is outside the job-request range")]
    KindOutOfRange(u32),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is no longer writable")]
    WriterClosed(ConnectionId),
}

/// Tunables for a [`Relay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Events buffered per subscription before new ones are dropped.
    pub outbox_capacity: usize,
    /// Reject events whose id or signature do not verify.
    pub verify_sig: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            verify_sig: false,
        }
    }
}

/// Owns the subscription registry, the job handlers, and the outbound queue
/// of every live connection.
pub struct Relay {
    registry: Registry,
    services: Services,
    verify_sig: bool,
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<RelayMessage>>>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(config: RelayConfig, services: Services) -> Self {
        Self {
            registry: Registry::new(config.outbox_capacity),
            services,
            verify_sig: config.verify_sig,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a session for a new connection. The returned receiver yields every
    /// frame the session wants written to the transport.
    pub fn connect(self: &Arc<Self>) -> (Session, mpsc::Receiver<RelayMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WRITER_CAPACITY);
        self.connections.write().insert(id, tx.clone());
        debug!(conn = id, "connection opened");
        (Session::new(id, Arc::clone(self), tx), rx)
    }

    /// Queue `event` as a direct `EVENT` reply on connection `conn` without
    /// waiting. Returns `Ok(false)` when the connection's queue is full or its
    /// writer has gone away.
    pub fn respond(&self, conn: ConnectionId, event: Event) -> Result<bool, RelayError> {
        let connections = self.connections.read();
        let writer = connections
            .get(&conn)
            .ok_or(RelayError::UnknownConnection(conn))?;
        Ok(writer
            .try_send(RelayMessage::Event {
                subscription_id: None,
                event: Arc::new(event),
            })
            .is_ok())
    }

    pub(crate) fn disconnect(&self, conn: ConnectionId) {
        self.connections.write().remove(&conn);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn verify_sig(&self) -> bool {
        self.verify_sig
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}
