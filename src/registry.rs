//! Live subscription registry and broadcast fan-out.
//!
//! Subscriptions are keyed by connection and then by subscription id, so two
//! connections may reuse the same id without interfering. Each subscription
//! owns the sending half of a bounded outbox; dropping the entry closes the
//! outbox and ends the delivery loop reading from it.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::{event::Event, filter::Filter};

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Receiving half of a subscription's bounded delivery queue.
pub type Outbox = mpsc::Receiver<Arc<Event>>;

/// A client subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    /// Check if an event matches any filter in this subscription.
    pub fn matches(&self, event: &Event) -> bool {
        self.filters.iter().any(|f| f.matches(event))
    }
}

struct Entry {
    subscription: Subscription,
    outbox: mpsc::Sender<Arc<Event>>,
}

/// Process-wide set of live subscriptions.
pub struct Registry {
    capacity: usize,
    connections: RwLock<HashMap<ConnectionId, HashMap<String, Entry>>>,
}

impl Registry {
    /// Create a registry whose outboxes hold at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a subscription and return its outbox. An existing
    /// subscription with the same id on the same connection is replaced and
    /// its outbox closed.
    pub fn add(&self, conn: ConnectionId, id: &str, filters: Vec<Filter>) -> Outbox {
        let (tx, rx) = mpsc::channel(self.capacity);
        let entry = Entry {
            subscription: Subscription {
                id: id.to_string(),
                filters,
            },
            outbox: tx,
        };
        let mut connections = self.connections.write();
        let subs = connections.entry(conn).or_default();
        if subs.remove(id).is_some() {
            debug!(conn, sub = id, "replacing subscription");
        }
        subs.insert(id.to_string(), entry);
        rx
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn remove(&self, conn: ConnectionId, id: &str) -> bool {
        let mut connections = self.connections.write();
        let Some(subs) = connections.get_mut(&conn) else {
            return false;
        };
        let removed = subs.remove(id).is_some();
        if subs.is_empty() {
            connections.remove(&conn);
        }
        removed
    }

    /// Remove every subscription owned by `conn`. Returns how many were live.
    pub fn remove_all(&self, conn: ConnectionId) -> usize {
        self.connections
            .write()
            .remove(&conn)
            .map_or(0, |subs| subs.len())
    }

    /// Offer `event` to every matching subscription without blocking. A full
    /// outbox drops the event for that subscriber only. Returns the number of
    /// outboxes that accepted it.
    pub fn broadcast(&self, event: &Arc<Event>) -> usize {
        let connections = self.connections.read();
        let mut delivered = 0;
        for (conn, subs) in connections.iter() {
            for entry in subs.values() {
                if !entry.subscription.matches(event) {
                    continue;
                }
                match entry.outbox.try_send(Arc::clone(event)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        debug!(
                            conn = *conn,
                            sub = %entry.subscription.id,
                            event = %event.id,
                            "outbox full, dropping event"
                        );
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
        delivered
    }

    /// Total number of live subscriptions.
    pub fn len(&self) -> usize {
        self.connections.read().values().map(HashMap::len).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections holding at least one subscription.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }
}
