//! Observer hub.
//!
//! Holds the outbound channels of every subscribed management observer.
//! Broadcast iterates a detached snapshot of the set, so subscribe and
//! unsubscribe may run concurrently; senders whose connection has gone
//! away are pruned on the next broadcast.

use dashmap::DashMap;
use lockbridge_protocol::Message;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Broadcast set of subscribed observers.
pub struct ObserverHub {
    observers: DashMap<Uuid, mpsc::UnboundedSender<Message>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self {
            observers: DashMap::new(),
        }
    }

    /// Add an observer; the returned id is its unsubscribe handle.
    pub fn subscribe(&self, sender: mpsc::UnboundedSender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.observers.insert(id, sender);
        debug!(observer = %id, total = self.observers.len(), "Observer subscribed");
        id
    }

    /// Remove an observer. Idempotent.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.observers.remove(&id).is_some() {
            debug!(observer = %id, total = self.observers.len(), "Observer unsubscribed");
        }
    }

    /// Number of subscribed observers.
    pub fn count(&self) -> usize {
        self.observers.len()
    }

    /// Send a message to every observer, pruning dead channels.
    ///
    /// Returns the number of observers the message was queued for.
    pub fn broadcast(&self, message: &Message) -> usize {
        let targets: Vec<(Uuid, mpsc::UnboundedSender<Message>)> = self
            .observers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut delivered = 0;
        for (id, sender) in targets {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                self.observers.remove(&id);
                trace!(observer = %id, "Pruned dead observer channel");
            }
        }
        delivered
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new()
    }
}
