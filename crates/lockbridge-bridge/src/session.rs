//! Device session handle.
//!
//! A [`DeviceSession`] represents one locker controller's current link to
//! the bridge. The registry owns the authoritative copy; everything else
//! addresses the session by controller id, never by holding it directly,
//! so a reconnect can swap sessions without dangling references.

use chrono::{DateTime, Utc};
use lockbridge_core::{ControllerId, Error, Result};
use lockbridge_protocol::Message;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// One live connection to one locker controller.
///
/// Cloning is cheap; clones share the outbound channel, the last-seen
/// clock and the close signal. The `epoch` distinguishes this physical
/// connection from any session that later replaces it for the same
/// controller id.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    controller_id: ControllerId,
    epoch: Uuid,
    outbound: mpsc::UnboundedSender<Message>,
    remote_addr: Option<SocketAddr>,
    connected_at: DateTime<Utc>,
    last_seen: Arc<Mutex<Instant>>,
    close: Arc<Notify>,
}

impl DeviceSession {
    /// Create a session for a freshly registered connection.
    pub fn new(
        controller_id: ControllerId,
        outbound: mpsc::UnboundedSender<Message>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            controller_id,
            epoch: Uuid::new_v4(),
            outbound,
            remote_addr,
            connected_at: Utc::now(),
            last_seen: Arc::new(Mutex::new(Instant::now())),
            close: Arc::new(Notify::new()),
        }
    }

    /// Controller this session belongs to.
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Connection generation marker.
    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    /// Remote peer address, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the session was established.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queue a message for the session's writer task.
    ///
    /// # Errors
    /// Returns `Error::SessionClosed` if the writer side is gone.
    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| Error::SessionClosed(self.controller_id.to_string()))
    }

    /// Clone of the outbound sender, for components that queue messages
    /// without holding the session.
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.outbound.clone()
    }

    /// Record inbound traffic; called for every frame the device sends.
    pub fn touch(&self) {
        let mut seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        *seen = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle(&self) -> Duration {
        let seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.elapsed()
    }

    /// Ask the session's read task to shut down.
    ///
    /// Used when a reconnect replaces this session or the liveness monitor
    /// evicts it; the read task observes the signal and runs its cleanup.
    pub fn request_close(&self) {
        self.close.notify_waiters();
        self.close.notify_one();
    }

    /// Resolves when [`request_close`](Self::request_close) has been called.
    pub async fn closed(&self) {
        self.close.notified().await;
    }
}
