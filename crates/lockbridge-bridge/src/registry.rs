//! Connection registry.
//!
//! Maps a controller's logical identifier to its current [`DeviceSession`],
//! enforces the allow-list, and replaces stale sessions on reconnect. The
//! registry is the sole owner of sessions; other components look them up by
//! id each time they need one.

use crate::session::DeviceSession;
use dashmap::DashMap;
use lockbridge_core::{ControllerId, Error, Result};
use lockbridge_protocol::Message;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of a successful registration.
#[derive(Debug, PartialEq, Eq)]
pub enum Registration {
    /// No session existed for this controller.
    Accepted,
    /// An existing session was replaced (device reconnected).
    Replaced,
}

/// A point-in-time view of one session, taken for the liveness sweep.
///
/// Carries everything the sweep needs so it never holds map guards while
/// probing or evicting.
pub struct SessionProbe {
    pub controller_id: ControllerId,
    pub epoch: Uuid,
    pub idle: Duration,
    pub sender: mpsc::UnboundedSender<Message>,
}

/// Registry of live controller sessions, keyed by controller id.
pub struct ConnectionRegistry {
    sessions: DashMap<ControllerId, DeviceSession>,
    allow_list: HashSet<ControllerId>,
}

impl ConnectionRegistry {
    /// Create a registry that accepts only the given controller ids.
    pub fn new(allow_list: HashSet<ControllerId>) -> Self {
        Self {
            sessions: DashMap::new(),
            allow_list,
        }
    }

    /// Whether a controller id would pass the allow-list.
    pub fn permits(&self, controller_id: &ControllerId) -> bool {
        self.allow_list.contains(controller_id)
    }

    /// Register a session, replacing any existing one for the same id.
    ///
    /// The replaced session, if any, is returned so the caller can close it
    /// and fail its pending requests; its state is never transferred to the
    /// new session.
    ///
    /// # Errors
    /// Returns `Error::UnauthorizedController` if the id is not on the
    /// allow-list. No session is stored in that case.
    pub fn register(&self, session: DeviceSession) -> Result<(Registration, Option<DeviceSession>)> {
        let controller_id = session.controller_id().clone();

        if !self.permits(&controller_id) {
            warn!(controller = %controller_id, "Registration rejected: not on allow-list");
            return Err(Error::UnauthorizedController(controller_id.to_string()));
        }

        let previous = self.sessions.insert(controller_id.clone(), session);
        match previous {
            Some(old) => {
                info!(
                    controller = %controller_id,
                    old_epoch = %old.epoch(),
                    "Controller re-registered; replacing previous session"
                );
                Ok((Registration::Replaced, Some(old)))
            }
            None => {
                info!(controller = %controller_id, total = self.sessions.len(), "Controller registered");
                Ok((Registration::Accepted, None))
            }
        }
    }

    /// Look up the current session's epoch and outbound sender.
    ///
    /// Returns a detached handle pair rather than the session itself, so
    /// callers never hold a session across a reconnect.
    pub fn lookup_sender(
        &self,
        controller_id: &ControllerId,
    ) -> Option<(Uuid, mpsc::UnboundedSender<Message>)> {
        self.sessions
            .get(controller_id)
            .map(|s| (s.epoch(), s.sender()))
    }

    /// Remove a session if it is still the one identified by `epoch`.
    ///
    /// Idempotent: unregistering an absent id, or an id whose session was
    /// already replaced by a newer epoch, is a no-op returning `None`.
    pub fn unregister(
        &self,
        controller_id: &ControllerId,
        epoch: Uuid,
    ) -> Option<DeviceSession> {
        let removed = self
            .sessions
            .remove_if(controller_id, |_, s| s.epoch() == epoch)
            .map(|(_, s)| s);
        if removed.is_some() {
            info!(controller = %controller_id, total = self.sessions.len(), "Controller unregistered");
        } else {
            debug!(controller = %controller_id, "Unregister no-op (absent or superseded)");
        }
        removed
    }

    /// Record inbound traffic for a controller's current session.
    pub fn touch(&self, controller_id: &ControllerId) {
        if let Some(session) = self.sessions.get(controller_id) {
            session.touch();
        }
    }

    /// Whether a controller currently holds a live session.
    pub fn is_connected(&self, controller_id: &ControllerId) -> bool {
        self.sessions.contains_key(controller_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ids of all currently connected controllers.
    pub fn controllers(&self) -> Vec<ControllerId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot every session for a liveness sweep.
    ///
    /// Collects detached probes first so the sweep never holds map guards
    /// while sending pings or evicting.
    pub fn probe_sessions(&self) -> Vec<SessionProbe> {
        self.sessions
            .iter()
            .map(|entry| SessionProbe {
                controller_id: entry.key().clone(),
                epoch: entry.epoch(),
                idle: entry.idle(),
                sender: entry.sender(),
            })
            .collect()
    }
}
