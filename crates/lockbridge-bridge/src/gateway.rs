//! Command gateway.
//!
//! The single entry point callers use to act on a cabinet: authenticate the
//! caller, locate the controller's live session, run the command through the
//! [`RequestCorrelator`], and project the optimistic result on success.
//!
//! Projection is optimistic by design. The device confirmed the command, so
//! we assume the lock actuated; its next status push overwrites our guess
//! either way.

use crate::correlator::RequestCorrelator;
use crate::projector::StateProjector;
use crate::registry::ConnectionRegistry;
use lockbridge_core::{CellId, CellState, CommandKind, ControllerId, Error, PackageId, Result};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Decides whether a presented credential may issue cell commands.
pub trait CommandAuthorizer: Send + Sync {
    fn authorize(&self, secret: &str) -> bool;
}

/// Authorizer backed by a single shared secret.
///
/// Comparison is constant-time. An empty configured secret authorizes
/// nobody rather than everybody.
pub struct SharedSecretAuthorizer {
    secret: String,
}

impl SharedSecretAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CommandAuthorizer for SharedSecretAuthorizer {
    fn authorize(&self, secret: &str) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        self.secret.as_bytes().ct_eq(secret.as_bytes()).into()
    }
}

/// Authenticated front door for unlock/lock commands.
pub struct CommandGateway {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<RequestCorrelator>,
    projector: Arc<StateProjector>,
    authorizer: Arc<dyn CommandAuthorizer>,
    command_timeout: Duration,
}

impl CommandGateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<RequestCorrelator>,
        projector: Arc<StateProjector>,
        authorizer: Arc<dyn CommandAuthorizer>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            projector,
            authorizer,
            command_timeout,
        }
    }

    /// Unlock a cell so its door can be opened.
    ///
    /// On success the cell is projected as open; a package already
    /// projected in the cell stays projected (a pickup is only complete
    /// once the device reports the cell empty).
    pub async fn open_cell(
        &self,
        secret: &str,
        controller_id: &ControllerId,
        cell_id: &CellId,
    ) -> Result<()> {
        let (epoch, sender) = self.admit(secret, controller_id)?;

        self.correlator
            .send(
                controller_id,
                epoch,
                &sender,
                CommandKind::Unlock,
                cell_id.clone(),
                None,
                self.command_timeout,
            )
            .await?;

        let package = self.projector.current_package(controller_id, cell_id);
        self.projector
            .apply_cell(controller_id, cell_id, CellState::opening(package));
        info!(controller = %controller_id, cell = %cell_id, "Cell unlocked");
        Ok(())
    }

    /// Lock a cell, optionally recording a deposited package.
    ///
    /// With a `package_id` this is a deposit; without one the cell is
    /// projected locked and empty.
    pub async fn lock_cell(
        &self,
        secret: &str,
        controller_id: &ControllerId,
        cell_id: &CellId,
        package_id: Option<PackageId>,
    ) -> Result<()> {
        let (epoch, sender) = self.admit(secret, controller_id)?;

        self.correlator
            .send(
                controller_id,
                epoch,
                &sender,
                CommandKind::Lock,
                cell_id.clone(),
                package_id.clone(),
                self.command_timeout,
            )
            .await?;

        self.projector
            .apply_cell(controller_id, cell_id, CellState::locked_with(package_id));
        info!(controller = %controller_id, cell = %cell_id, "Cell locked");
        Ok(())
    }

    fn admit(
        &self,
        secret: &str,
        controller_id: &ControllerId,
    ) -> Result<(uuid::Uuid, tokio::sync::mpsc::UnboundedSender<lockbridge_protocol::Message>)>
    {
        if !self.authorizer.authorize(secret) {
            warn!(controller = %controller_id, "Rejected command with bad credential");
            return Err(Error::BadCredential);
        }
        self.registry
            .lookup_sender(controller_id)
            .ok_or_else(|| Error::NotConnected(controller_id.to_string()))
    }
}
