//! Wire message model.
//!
//! One internally tagged enum covers every message the bridge exchanges
//! with devices and observers. The `type` field selects the variant;
//! remaining fields are camelCase, matching what the locker-controller
//! firmware emits.

use chrono::{DateTime, Utc};
use lockbridge_core::{CellId, CellState, CommandKind, ControllerId, PackageId, RequestId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cell state as reported by a device.
///
/// Devices report lock and door state only; the bridge stamps arrival time
/// when it folds a report into its projected [`CellState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellReport {
    /// Whether the cell's lock is engaged.
    pub locked: bool,

    /// Whether the cell's door is open.
    pub opened: bool,

    /// Package the device believes is inside the cell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<PackageId>,
}

impl CellReport {
    /// Fold this report into a bridge-stamped [`CellState`].
    #[must_use]
    pub fn into_state(self) -> CellState {
        CellState {
            locked: self.locked,
            opened: self.opened,
            package_id: self.package_id,
            updated_at: Utc::now(),
        }
    }
}

/// One controller's entry in a broadcast snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSnapshot {
    /// Whether the controller currently holds a live session.
    pub is_online: bool,

    /// Last inbound traffic from the controller.
    pub last_seen: DateTime<Utc>,

    /// Last known state of every observed cell.
    ///
    /// Retained across disconnects so observers can still see what was
    /// last inside each cell of an offline cabinet.
    pub cells: HashMap<CellId, CellState>,
}

/// Every message type on the wire, in both directions.
///
/// | direction | variants |
/// |---|---|
/// | device → bridge | `register`, `statusUpdate`, `cellUpdate`, `pong`, `unlockResponse`, `lockResponse` |
/// | bridge → device | `registerAck`, `ping`, `unlock`, `lock` |
/// | observer → bridge | `identify`, `ping` |
/// | bridge → observer | `lockerUpdate`, `pong`, `error` |
/// | stateless caller ↔ bridge | `command`, `commandResult` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// Device announces itself; first frame of every device connection.
    Register {
        /// Controller identifier, checked against the allow-list.
        id: ControllerId,

        /// Optional initial cell map, seeding the projector before the
        /// first status push.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cells: Option<HashMap<CellId, CellReport>>,
    },

    /// Bridge confirms a successful registration.
    RegisterAck { message: String },

    /// Full cell map push from a device.
    StatusUpdate { cells: HashMap<CellId, CellReport> },

    /// Alias push some firmware revisions send; handled like `statusUpdate`.
    CellUpdate { cells: HashMap<CellId, CellReport> },

    /// Application-level liveness probe.
    Ping,

    /// Reply to `ping`; refreshes the session's last-seen timestamp.
    Pong,

    /// Command: release a cell's lock.
    Unlock { request_id: RequestId, cell_id: CellId },

    /// Command: engage a cell's lock, optionally associating a package.
    Lock {
        request_id: RequestId,
        cell_id: CellId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_id: Option<PackageId>,
    },

    /// Device acknowledgement of an `unlock` command.
    UnlockResponse {
        request_id: RequestId,
        success: bool,
        cell_id: CellId,
    },

    /// Device acknowledgement of a `lock` command.
    LockResponse {
        request_id: RequestId,
        success: bool,
        cell_id: CellId,
    },

    /// Full aggregate state broadcast to observers.
    LockerUpdate {
        lockers: HashMap<ControllerId, ControllerSnapshot>,
        timestamp: DateTime<Utc>,
    },

    /// Observer handshake; first frame of every observer connection.
    Identify { client: String, secret: String },

    /// Error reply, sent before the bridge closes a misbehaving connection.
    Error { message: String },

    /// Stateless fallback: a single cell command over a short-lived
    /// connection, answered by exactly one `commandResult`.
    Command {
        action: CommandKind,
        id: ControllerId,
        cell_id: CellId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        package_id: Option<PackageId>,
        secret: String,
    },

    /// Reply to a `command` frame.
    CommandResult {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    /// Wire name of this message's type tag, for logging.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::RegisterAck { .. } => "registerAck",
            Message::StatusUpdate { .. } => "statusUpdate",
            Message::CellUpdate { .. } => "cellUpdate",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Unlock { .. } => "unlock",
            Message::Lock { .. } => "lock",
            Message::UnlockResponse { .. } => "unlockResponse",
            Message::LockResponse { .. } => "lockResponse",
            Message::LockerUpdate { .. } => "lockerUpdate",
            Message::Identify { .. } => "identify",
            Message::Error { .. } => "error",
            Message::Command { .. } => "command",
            Message::CommandResult { .. } => "commandResult",
        }
    }
}
