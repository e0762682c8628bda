use crate::{
    Result,
    constants::{
        MAX_CELL_ID_LENGTH, MAX_CONTROLLER_ID_LENGTH, MAX_PACKAGE_ID_LENGTH,
        MIN_CONTROLLER_ID_LENGTH,
    },
    error::Error,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical identifier of one locker cabinet's control unit.
///
/// Controller ids are opaque strings chosen by the device operator
/// (e.g. `"LOC1"`). Syntax is validated here; whether a given id is
/// *authorized* is a registry allow-list decision, not a type-level one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControllerId(String);

impl ControllerId {
    /// Create a controller id with validation.
    ///
    /// Ids are normalized (trimmed, uppercased) before validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidIdentifier` if the id is outside the 2-32
    /// character range or contains characters other than ASCII
    /// alphanumerics, `-` and `_`.
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim().to_uppercase();

        let len = id.len();
        if !(MIN_CONTROLLER_ID_LENGTH..=MAX_CONTROLLER_ID_LENGTH).contains(&len) {
            return Err(Error::InvalidIdentifier(format!(
                "Controller id must be {MIN_CONTROLLER_ID_LENGTH}-{MAX_CONTROLLER_ID_LENGTH} chars, got {len}"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidIdentifier(format!(
                "Controller id '{id}' contains invalid characters"
            )));
        }

        Ok(ControllerId(id))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ControllerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ControllerId::new(s)
    }
}

/// Identifier of one lockable compartment within a cabinet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct CellId(String);

impl CellId {
    /// Create a cell id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidIdentifier` if the id is empty, longer than 16
    /// characters, or not ASCII alphanumeric.
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim().to_uppercase();

        if id.is_empty() || id.len() > MAX_CELL_ID_LENGTH {
            return Err(Error::InvalidIdentifier(format!(
                "Cell id must be 1-{MAX_CELL_ID_LENGTH} chars, got {}",
                id.len()
            )));
        }

        if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidIdentifier(format!(
                "Cell id '{id}' contains invalid characters"
            )));
        }

        Ok(CellId(id))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CellId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CellId::new(s)
    }
}

/// Opaque identifier of the package stored inside a cell.
///
/// The bridge never interprets package ids; it only carries them between
/// the command caller, the device and the projected state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    /// Create a package id with validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidIdentifier` if the id is empty or longer than
    /// 64 characters.
    pub fn new(id: &str) -> Result<Self> {
        let id = id.trim().to_string();

        if id.is_empty() || id.len() > MAX_PACKAGE_ID_LENGTH {
            return Err(Error::InvalidIdentifier(format!(
                "Package id must be 1-{MAX_PACKAGE_ID_LENGTH} chars, got {}",
                id.len()
            )));
        }

        Ok(PackageId(id))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two cell commands a caller can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    /// Release the cell's lock so the door can be opened.
    Unlock,
    /// Engage the cell's lock, optionally associating a package.
    Lock,
}

impl CommandKind {
    /// Short wire-compatible name of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Unlock => "unlock",
            CommandKind::Lock => "lock",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Correlation identifier for one outbound command.
///
/// Built from the target controller, the command kind, the epoch-millis
/// clock and a process-wide monotonic sequence, so two commands issued in
/// the same millisecond still get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

impl RequestId {
    /// Generate a fresh request id for a command against `controller`.
    #[must_use]
    pub fn generate(controller: &ControllerId, kind: CommandKind) -> Self {
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let millis = Utc::now().timestamp_millis();
        RequestId(format!("{controller}:{kind}:{millis}:{seq}"))
    }

    /// Wrap an id received from the wire without interpretation.
    ///
    /// Devices echo request ids verbatim; a response id only ever needs to
    /// match a pending entry, never to parse.
    #[must_use]
    pub fn from_wire(id: String) -> Self {
        RequestId(id)
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last observed (or optimistically projected) state of one cell.
///
/// Overwritten wholesale on every device push; there is no partial merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellState {
    /// Whether the cell's lock is engaged.
    pub locked: bool,

    /// Whether the cell's door is open.
    pub opened: bool,

    /// Package currently associated with the cell, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<PackageId>,

    /// When this state was recorded by the bridge.
    pub updated_at: DateTime<Utc>,
}

impl CellState {
    /// A locked, closed, empty cell, the state a fresh cell starts in.
    #[must_use]
    pub fn locked_empty() -> Self {
        CellState {
            locked: true,
            opened: false,
            package_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Projected state right after the bridge accepted an unlock.
    #[must_use]
    pub fn opening(package_id: Option<PackageId>) -> Self {
        CellState {
            locked: false,
            opened: true,
            package_id,
            updated_at: Utc::now(),
        }
    }

    /// Projected state right after the bridge accepted a lock.
    #[must_use]
    pub fn locked_with(package_id: Option<PackageId>) -> Self {
        CellState {
            locked: true,
            opened: false,
            package_id,
            updated_at: Utc::now(),
        }
    }
}
