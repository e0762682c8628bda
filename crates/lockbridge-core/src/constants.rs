//! Protocol and bridge-level constants.
//!
//! Centralizes every tunable the bridge and its peers agree on: identifier
//! limits, command timeouts, liveness windows and framing limits. Changing a
//! timeout here changes the default for every component that does not
//! override it through its config struct.
//!
//! # Timeout Knobs
//!
//! The bridge deliberately keeps two independent timeout families:
//!
//! | Knob | Default | Scope |
//! |------|---------|-------|
//! | `DEFAULT_COMMAND_TIMEOUT_MS` | 5000 | one outbound cell command |
//! | `DEFAULT_LIVENESS_TIMEOUT_SECS` | 60 | whole-session staleness |
//!
//! A slow device may miss a command deadline while its session stays alive,
//! and a dead connection is evicted even when no command is outstanding.

use std::time::Duration;

// ============================================================================
// Identifier limits
// ============================================================================

/// Minimum length of a controller identifier.
pub const MIN_CONTROLLER_ID_LENGTH: usize = 2;

/// Maximum length of a controller identifier.
pub const MAX_CONTROLLER_ID_LENGTH: usize = 32;

/// Maximum length of a cell identifier (e.g. "A1", "B12").
pub const MAX_CELL_ID_LENGTH: usize = 16;

/// Maximum length of an opaque package identifier.
pub const MAX_PACKAGE_ID_LENGTH: usize = 64;

// ============================================================================
// Command correlation
// ============================================================================

/// Default timeout for a single cell command (unlock/lock).
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 5000;

/// Default timeout as a [`Duration`].
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS);

// ============================================================================
// Liveness monitoring
// ============================================================================

/// Interval between liveness sweeps (ping emission + staleness check).
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 20;

/// A session with no inbound traffic for this long is evicted.
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 60;

// ============================================================================
// Observer broadcast
// ============================================================================

/// Interval for the periodic full-state broadcast to observers.
///
/// Mutations broadcast immediately; this timer is the backstop against a
/// missed push.
pub const DEFAULT_BROADCAST_INTERVAL_SECS: u64 = 30;

// ============================================================================
// Transport limits
// ============================================================================

/// Maximum wire frame size in bytes (64 KB).
///
/// Frames above this are rejected before JSON parsing to bound the memory a
/// misbehaving peer can pin.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Undecodable frames tolerated per connection before it is closed.
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Default maximum number of simultaneous connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
