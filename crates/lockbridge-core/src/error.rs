use thiserror::Error;

/// Error taxonomy for the locker bridge.
///
/// Variants are grouped to match the failure classes the bridge exposes to
/// callers: authorization failures close the offending connection, command
/// failures are scoped to the single command that caused them, and transport
/// failures cascade into session closure.
#[derive(Error, Debug)]
pub enum Error {
    // Authorization errors
    #[error("Controller '{0}' is not on the allow-list")]
    UnauthorizedController(String),

    #[error("Observer credential rejected")]
    BadCredential,

    // Command errors
    #[error("Controller '{0}' has no live session")]
    NotConnected(String),

    #[error("Command '{request_id}' timed out after {timeout_ms}ms")]
    CommandTimeout { request_id: String, timeout_ms: u64 },

    #[error("Device rejected command '{request_id}' for cell '{cell_id}'")]
    DeviceRejected { request_id: String, cell_id: String },

    #[error("Session for controller '{0}' closed while command was pending")]
    SessionClosed(String),

    // Protocol errors
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Frame exceeds maximum size: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    // Transport errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
