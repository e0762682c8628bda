//! Cabinet emulator: connection lifecycle and command handling.
//!
//! # Design
//!
//! The emulator is deliberately a plain single-task client:
//! - **No automatic retry**: tests decide when to reconnect.
//! - **No background pings**: the bridge probes, the emulator answers.
//! - **Scripted misbehavior**: [`ResponseMode`] selects how commands and
//!   pings are (mis)handled.

use futures::{SinkExt, StreamExt};
use lockbridge_core::{CellId, ControllerId, PackageId};
use lockbridge_protocol::{CellReport, Message, WireCodec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

/// How the emulator reacts to bridge traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// Execute commands, answer pings.
    #[default]
    Normal,

    /// Never answer cell commands; pings still get pongs. Drives the
    /// bridge's command-timeout path.
    Silent,

    /// Answer every cell command with `success: false` and leave the
    /// cells untouched.
    Reject,

    /// Ignore pings; commands still work. Drives the liveness eviction
    /// path when the cabinet also stays otherwise quiet.
    Deaf,
}

/// Configuration for one emulated cabinet.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Bridge address to connect to.
    pub server_addr: SocketAddr,

    /// Controller id announced in the `register` frame.
    pub controller_id: String,

    /// Cell ids this cabinet exposes; all start locked and empty.
    pub cells: Vec<String>,

    /// Behavior knob for tests.
    pub response_mode: ResponseMode,

    /// Timeout for connect and the registration acknowledgement.
    pub timeout: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9500".parse().unwrap(),
            controller_id: "LOC1".into(),
            cells: vec!["A1".into()],
            response_mode: ResponseMode::Normal,
            timeout: Duration::from_millis(3000),
        }
    }
}

/// Errors that can occur during emulator operations.
#[derive(Debug, Error)]
pub enum EmulatorError {
    /// Connection attempt timed out.
    #[error("Connection timeout after {0}ms")]
    ConnectionTimeout(u64),

    /// The bridge never acknowledged the registration.
    #[error("Registration timeout after {0}ms")]
    RegistrationTimeout(u64),

    /// The bridge refused the registration.
    #[error("Registration rejected: {0}")]
    Rejected(String),

    /// Connection was lost during operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Invalid identifier in the configuration.
    #[error("Protocol error: {0}")]
    Protocol(#[from] lockbridge_core::Error),

    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected, registered cabinet emulator.
///
/// Single-task by design: run it to completion with [`run`](Self::run) or
/// [`spawn`](Self::spawn), or drive it frame by frame with
/// [`step`](Self::step) from a test.
pub struct CabinetEmulator {
    controller_id: ControllerId,
    mode: ResponseMode,
    framed: Framed<TcpStream, WireCodec>,
    cells: HashMap<CellId, CellReport>,
}

impl CabinetEmulator {
    /// Connect to the bridge and complete the registration handshake.
    ///
    /// The initial cell map (everything locked and empty) rides on the
    /// `register` frame.
    ///
    /// # Errors
    /// Fails on bad identifiers, connect/ack timeouts, or an `error`
    /// reply from the bridge (allow-list refusal).
    pub async fn connect(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        let controller_id = ControllerId::new(&config.controller_id)?;
        let mut cells = HashMap::new();
        for raw in &config.cells {
            cells.insert(
                CellId::new(raw)?,
                CellReport {
                    locked: true,
                    opened: false,
                    package_id: None,
                },
            );
        }

        debug!(controller = %controller_id, addr = %config.server_addr, "Connecting to bridge");
        let stream = tokio::time::timeout(config.timeout, TcpStream::connect(config.server_addr))
            .await
            .map_err(|_| EmulatorError::ConnectionTimeout(config.timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, WireCodec::new());

        framed
            .send(Message::Register {
                id: controller_id.clone(),
                cells: Some(cells.clone()),
            })
            .await
            .map_err(|e| EmulatorError::ConnectionLost(e.to_string()))?;

        let ack = tokio::time::timeout(config.timeout, framed.next())
            .await
            .map_err(|_| EmulatorError::RegistrationTimeout(config.timeout.as_millis() as u64))?;
        match ack {
            Some(Ok(Message::RegisterAck { message })) => {
                info!(controller = %controller_id, %message, "Registered with bridge");
            }
            Some(Ok(Message::Error { message })) => {
                return Err(EmulatorError::Rejected(message));
            }
            Some(Ok(other)) => {
                return Err(EmulatorError::ConnectionLost(format!(
                    "unexpected handshake reply: {}",
                    other.type_name()
                )));
            }
            Some(Err(e)) => return Err(EmulatorError::ConnectionLost(e.to_string())),
            None => {
                return Err(EmulatorError::ConnectionLost(
                    "closed during registration".into(),
                ));
            }
        }

        Ok(Self {
            controller_id,
            mode: config.response_mode,
            framed,
            cells,
        })
    }

    /// Controller id this emulator registered as.
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Current local state of one cell.
    pub fn cell(&self, cell_id: &CellId) -> Option<&CellReport> {
        self.cells.get(cell_id)
    }

    /// Overwrite one cell locally. Call [`send_status`](Self::send_status)
    /// to make the bridge see it, like firmware reporting a door event.
    pub fn set_cell(&mut self, cell_id: CellId, report: CellReport) {
        self.cells.insert(cell_id, report);
    }

    /// Push the full local cell map as a `statusUpdate`.
    pub async fn send_status(&mut self) -> Result<(), EmulatorError> {
        self.framed
            .send(Message::StatusUpdate {
                cells: self.cells.clone(),
            })
            .await
            .map_err(|e| EmulatorError::ConnectionLost(e.to_string()))
    }

    /// Read and handle one frame from the bridge.
    ///
    /// Returns `Ok(false)` when the bridge closed the connection.
    pub async fn step(&mut self) -> Result<bool, EmulatorError> {
        let frame = match self.framed.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return Err(EmulatorError::ConnectionLost(e.to_string())),
            None => {
                info!(controller = %self.controller_id, "Bridge closed the connection");
                return Ok(false);
            }
        };

        trace!(controller = %self.controller_id, message = frame.type_name(), "Bridge frame");
        match frame {
            Message::Ping => {
                if self.mode == ResponseMode::Deaf {
                    debug!(controller = %self.controller_id, "Ignoring ping (deaf mode)");
                } else {
                    self.reply(Message::Pong).await?;
                }
            }
            Message::Unlock { request_id, cell_id } => {
                let success = self.actuate_unlock(&cell_id);
                if self.mode == ResponseMode::Silent {
                    debug!(controller = %self.controller_id, %request_id, "Swallowing unlock (silent mode)");
                } else {
                    self.reply(Message::UnlockResponse {
                        request_id,
                        success,
                        cell_id,
                    })
                    .await?;
                }
            }
            Message::Lock {
                request_id,
                cell_id,
                package_id,
            } => {
                let success = self.actuate_lock(&cell_id, package_id);
                if self.mode == ResponseMode::Silent {
                    debug!(controller = %self.controller_id, %request_id, "Swallowing lock (silent mode)");
                } else {
                    self.reply(Message::LockResponse {
                        request_id,
                        success,
                        cell_id,
                    })
                    .await?;
                }
            }
            Message::Error { message } => {
                warn!(controller = %self.controller_id, %message, "Bridge reported an error");
            }
            other => {
                debug!(
                    controller = %self.controller_id,
                    message = other.type_name(),
                    "Ignoring unexpected frame"
                );
            }
        }

        Ok(true)
    }

    /// Serve bridge traffic until the connection ends.
    pub async fn run(mut self) -> Result<(), EmulatorError> {
        while self.step().await? {}
        Ok(())
    }

    /// Serve bridge traffic on a background task.
    pub fn spawn(self) -> JoinHandle<Result<(), EmulatorError>> {
        tokio::spawn(self.run())
    }

    fn actuate_unlock(&mut self, cell_id: &CellId) -> bool {
        if self.mode == ResponseMode::Reject {
            return false;
        }
        match self.cells.get_mut(cell_id) {
            Some(cell) => {
                cell.locked = false;
                cell.opened = true;
                true
            }
            None => {
                warn!(controller = %self.controller_id, cell = %cell_id, "Unlock for unknown cell");
                false
            }
        }
    }

    fn actuate_lock(&mut self, cell_id: &CellId, package_id: Option<PackageId>) -> bool {
        if self.mode == ResponseMode::Reject {
            return false;
        }
        match self.cells.get_mut(cell_id) {
            Some(cell) => {
                cell.locked = true;
                cell.opened = false;
                cell.package_id = package_id;
                true
            }
            None => {
                warn!(controller = %self.controller_id, cell = %cell_id, "Lock for unknown cell");
                false
            }
        }
    }

    async fn reply(&mut self, message: Message) -> Result<(), EmulatorError> {
        self.framed
            .send(message)
            .await
            .map_err(|e| EmulatorError::ConnectionLost(e.to_string()))
    }
}
