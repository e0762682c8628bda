//! Software locker-cabinet controller.
//!
//! Connects to a bridge the way real cabinet firmware does: registers over
//! TCP, answers pings and cell commands, and pushes status updates. The
//! [`ResponseMode`] knob makes it misbehave on purpose, which is what the
//! bridge's timeout, rejection and liveness paths are tested against.
//!
//! # Example
//!
//! ```no_run
//! use lockbridge_emulator::{CabinetEmulator, EmulatorConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EmulatorConfig {
//!     server_addr: "127.0.0.1:9500".parse()?,
//!     controller_id: "LOC1".into(),
//!     cells: vec!["A1".into(), "A2".into()],
//!     ..EmulatorConfig::default()
//! };
//! let emulator = CabinetEmulator::connect(config).await?;
//! emulator.spawn(); // serve commands in the background
//! # Ok(())
//! # }
//! ```

pub mod cabinet;

pub use cabinet::{CabinetEmulator, EmulatorConfig, EmulatorError, ResponseMode};
