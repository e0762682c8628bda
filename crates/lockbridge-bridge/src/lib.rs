//! The lockbridge hardware bridge.
//!
//! This crate connects a central controller to physically distributed
//! locker cabinets. It tracks which cabinets are reachable, issues cell
//! commands and correlates their asynchronous acknowledgements, evicts
//! silently-dead connections, and broadcasts a live aggregate state to
//! management observers.
//!
//! # Architecture
//!
//! ```text
//! Cabinet LOC1 ┐
//!              │   ┌──────────────────────────────────────────┐
//! Cabinet LOC2 ├──►│ LockerBridge                             │
//!              │   │  ├─ ConnectionRegistry (id -> session)   │
//! Cabinet LOCn ┘   │  ├─ RequestCorrelator  (requestId map)   │
//!                  │  ├─ LivenessMonitor    (ping + eviction) │
//! Observers ◄──────│  ├─ StateProjector     (cell state view) │
//!                  │  └─ CommandGateway     (open/lock cells) │
//! Callers ────────►└──────────────────────────────────────────┘
//! ```
//!
//! Inbound device messages flow through the registry (session bookkeeping)
//! to either the correlator (command responses) or the projector (status
//! pushes); every projector mutation broadcasts a snapshot to subscribed
//! observers. Outbound commands resolve a session through the registry,
//! park a pending entry in the correlator, and complete when the matching
//! response arrives or the deadline elapses.

pub mod config;
pub mod correlator;
pub mod gateway;
pub mod liveness;
pub mod observers;
pub mod projector;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

pub use config::BridgeConfig;
pub use correlator::RequestCorrelator;
pub use gateway::{CommandAuthorizer, CommandGateway, SharedSecretAuthorizer};
pub use liveness::LivenessMonitor;
pub use observers::ObserverHub;
pub use projector::StateProjector;
pub use registry::{ConnectionRegistry, Registration};
pub use server::LockerBridge;
pub use session::DeviceSession;
pub use store::{CellStateStore, MemoryStore, NoopStore};
