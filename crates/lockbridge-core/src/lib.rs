//! Core domain types for the lockbridge locker-cabinet bridge.
//!
//! This crate defines the identifiers, cell state model, protocol constants
//! and error taxonomy shared by every other lockbridge crate. It carries no
//! I/O of its own.

pub mod constants;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
