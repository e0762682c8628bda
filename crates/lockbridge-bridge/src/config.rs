//! Bridge configuration.

use lockbridge_core::{
    ControllerId, Result,
    constants::{
        DEFAULT_BROADCAST_INTERVAL_SECS, DEFAULT_COMMAND_TIMEOUT, DEFAULT_LIVENESS_INTERVAL_SECS,
        DEFAULT_LIVENESS_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    },
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the locker bridge.
///
/// # Example
///
/// ```
/// use lockbridge_bridge::BridgeConfig;
///
/// let config = BridgeConfig {
///     bind_addr: "0.0.0.0:9500".parse().unwrap(),
///     allowed_controllers: vec!["LOC1".into(), "LOC2".into()],
///     admin_secret: "s3cret".into(),
///     ..BridgeConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address to bind the listener to.
    pub bind_addr: SocketAddr,

    /// Controller identifiers permitted to register.
    ///
    /// A device whose `register` id is not in this list is refused and its
    /// connection closed. An empty list rejects every device.
    pub allowed_controllers: Vec<String>,

    /// Shared secret observers present in their `identify` frame, and
    /// stateless callers present with a `command` frame.
    ///
    /// An empty secret rejects every observer and fallback command.
    pub admin_secret: String,

    /// Caller-visible timeout for one cell command.
    pub command_timeout: Duration,

    /// Interval between liveness sweeps.
    pub liveness_interval: Duration,

    /// A session with no inbound traffic for this long is evicted.
    pub liveness_timeout: Duration,

    /// Interval for the periodic backstop broadcast to observers.
    pub broadcast_interval: Duration,

    /// Maximum number of simultaneous connections.
    pub max_connections: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9500".parse().unwrap(),
            allowed_controllers: Vec::new(),
            admin_secret: String::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            liveness_interval: Duration::from_secs(DEFAULT_LIVENESS_INTERVAL_SECS),
            liveness_timeout: Duration::from_secs(DEFAULT_LIVENESS_TIMEOUT_SECS),
            broadcast_interval: Duration::from_secs(DEFAULT_BROADCAST_INTERVAL_SECS),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate the configured allow-list.
    ///
    /// # Errors
    /// Returns `Error::InvalidIdentifier` if any entry is not a syntactically
    /// valid controller id.
    pub fn allow_list(&self) -> Result<HashSet<ControllerId>> {
        self.allowed_controllers
            .iter()
            .map(|raw| ControllerId::new(raw))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_rejects_everything() {
        let config = BridgeConfig::default();
        assert!(config.allow_list().unwrap().is_empty());
        assert!(config.admin_secret.is_empty());
    }

    #[test]
    fn allow_list_normalizes_entries() {
        let config = BridgeConfig {
            allowed_controllers: vec![" loc1 ".into(), "LOC2".into()],
            ..BridgeConfig::default()
        };
        let list = config.allow_list().unwrap();
        assert!(list.contains(&ControllerId::new("LOC1").unwrap()));
        assert!(list.contains(&ControllerId::new("LOC2").unwrap()));
    }

    #[test]
    fn allow_list_rejects_invalid_entries() {
        let config = BridgeConfig {
            allowed_controllers: vec!["not a valid id!".into()],
            ..BridgeConfig::default()
        };
        assert!(config.allow_list().is_err());
    }
}
