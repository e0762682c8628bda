//! Locker bridge daemon.
//!
//! Configuration comes from the environment:
//!
//! - `LOCKBRIDGE_BIND`: listener address (default `0.0.0.0:9500`)
//! - `LOCKBRIDGE_ALLOW`: comma-separated controller ids allowed to register
//! - `LOCKBRIDGE_SECRET`: shared secret for observers and fallback commands
//! - `RUST_LOG`: tracing filter (default `info`)

use anyhow::Context;
use lockbridge_bridge::{BridgeConfig, LockerBridge};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn config_from_env() -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::default();

    if let Ok(bind) = std::env::var("LOCKBRIDGE_BIND") {
        config.bind_addr = bind
            .parse()
            .with_context(|| format!("invalid LOCKBRIDGE_BIND address: {bind}"))?;
    }
    if let Ok(allow) = std::env::var("LOCKBRIDGE_ALLOW") {
        config.allowed_controllers = allow
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Ok(secret) = std::env::var("LOCKBRIDGE_SECRET") {
        config.admin_secret = secret;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config_from_env()?;
    if config.allowed_controllers.is_empty() {
        info!("LOCKBRIDGE_ALLOW is empty; every device registration will be refused");
    }
    if config.admin_secret.is_empty() {
        info!("LOCKBRIDGE_SECRET is empty; observers and fallback commands are disabled");
    }

    let bridge = LockerBridge::bind(config)
        .await
        .context("failed to start locker bridge")?;
    let addr = bridge.local_addr().context("listener has no local address")?;
    info!(%addr, "lockbridged started");

    tokio::select! {
        result = bridge.run() => result.context("bridge terminated")?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    Ok(())
}
