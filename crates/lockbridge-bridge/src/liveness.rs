//! Liveness monitor.
//!
//! A periodic sweep over every registered session. Sessions quiet for
//! longer than the liveness interval get a `ping` probe; sessions quiet
//! for longer than the liveness timeout are evicted: unregistered, their
//! pending commands cancelled, and the controller projected offline.
//!
//! Any inbound frame counts as life, so a chatty device never sees a
//! probe at all.

use crate::correlator::RequestCorrelator;
use crate::projector::StateProjector;
use crate::registry::ConnectionRegistry;
use lockbridge_protocol::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodic health sweep over registered device sessions.
pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<RequestCorrelator>,
    projector: Arc<StateProjector>,
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<RequestCorrelator>,
        projector: Arc<StateProjector>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            projector,
            interval,
            timeout,
        }
    }

    /// Spawn the sweep loop. Runs until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly
            // started bridge doesn't probe sessions it just accepted.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    /// Run one sweep pass. Returns the number of sessions evicted.
    pub fn sweep(&self) -> usize {
        let probes = self.registry.probe_sessions();
        let mut evicted = 0;

        for probe in probes {
            if probe.idle > self.timeout {
                warn!(
                    controller = %probe.controller_id,
                    idle = ?probe.idle,
                    "Session unresponsive; evicting"
                );
                // Epoch-guarded so a reconnect racing the sweep is left alone.
                if let Some(session) = self
                    .registry
                    .unregister(&probe.controller_id, probe.epoch)
                {
                    session.request_close();
                    let cancelled = self
                        .correlator
                        .fail_all_for(&probe.controller_id, probe.epoch);
                    self.projector.mark_offline(&probe.controller_id);
                    info!(
                        controller = %probe.controller_id,
                        cancelled,
                        "Evicted unresponsive session"
                    );
                    evicted += 1;
                }
            } else if probe.idle > self.interval {
                debug!(
                    controller = %probe.controller_id,
                    idle = ?probe.idle,
                    "Session quiet; probing"
                );
                // A closed channel here means the session is already being
                // torn down; the next sweep will see it gone.
                let _ = probe.sender.send(Message::Ping);
            }
        }

        evicted
    }
}
