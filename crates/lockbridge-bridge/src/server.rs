//! TCP server loop for the locker bridge.
//!
//! One listener carries all three connection kinds. The first decoded frame
//! decides what a connection is:
//!
//! - `register`: a locker controller; long-lived device session.
//! - `identify`: a management observer; receives `lockerUpdate` pushes.
//! - `command`: a stateless caller; one command, one `commandResult`, close.
//!
//! Each accepted connection gets a reader task and a writer task draining
//! an unbounded channel, so a slow peer never blocks the components that
//! queue messages for it.
//!
//! # Example
//!
//! ```no_run
//! use lockbridge_bridge::{BridgeConfig, LockerBridge};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = BridgeConfig {
//!     bind_addr: "0.0.0.0:9500".parse()?,
//!     allowed_controllers: vec!["LOC1".into()],
//!     admin_secret: "s3cret".into(),
//!     ..BridgeConfig::default()
//! };
//! let bridge = LockerBridge::bind(config).await?;
//! bridge.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::BridgeConfig;
use crate::correlator::RequestCorrelator;
use crate::gateway::{CommandAuthorizer, CommandGateway, SharedSecretAuthorizer};
use crate::liveness::LivenessMonitor;
use crate::observers::ObserverHub;
use crate::projector::StateProjector;
use crate::registry::ConnectionRegistry;
use crate::session::DeviceSession;
use crate::store::{CellStateStore, NoopStore};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use lockbridge_core::constants::MAX_PROTOCOL_VIOLATIONS;
use lockbridge_core::{CellId, CommandKind, ControllerId, Error, PackageId, Result};
use lockbridge_protocol::{CellReport, Message, WireCodec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

/// Time a fresh connection has to produce its first frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Observer client name accepted by the `identify` handshake.
const OBSERVER_CLIENT: &str = "admin";

type WireSink = SplitSink<Framed<TcpStream, WireCodec>, Message>;
type WireStream = SplitStream<Framed<TcpStream, WireCodec>>;

/// The bridge: listener plus all shared components, ready to run.
pub struct LockerBridge {
    listener: TcpListener,
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<RequestCorrelator>,
    projector: Arc<StateProjector>,
    hub: Arc<ObserverHub>,
    gateway: Arc<CommandGateway>,
    active: AtomicUsize,
}

impl LockerBridge {
    /// Bind the bridge with no persistence.
    pub async fn bind(config: BridgeConfig) -> Result<Self> {
        Self::bind_with_store(config, Arc::new(NoopStore)).await
    }

    /// Bind the bridge, recording cell mutations through `store`.
    ///
    /// # Errors
    /// Returns `Error::InvalidIdentifier` for a malformed allow-list entry
    /// and `Error::Io` when the listener cannot bind.
    pub async fn bind_with_store(
        config: BridgeConfig,
        store: Arc<dyn CellStateStore>,
    ) -> Result<Self> {
        let allow_list = config.allow_list()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %config.bind_addr,
            controllers = allow_list.len(),
            max_connections = config.max_connections,
            "Locker bridge listening"
        );

        let registry = Arc::new(ConnectionRegistry::new(allow_list));
        let correlator = Arc::new(RequestCorrelator::new());
        let hub = Arc::new(ObserverHub::new());
        let projector = Arc::new(StateProjector::new(hub.clone(), store));
        let gateway = Arc::new(CommandGateway::new(
            registry.clone(),
            correlator.clone(),
            projector.clone(),
            Arc::new(SharedSecretAuthorizer::new(config.admin_secret.clone())),
            config.command_timeout,
        ));

        Ok(Self {
            listener,
            inner: Arc::new(BridgeInner {
                config,
                registry,
                correlator,
                projector,
                hub,
                gateway,
                active: AtomicUsize::new(0),
            }),
        })
    }

    /// Local listener address; port 0 binds resolve here.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle for issuing cell commands in-process.
    pub fn gateway(&self) -> Arc<CommandGateway> {
        self.inner.gateway.clone()
    }

    /// Current registered-controller view, for monitoring.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.inner.registry.clone()
    }

    /// Run the accept loop plus the background liveness and broadcast
    /// tasks. Returns only when the listener fails.
    pub async fn run(self) -> Result<()> {
        let monitor = Arc::new(LivenessMonitor::new(
            self.inner.registry.clone(),
            self.inner.correlator.clone(),
            self.inner.projector.clone(),
            self.inner.config.liveness_interval,
            self.inner.config.liveness_timeout,
        ));
        let liveness_task = monitor.spawn();

        let projector = self.inner.projector.clone();
        let broadcast_interval = self.inner.config.broadcast_interval;
        let broadcast_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broadcast_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                projector.broadcast_now();
            }
        });

        let result = self.accept_loop().await;
        liveness_task.abort();
        broadcast_task.abort();
        result
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!(%addr, "Accepted connection");

            let active = self.inner.active.load(Ordering::Acquire);
            if active >= self.inner.config.max_connections {
                error!(
                    %addr,
                    active,
                    max_connections = self.inner.config.max_connections,
                    "Connection rejected: maximum connections reached"
                );
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                warn!(%addr, error = %e, "Failed to set TCP_NODELAY");
            }

            let inner = self.inner.clone();
            inner.active.fetch_add(1, Ordering::AcqRel);
            tokio::spawn(async move {
                handle_connection(inner.clone(), stream, addr).await;
                inner.active.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

/// Classify a connection by its first frame and run the matching flow.
async fn handle_connection(inner: Arc<BridgeInner>, stream: TcpStream, addr: SocketAddr) {
    let mut framed = Framed::new(stream, WireCodec::new());

    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            warn!(%addr, error = %e, "Undecodable handshake frame");
            let _ = framed
                .send(Message::Error {
                    message: "malformed handshake".into(),
                })
                .await;
            return;
        }
        Ok(None) => {
            debug!(%addr, "Connection closed before handshake");
            return;
        }
        Err(_) => {
            warn!(%addr, "Handshake timed out");
            return;
        }
    };

    match first {
        Message::Register { id, cells } => {
            run_device_session(inner, framed, addr, id, cells).await;
        }
        Message::Identify { client, secret } => {
            run_observer_session(inner, framed, addr, client, secret).await;
        }
        Message::Command {
            action,
            id,
            cell_id,
            package_id,
            secret,
        } => {
            run_fallback_command(inner, framed, addr, action, id, cell_id, package_id, secret)
                .await;
        }
        other => {
            warn!(%addr, message = other.type_name(), "Unexpected handshake frame");
            let _ = framed
                .send(Message::Error {
                    message: format!("expected register, identify or command, got {}", other.type_name()),
                })
                .await;
        }
    }
}

/// Drain an outbound channel into the socket until either side ends.
fn spawn_writer(mut sink: WireSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            trace!(message = message.type_name(), "Writing frame");
            if let Err(e) = sink.send(message).await {
                debug!(error = %e, "Writer stopping");
                break;
            }
        }
        let _ = sink.close().await;
    });
}

async fn run_device_session(
    inner: Arc<BridgeInner>,
    mut framed: Framed<TcpStream, WireCodec>,
    addr: SocketAddr,
    controller_id: ControllerId,
    initial_cells: Option<HashMap<CellId, CellReport>>,
) {
    if !inner.registry.permits(&controller_id) {
        warn!(%addr, controller = %controller_id, "Registration refused: not on allow-list");
        let _ = framed
            .send(Message::Error {
                message: format!("controller {controller_id} is not authorized"),
            })
            .await;
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let session = DeviceSession::new(controller_id.clone(), tx, Some(addr));
    let epoch = session.epoch();

    let replaced = match inner.registry.register(session.clone()) {
        Ok((_, replaced)) => replaced,
        Err(e) => {
            // Allow-list raced between permits() and register(); refuse.
            warn!(%addr, controller = %controller_id, error = %e, "Registration failed");
            let _ = framed
                .send(Message::Error {
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };
    if let Some(old) = replaced {
        old.request_close();
        let cancelled = inner.correlator.fail_all_for(&controller_id, old.epoch());
        info!(
            controller = %controller_id,
            cancelled,
            "Replaced previous session on reconnect"
        );
    }

    let (sink, stream) = framed.split();
    spawn_writer(sink, rx);

    if session
        .send(Message::RegisterAck {
            message: format!("registered {controller_id}"),
        })
        .is_err()
    {
        // Writer died before the ack; tear down what we just set up.
        cleanup_device(&inner, &controller_id, epoch);
        return;
    }

    inner.projector.mark_online(&controller_id);
    if let Some(cells) = initial_cells {
        debug!(controller = %controller_id, cells = cells.len(), "Seeding initial cell map");
        inner.projector.apply_reports(&controller_id, cells);
    }

    read_device_frames(&inner, &session, stream).await;
    cleanup_device(&inner, &controller_id, epoch);
}

/// Device read loop; returns when the socket ends, the session is told to
/// close, or the peer exceeds the protocol-violation threshold.
async fn read_device_frames(
    inner: &Arc<BridgeInner>,
    session: &DeviceSession,
    mut stream: WireStream,
) {
    let controller_id = session.controller_id().clone();
    let mut violations = 0u32;

    loop {
        tokio::select! {
            () = session.closed() => {
                debug!(controller = %controller_id, "Session close requested; reader stopping");
                return;
            }
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    // The codec swallows stray malformed lines itself; an
                    // error here means the frame limit or the violation
                    // threshold was hit and the stream is finished.
                    Some(Err(e)) => {
                        warn!(controller = %controller_id, error = %e, "Unrecoverable framing fault; closing");
                        let _ = session.send(Message::Error {
                            message: "too many malformed messages".into(),
                        });
                        return;
                    }
                    None => {
                        info!(controller = %controller_id, "Device disconnected");
                        return;
                    }
                };

                session.touch();
                inner.projector.touch(&controller_id);
                trace!(controller = %controller_id, message = message.type_name(), "Device frame");

                match message {
                    Message::StatusUpdate { cells } | Message::CellUpdate { cells } => {
                        inner.projector.apply_reports(&controller_id, cells);
                    }
                    Message::Pong => {}
                    Message::Ping => {
                        let _ = session.send(Message::Pong);
                    }
                    Message::UnlockResponse { request_id, success, cell_id }
                    | Message::LockResponse { request_id, success, cell_id } => {
                        inner.correlator.resolve(&request_id, success, cell_id);
                    }
                    Message::Register { .. } => {
                        debug!(controller = %controller_id, "Duplicate register on live session ignored");
                    }
                    other => {
                        violations += 1;
                        warn!(
                            controller = %controller_id,
                            message = other.type_name(),
                            violations,
                            "Unexpected message from device"
                        );
                        if violations >= MAX_PROTOCOL_VIOLATIONS {
                            warn!(controller = %controller_id, "Protocol-violation threshold reached; closing");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Epoch-guarded teardown shared by every exit path of a device session.
///
/// A reconnect that already replaced this session makes all of this a
/// no-op: unregister misses, and the pendings now belong to the new epoch.
fn cleanup_device(inner: &Arc<BridgeInner>, controller_id: &ControllerId, epoch: uuid::Uuid) {
    if inner.registry.unregister(controller_id, epoch).is_some() {
        let cancelled = inner.correlator.fail_all_for(controller_id, epoch);
        inner.projector.mark_offline(controller_id);
        info!(controller = %controller_id, cancelled, "Device session closed");
    }
}

async fn run_observer_session(
    inner: Arc<BridgeInner>,
    mut framed: Framed<TcpStream, WireCodec>,
    addr: SocketAddr,
    client: String,
    secret: String,
) {
    let authorizer = SharedSecretAuthorizer::new(inner.config.admin_secret.clone());
    if client != OBSERVER_CLIENT || !authorizer.authorize(&secret) {
        warn!(%addr, %client, "Observer identify rejected");
        let _ = framed
            .send(Message::Error {
                message: "identify rejected".into(),
            })
            .await;
        return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    // Current state up front, before any mutation-driven push.
    if tx.send(inner.projector.locker_update()).is_err() {
        return;
    }
    let pong_tx = tx.clone();
    let observer_id = inner.hub.subscribe(tx);
    info!(%addr, observer = %observer_id, "Observer connected");

    let (sink, mut stream) = framed.split();
    spawn_writer(sink, rx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Ping) => {
                let _ = pong_tx.send(Message::Pong);
            }
            Ok(other) => {
                debug!(observer = %observer_id, message = other.type_name(), "Ignoring observer frame");
            }
            Err(e) => {
                warn!(observer = %observer_id, error = %e, "Unrecoverable framing fault; closing");
                break;
            }
        }
    }

    inner.hub.unsubscribe(observer_id);
    info!(observer = %observer_id, "Observer disconnected");
}

#[allow(clippy::too_many_arguments)]
async fn run_fallback_command(
    inner: Arc<BridgeInner>,
    mut framed: Framed<TcpStream, WireCodec>,
    addr: SocketAddr,
    action: CommandKind,
    controller_id: ControllerId,
    cell_id: CellId,
    package_id: Option<PackageId>,
    secret: String,
) {
    debug!(%addr, controller = %controller_id, cell = %cell_id, %action, "Fallback command");

    let outcome = match action {
        CommandKind::Unlock => {
            inner
                .gateway
                .open_cell(&secret, &controller_id, &cell_id)
                .await
        }
        CommandKind::Lock => {
            inner
                .gateway
                .lock_cell(&secret, &controller_id, &cell_id, package_id)
                .await
        }
    };

    let reply = match outcome {
        Ok(()) => Message::CommandResult {
            success: true,
            error: None,
        },
        Err(e) => {
            // The caller gets the outcome class, not internals.
            let reason = match &e {
                Error::BadCredential => "unauthorized".to_string(),
                Error::NotConnected(id) => format!("controller {id} not connected"),
                Error::CommandTimeout { .. } => "device did not respond".to_string(),
                Error::DeviceRejected { .. } => "device rejected the command".to_string(),
                other => other.to_string(),
            };
            Message::CommandResult {
                success: false,
                error: Some(reason),
            }
        }
    };
    let _ = framed.send(reply).await;
    // One command per connection; close regardless of outcome.
}
