//! End-to-end tests: a real bridge on a random port, exercised by the
//! cabinet emulator over TCP, with observer connections checking the
//! broadcast state.

use futures::{SinkExt, StreamExt};
use lockbridge_bridge::{BridgeConfig, CommandGateway, ConnectionRegistry, LockerBridge};
use lockbridge_core::constants::MAX_PROTOCOL_VIOLATIONS;
use lockbridge_core::{CellId, ControllerId, Error, PackageId};
use lockbridge_emulator::{CabinetEmulator, EmulatorConfig, EmulatorError, ResponseMode};
use lockbridge_protocol::{ControllerSnapshot, Message, WireCodec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const SECRET: &str = "s3cret";

fn loc1() -> ControllerId {
    ControllerId::new("LOC1").unwrap()
}

fn a1() -> CellId {
    CellId::new("A1").unwrap()
}

fn a2() -> CellId {
    CellId::new("A2").unwrap()
}

fn test_config() -> BridgeConfig {
    BridgeConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        allowed_controllers: vec!["LOC1".into()],
        admin_secret: SECRET.into(),
        command_timeout: Duration::from_millis(300),
        ..BridgeConfig::default()
    }
}

async fn start_bridge(
    config: BridgeConfig,
) -> (SocketAddr, Arc<CommandGateway>, Arc<ConnectionRegistry>) {
    let bridge = LockerBridge::bind(config).await.unwrap();
    let addr = bridge.local_addr().unwrap();
    let gateway = bridge.gateway();
    let registry = bridge.registry();
    tokio::spawn(bridge.run());
    (addr, gateway, registry)
}

async fn connect_emulator(addr: SocketAddr, mode: ResponseMode) -> CabinetEmulator {
    let config = EmulatorConfig {
        server_addr: addr,
        controller_id: "LOC1".into(),
        cells: vec!["A1".into(), "A2".into()],
        response_mode: mode,
        timeout: Duration::from_secs(2),
    };
    CabinetEmulator::connect(config).await.unwrap()
}

async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Observer connection: identify, then read `lockerUpdate` pushes.
async fn observe(addr: SocketAddr, secret: &str) -> Framed<TcpStream, WireCodec> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new());
    framed
        .send(Message::Identify {
            client: "admin".into(),
            secret: secret.into(),
        })
        .await
        .unwrap();
    framed
}

/// Read pushes until one satisfies `predicate`, bounded by a deadline.
async fn await_update(
    framed: &mut Framed<TcpStream, WireCodec>,
    predicate: impl Fn(&HashMap<ControllerId, ControllerSnapshot>) -> bool,
) -> HashMap<ControllerId, ControllerSnapshot> {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match framed.next().await {
                Some(Ok(Message::LockerUpdate { lockers, .. })) => {
                    if predicate(&lockers) {
                        return lockers;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("observer stream ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .expect("no matching lockerUpdate before deadline")
}

#[tokio::test]
async fn unlisted_controller_is_refused() {
    let (addr, _, registry) = start_bridge(test_config()).await;

    let config = EmulatorConfig {
        server_addr: addr,
        controller_id: "LOC9".into(),
        ..EmulatorConfig::default()
    };
    let result = CabinetEmulator::connect(config).await;

    assert!(matches!(result, Err(EmulatorError::Rejected(_))));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn open_and_lock_round_trip() {
    let (addr, gateway, registry) = start_bridge(test_config()).await;
    let emulator = connect_emulator(addr, ResponseMode::Normal).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    gateway.open_cell(SECRET, &loc1(), &a1()).await.unwrap();
    gateway
        .lock_cell(SECRET, &loc1(), &a1(), Some(PackageId::new("PKG1").unwrap()))
        .await
        .unwrap();

    let mut observer = observe(addr, SECRET).await;
    let lockers = await_update(&mut observer, |lockers| {
        lockers
            .get(&loc1())
            .and_then(|entry| entry.cells.get(&a1()))
            .is_some_and(|cell| cell.locked && cell.package_id.is_some())
    })
    .await;
    let cell = &lockers[&loc1()].cells[&a1()];
    assert_eq!(cell.package_id, Some(PackageId::new("PKG1").unwrap()));
}

#[tokio::test]
async fn silent_device_times_out() {
    let (addr, gateway, registry) = start_bridge(test_config()).await;
    let emulator = connect_emulator(addr, ResponseMode::Silent).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    let start = Instant::now();
    let err = gateway.open_cell(SECRET, &loc1(), &a1()).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::CommandTimeout { .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(300), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "returned late: {elapsed:?}");
}

#[tokio::test]
async fn rejecting_device_is_a_distinct_outcome() {
    let (addr, gateway, registry) = start_bridge(test_config()).await;
    let emulator = connect_emulator(addr, ResponseMode::Reject).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    let err = gateway.open_cell(SECRET, &loc1(), &a1()).await.unwrap_err();
    assert!(matches!(err, Error::DeviceRejected { .. }), "got {err:?}");
}

#[tokio::test]
async fn command_for_disconnected_controller_fails_immediately() {
    let (_, gateway, _) = start_bridge(test_config()).await;

    let start = Instant::now();
    let err = gateway.open_cell(SECRET, &loc1(), &a1()).await.unwrap_err();

    assert!(matches!(err, Error::NotConnected(_)), "got {err:?}");
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn session_loss_cancels_pending_commands_before_their_deadline() {
    let mut config = test_config();
    config.command_timeout = Duration::from_secs(5);
    let (addr, gateway, registry) = start_bridge(config).await;
    let emulator = connect_emulator(addr, ResponseMode::Silent).await;
    let device = emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    // Drop the device mid-flight; both pendings must fail well before
    // their five second deadline.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        device.abort();
    });

    let start = Instant::now();
    let (loc, addr1, addr2) = (loc1(), a1(), a2());
    let (r1, r2) = tokio::join!(
        gateway.open_cell(SECRET, &loc, &addr1),
        gateway.open_cell(SECRET, &loc, &addr2),
    );
    let elapsed = start.elapsed();

    assert!(matches!(r1.unwrap_err(), Error::SessionClosed(_)));
    assert!(matches!(r2.unwrap_err(), Error::SessionClosed(_)));
    assert!(elapsed < Duration::from_secs(2), "cancellation too slow: {elapsed:?}");
}

#[tokio::test]
async fn reconnect_replaces_the_previous_session() {
    let (addr, gateway, registry) = start_bridge(test_config()).await;

    let first = connect_emulator(addr, ResponseMode::Normal).await;
    let first_task = first.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    let second = connect_emulator(addr, ResponseMode::Normal).await;
    second.spawn();

    // The replaced session's connection is closed by the bridge.
    let first_outcome = tokio::time::timeout(Duration::from_secs(2), first_task)
        .await
        .expect("replaced emulator still running")
        .unwrap();
    assert!(first_outcome.is_ok());

    // Commands are served by the replacement.
    assert_eq!(registry.len(), 1);
    gateway.open_cell(SECRET, &loc1(), &a1()).await.unwrap();
}

#[tokio::test]
async fn observer_sees_registration_and_initial_cells() {
    let (addr, _, registry) = start_bridge(test_config()).await;
    let mut observer = observe(addr, SECRET).await;

    // Handshake reply carries the (empty) current state.
    let initial = await_update(&mut observer, |_| true).await;
    assert!(initial.is_empty());

    let emulator = connect_emulator(addr, ResponseMode::Normal).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    let lockers = await_update(&mut observer, |lockers| {
        lockers
            .get(&loc1())
            .is_some_and(|entry| entry.is_online && entry.cells.len() == 2)
    })
    .await;
    let entry = &lockers[&loc1()];
    assert_eq!(entry.cells.len(), 2);
    assert!(entry.cells[&a1()].locked);
    assert!(entry.cells[&a1()].package_id.is_none());
}

#[tokio::test]
async fn observer_with_bad_secret_is_refused() {
    let (addr, _, _) = start_bridge(test_config()).await;

    let mut observer = observe(addr, "wrong").await;
    match observer.next().await {
        Some(Ok(Message::Error { .. })) => {}
        other => panic!("expected error frame, got {other:?}"),
    }
    // The bridge hangs up after the error.
    assert!(matches!(observer.next().await, None | Some(Err(_))));
}

#[tokio::test]
async fn fallback_command_frame_is_served_and_answered() {
    let (addr, _, registry) = start_bridge(test_config()).await;
    let emulator = connect_emulator(addr, ResponseMode::Normal).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new());
    framed
        .send(Message::Command {
            action: lockbridge_core::CommandKind::Unlock,
            id: loc1(),
            cell_id: a1(),
            package_id: None,
            secret: SECRET.into(),
        })
        .await
        .unwrap();

    match framed.next().await {
        Some(Ok(Message::CommandResult { success, error })) => {
            assert!(success, "command failed: {error:?}");
        }
        other => panic!("expected commandResult, got {other:?}"),
    }
}

#[tokio::test]
async fn fallback_command_with_bad_secret_is_unauthorized() {
    let (addr, _, _) = start_bridge(test_config()).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new());
    framed
        .send(Message::Command {
            action: lockbridge_core::CommandKind::Unlock,
            id: loc1(),
            cell_id: a1(),
            package_id: None,
            secret: "wrong".into(),
        })
        .await
        .unwrap();

    match framed.next().await {
        Some(Ok(Message::CommandResult { success, error })) => {
            assert!(!success);
            assert_eq!(error.as_deref(), Some("unauthorized"));
        }
        other => panic!("expected commandResult, got {other:?}"),
    }
}

#[tokio::test]
async fn unresponsive_device_is_evicted_but_its_cells_are_retained() {
    let mut config = test_config();
    config.liveness_interval = Duration::from_millis(100);
    config.liveness_timeout = Duration::from_millis(300);
    let (addr, _, registry) = start_bridge(config).await;

    // Deaf: ignores pings and, being command-free, never sends anything
    // after registering.
    let emulator = connect_emulator(addr, ResponseMode::Deaf).await;
    emulator.spawn();
    wait_until(Duration::from_secs(2), || registry.is_connected(&loc1())).await;

    wait_until(Duration::from_secs(3), || !registry.is_connected(&loc1())).await;

    let mut observer = observe(addr, SECRET).await;
    let lockers = await_update(&mut observer, |lockers| {
        lockers.get(&loc1()).is_some_and(|entry| !entry.is_online)
    })
    .await;
    let entry = &lockers[&loc1()];
    assert!(!entry.is_online);
    assert_eq!(entry.cells.len(), 2, "cells must survive eviction");
}

#[tokio::test]
async fn device_session_survives_stray_garbage_lines() {
    let (addr, _, registry) = start_bridge(test_config()).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"type\":\"register\",\"id\":\"LOC1\"}\n")
        .await
        .unwrap();
    let ack = lines.next_line().await.unwrap().unwrap();
    assert!(ack.contains("registerAck"), "unexpected first frame: {ack}");

    write_half.write_all(b"this is not json\n").await.unwrap();
    write_half.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();

    // A lone garbage line is dropped; the session answers the next frame.
    let pong = tokio::time::timeout(Duration::from_secs(3), lines.next_line())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(pong.contains("pong"), "unexpected frame after garbage: {pong}");
    assert!(registry.is_connected(&loc1()));
}

#[tokio::test]
async fn device_flooding_garbage_is_disconnected() {
    let (addr, _, registry) = start_bridge(test_config()).await;

    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half
        .write_all(b"{\"type\":\"register\",\"id\":\"LOC1\"}\n")
        .await
        .unwrap();
    lines.next_line().await.unwrap().unwrap();
    assert!(registry.is_connected(&loc1()));

    for _ in 0..MAX_PROTOCOL_VIOLATIONS {
        write_half.write_all(b"garbage\n").await.unwrap();
    }

    wait_until(Duration::from_secs(2), || !registry.is_connected(&loc1())).await;
}
