//! Request correlator.
//!
//! Issues unique request identifiers for outbound cell commands, parks a
//! pending-result handle keyed by that identifier, and resolves it when the
//! matching response arrives, or fails it when the deadline elapses or the
//! session closes, whichever wins.
//!
//! # Single-Resolution Invariant
//!
//! A pending request is resolved at most once. Resolution always starts
//! with an atomic removal from the pending map; the timer path and the
//! response path race for that removal, and the loser sees an absent entry
//! and backs off. A late duplicate response therefore degrades to a logged
//! no-op and can never touch another caller's request.

use dashmap::DashMap;
use lockbridge_core::{CellId, CommandKind, ControllerId, Error, PackageId, RequestId, Result};
use lockbridge_protocol::Message;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Terminal state delivered through a pending request's channel.
#[derive(Debug)]
enum Resolution {
    /// The device answered; `success` is its verdict.
    Replied { success: bool, cell_id: CellId },
    /// The session closed while the request was pending.
    SessionClosed,
}

/// One in-flight command awaiting its device response.
struct PendingRequest {
    controller_id: ControllerId,
    epoch: Uuid,
    issued_at: Instant,
    /// Original command payload, kept for timeout diagnostics.
    command: Message,
    resolve_tx: oneshot::Sender<Resolution>,
}

/// Correlates outbound cell commands with their asynchronous responses.
///
/// Responses are matched strictly by request id, never by arrival order;
/// a controller may answer commands out of issuance order.
pub struct RequestCorrelator {
    pending: DashMap<RequestId, PendingRequest>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Send a cell command and wait for its resolution.
    ///
    /// The wait is a channel receive, so the calling task suspends without
    /// blocking any session's I/O loop.
    ///
    /// # Errors
    /// - `Error::NotConnected` if the outbound channel is already gone
    ///   (no pending entry is created in that case)
    /// - `Error::CommandTimeout` if no response arrives within `timeout`
    /// - `Error::DeviceRejected` if the device answers `success = false`
    /// - `Error::SessionClosed` if the session closes while pending
    pub async fn send(
        &self,
        controller_id: &ControllerId,
        epoch: Uuid,
        sender: &mpsc::UnboundedSender<Message>,
        kind: CommandKind,
        cell_id: CellId,
        package_id: Option<PackageId>,
        timeout: Duration,
    ) -> Result<()> {
        let request_id = RequestId::generate(controller_id, kind);
        let command = match kind {
            CommandKind::Unlock => Message::Unlock {
                request_id: request_id.clone(),
                cell_id: cell_id.clone(),
            },
            CommandKind::Lock => Message::Lock {
                request_id: request_id.clone(),
                cell_id: cell_id.clone(),
                package_id,
            },
        };

        let (resolve_tx, mut resolve_rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            PendingRequest {
                controller_id: controller_id.clone(),
                epoch,
                issued_at: Instant::now(),
                command: command.clone(),
                resolve_tx,
            },
        );

        if sender.send(command).is_err() {
            // Writer already gone; withdraw the entry we just parked.
            self.pending.remove(&request_id);
            return Err(Error::NotConnected(controller_id.to_string()));
        }

        trace!(
            controller = %controller_id,
            request_id = %request_id,
            command = %kind,
            "Command sent; awaiting response"
        );

        match tokio::time::timeout(timeout, &mut resolve_rx).await {
            Ok(Ok(resolution)) => self.conclude(controller_id, &request_id, resolution),
            Ok(Err(_)) => {
                // Sender dropped without resolving; treat as session loss.
                self.pending.remove(&request_id);
                Err(Error::SessionClosed(controller_id.to_string()))
            }
            Err(_elapsed) => {
                match self.pending.remove(&request_id) {
                    Some((_, stale)) => {
                        warn!(
                            controller = %controller_id,
                            request_id = %request_id,
                            elapsed = ?stale.issued_at.elapsed(),
                            command = ?stale.command,
                            "Command timed out"
                        );
                        Err(Error::CommandTimeout {
                            request_id: request_id.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                    None => {
                        // The response won the removal race just as the timer
                        // fired; its resolution is already in the channel.
                        match (&mut resolve_rx).await {
                            Ok(resolution) => {
                                self.conclude(controller_id, &request_id, resolution)
                            }
                            Err(_) => Err(Error::SessionClosed(controller_id.to_string())),
                        }
                    }
                }
            }
        }
    }

    fn conclude(
        &self,
        controller_id: &ControllerId,
        request_id: &RequestId,
        resolution: Resolution,
    ) -> Result<()> {
        match resolution {
            Resolution::Replied { success: true, .. } => Ok(()),
            Resolution::Replied { success: false, cell_id } => Err(Error::DeviceRejected {
                request_id: request_id.to_string(),
                cell_id: cell_id.to_string(),
            }),
            Resolution::SessionClosed => Err(Error::SessionClosed(controller_id.to_string())),
        }
    }

    /// Resolve a pending request from an inbound device response.
    ///
    /// Returns `true` if a pending entry was found and resolved. Unknown or
    /// already-resolved ids are logged and dropped without side effects.
    pub fn resolve(&self, request_id: &RequestId, success: bool, cell_id: CellId) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                debug!(
                    controller = %pending.controller_id,
                    request_id = %request_id,
                    success,
                    elapsed = ?pending.issued_at.elapsed(),
                    "Response correlated"
                );
                // Receiver may already be gone if the caller gave up; that
                // race still counts as the single resolution.
                let _ = pending
                    .resolve_tx
                    .send(Resolution::Replied { success, cell_id });
                true
            }
            None => {
                debug!(request_id = %request_id, "Dropping response for unknown or resolved request");
                false
            }
        }
    }

    /// Fail every pending request issued against one session, immediately.
    ///
    /// Only entries matching the closing session's `epoch` are cancelled,
    /// so commands already in flight against a replacement session are
    /// untouched. Returns the number of requests cancelled.
    pub fn fail_all_for(&self, controller_id: &ControllerId, epoch: Uuid) -> usize {
        let doomed: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|e| e.controller_id == *controller_id && e.epoch == epoch)
            .map(|e| e.key().clone())
            .collect();

        let mut cancelled = 0;
        for request_id in doomed {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.resolve_tx.send(Resolution::SessionClosed);
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(
                controller = %controller_id,
                cancelled,
                "Cancelled pending requests for closed session"
            );
        }
        cancelled
    }

    /// Number of requests currently awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc1() -> ControllerId {
        ControllerId::new("LOC1").unwrap()
    }

    fn a1() -> CellId {
        CellId::new("A1").unwrap()
    }

    /// Pull the request id out of the command frame the correlator sent.
    async fn sent_request_id(rx: &mut mpsc::UnboundedReceiver<Message>) -> RequestId {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no outbound frame")
            .expect("channel closed");
        match frame {
            Message::Unlock { request_id, .. } | Message::Lock { request_id, .. } => request_id,
            other => panic!("unexpected outbound frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_resolves_pending_request() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let epoch = Uuid::new_v4();

        let fut = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(
                        &loc1(),
                        epoch,
                        &tx,
                        CommandKind::Unlock,
                        a1(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        // Wait for the outbound frame, then answer it.
        let request_id = sent_request_id(&mut rx).await;
        assert!(correlator.resolve(&request_id, true, a1()));

        fut.await.unwrap().unwrap();
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry_and_reports_elapsed_deadline() {
        let correlator = RequestCorrelator::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = correlator
            .send(
                &loc1(),
                Uuid::new_v4(),
                &tx,
                CommandKind::Unlock,
                a1(),
                None,
                Duration::from_millis(5000),
            )
            .await;

        assert!(matches!(
            result,
            Err(Error::CommandTimeout { timeout_ms: 5000, .. })
        ));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn rejection_is_distinct_from_timeout() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let fut = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(
                        &loc1(),
                        Uuid::new_v4(),
                        &tx,
                        CommandKind::Lock,
                        a1(),
                        Some(PackageId::new("PKG99").unwrap()),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let request_id = sent_request_id(&mut rx).await;
        correlator.resolve(&request_id, false, a1());

        let err = fut.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DeviceRejected { .. }));
    }

    #[tokio::test]
    async fn unknown_response_does_not_disturb_other_pending() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let epoch = Uuid::new_v4();

        let fut = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(
                        &loc1(),
                        epoch,
                        &tx,
                        CommandKind::Unlock,
                        a1(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let real_id = sent_request_id(&mut rx).await;

        // A response with a fabricated id is dropped...
        let bogus = RequestId::from_wire("LOC1:unlock:0:999999".to_string());
        assert!(!correlator.resolve(&bogus, true, a1()));
        assert_eq!(correlator.pending_count(), 1);

        // ...and the real request still resolves normally.
        assert!(correlator.resolve(&real_id, true, a1()));
        fut.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_resolution_is_a_noop() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let fut = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send(
                        &loc1(),
                        Uuid::new_v4(),
                        &tx,
                        CommandKind::Unlock,
                        a1(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        let request_id = sent_request_id(&mut rx).await;

        assert!(correlator.resolve(&request_id, true, a1()));
        assert!(!correlator.resolve(&request_id, false, a1()));

        // The first resolution wins: the caller sees success.
        fut.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_close_fails_pending_requests_immediately() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let epoch = Uuid::new_v4();

        let futs: Vec<_> = (0..2)
            .map(|_| {
                let correlator = correlator.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    correlator
                        .send(
                            &loc1(),
                            epoch,
                            &tx,
                            CommandKind::Unlock,
                            a1(),
                            None,
                            Duration::from_secs(60),
                        )
                        .await
                })
            })
            .collect();

        while correlator.pending_count() < 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(correlator.fail_all_for(&loc1(), epoch), 2);

        for fut in futs {
            let err = tokio::time::timeout(Duration::from_millis(100), fut)
                .await
                .expect("cancellation should be immediate")
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, Error::SessionClosed(_)));
        }
    }

    #[tokio::test]
    async fn fail_all_respects_session_epoch() {
        let correlator = std::sync::Arc::new(RequestCorrelator::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let old_epoch = Uuid::new_v4();
        let new_epoch = Uuid::new_v4();

        let fut = {
            let correlator = correlator.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                correlator
                    .send(
                        &loc1(),
                        new_epoch,
                        &tx,
                        CommandKind::Unlock,
                        a1(),
                        None,
                        Duration::from_secs(5),
                    )
                    .await
            })
        };

        while correlator.pending_count() < 1 {
            tokio::task::yield_now().await;
        }
        // Closing the *old* session must not cancel the new session's request.
        assert_eq!(correlator.fail_all_for(&loc1(), old_epoch), 0);
        assert_eq!(correlator.pending_count(), 1);

        assert_eq!(correlator.fail_all_for(&loc1(), new_epoch), 1);
        let err = fut.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
    }

    #[tokio::test]
    async fn dead_channel_reports_not_connected_without_parking() {
        let correlator = RequestCorrelator::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let err = correlator
            .send(
                &loc1(),
                Uuid::new_v4(),
                &tx,
                CommandKind::Unlock,
                a1(),
                None,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotConnected(_)));
        assert_eq!(correlator.pending_count(), 0);
    }
}
