//! State projector.
//!
//! Maintains the authoritative in-memory view of
//! `{controller -> {cell -> CellState}}` derived from device messages, and
//! broadcasts full snapshots to subscribed observers on every mutation
//! (push) and on a fixed interval (backstop, driven by the server).
//!
//! # Ordering
//!
//! Cell pushes are applied in arrival order and overwrite wholesale; the
//! devices are the sole source of truth for their own cells, so there is
//! no merge and no timestamp arbitration. An evicted controller flips to
//! offline but its last-known cells are retained so observers can still
//! see what was last inside each compartment.

use crate::observers::ObserverHub;
use crate::store::CellStateStore;
use chrono::{DateTime, Utc};
use lockbridge_core::{CellId, CellState, ControllerId, PackageId};
use lockbridge_protocol::{CellReport, ControllerSnapshot, Message};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

struct ControllerEntry {
    is_online: bool,
    last_seen: DateTime<Utc>,
    cells: HashMap<CellId, CellState>,
}

/// Projected aggregate state of every known controller.
pub struct StateProjector {
    lockers: RwLock<HashMap<ControllerId, ControllerEntry>>,
    hub: Arc<ObserverHub>,
    store: Arc<dyn CellStateStore>,
}

impl StateProjector {
    pub fn new(hub: Arc<ObserverHub>, store: Arc<dyn CellStateStore>) -> Self {
        Self {
            lockers: RwLock::new(HashMap::new()),
            hub,
            store,
        }
    }

    /// Mark a controller online, creating its entry on first registration.
    ///
    /// Broadcasts the updated snapshot.
    pub fn mark_online(&self, controller_id: &ControllerId) {
        {
            let mut lockers = self.lockers.write().unwrap_or_else(|e| e.into_inner());
            let entry = lockers
                .entry(controller_id.clone())
                .or_insert_with(|| ControllerEntry {
                    is_online: true,
                    last_seen: Utc::now(),
                    cells: HashMap::new(),
                });
            entry.is_online = true;
            entry.last_seen = Utc::now();
        }
        debug!(controller = %controller_id, "Controller online");
        self.broadcast_now();
    }

    /// Mark a controller offline, retaining its last-known cells.
    ///
    /// No-op for controllers that never registered. Broadcasts on change.
    pub fn mark_offline(&self, controller_id: &ControllerId) {
        let changed = {
            let mut lockers = self.lockers.write().unwrap_or_else(|e| e.into_inner());
            match lockers.get_mut(controller_id) {
                Some(entry) if entry.is_online => {
                    entry.is_online = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            debug!(controller = %controller_id, "Controller offline");
            self.broadcast_now();
        }
    }

    /// Refresh a controller's last-seen timestamp without broadcasting.
    ///
    /// Called for every inbound device frame.
    pub fn touch(&self, controller_id: &ControllerId) {
        let mut lockers = self.lockers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = lockers.get_mut(controller_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Apply a device cell-map push, overwriting each reported cell.
    ///
    /// Reports for a controller that never registered are dropped; the
    /// snapshot must never grow cells for unknown controllers.
    pub fn apply_reports(&self, controller_id: &ControllerId, reports: HashMap<CellId, CellReport>) {
        let applied = {
            let mut lockers = self.lockers.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = lockers.get_mut(controller_id) else {
                warn!(controller = %controller_id, "Dropping cell report for unregistered controller");
                return;
            };
            entry.last_seen = Utc::now();
            let mut applied = Vec::with_capacity(reports.len());
            for (cell_id, report) in reports {
                let state = report.into_state();
                entry.cells.insert(cell_id.clone(), state.clone());
                applied.push((cell_id, state));
            }
            applied
        };

        for (cell_id, state) in &applied {
            self.store.record_cell(controller_id, cell_id, state);
        }
        debug!(controller = %controller_id, cells = applied.len(), "Applied device cell update");
        self.broadcast_now();
    }

    /// Record the optimistic result of an accepted command for one cell.
    ///
    /// Dropped, like device reports, if the controller is unknown.
    pub fn apply_cell(&self, controller_id: &ControllerId, cell_id: &CellId, state: CellState) {
        {
            let mut lockers = self.lockers.write().unwrap_or_else(|e| e.into_inner());
            let Some(entry) = lockers.get_mut(controller_id) else {
                warn!(controller = %controller_id, "Dropping cell state for unregistered controller");
                return;
            };
            entry.cells.insert(cell_id.clone(), state.clone());
        }
        self.store.record_cell(controller_id, cell_id, &state);
        debug!(controller = %controller_id, cell = %cell_id, "Applied optimistic cell state");
        self.broadcast_now();
    }

    /// Package currently projected for a cell, if any.
    pub fn current_package(
        &self,
        controller_id: &ControllerId,
        cell_id: &CellId,
    ) -> Option<PackageId> {
        let lockers = self.lockers.read().unwrap_or_else(|e| e.into_inner());
        lockers
            .get(controller_id)
            .and_then(|entry| entry.cells.get(cell_id))
            .and_then(|state| state.package_id.clone())
    }

    /// Full read-only snapshot, safe for concurrent broadcast.
    pub fn snapshot(&self) -> HashMap<ControllerId, ControllerSnapshot> {
        let lockers = self.lockers.read().unwrap_or_else(|e| e.into_inner());
        lockers
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    ControllerSnapshot {
                        is_online: entry.is_online,
                        last_seen: entry.last_seen,
                        cells: entry.cells.clone(),
                    },
                )
            })
            .collect()
    }

    /// Build the observer-facing update frame for the current state.
    pub fn locker_update(&self) -> Message {
        Message::LockerUpdate {
            lockers: self.snapshot(),
            timestamp: Utc::now(),
        }
    }

    /// Broadcast the current snapshot to every observer.
    pub fn broadcast_now(&self) {
        if self.hub.count() > 0 {
            self.hub.broadcast(&self.locker_update());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NoopStore};
    use tokio::sync::mpsc;

    fn loc1() -> ControllerId {
        ControllerId::new("LOC1").unwrap()
    }

    fn a1() -> CellId {
        CellId::new("A1").unwrap()
    }

    fn report(locked: bool, opened: bool, package: Option<&str>) -> CellReport {
        CellReport {
            locked,
            opened,
            package_id: package.map(|p| PackageId::new(p).unwrap()),
        }
    }

    fn projector() -> StateProjector {
        StateProjector::new(Arc::new(ObserverHub::new()), Arc::new(NoopStore))
    }

    #[test]
    fn snapshot_never_contains_unregistered_controllers() {
        let projector = projector();
        let mut reports = HashMap::new();
        reports.insert(a1(), report(true, false, None));

        // No mark_online happened for LOC1.
        projector.apply_reports(&loc1(), reports);
        assert!(projector.snapshot().is_empty());
    }

    #[test]
    fn apply_overwrites_wholesale() {
        let projector = projector();
        projector.mark_online(&loc1());

        let mut first = HashMap::new();
        first.insert(a1(), report(true, false, Some("PKG1")));
        projector.apply_reports(&loc1(), first);

        let mut second = HashMap::new();
        second.insert(a1(), report(false, true, None));
        projector.apply_reports(&loc1(), second);

        let snapshot = projector.snapshot();
        let cell = &snapshot[&loc1()].cells[&a1()];
        assert!(!cell.locked);
        assert!(cell.opened);
        assert!(cell.package_id.is_none(), "overwrite must not merge old package");
    }

    #[test]
    fn applying_same_update_twice_is_idempotent() {
        let projector = projector();
        projector.mark_online(&loc1());

        let mut reports = HashMap::new();
        reports.insert(a1(), report(true, false, Some("PKG9")));
        projector.apply_reports(&loc1(), reports.clone());
        let first = projector.snapshot();
        projector.apply_reports(&loc1(), reports);
        let second = projector.snapshot();

        let a = &first[&loc1()].cells[&a1()];
        let b = &second[&loc1()].cells[&a1()];
        assert_eq!(a.locked, b.locked);
        assert_eq!(a.opened, b.opened);
        assert_eq!(a.package_id, b.package_id);
    }

    #[test]
    fn offline_retains_last_known_cells() {
        let projector = projector();
        projector.mark_online(&loc1());
        let mut reports = HashMap::new();
        reports.insert(a1(), report(true, false, Some("PKG5")));
        projector.apply_reports(&loc1(), reports);

        projector.mark_offline(&loc1());

        let snapshot = projector.snapshot();
        let entry = &snapshot[&loc1()];
        assert!(!entry.is_online);
        assert_eq!(
            entry.cells[&a1()].package_id,
            Some(PackageId::new("PKG5").unwrap())
        );
    }

    #[test]
    fn mutations_broadcast_to_observers() {
        let hub = Arc::new(ObserverHub::new());
        let projector = StateProjector::new(hub.clone(), Arc::new(NoopStore));
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.subscribe(tx);

        projector.mark_online(&loc1());

        let Message::LockerUpdate { lockers, .. } = rx.try_recv().unwrap() else {
            panic!("expected lockerUpdate");
        };
        assert!(lockers[&loc1()].is_online);
    }

    #[test]
    fn mutations_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let projector = StateProjector::new(Arc::new(ObserverHub::new()), store.clone());
        projector.mark_online(&loc1());

        let mut reports = HashMap::new();
        reports.insert(a1(), report(true, false, Some("PKG7")));
        projector.apply_reports(&loc1(), reports);

        let recorded = store.get(&loc1(), &a1()).unwrap();
        assert!(recorded.locked);
        assert_eq!(recorded.package_id, Some(PackageId::new("PKG7").unwrap()));
    }

    #[test]
    fn reconnect_flips_back_online_without_losing_cells() {
        let projector = projector();
        projector.mark_online(&loc1());
        let mut reports = HashMap::new();
        reports.insert(a1(), report(true, false, None));
        projector.apply_reports(&loc1(), reports);
        projector.mark_offline(&loc1());

        projector.mark_online(&loc1());

        let snapshot = projector.snapshot();
        assert!(snapshot[&loc1()].is_online);
        assert_eq!(snapshot[&loc1()].cells.len(), 1);
    }
}
