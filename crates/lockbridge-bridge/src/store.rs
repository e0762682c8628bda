//! Persistence seam for projected cell state.
//!
//! The bridge does not implement durable storage; it records every cell
//! mutation through this trait so an external collaborator can. Recording
//! is fire-and-forget from the projector's point of view: a store that can
//! fail should log and retry internally rather than stall state projection.

use lockbridge_core::{CellId, CellState, ControllerId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Sink for durable cell-state records.
pub trait CellStateStore: Send + Sync {
    /// Record the latest state of one cell.
    fn record_cell(&self, controller_id: &ControllerId, cell_id: &CellId, state: &CellState);
}

/// Store that discards every record; the default when no collaborator is
/// wired in.
pub struct NoopStore;

impl CellStateStore for NoopStore {
    fn record_cell(&self, _controller_id: &ControllerId, _cell_id: &CellId, _state: &CellState) {}
}

/// In-memory store keeping the latest record per cell. Used in tests to
/// assert what the projector handed to persistence.
pub struct MemoryStore {
    records: Mutex<HashMap<(ControllerId, CellId), CellState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Latest recorded state for a cell, if any.
    pub fn get(&self, controller_id: &ControllerId, cell_id: &CellId) -> Option<CellState> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(&(controller_id.clone(), cell_id.clone()))
            .cloned()
    }

    /// Number of distinct cells recorded.
    pub fn len(&self) -> usize {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CellStateStore for MemoryStore {
    fn record_cell(&self, controller_id: &ControllerId, cell_id: &CellId, state: &CellState) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert((controller_id.clone(), cell_id.clone()), state.clone());
    }
}
