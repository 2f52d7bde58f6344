//! Broadcast progress snapshots (spec §9 design note: "the target uses a
//! broadcast channel of immutable progress snapshots, one per event").
//!
//! Generalizes the teacher's `EarlyReply`/`Reply` split
//! (`src/message_types.rs`) from "per-connection reply channel" to
//! "process-wide fan-out": every subscriber gets every event over a
//! `tokio::sync::broadcast` channel, and because every snapshot is
//! self-contained and the underlying state is idempotent, a subscriber that
//! misses an update (lagged receiver) can simply requery status - matching
//! spec §6 "missed updates are safe."

use tokio::sync::broadcast;

use crate::model::{RunStatus, SyncDirection, SyncPairId};

/// Phase weights from spec §4.5: scan 15%, calc 5%, checksum 10%, sync 60%,
/// verify 10%.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Scanning,
    Calculating,
    Checksumming,
    Resolving,
    Syncing,
    Verifying,
    Completed,
}

impl SyncPhase {
    pub fn weight_percent(&self) -> f64 {
        match self {
            SyncPhase::Scanning => 15.0,
            SyncPhase::Calculating => 5.0,
            SyncPhase::Checksumming => 10.0,
            SyncPhase::Resolving => 0.0,
            SyncPhase::Syncing => 60.0,
            SyncPhase::Verifying => 10.0,
            SyncPhase::Completed => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncProgressInfo {
    pub run_id: u64,
    pub sync_pair_id: SyncPairId,
    pub direction: SyncDirection,
    pub phase: SyncPhase,
    pub phase_fraction_complete: f64,
    pub overall_percent: f64,
    pub files_done: u64,
    pub files_total: u64,
}

#[derive(Debug, Clone)]
pub struct IndexProgress {
    pub sync_pair_id: SyncPairId,
    pub entries_seen: u64,
    pub bytes_seen: u64,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct EvictionProgress {
    pub sync_pair_id: SyncPairId,
    pub bytes_freed: u64,
    pub bytes_target: u64,
    pub files_evicted: u64,
    pub done: bool,
}

#[derive(Debug, Clone)]
pub struct SyncStatusChanged {
    pub sync_pair_id: SyncPairId,
    pub run_id: u64,
    pub status: RunStatus,
}

/// One fan-out event (spec §6 streaming events:
/// `syncProgress`/`syncStatusChanged`/`indexReady`/`configUpdated`/
/// `stateChanged`).
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    SyncProgress(SyncProgressInfo),
    SyncStatusChanged(SyncStatusChanged),
    IndexReady(IndexProgress),
    EvictionProgress(EvictionProgress),
    ConfigUpdated,
    StateChanged { sync_pair_id: SyncPairId, mounted: bool },
}

/// Shared broadcast bus. Cloning is cheap (it clones the sender handle);
/// every component that needs to publish progress holds one.
#[derive(Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        ProgressBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish: no subscribers is not an error (spec §6,
    /// subscribers are optional observers, never required for correctness).
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
