//! RPC surface (spec §6). Generalizes the teacher's `message_types.rs`
//! `Procedure`/`Command`/`Reply`/`ProcResult` tagged-message pattern: the
//! "many interfaces" a settings UI, a menu-bar process, and a mount-event
//! listener would otherwise need collapse to one `Request` enum with one
//! variant per method and one `Response` enum, dispatched by
//! [`crate::coordinator::Coordinator`] (spec §9 "Dynamic polymorphism /
//! protocols").

use std::path::PathBuf;

use crate::error::SyncError;
use crate::model::{FileEntry, RunStatus, SyncHistory, SyncPairId, SyncStatistics};
use crate::progress::SyncProgressInfo;

#[derive(Debug, Clone)]
pub struct MountInfo {
    pub sync_pair_id: SyncPairId,
    pub target_dir: PathBuf,
    pub mounted: bool,
}

#[derive(Debug, Clone)]
pub struct IndexStats {
    pub sync_pair_id: SyncPairId,
    pub total_files: u64,
    pub total_directories: u64,
    pub total_bytes: u64,
    pub pending_inbound: u64,
}

/// One request per §6 method table entry.
#[derive(Debug, Clone)]
pub enum Request {
    Mount { sync_pair_id: SyncPairId, local_dir: PathBuf, external_dir: PathBuf, target_dir: PathBuf },
    Unmount { sync_pair_id: SyncPairId },
    UnmountAll,
    GetMountStatus { sync_pair_id: SyncPairId },
    GetAllMounts,
    GetFileStatus { sync_pair_id: SyncPairId, virtual_path: String },
    UpdateExternalPath { sync_pair_id: SyncPairId, new_path: PathBuf },
    SetExternalOffline { sync_pair_id: SyncPairId, offline: bool },
    SetReadOnly { sync_pair_id: SyncPairId, read_only: bool },
    RebuildIndex { sync_pair_id: SyncPairId },
    GetIndexStats { sync_pair_id: SyncPairId },
    SyncNow { sync_pair_id: SyncPairId },
    SyncAll,
    SyncFile { sync_pair_id: SyncPairId, virtual_path: String },
    PauseSync { sync_pair_id: SyncPairId },
    ResumeSync { sync_pair_id: SyncPairId },
    CancelSync { sync_pair_id: SyncPairId },
    GetSyncStatus { sync_pair_id: SyncPairId },
    GetAllSyncStatus,
    GetPendingQueue { sync_pair_id: SyncPairId },
    GetSyncProgress { sync_pair_id: SyncPairId },
    GetSyncHistory { sync_pair_id: SyncPairId, limit: usize },
    GetSyncStatistics { sync_pair_id: SyncPairId },
    GetDirtyFiles { sync_pair_id: SyncPairId },
    MarkFileDirty { sync_pair_id: SyncPairId, virtual_path: String },
    ClearFileDirty { sync_pair_id: SyncPairId, virtual_path: String },
    PrepareForShutdown,
    GetVersion,
    HealthCheck,
}

#[derive(Debug, Clone)]
pub enum Response {
    Unit,
    Bool(bool),
    MountInfos(Vec<MountInfo>),
    FileEntry(Option<FileEntry>),
    IndexStats(IndexStats),
    SyncHistory(Vec<SyncHistory>),
    SyncStatistics(Option<SyncStatistics>),
    DirtyFiles(Vec<crate::model::DirtyFile>),
    RunId(u64),
    RunStatus(Option<RunStatus>),
    SyncProgress(Option<SyncProgressInfo>),
    Version(String),
    Health { ok: bool, detail: String },
}

pub type RpcResult = Result<Response, SyncError>;
