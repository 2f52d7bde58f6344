//! Core data model (spec §3): [`FileEntry`], [`SyncPair`], [`SyncHistory`],
//! [`SyncStatistics`], [`DirtyFile`], [`SyncPlan`] and [`ConflictInfo`].
//!
//! These are plain records; invariants are enforced by the components that
//! construct them ([`crate::store`] for `FileEntry`, [`crate::sync`] for
//! `SyncPlan`), not by the types themselves, mirroring the teacher's
//! `vfs::file::Attr`-style "dumb struct" records.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// Identifier for a configured sync pair (spec §3 `SyncPair.id`).
pub type SyncPairId = u32;

/// Lock timeout from spec §3/§5: a `syncLocked` entry older than this is
/// treated as expired and reclaimed.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// VFS open(write) wait for an unlock before returning `EBUSY` (spec §5).
pub const WRITE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Chunk size used for both cancellation checks and checksum/copy I/O
/// (spec §4.5, §5).
pub const IO_CHUNK_BYTES: usize = 64 * 1024;

/// Where a [`FileEntry`] currently resides (spec §3 `location`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    NotExists,
    LocalOnly,
    ExternalOnly,
    Both,
}

/// Direction a sync lock is held for (spec §3 `lockDirection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDirection {
    LocalToExternal,
    ExternalToLocal,
}

/// Per-entry lock state (spec §3 `lockState`/`lockTime`/`lockDirection`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    SyncLocked { since: SystemTimestamp, direction: LockDirection },
}

/// `SystemTime` is not directly `Serialize`; store as epoch-nanos, matching
/// the teacher's own `file::Time { seconds, nanos }` split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemTimestamp(pub u128);

impl SystemTimestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn elapsed(&self) -> Duration {
        let now = SystemTimestamp::now().0;
        Duration::from_nanos(now.saturating_sub(self.0).min(u64::MAX as u128) as u64)
    }

    pub fn duration_since(&self, earlier: SystemTimestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0).min(u64::MAX as u128) as u64)
    }

    pub fn abs_diff(&self, other: SystemTimestamp) -> Duration {
        let diff = self.0.abs_diff(other.0);
        Duration::from_nanos(diff.min(u64::MAX as u128) as u64)
    }
}

impl From<SystemTime> for SystemTimestamp {
    fn from(t: SystemTime) -> Self {
        let nanos =
            t.duration_since(SystemTime::UNIX_EPOCH).unwrap_or(Duration::ZERO).as_nanos();
        SystemTimestamp(nanos)
    }
}

/// The central record, keyed by `(syncPairId, virtualPath)` (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub sync_pair_id: SyncPairId,
    /// Never starts with `/`, never contains `..` or `//` (validated by
    /// [`crate::path_guard`] before this record is ever constructed).
    pub virtual_path: String,
    pub local_path: Option<PathBuf>,
    pub external_path: Option<PathBuf>,
    pub location: Location,
    pub size: u64,
    pub created_at: SystemTimestamp,
    pub modified_at: SystemTimestamp,
    pub accessed_at: SystemTimestamp,
    pub checksum: Option<String>,
    pub is_dirty: bool,
    pub is_directory: bool,
    pub lock_state: LockState,
}

impl FileEntry {
    /// A brand-new, not-yet-placed entry.
    pub fn new(sync_pair_id: SyncPairId, virtual_path: String, is_directory: bool) -> Self {
        let now = SystemTimestamp::now();
        FileEntry {
            sync_pair_id,
            virtual_path,
            local_path: None,
            external_path: None,
            location: Location::NotExists,
            size: 0,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            checksum: None,
            is_dirty: false,
            is_directory,
            lock_state: LockState::Unlocked,
        }
    }

    /// Spec §3 invariant 1: location is consistent with which paths are set.
    pub fn location_consistent(&self) -> bool {
        match self.location {
            Location::NotExists => self.local_path.is_none() && self.external_path.is_none(),
            Location::LocalOnly => self.local_path.is_some() && self.external_path.is_none(),
            Location::ExternalOnly => self.local_path.is_none() && self.external_path.is_some(),
            Location::Both => self.local_path.is_some() && self.external_path.is_some(),
        }
    }

    /// Spec §3 invariant 2: only a local copy can be dirty.
    pub fn dirty_consistent(&self) -> bool {
        !self.is_dirty || matches!(self.location, Location::LocalOnly | Location::Both)
    }

    /// Spec §3 invariant: a `syncLocked` entry older than `LOCK_TIMEOUT` is
    /// expired and should be treated as `Unlocked` by the reader.
    pub fn effective_lock_state(&self) -> LockState {
        if let LockState::SyncLocked { since, direction } = self.lock_state {
            if since.elapsed() < LOCK_TIMEOUT {
                return LockState::SyncLocked { since, direction };
            }
        }
        LockState::Unlocked
    }

    pub fn is_evictable(&self) -> bool {
        matches!(self.location, Location::Both)
            && !self.is_dirty
            && matches!(self.effective_lock_state(), LockState::Unlocked)
    }
}

/// Configuration-supplied tuple describing a mirrored pair (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPair {
    pub id: SyncPairId,
    pub disk_id: String,
    pub local_dir: PathBuf,
    pub external_relative_path: String,
    pub direction: SyncDirection,
    pub create_symlink: bool,
    pub enabled: bool,
    pub max_local_cache_size: u64,
    pub auto_eviction_enabled: bool,
    pub target_free_space: u64,
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    LocalToExternal,
    ExternalToLocal,
    Bidirectional,
}

impl SyncDirection {
    pub fn allows_pull(&self) -> bool {
        matches!(self, SyncDirection::ExternalToLocal | SyncDirection::Bidirectional)
    }

    pub fn allows_push(&self) -> bool {
        matches!(self, SyncDirection::LocalToExternal | SyncDirection::Bidirectional)
    }
}

/// Append-only per-run record (spec §3 `SyncHistory`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: u64,
    pub sync_pair_id: SyncPairId,
    pub disk_id: String,
    pub started_at: SystemTimestamp,
    pub completed_at: Option<SystemTimestamp>,
    pub status: RunStatus,
    pub direction: SyncDirection,
    pub files_count: u64,
    pub total_size: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

/// Per-(day, syncPair) aggregate (spec §3 `SyncStatistics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub date: String,
    pub sync_pair_id: SyncPairId,
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub avg_duration: Duration,
}

impl SyncStatistics {
    pub fn empty(date: String, sync_pair_id: SyncPairId) -> Self {
        SyncStatistics {
            date,
            sync_pair_id,
            runs: 0,
            successes: 0,
            failures: 0,
            total_files: 0,
            total_bytes: 0,
            avg_duration: Duration::ZERO,
        }
    }

    /// Incremental running average: `avgₙ = (avgₙ₋₁·(n−1) + durationₙ) / n`.
    pub fn record_run(&mut self, success: bool, files: u64, bytes: u64, duration: Duration) {
        self.runs += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_files += files;
        self.total_bytes += bytes;
        let n = self.runs;
        let prev_total = self.avg_duration.as_secs_f64() * (n - 1) as f64;
        let new_avg = (prev_total + duration.as_secs_f64()) / n as f64;
        self.avg_duration = Duration::from_secs_f64(new_avg.max(0.0));
    }
}

/// Transient queue entry awaiting sync (spec §3 `DirtyFile`).
#[derive(Debug, Clone)]
pub struct DirtyFile {
    pub virtual_path: String,
    pub local_path: PathBuf,
    pub created_at: SystemTimestamp,
    pub modified_at: SystemTimestamp,
    pub sync_attempts: u32,
    pub last_sync_error: Option<String>,
}

/// Action variants produced by the planner (spec §3 `SyncPlan`).
#[derive(Debug, Clone)]
pub enum SyncAction {
    Copy { relative_path: String },
    Update { relative_path: String },
    Delete { relative_path: String },
    CreateDirectory { relative_path: String },
    CreateSymlink { relative_path: String, target: PathBuf },
    ResolveConflict { relative_path: String },
    Skip { relative_path: String, reason: String },
}

impl SyncAction {
    pub fn relative_path(&self) -> &str {
        match self {
            SyncAction::Copy { relative_path }
            | SyncAction::Update { relative_path }
            | SyncAction::Delete { relative_path }
            | SyncAction::CreateDirectory { relative_path }
            | SyncAction::CreateSymlink { relative_path, .. }
            | SyncAction::ResolveConflict { relative_path }
            | SyncAction::Skip { relative_path, .. } => relative_path,
        }
    }
}

/// Constructed per run, not persisted (spec §3 `SyncPlan`).
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub id: u64,
    pub sync_pair_id: SyncPairId,
    pub direction: SyncDirection,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub actions: Vec<SyncAction>,
    pub conflicts: Vec<ConflictInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    BothModified,
    DeletedOnLocal,
    DeletedOnExternal,
    TypeChanged,
    PermissionConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    KeepLocal,
    KeepExternal,
    LocalWinsWithBackup,
    ExternalWinsWithBackup,
    KeepBoth,
    Skip,
}

#[derive(Debug, Clone, Copy)]
pub struct SideMeta {
    pub size: u64,
    pub mtime: SystemTimestamp,
}

#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub relative_path: String,
    pub local_meta: Option<SideMeta>,
    pub external_meta: Option<SideMeta>,
    pub conflict_type: ConflictType,
    pub resolution: Option<ConflictResolution>,
}

/// Configured strategy a bidirectional pair resolves `bothModified`
/// conflicts with (spec §4.5 phase 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    KeepLocal,
    KeepExternal,
    LocalWinsWithBackup,
    ExternalWinsWithBackup,
    KeepBoth,
    Skip,
    NewerWins,
}

/// Cache eviction ordering strategies (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionStrategy {
    ModifiedTime,
    AccessTime,
    SizeFirst,
}
