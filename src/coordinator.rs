//! Top-level owner of every other component (spec §4.7).
//!
//! Generalizes the teacher's `message_types.rs` tagged-command pattern: one
//! [`Request`]/[`Response`] pair dispatched by [`Coordinator::handle`], with
//! streaming events (`syncProgress`, `syncStatusChanged`, `indexReady`,
//! `configUpdated`, `stateChanged`) fanned out on the shared [`ProgressBus`].
//! Debounce timers and the per-pair periodic sync schedule are the
//! Coordinator's own concern; everything else (planning, copying, eviction)
//! is delegated to [`SyncEngine`] and [`CacheEvictor`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{AdvancedConfig, CacheConfig, Config, FiltersConfig};
use crate::error::{Errno, SyncError, SyncResult};
use crate::evictor::CacheEvictor;
use crate::indexer::Indexer;
use crate::model::{ConflictStrategy, DirtyFile, FileEntry, RunStatus, SyncPair, SyncPairId};
use crate::progress::{ProgressBus, ProgressEvent, SyncProgressInfo};
use crate::rpc::{IndexStats, MountInfo, Request, Response, RpcResult};
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::vfs::{HostMount, NoopHostMount, VfsDispatcher};

/// Default interval for the per-pair periodic sync timer (SPEC_FULL.md
/// Coordinator, "periodic per-pair timer defaulting to 3600s").
const DEFAULT_PERIODIC_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

/// Bound on how long shutdown waits for in-flight runs to notice
/// cancellation before the store is flushed anyway (spec §4.7 shutdown
/// sequence).
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct DebounceHandle {
    task: JoinHandle<()>,
}

/// Mutable per-pair state that lives only in the Coordinator - mount
/// wiring, pause/offline flags, and the conflict strategy a run should use.
/// Not persisted: a restart remounts from config the same way the real
/// daemon would be told to by its settings UI.
struct PairRuntime {
    pair: SyncPair,
    target_dir: PathBuf,
    external_root: Option<PathBuf>,
    mounted: bool,
    external_offline: bool,
    read_only: bool,
    paused: bool,
    conflict_strategy: ConflictStrategy,
    /// Live while `mounted`: the dispatcher applications actually read and
    /// write through (spec §4.4 "for each sync pair it exposes a mount
    /// point"). Built in `mount()`, torn down in `unmount()`.
    vfs: Option<Arc<VfsDispatcher>>,
}

impl PairRuntime {
    fn effective_external_root(&self) -> Option<PathBuf> {
        if self.mounted && !self.external_offline {
            self.external_root.clone()
        } else {
            None
        }
    }
}

struct Inner {
    store: Arc<Store>,
    progress: ProgressBus,
    engine: SyncEngine,
    evictor: CacheEvictor,
    cache_config: CacheConfig,
    advanced: AdvancedConfig,
    filters: FiltersConfig,
    /// Binds each pair's `targetDir` to the host filesystem (spec §4.4,
    /// §9 "the VFS layer is the one unavoidable host integration"). A real
    /// FUSE/Dokan/NFS-loopback adapter is host integration left to a thin
    /// adapter crate; this process-wide default claims success without
    /// touching the host, matching `--foreground` debug runs.
    host_mount: Arc<dyn HostMount>,
    pairs: DashMap<SyncPairId, PairRuntime>,
    debounce: DashMap<SyncPairId, DebounceHandle>,
    last_progress: DashMap<SyncPairId, SyncProgressInfo>,
    last_status: DashMap<SyncPairId, (u64, RunStatus)>,
    shutting_down: AtomicBool,
    background_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Cheaply cloneable handle: every field inside `Inner` is itself shared, so
/// background tasks hold a `Coordinator` the same way they'd hold an `Arc`.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: Config, store: Arc<Store>, progress: ProgressBus) -> Self {
        Self::with_host_mount(config, store, progress, Arc::new(NoopHostMount))
    }

    /// As [`Coordinator::new`], but with an explicit [`HostMount`] binding -
    /// used by tests that need to observe mount/unmount calls (a real
    /// FUSE/Dokan/NFS-loopback binding is a thin adapter crate left outside
    /// this workspace; production callers get [`NoopHostMount`] from `new`).
    pub fn with_host_mount(
        config: Config,
        store: Arc<Store>,
        progress: ProgressBus,
        host_mount: Arc<dyn HostMount>,
    ) -> Self {
        let pairs = DashMap::new();
        for pair_config in &config.sync_pairs {
            let conflict_strategy = pair_config.conflict_strategy.unwrap_or(ConflictStrategy::NewerWins);
            let pair = pair_config.clone().into_sync_pair();
            let target_dir = pair.local_dir.clone();
            pairs.insert(
                pair.id,
                PairRuntime {
                    pair,
                    target_dir,
                    external_root: None,
                    mounted: false,
                    external_offline: false,
                    read_only: false,
                    paused: !config.general.auto_sync_enabled,
                    conflict_strategy,
                    vfs: None,
                },
            );
        }

        let engine = SyncEngine::new(store.clone(), progress.clone());
        let evictor = CacheEvictor::new(store.clone(), progress.clone());

        let inner = Arc::new(Inner {
            store,
            progress,
            engine,
            evictor,
            cache_config: config.cache,
            advanced: config.advanced,
            filters: config.filters,
            host_mount,
            pairs,
            debounce: DashMap::new(),
            last_progress: DashMap::new(),
            last_status: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            background_tasks: StdMutex::new(Vec::new()),
        });

        let coordinator = Coordinator { inner };
        coordinator.spawn_progress_mirror();
        coordinator.spawn_periodic_sync_timers();
        coordinator.spawn_eviction_loop();
        coordinator
    }

    /// Single dispatch point for every §6 RPC method.
    pub async fn handle(&self, request: Request) -> RpcResult {
        match request {
            Request::Mount { sync_pair_id, local_dir, external_dir, target_dir } => {
                self.mount(sync_pair_id, local_dir, external_dir, target_dir).await
            }
            Request::Unmount { sync_pair_id } => self.unmount(sync_pair_id).await,
            Request::UnmountAll => self.unmount_all().await,
            Request::GetMountStatus { sync_pair_id } => self.get_mount_status(sync_pair_id),
            Request::GetAllMounts => self.get_all_mounts(),
            Request::GetFileStatus { sync_pair_id, virtual_path } => {
                Ok(Response::FileEntry(self.inner.store.get_entry(sync_pair_id, &virtual_path)))
            }
            Request::UpdateExternalPath { sync_pair_id, new_path } => {
                self.update_external_path(sync_pair_id, new_path)
            }
            Request::SetExternalOffline { sync_pair_id, offline } => {
                self.set_external_offline(sync_pair_id, offline)
            }
            Request::SetReadOnly { sync_pair_id, read_only } => {
                self.with_runtime_mut(sync_pair_id, |rt| rt.read_only = read_only)
            }
            Request::RebuildIndex { sync_pair_id } => self.rebuild_index(sync_pair_id).await,
            Request::GetIndexStats { sync_pair_id } => self.index_stats_from_store(sync_pair_id),
            Request::SyncNow { sync_pair_id } => self.sync_now(sync_pair_id).await,
            Request::SyncAll => self.sync_all(),
            Request::SyncFile { sync_pair_id, virtual_path } => {
                self.sync_file(sync_pair_id, virtual_path).await
            }
            Request::PauseSync { sync_pair_id } => self.with_runtime_mut(sync_pair_id, |rt| rt.paused = true),
            Request::ResumeSync { sync_pair_id } => {
                let result = self.with_runtime_mut(sync_pair_id, |rt| rt.paused = false);
                if result.is_ok() {
                    self.schedule_debounced_sync(sync_pair_id);
                }
                result
            }
            Request::CancelSync { sync_pair_id } => {
                self.inner.engine.cancel(sync_pair_id);
                Ok(Response::Unit)
            }
            Request::GetSyncStatus { sync_pair_id } => Ok(Response::RunStatus(
                self.inner.last_status.get(&sync_pair_id).map(|s| s.1),
            )),
            Request::GetAllSyncStatus => Ok(Response::SyncHistory(self.latest_history_per_pair())),
            Request::GetPendingQueue { sync_pair_id } => {
                Ok(Response::DirtyFiles(self.dirty_files(sync_pair_id)))
            }
            Request::GetSyncProgress { sync_pair_id } => {
                Ok(Response::SyncProgress(self.inner.last_progress.get(&sync_pair_id).map(|p| p.clone())))
            }
            Request::GetSyncHistory { sync_pair_id, limit } => {
                Ok(Response::SyncHistory(self.inner.store.get_history(sync_pair_id, limit)))
            }
            Request::GetSyncStatistics { sync_pair_id } => {
                let date = crate::sync::date_key_now();
                Ok(Response::SyncStatistics(self.inner.store.get_statistics(sync_pair_id, &date)))
            }
            Request::GetDirtyFiles { sync_pair_id } => Ok(Response::DirtyFiles(self.dirty_files(sync_pair_id))),
            Request::MarkFileDirty { sync_pair_id, virtual_path } => {
                self.mark_file_dirty(sync_pair_id, virtual_path).await
            }
            Request::ClearFileDirty { sync_pair_id, virtual_path } => {
                self.inner.store.mark_clean(sync_pair_id, &virtual_path).await?;
                Ok(Response::Unit)
            }
            Request::PrepareForShutdown => {
                self.shutdown().await;
                Ok(Response::Unit)
            }
            Request::GetVersion => Ok(Response::Version(env!("CARGO_PKG_VERSION").to_string())),
            Request::HealthCheck => Ok(Response::Health {
                ok: true,
                detail: format!("{} sync pairs configured", self.inner.pairs.len()),
            }),
        }
    }

    fn refuse_if_shutting_down(&self) -> SyncResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::InvalidConfig("coordinator is shutting down".into()));
        }
        Ok(())
    }

    fn pair_not_found(sync_pair_id: SyncPairId) -> SyncError {
        SyncError::NotFound(format!("sync pair {sync_pair_id}"))
    }

    fn with_runtime_mut(&self, sync_pair_id: SyncPairId, f: impl FnOnce(&mut PairRuntime)) -> RpcResult {
        self.refuse_if_shutting_down()?;
        let mut rt = self
            .inner
            .pairs
            .get_mut(&sync_pair_id)
            .ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
        f(&mut rt);
        Ok(Response::Unit)
    }

    /// Starts the VFS for `sync_pair_id` (spec §6 "Starts VFS for the
    /// pair."): builds a [`VfsDispatcher`] bound to the pair's local/external
    /// roots, relays the `DirtyFile` events it publishes on write-close into
    /// the debounced sync scheduler (spec §4.4 "write/close"), and binds
    /// `target_dir` through the process's [`HostMount`].
    async fn mount(
        &self,
        sync_pair_id: SyncPairId,
        local_dir: PathBuf,
        external_dir: PathBuf,
        target_dir: PathBuf,
    ) -> RpcResult {
        self.refuse_if_shutting_down()?;

        let direction = {
            let mut rt = self
                .inner
                .pairs
                .get_mut(&sync_pair_id)
                .ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
            rt.pair.local_dir = local_dir.clone();
            rt.external_root = Some(external_dir.clone());
            rt.target_dir = target_dir.clone();
            rt.mounted = true;
            rt.pair.direction
        };

        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(VfsDispatcher::new(
            self.inner.store.clone(),
            sync_pair_id,
            local_dir,
            Some(external_dir),
            direction,
            Some(dirty_tx),
        ));
        self.inner
            .pairs
            .get_mut(&sync_pair_id)
            .ok_or_else(|| Self::pair_not_found(sync_pair_id))?
            .vfs = Some(dispatcher);
        self.spawn_dirty_file_relay(sync_pair_id, dirty_rx);

        self.inner
            .host_mount
            .mount(sync_pair_id, &target_dir)
            .await
            .map_err(Self::host_mount_error)?;

        tracing::info!(sync_pair_id, "sync pair mounted");
        self.inner.progress.publish(ProgressEvent::StateChanged { sync_pair_id, mounted: true });
        Ok(Response::Unit)
    }

    async fn unmount(&self, sync_pair_id: SyncPairId) -> RpcResult {
        self.refuse_if_shutting_down()?;
        {
            let mut rt = self
                .inner
                .pairs
                .get_mut(&sync_pair_id)
                .ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
            rt.mounted = false;
            rt.vfs = None;
        }
        self.inner
            .host_mount
            .unmount(sync_pair_id)
            .await
            .map_err(Self::host_mount_error)?;
        self.inner.progress.publish(ProgressEvent::StateChanged { sync_pair_id, mounted: false });
        Ok(Response::Unit)
    }

    async fn unmount_all(&self) -> RpcResult {
        let ids: Vec<SyncPairId> = self.inner.pairs.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unmount(id).await?;
        }
        Ok(Response::Unit)
    }

    fn host_mount_error(errno: Errno) -> SyncError {
        SyncError::Internal(format!("host mount operation failed: {errno:?}"))
    }

    /// Forwards each `DirtyFile` the dispatcher publishes on write-close
    /// into the same debounced scheduler a `markFileDirty` RPC uses (spec
    /// §4.7 "Each write-close ... enqueues a task keyed by `syncPairId`").
    fn spawn_dirty_file_relay(
        &self,
        sync_pair_id: SyncPairId,
        mut dirty_rx: mpsc::UnboundedReceiver<DirtyFile>,
    ) {
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            while dirty_rx.recv().await.is_some() {
                coordinator.schedule_debounced_sync(sync_pair_id);
            }
        });
        self.inner.background_tasks.lock().unwrap().push(task);
    }

    fn get_mount_status(&self, sync_pair_id: SyncPairId) -> RpcResult {
        let rt = self.inner.pairs.get(&sync_pair_id).ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
        Ok(Response::MountInfos(vec![MountInfo {
            sync_pair_id,
            target_dir: rt.target_dir.clone(),
            mounted: rt.mounted,
        }]))
    }

    fn get_all_mounts(&self) -> RpcResult {
        let infos = self
            .inner
            .pairs
            .iter()
            .map(|e| MountInfo { sync_pair_id: *e.key(), target_dir: e.target_dir.clone(), mounted: e.mounted })
            .collect();
        Ok(Response::MountInfos(infos))
    }

    fn update_external_path(&self, sync_pair_id: SyncPairId, new_path: PathBuf) -> RpcResult {
        self.with_runtime_mut(sync_pair_id, |rt| rt.external_root = Some(new_path))
    }

    fn set_external_offline(&self, sync_pair_id: SyncPairId, offline: bool) -> RpcResult {
        let mounted = {
            let mut rt = self
                .inner
                .pairs
                .get_mut(&sync_pair_id)
                .ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
            rt.external_offline = offline;
            rt.mounted
        };
        self.inner
            .progress
            .publish(ProgressEvent::StateChanged { sync_pair_id, mounted: mounted && !offline });
        if !offline {
            self.schedule_debounced_sync(sync_pair_id);
        }
        Ok(Response::Unit)
    }

    async fn rebuild_index(&self, sync_pair_id: SyncPairId) -> RpcResult {
        self.refuse_if_shutting_down()?;
        let (pair, external_root) = self.pair_snapshot(sync_pair_id)?;
        let indexer = Indexer::new(&self.inner.store, self.inner.progress.clone());
        let stats = indexer.rebuild(&pair, external_root.as_deref(), &self.inner.filters).await?;
        Ok(Response::IndexStats(stats))
    }

    /// Cheap view computed from what the Store already knows, without
    /// re-walking either tree (a disk walk is what `RebuildIndex` is for).
    fn index_stats_from_store(&self, sync_pair_id: SyncPairId) -> RpcResult {
        self.pair_snapshot(sync_pair_id)?;
        let entries = self.inner.store.list_pair(sync_pair_id);
        let mut stats = IndexStats {
            sync_pair_id,
            total_files: 0,
            total_directories: 0,
            total_bytes: 0,
            pending_inbound: 0,
        };
        for entry in entries {
            if entry.is_directory {
                stats.total_directories += 1;
            } else {
                stats.total_files += 1;
                stats.total_bytes += entry.size;
                if matches!(entry.location, crate::model::Location::ExternalOnly) {
                    stats.pending_inbound += 1;
                }
            }
        }
        Ok(Response::IndexStats(stats))
    }

    fn pair_snapshot(&self, sync_pair_id: SyncPairId) -> SyncResult<(SyncPair, Option<PathBuf>)> {
        let rt = self.inner.pairs.get(&sync_pair_id).ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
        Ok((rt.pair.clone(), rt.effective_external_root()))
    }

    /// Runs one sync for `sync_pair_id` to completion and records its
    /// outcome. `syncNow`/`syncFile` and the debounce/periodic schedulers
    /// all funnel through here so "last known status" stays consistent
    /// regardless of what triggered the run.
    async fn sync_now(&self, sync_pair_id: SyncPairId) -> RpcResult {
        self.refuse_if_shutting_down()?;
        let (pair, strategy, external_root, paused) = {
            let rt = self.inner.pairs.get(&sync_pair_id).ok_or_else(|| Self::pair_not_found(sync_pair_id))?;
            (rt.pair.clone(), rt.conflict_strategy, rt.effective_external_root(), rt.paused)
        };
        if paused {
            return Err(SyncError::InvalidConfig(format!("sync pair {sync_pair_id} is paused")));
        }

        let indexer = Indexer::new(&self.inner.store, self.inner.progress.clone());
        let outcome = self
            .inner
            .engine
            .run(&pair, external_root.as_deref(), &indexer, &self.inner.filters, strategy, true)
            .await?;
        self.inner.last_status.insert(sync_pair_id, (outcome.run_id, outcome.status));
        self.inner.progress.publish(ProgressEvent::SyncStatusChanged(crate::progress::SyncStatusChanged {
            sync_pair_id,
            run_id: outcome.run_id,
            status: outcome.status,
        }));
        Ok(Response::RunId(outcome.run_id))
    }

    /// Fans out, fire-and-forget: each pair serializes with itself via the
    /// SyncEngine's own per-pair lock, so nothing here needs to wait for the
    /// slowest pair before returning (spec §5 "runs queue, per pair").
    fn sync_all(&self) -> RpcResult {
        self.refuse_if_shutting_down()?;
        let ids: Vec<SyncPairId> = self.inner.pairs.iter().map(|e| *e.key()).collect();
        for id in ids {
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(err) = coordinator.sync_now(id).await {
                    tracing::warn!(sync_pair_id = id, %err, "syncAll: one pair failed");
                }
            });
        }
        Ok(Response::Unit)
    }

    /// The engine has no single-file execution path (spec §4.5 plans a
    /// whole pair at a time); marking the file dirty and running the pair
    /// is the closest honest mapping for this RPC.
    async fn sync_file(&self, sync_pair_id: SyncPairId, virtual_path: String) -> RpcResult {
        let mut entry = self
            .inner
            .store
            .get_entry(sync_pair_id, &virtual_path)
            .ok_or_else(|| SyncError::NotFound(virtual_path.clone()))?;
        entry.is_dirty = matches!(entry.location, crate::model::Location::LocalOnly | crate::model::Location::Both);
        self.inner.store.upsert_entry(entry).await?;
        self.sync_now(sync_pair_id).await
    }

    async fn mark_file_dirty(&self, sync_pair_id: SyncPairId, virtual_path: String) -> RpcResult {
        let mut entry = self
            .inner
            .store
            .get_entry(sync_pair_id, &virtual_path)
            .unwrap_or_else(|| FileEntry::new(sync_pair_id, virtual_path.clone(), false));
        entry.is_dirty = true;
        entry.modified_at = crate::model::SystemTimestamp::now();
        self.inner.store.upsert_entry(entry).await?;
        self.schedule_debounced_sync(sync_pair_id);
        Ok(Response::Unit)
    }

    fn dirty_files(&self, sync_pair_id: SyncPairId) -> Vec<DirtyFile> {
        self.inner
            .store
            .list_dirty(sync_pair_id)
            .into_iter()
            .map(|entry| DirtyFile {
                virtual_path: entry.virtual_path,
                local_path: entry.local_path.unwrap_or_default(),
                created_at: entry.created_at,
                modified_at: entry.modified_at,
                sync_attempts: 0,
                last_sync_error: None,
            })
            .collect()
    }

    fn latest_history_per_pair(&self) -> Vec<crate::model::SyncHistory> {
        self.inner
            .pairs
            .iter()
            .filter_map(|e| self.inner.store.get_history(*e.key(), 1).into_iter().next())
            .collect()
    }

    /// Debounced scheduling keyed by `syncPairId` (SPEC_FULL.md Coordinator:
    /// "`tokio::time` timers keyed by `syncPairId` in a
    /// `dashmap<SyncPairId, DebounceHandle>`"). Rescheduling aborts any
    /// pending timer for the same pair rather than letting both fire.
    fn schedule_debounced_sync(&self, sync_pair_id: SyncPairId) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let delay = Duration::from_millis(self.inner.advanced.debounce_delay);
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.inner.debounce.remove(&sync_pair_id);
            if let Err(err) = coordinator.sync_now(sync_pair_id).await {
                tracing::warn!(sync_pair_id, %err, "debounced sync failed");
            }
        });
        // Replacing (not dropping) the old handle: a task must never abort
        // itself from inside its own `remove` call above, only a *newer*
        // schedule is allowed to cut an older, still-pending one short.
        if let Some(old) = self.inner.debounce.insert(sync_pair_id, DebounceHandle { task }) {
            old.task.abort();
        }
    }

    fn spawn_progress_mirror(&self) {
        let coordinator = self.clone();
        let mut receiver = self.inner.progress.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(ProgressEvent::SyncProgress(info)) => {
                        coordinator.inner.last_progress.insert(info.sync_pair_id, info);
                    }
                    Ok(ProgressEvent::SyncStatusChanged(status)) => {
                        coordinator.inner.last_status.insert(status.sync_pair_id, (status.run_id, status.status));
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.background_tasks.lock().unwrap().push(task);
    }

    fn spawn_periodic_sync_timers(&self) {
        let ids: Vec<SyncPairId> = self.inner.pairs.iter().map(|e| *e.key()).collect();
        for sync_pair_id in ids {
            let coordinator = self.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(DEFAULT_PERIODIC_SYNC_INTERVAL);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    let paused = coordinator
                        .inner
                        .pairs
                        .get(&sync_pair_id)
                        .map(|rt| rt.paused || !rt.pair.enabled)
                        .unwrap_or(true);
                    if paused {
                        continue;
                    }
                    if let Err(err) = coordinator.sync_now(sync_pair_id).await {
                        tracing::warn!(sync_pair_id, %err, "periodic sync failed");
                    }
                }
            });
            self.inner.background_tasks.lock().unwrap().push(task);
        }
    }

    fn spawn_eviction_loop(&self) {
        let coordinator = self.clone();
        let interval = Duration::from_secs(self.inner.cache_config.check_interval);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let pairs: Vec<(SyncPair, bool)> = coordinator
                    .inner
                    .pairs
                    .iter()
                    .map(|e| (e.pair.clone(), e.pair.auto_eviction_enabled && !e.paused))
                    .collect();
                for (pair, enabled) in pairs {
                    if !enabled {
                        continue;
                    }
                    let strategy = coordinator.inner.cache_config.eviction_strategy;
                    let reserve = coordinator.inner.cache_config.reserve_buffer;
                    match coordinator.inner.evictor.evict(&pair, strategy, reserve).await {
                        Ok(outcome) if outcome.files_evicted > 0 => {
                            tracing::info!(
                                sync_pair_id = pair.id,
                                files_evicted = outcome.files_evicted,
                                bytes_freed = outcome.bytes_freed,
                                "cache eviction pass completed"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(sync_pair_id = pair.id, %err, "cache eviction pass failed");
                        }
                    }
                }
            }
        });
        self.inner.background_tasks.lock().unwrap().push(task);
    }

    /// Graceful shutdown (spec §4.7): refuse new requests, signal
    /// cancellation to every in-flight run, give them a bounded drain
    /// window, flush the store, then stop accepting connections. Each stage
    /// is logged so a slow shutdown is diagnosable (SPEC_FULL.md
    /// Coordinator "Shutdown").
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutdown: refusing new requests");

        tracing::info!("shutdown: signalling cancellation to in-flight runs");
        for entry in self.inner.pairs.iter() {
            self.inner.engine.cancel(*entry.key());
        }

        tracing::info!(timeout = ?SHUTDOWN_DRAIN_TIMEOUT, "shutdown: waiting for runs to drain");
        let tasks: Vec<JoinHandle<()>> = self.inner.background_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        tracing::info!("shutdown: flushing store");
        if let Err(err) = self.inner.store.snapshot().await {
            tracing::warn!(%err, "store flush during shutdown failed");
        }

        tracing::info!("shutdown: listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DiskConfig, SyncPairConfig};
    use crate::model::SyncDirection;
    use crate::vfs::MockHostMount;

    fn test_config(local_dir: PathBuf) -> Config {
        let mut config = Config::default();
        config.disks.push(DiskConfig {
            id: "disk1".into(),
            name: "Disk".into(),
            mount_path: "/Volumes/disk1".into(),
            priority: 0,
            enabled: true,
            file_system: None,
        });
        config.sync_pairs.push(SyncPairConfig {
            id: 1,
            disk_id: "disk1".into(),
            local_path: local_dir,
            external_relative_path: "mirror".into(),
            direction: SyncDirection::Bidirectional,
            create_symlink: false,
            enabled: true,
            max_local_cache_size: u64::MAX,
            auto_eviction_enabled: false,
            target_free_space: 0,
            exclude_patterns: vec![],
            include_patterns: vec![],
            conflict_strategy: None,
        });
        config
    }

    #[tokio::test]
    async fn mount_then_sync_now_pushes_local_file_to_external() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let external_dir = tempfile::tempdir().unwrap();
        std::fs::write(local_dir.path().join("a.txt"), b"hello").unwrap();

        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let progress = ProgressBus::default();
        let coordinator = Coordinator::new(test_config(local_dir.path().to_path_buf()), store, progress);

        let response = coordinator
            .handle(Request::Mount {
                sync_pair_id: 1,
                local_dir: local_dir.path().to_path_buf(),
                external_dir: external_dir.path().to_path_buf(),
                target_dir: local_dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        assert!(matches!(response, Response::Unit));

        coordinator.handle(Request::RebuildIndex { sync_pair_id: 1 }).await.unwrap();
        let response = coordinator.handle(Request::SyncNow { sync_pair_id: 1 }).await.unwrap();
        assert!(matches!(response, Response::RunId(_)));

        assert!(external_dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn mount_binds_host_mount_and_builds_vfs() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let external_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let host_mount = Arc::new(MockHostMount::default());
        let coordinator = Coordinator::with_host_mount(
            test_config(local_dir.path().to_path_buf()),
            store,
            ProgressBus::default(),
            host_mount.clone(),
        );

        coordinator
            .handle(Request::Mount {
                sync_pair_id: 1,
                local_dir: local_dir.path().to_path_buf(),
                external_dir: external_dir.path().to_path_buf(),
                target_dir: local_dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        assert!(host_mount.mounted.lock().unwrap().contains(&1));
        assert!(coordinator.inner.pairs.get(&1).unwrap().vfs.is_some());

        coordinator.handle(Request::Unmount { sync_pair_id: 1 }).await.unwrap();
        assert!(!host_mount.mounted.lock().unwrap().contains(&1));
        assert!(coordinator.inner.pairs.get(&1).unwrap().vfs.is_none());
    }

    #[tokio::test]
    async fn paused_pair_refuses_sync_now() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let coordinator = Coordinator::new(test_config(local_dir.path().to_path_buf()), store, ProgressBus::default());

        coordinator.handle(Request::PauseSync { sync_pair_id: 1 }).await.unwrap();
        let result = coordinator.handle(Request::SyncNow { sync_pair_id: 1 }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unknown_sync_pair_is_not_found() {
        let data_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let coordinator = Coordinator::new(Config::default(), store, ProgressBus::default());

        let result = coordinator.handle(Request::GetFileStatus { sync_pair_id: 99, virtual_path: "x".into() }).await;
        assert!(matches!(result, Ok(Response::FileEntry(None))));

        let result = coordinator.handle(Request::GetMountStatus { sync_pair_id: 99 }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_refuses_further_mutation() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let coordinator = Coordinator::new(test_config(local_dir.path().to_path_buf()), store, ProgressBus::default());

        coordinator.shutdown().await;
        let result = coordinator.handle(Request::SyncNow { sync_pair_id: 1 }).await;
        assert!(result.is_err());
    }
}
