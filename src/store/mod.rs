//! Persistent, transactional store indexed by `(syncPairId, virtualPath)`
//! (spec §4.1).
//!
//! The in-memory index is a [`dashmap::DashMap`] (a teacher dependency
//! declared but never wired up) so readers "never block writers beyond a
//! bounded critical section" the way the spec requires: a `DashMap` shard
//! lock is only ever held for the duration of a single map operation, never
//! across an `.await`. Durability is layered on top with
//! [`journal::Journal`]; `accessedAt` is tracked in a `moka::sync::Cache`
//! with no backing durability at all, matching the spec's explicit
//! best-effort choice for that one field.

mod journal;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use moka::sync::Cache;
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};
use crate::model::{
    FileEntry, Location, LockState, SyncHistory, SyncPairId, SyncStatistics, SystemTimestamp,
};
use journal::{Journal, JournalRecord};

type EntryKey = (SyncPairId, String);

/// Default interval between full snapshots (spec SPEC_FULL.md "Snapshotting").
pub const DEFAULT_SNAPSHOT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

pub struct Store {
    entries: DashMap<EntryKey, FileEntry>,
    history: DashMap<u64, SyncHistory>,
    next_history_id: std::sync::atomic::AtomicU64,
    statistics: DashMap<(String, SyncPairId), SyncStatistics>,
    accessed_at: Cache<EntryKey, SystemTimestamp>,
    journal: Mutex<Journal>,
    data_dir: PathBuf,
}

impl Store {
    /// Open the store rooted at `data_dir`, replaying its journal (and a
    /// prior snapshot, if any) to reconstruct in-memory state (spec §4.1,
    /// §6 "recovery journal").
    pub fn open(data_dir: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| SyncError::StoreError(format!("creating data dir: {e}")))?;

        let entries: DashMap<EntryKey, FileEntry> = DashMap::new();
        let history: DashMap<u64, SyncHistory> = DashMap::new();
        let statistics: DashMap<(String, SyncPairId), SyncStatistics> = DashMap::new();
        let mut max_history_id = 0u64;

        let snapshot_path = data_dir.join("store.snapshot.json");
        if let Ok(text) = std::fs::read_to_string(&snapshot_path) {
            if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&text) {
                for entry in snapshot.entries {
                    entries.insert((entry.sync_pair_id, entry.virtual_path.clone()), entry);
                }
                for record in snapshot.history {
                    max_history_id = max_history_id.max(record.id);
                    history.insert(record.id, record);
                }
                for stat in snapshot.statistics {
                    statistics.insert((stat.date.clone(), stat.sync_pair_id), stat);
                }
            }
        }

        let journal_path = data_dir.join("store.journal.bin");
        journal::replay(&journal_path, |record| match record {
            JournalRecord::UpsertEntry(entry) => {
                entries.insert((entry.sync_pair_id, entry.virtual_path.clone()), entry);
            }
            JournalRecord::DeleteEntry { sync_pair_id, virtual_path } => {
                entries.remove(&(sync_pair_id, virtual_path));
            }
            JournalRecord::MarkClean { sync_pair_id, virtual_path } => {
                if let Some(mut entry) = entries.get_mut(&(sync_pair_id, virtual_path)) {
                    entry.is_dirty = false;
                }
            }
            JournalRecord::AppendHistory(record) => {
                max_history_id = max_history_id.max(record.id);
                history.insert(record.id, record);
            }
            JournalRecord::UpsertStatistics(stat) => {
                statistics.insert((stat.date.clone(), stat.sync_pair_id), stat);
            }
        })
        .map_err(|e| SyncError::StoreError(format!("replaying journal: {e}")))?;

        let journal = Journal::open(&journal_path)
            .map_err(|e| SyncError::StoreError(format!("opening journal: {e}")))?;

        tracing::info!(
            entries = entries.len(),
            history = history.len(),
            data_dir = %data_dir.display(),
            "store recovered"
        );

        Ok(Store {
            entries,
            history,
            next_history_id: std::sync::atomic::AtomicU64::new(max_history_id + 1),
            statistics,
            accessed_at: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(std::time::Duration::from_secs(3600))
                .build(),
            journal: Mutex::new(journal),
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn get_entry(&self, sync_pair_id: SyncPairId, virtual_path: &str) -> Option<FileEntry> {
        let mut entry = self.entries.get(&(sync_pair_id, virtual_path.to_string()))?.clone();
        if let Some(accessed) = self.accessed_at.get(&(sync_pair_id, virtual_path.to_string())) {
            entry.accessed_at = accessed;
        }
        Some(entry)
    }

    /// Writes under the single-writer journal mutex (spec §4.1).
    pub async fn upsert_entry(&self, entry: FileEntry) -> SyncResult<()> {
        let key = (entry.sync_pair_id, entry.virtual_path.clone());
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::UpsertEntry(entry.clone()))
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    pub async fn delete_entry(&self, sync_pair_id: SyncPairId, virtual_path: &str) -> SyncResult<()> {
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::DeleteEntry {
                    sync_pair_id,
                    virtual_path: virtual_path.to_string(),
                })
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        self.entries.remove(&(sync_pair_id, virtual_path.to_string()));
        Ok(())
    }

    /// Atomic; bumps `modifiedAt` (spec §4.1 `updateLocation`).
    pub async fn update_location(
        &self,
        sync_pair_id: SyncPairId,
        virtual_path: &str,
        location: Location,
        local_path: Option<PathBuf>,
        external_path: Option<PathBuf>,
    ) -> SyncResult<()> {
        let key = (sync_pair_id, virtual_path.to_string());
        let mut entry = self
            .entries
            .get(&key)
            .map(|e| e.clone())
            .ok_or_else(|| SyncError::NotFound(virtual_path.to_string()))?;
        entry.location = location;
        entry.local_path = local_path;
        entry.external_path = external_path;
        entry.modified_at = SystemTimestamp::now();
        self.upsert_entry(entry).await
    }

    /// Clears `isDirty` (spec §4.1 `markClean`).
    pub async fn mark_clean(&self, sync_pair_id: SyncPairId, virtual_path: &str) -> SyncResult<()> {
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::MarkClean {
                    sync_pair_id,
                    virtual_path: virtual_path.to_string(),
                })
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        if let Some(mut entry) = self.entries.get_mut(&(sync_pair_id, virtual_path.to_string())) {
            entry.is_dirty = false;
        }
        Ok(())
    }

    /// Acquires a `syncLocked` state on an entry iff it is currently
    /// unlocked or its prior lock has expired (spec §3 `lockState`, §5
    /// "the lock cannot change between check and open because the
    /// SyncEngine acquires locks via the same single-writer path").
    /// In-memory only - lock state is transient and has no journal record,
    /// matching the journal's record set (`upsertEntry`/`deleteEntry`/
    /// `markClean`/history/statistics only).
    pub fn try_lock(
        &self,
        sync_pair_id: SyncPairId,
        virtual_path: &str,
        direction: crate::model::LockDirection,
    ) -> SyncResult<bool> {
        let key = (sync_pair_id, virtual_path.to_string());
        let mut slot = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| SyncError::NotFound(virtual_path.to_string()))?;
        if !matches!(slot.effective_lock_state(), LockState::Unlocked) {
            return Ok(false);
        }
        slot.lock_state =
            LockState::SyncLocked { since: SystemTimestamp::now(), direction };
        Ok(true)
    }

    /// Releases a sync lock regardless of its current direction (spec §4.5
    /// execute step: "Mark Store entry clean; update `location`; unlock.").
    pub fn unlock(&self, sync_pair_id: SyncPairId, virtual_path: &str) {
        if let Some(mut entry) = self.entries.get_mut(&(sync_pair_id, virtual_path.to_string())) {
            entry.lock_state = LockState::Unlocked;
        }
    }

    /// Updates `accessedAt` in memory only; flushed opportunistically into
    /// the next snapshot (spec §4.1: "no durability guarantee for
    /// accessedAt").
    pub fn touch_access(&self, sync_pair_id: SyncPairId, virtual_path: &str) {
        self.accessed_at
            .insert((sync_pair_id, virtual_path.to_string()), SystemTimestamp::now());
    }

    /// Filters `location = both ∧ ¬isDirty ∧ lockState = unlocked`
    /// (spec §4.1 `listEvictable`).
    pub fn list_evictable(&self, sync_pair_id: SyncPairId) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == sync_pair_id && e.value().is_evictable())
            .map(|e| {
                let mut entry = e.value().clone();
                if let Some(accessed) = self.accessed_at.get(e.key()) {
                    entry.accessed_at = accessed;
                }
                entry
            })
            .collect()
    }

    pub fn list_dirty(&self, sync_pair_id: SyncPairId) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|e| e.key().0 == sync_pair_id && e.value().is_dirty)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Every entry belonging to a sync pair, used by the Indexer to diff
    /// on-disk reality against what the Store already believes.
    pub fn list_pair(&self, sync_pair_id: SyncPairId) -> Vec<FileEntry> {
        self.entries.iter().filter(|e| e.key().0 == sync_pair_id).map(|e| e.value().clone()).collect()
    }

    /// Destroys a sync pair's records (spec §3 "destroyed only by explicit
    /// removal, which also purges all its FileEntrys").
    pub async fn purge_pair(&self, sync_pair_id: SyncPairId) -> SyncResult<()> {
        let victims: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().0 == sync_pair_id)
            .map(|e| e.key().1.clone())
            .collect();
        for virtual_path in victims {
            self.delete_entry(sync_pair_id, &virtual_path).await?;
        }
        Ok(())
    }

    pub async fn append_history(&self, mut record: SyncHistory) -> SyncResult<u64> {
        let id = self.next_history_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        record.id = id;
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::AppendHistory(record.clone()))
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        self.history.insert(id, record);
        Ok(id)
    }

    pub async fn seal_history(&self, id: u64, update: impl FnOnce(&mut SyncHistory)) -> SyncResult<()> {
        let mut record = self
            .history
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| SyncError::NotFound(format!("history record {id}")))?;
        update(&mut record);
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::AppendHistory(record.clone()))
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        self.history.insert(id, record);
        Ok(())
    }

    pub fn get_history(&self, sync_pair_id: SyncPairId, limit: usize) -> Vec<SyncHistory> {
        let mut records: Vec<SyncHistory> =
            self.history.iter().filter(|r| r.sync_pair_id == sync_pair_id).map(|r| r.clone()).collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        records.truncate(limit);
        records
    }

    pub async fn upsert_statistics(&self, stat: SyncStatistics) -> SyncResult<()> {
        {
            let mut journal = self.journal.lock().await;
            journal
                .append(&JournalRecord::UpsertStatistics(stat.clone()))
                .map_err(|e| SyncError::StoreError(format!("journal append: {e}")))?;
        }
        self.statistics.insert((stat.date.clone(), stat.sync_pair_id), stat);
        Ok(())
    }

    pub fn get_statistics(&self, sync_pair_id: SyncPairId, date: &str) -> Option<SyncStatistics> {
        self.statistics.get(&(date.to_string(), sync_pair_id)).map(|s| s.clone())
    }

    /// Serialize the full in-memory state to `store.snapshot.json` and
    /// compact the journal to just its header (spec SPEC_FULL.md
    /// "Snapshotting").
    pub async fn snapshot(&self) -> SyncResult<()> {
        let snapshot = Snapshot {
            entries: self.entries.iter().map(|e| e.value().clone()).collect(),
            history: self.history.iter().map(|r| r.value().clone()).collect(),
            statistics: self.statistics.iter().map(|s| s.value().clone()).collect(),
        };
        let text = serde_json::to_string(&snapshot)
            .map_err(|e| SyncError::StoreError(format!("serializing snapshot: {e}")))?;
        let tmp_path = self.data_dir.join("store.snapshot.json.tmp");
        let final_path = self.data_dir.join("store.snapshot.json");
        tokio::fs::write(&tmp_path, text)
            .await
            .map_err(|e| SyncError::StoreError(format!("writing snapshot: {e}")))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| SyncError::StoreError(format!("installing snapshot: {e}")))?;

        let mut journal = self.journal.lock().await;
        journal.compact().map_err(|e| SyncError::StoreError(format!("compacting journal: {e}")))?;
        tracing::info!(entries = snapshot_len(&self.entries), "store snapshot written");
        Ok(())
    }

    /// Spawn a background task that snapshots on `interval`, returning its
    /// handle so the Coordinator can abort it on shutdown.
    pub fn spawn_snapshot_task(
        store: Arc<Store>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = store.snapshot().await {
                    tracing::warn!(%err, "periodic snapshot failed");
                }
            }
        })
    }
}

fn snapshot_len(map: &DashMap<EntryKey, FileEntry>) -> usize {
    map.len()
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    entries: Vec<FileEntry>,
    history: Vec<SyncHistory>,
    statistics: Vec<SyncStatistics>,
}

/// Helper used by tests and the Indexer to bucket entries by parent
/// directory for a `readdir`-style merge (spec §4.4).
pub fn group_by_parent(entries: &[FileEntry]) -> HashMap<String, Vec<FileEntry>> {
    let mut out: HashMap<String, Vec<FileEntry>> = HashMap::new();
    for entry in entries {
        let parent = match entry.virtual_path.rsplit_once('/') {
            Some((parent, _)) => parent.to_string(),
            None => String::new(),
        };
        out.entry(parent).or_default().push(entry.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Location;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let mut entry = FileEntry::new(1, "a.txt".into(), false);
        entry.location = Location::LocalOnly;
        entry.local_path = Some("/tmp/a.txt".into());
        store.upsert_entry(entry.clone()).await.unwrap();

        let fetched = store.get_entry(1, "a.txt").unwrap();
        assert_eq!(fetched.virtual_path, "a.txt");
        assert!(matches!(fetched.location, Location::LocalOnly));
    }

    #[tokio::test]
    async fn recovers_from_journal_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let entry = FileEntry::new(2, "b.txt".into(), false);
            store.upsert_entry(entry).await.unwrap();
        }
        let reopened = Store::open(dir.path()).unwrap();
        assert!(reopened.get_entry(2, "b.txt").is_some());
    }

    #[tokio::test]
    async fn list_evictable_filters_dirty_and_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let mut clean_both = FileEntry::new(1, "clean.txt".into(), false);
        clean_both.location = Location::Both;
        clean_both.local_path = Some("/l/clean.txt".into());
        clean_both.external_path = Some("/e/clean.txt".into());
        store.upsert_entry(clean_both).await.unwrap();

        let mut dirty_both = FileEntry::new(1, "dirty.txt".into(), false);
        dirty_both.location = Location::Both;
        dirty_both.local_path = Some("/l/dirty.txt".into());
        dirty_both.external_path = Some("/e/dirty.txt".into());
        dirty_both.is_dirty = true;
        store.upsert_entry(dirty_both).await.unwrap();

        let evictable = store.list_evictable(1);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].virtual_path, "clean.txt");
    }

    #[tokio::test]
    async fn try_lock_rejects_while_already_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let entry = FileEntry::new(1, "a.txt".into(), false);
        store.upsert_entry(entry).await.unwrap();

        assert!(store.try_lock(1, "a.txt", crate::model::LockDirection::LocalToExternal).unwrap());
        assert!(!store.try_lock(1, "a.txt", crate::model::LockDirection::LocalToExternal).unwrap());

        store.unlock(1, "a.txt");
        assert!(store.try_lock(1, "a.txt", crate::model::LockDirection::ExternalToLocal).unwrap());
    }

    #[tokio::test]
    async fn snapshot_then_reopen_preserves_state_and_compacts_journal() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let entry = FileEntry::new(1, "a.txt".into(), false);
        store.upsert_entry(entry).await.unwrap();
        store.snapshot().await.unwrap();

        let journal_path = dir.path().join("store.journal.bin");
        let len_after_compact = std::fs::metadata(&journal_path).unwrap().len();
        assert_eq!(len_after_compact, 6);

        let reopened = Store::open(dir.path()).unwrap();
        assert!(reopened.get_entry(1, "a.txt").is_some());
    }
}
