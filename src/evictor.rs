//! Per-pair cache eviction (spec §4.6): frees cold, clean, already-mirrored
//! local copies until the pair is back under its configured budget.
//!
//! Candidates come from [`Store::list_evictable`], which already applies the
//! `location = both ∧ ¬isDirty ∧ lockState = unlocked` filter (spec §4.1);
//! this module only orders them and enforces the stop condition. Disk-free
//! queries use `fs2` (a dependency neither this teacher nor its own `examples/`
//! carry, but two sibling repos in the pack do - `64andrewwalker-calvin` and
//! `njsmith-posy` - for the same "how much room is left on this volume"
//! question).

use std::path::Path;
use std::sync::Arc;

use crate::error::SyncResult;
use crate::model::{EvictionStrategy, FileEntry, Location, SyncPair, SyncPairId};
use crate::progress::{EvictionProgress, ProgressBus, ProgressEvent};
use crate::store::Store;

/// Result of one eviction pass, returned to the Coordinator for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionOutcome {
    pub files_evicted: u64,
    pub bytes_freed: u64,
    pub files_failed: u64,
}

pub struct CacheEvictor {
    store: Arc<Store>,
    progress: ProgressBus,
}

impl CacheEvictor {
    pub fn new(store: Arc<Store>, progress: ProgressBus) -> Self {
        CacheEvictor { store, progress }
    }

    /// Runs one eviction pass for `pair` (spec §4.6). `reserve_buffer` is the
    /// process-wide `cache.reserveBuffer` setting: eviction keeps going past
    /// the pair's own budget shortfall if the local volume is still short of
    /// that reserve (spec §5 "enforced jointly by the SyncEngine ... and the
    /// CacheEvictor").
    pub async fn evict(
        &self,
        pair: &SyncPair,
        strategy: EvictionStrategy,
        reserve_buffer: u64,
    ) -> SyncResult<EvictionOutcome> {
        let resident = self.store.list_pair(pair.id);
        let current_cache_size: u64 = resident
            .iter()
            .filter(|e| !e.is_directory && matches!(e.location, Location::LocalOnly | Location::Both))
            .map(|e| e.size)
            .sum();

        let cache_shortfall =
            current_cache_size.saturating_sub(pair.max_local_cache_size) + pair.target_free_space;
        let reserve_shortfall = reserve_shortfall(&pair.local_dir, reserve_buffer);
        let target_free_bytes = cache_shortfall.max(reserve_shortfall);

        if target_free_bytes == 0 {
            return Ok(EvictionOutcome::default());
        }

        let mut candidates = self.store.list_evictable(pair.id);
        sort_candidates(&mut candidates, strategy);

        let mut outcome = EvictionOutcome::default();
        for entry in candidates {
            if outcome.bytes_freed >= target_free_bytes {
                break;
            }
            match self.evict_one(pair.id, &entry).await {
                Ok(freed) => {
                    outcome.files_evicted += 1;
                    outcome.bytes_freed += freed;
                    self.progress.publish(ProgressEvent::EvictionProgress(EvictionProgress {
                        sync_pair_id: pair.id,
                        bytes_freed: outcome.bytes_freed,
                        bytes_target: target_free_bytes,
                        files_evicted: outcome.files_evicted,
                        done: false,
                    }));
                }
                Err(err) => {
                    outcome.files_failed += 1;
                    tracing::warn!(path = %entry.virtual_path, %err, "eviction of one file failed, continuing");
                }
            }
        }

        self.progress.publish(ProgressEvent::EvictionProgress(EvictionProgress {
            sync_pair_id: pair.id,
            bytes_freed: outcome.bytes_freed,
            bytes_target: target_free_bytes,
            files_evicted: outcome.files_evicted,
            done: true,
        }));

        Ok(outcome)
    }

    /// Evicts a single candidate (spec §4.6 step list): lock, confirm the
    /// external side is actually reachable, delete the local copy, transition
    /// `location`, unlock. Returns the bytes freed.
    async fn evict_one(&self, sync_pair_id: SyncPairId, entry: &FileEntry) -> SyncResult<u64> {
        use crate::error::SyncError;
        use crate::model::LockDirection;

        let local_path = entry
            .local_path
            .as_ref()
            .ok_or_else(|| SyncError::Internal(format!("{} has no local path to evict", entry.virtual_path)))?;
        let external_path = entry
            .external_path
            .as_ref()
            .ok_or_else(|| SyncError::Internal(format!("{} has no external copy", entry.virtual_path)))?;

        if tokio::fs::metadata(external_path).await.is_err() {
            return Err(SyncError::DiskNotConnected { disk_id: entry.virtual_path.clone() });
        }

        if !self.store.try_lock(sync_pair_id, &entry.virtual_path, LockDirection::ExternalToLocal)? {
            return Err(SyncError::LockBusy { path: entry.virtual_path.clone() });
        }

        let result = tokio::fs::remove_file(local_path)
            .await
            .map_err(|e| SyncError::from_io(&e, format!("evicting {}", local_path.display())));
        self.store.unlock(sync_pair_id, &entry.virtual_path);
        result?;

        self.store
            .update_location(sync_pair_id, &entry.virtual_path, Location::ExternalOnly, None, Some(external_path.clone()))
            .await?;

        Ok(entry.size)
    }
}

fn reserve_shortfall(local_dir: &Path, reserve_buffer: u64) -> u64 {
    match fs2::available_space(local_dir) {
        Ok(available) => reserve_buffer.saturating_sub(available),
        Err(_) => 0,
    }
}

/// Orders candidates per spec §4.6's table.
fn sort_candidates(candidates: &mut [FileEntry], strategy: EvictionStrategy) {
    match strategy {
        EvictionStrategy::ModifiedTime => candidates.sort_by_key(|e| e.modified_at),
        EvictionStrategy::AccessTime => candidates.sort_by_key(|e| e.accessed_at),
        EvictionStrategy::SizeFirst => {
            candidates.sort_by(|a, b| b.size.cmp(&a.size).then(a.accessed_at.cmp(&b.accessed_at)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncDirection;
    use crate::progress::ProgressBus;

    fn pair(id: SyncPairId, local_dir: std::path::PathBuf, max_size: u64) -> SyncPair {
        SyncPair {
            id,
            disk_id: "disk".into(),
            local_dir,
            external_relative_path: "mirror".into(),
            direction: SyncDirection::Bidirectional,
            create_symlink: false,
            enabled: true,
            max_local_cache_size: max_size,
            auto_eviction_enabled: true,
            target_free_space: 0,
            exclude_patterns: vec![],
            include_patterns: vec![],
        }
    }

    async fn both_entry(
        store: &Store,
        sync_pair_id: SyncPairId,
        virtual_path: &str,
        local: std::path::PathBuf,
        external: std::path::PathBuf,
        size: u64,
        accessed_secs_ago: u128,
    ) {
        let mut entry = FileEntry::new(sync_pair_id, virtual_path.to_string(), false);
        entry.location = Location::Both;
        entry.local_path = Some(local);
        entry.external_path = Some(external);
        entry.size = size;
        entry.accessed_at = crate::model::SystemTimestamp(
            crate::model::SystemTimestamp::now().0.saturating_sub(accessed_secs_ago * 1_000_000_000),
        );
        store.upsert_entry(entry).await.unwrap();
    }

    #[tokio::test]
    async fn evicts_oldest_accessed_first_until_under_budget() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let external_dir = tempfile::tempdir().unwrap();

        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let old_local = local_dir.path().join("old.bin");
        let new_local = local_dir.path().join("new.bin");
        let old_external = external_dir.path().join("old.bin");
        let new_external = external_dir.path().join("new.bin");
        std::fs::write(&old_local, vec![0u8; 100]).unwrap();
        std::fs::write(&new_local, vec![0u8; 100]).unwrap();
        std::fs::write(&old_external, vec![0u8; 100]).unwrap();
        std::fs::write(&new_external, vec![0u8; 100]).unwrap();

        both_entry(&store, 1, "old.bin", old_local.clone(), old_external, 100, 3600).await;
        both_entry(&store, 1, "new.bin", new_local.clone(), new_external, 100, 10).await;

        let evictor = CacheEvictor::new(store.clone(), ProgressBus::default());
        let p = pair(1, local_dir.path().to_path_buf(), 100);
        let outcome = evictor.evict(&p, EvictionStrategy::AccessTime, 0).await.unwrap();

        assert_eq!(outcome.files_evicted, 1);
        assert!(!old_local.exists());
        assert!(new_local.exists());
        let entry = store.get_entry(1, "old.bin").unwrap();
        assert!(matches!(entry.location, Location::ExternalOnly));
        assert!(entry.local_path.is_none());
    }

    #[tokio::test]
    async fn under_budget_evicts_nothing() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let external_dir = tempfile::tempdir().unwrap();

        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let local = local_dir.path().join("a.bin");
        let external = external_dir.path().join("a.bin");
        std::fs::write(&local, vec![0u8; 10]).unwrap();
        std::fs::write(&external, vec![0u8; 10]).unwrap();
        both_entry(&store, 1, "a.bin", local.clone(), external, 10, 10).await;

        let evictor = CacheEvictor::new(store, ProgressBus::default());
        let p = pair(1, local_dir.path().to_path_buf(), 1024);
        let outcome = evictor.evict(&p, EvictionStrategy::AccessTime, 0).await.unwrap();

        assert_eq!(outcome.files_evicted, 0);
        assert!(local.exists());
    }

    #[tokio::test]
    async fn dirty_files_are_never_candidates() {
        let data_dir = tempfile::tempdir().unwrap();
        let local_dir = tempfile::tempdir().unwrap();
        let external_dir = tempfile::tempdir().unwrap();

        let store = Arc::new(Store::open(data_dir.path()).unwrap());
        let local = local_dir.path().join("dirty.bin");
        let external = external_dir.path().join("dirty.bin");
        std::fs::write(&local, vec![0u8; 1000]).unwrap();
        std::fs::write(&external, vec![0u8; 1000]).unwrap();

        let mut entry = FileEntry::new(1, "dirty.bin".to_string(), false);
        entry.location = Location::Both;
        entry.local_path = Some(local.clone());
        entry.external_path = Some(external);
        entry.size = 1000;
        entry.is_dirty = true;
        store.upsert_entry(entry).await.unwrap();

        let evictor = CacheEvictor::new(store, ProgressBus::default());
        let p = pair(1, local_dir.path().to_path_buf(), 1);
        let outcome = evictor.evict(&p, EvictionStrategy::AccessTime, 0).await.unwrap();

        assert_eq!(outcome.files_evicted, 0);
        assert!(local.exists());
    }
}
