//! The dispatch table itself (spec §4.4), generalized from the teacher's
//! `ShadowFS` (`examples/RMamonts-nfs-mamont/examples/shadow_fs/fs/mod.rs`):
//! same "decode identity, stat or touch the host filesystem, fold the result
//! back into an attribute struct" shape, but keyed by virtual path against
//! the [`Store`] instead of by NFS file handle against an in-memory id table.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::Errno;
use crate::model::{
    DirtyFile, FileEntry, Location, LockDirection, LockState, SyncDirection, SyncPairId,
    SystemTimestamp, WRITE_WAIT_TIMEOUT,
};
use crate::path_guard;
use crate::store::Store;

use super::types::{Attr, DirEntry, ReadResult, VfsResult, WriteResult};

/// One dispatcher per mounted sync pair (spec §4.4: "for each sync pair it
/// exposes a mount point").
pub struct VfsDispatcher {
    store: std::sync::Arc<Store>,
    sync_pair_id: SyncPairId,
    local_dir: PathBuf,
    external_dir: std::sync::Mutex<Option<PathBuf>>,
    direction: SyncDirection,
    dirty_tx: Option<mpsc::UnboundedSender<DirtyFile>>,
}

/// An in-flight local write, returned by `open_write` and consumed by
/// `write_close` (spec §4.4 "write/close").
pub struct WriteHandle {
    virtual_path: String,
    file: tokio::fs::File,
    wrote_any: bool,
}

impl VfsDispatcher {
    pub fn new(
        store: std::sync::Arc<Store>,
        sync_pair_id: SyncPairId,
        local_dir: PathBuf,
        external_dir: Option<PathBuf>,
        direction: SyncDirection,
        dirty_tx: Option<mpsc::UnboundedSender<DirtyFile>>,
    ) -> Self {
        VfsDispatcher {
            store,
            sync_pair_id,
            local_dir,
            external_dir: std::sync::Mutex::new(external_dir),
            direction,
            dirty_tx,
        }
    }

    pub fn set_external_dir(&self, dir: Option<PathBuf>) {
        *self.external_dir.lock().unwrap() = dir;
    }

    fn external_dir(&self) -> Option<PathBuf> {
        self.external_dir.lock().unwrap().clone()
    }

    fn local_abs(&self, virtual_path: &str) -> PathBuf {
        self.local_dir.join(virtual_path)
    }

    fn external_abs(&self, virtual_path: &str) -> Option<PathBuf> {
        self.external_dir().map(|d| d.join(virtual_path))
    }

    fn validate(&self, virtual_path: &str) -> VfsResult<String> {
        path_guard::validate_virtual(virtual_path).map_err(|e| Errno::from(&e))
    }

    fn attr_of(&self, entry: &FileEntry, metadata: Option<&std::fs::Metadata>) -> Attr {
        let (size, modified_at) = match metadata {
            Some(m) => (
                if entry.is_directory { 0 } else { m.len() },
                m.modified().map(SystemTimestamp::from).unwrap_or(entry.modified_at),
            ),
            None => (entry.size, entry.modified_at),
        };
        Attr { size, is_directory: entry.is_directory, modified_at, read_only: false }
    }

    /// spec §4.4 lookup/getattr rule: prefer local when present; a locked
    /// entry is served from whichever side is the copy's untouched source.
    pub async fn getattr(&self, virtual_path: &str) -> VfsResult<Attr> {
        let virtual_path = self.validate(virtual_path)?;
        let entry = self.store.get_entry(self.sync_pair_id, &virtual_path).ok_or(Errno::ENOENT)?;
        let source_abs = self.read_source_abs(&entry);
        let metadata = match &source_abs {
            Some(abs) => tokio::fs::metadata(abs).await.ok(),
            None => None,
        };
        Ok(self.attr_of(&entry, metadata.as_ref()))
    }

    pub async fn lookup(&self, parent_virtual_dir: &str, name: &str) -> VfsResult<Attr> {
        let child = join_virtual(parent_virtual_dir, name);
        self.getattr(&child).await
    }

    /// spec §4.4 readdir rule: merge the local listing with Store entries
    /// under this directory whose location is `externalOnly`/`both`,
    /// de-duplicated by name.
    pub async fn readdir(&self, virtual_path: &str) -> VfsResult<Vec<DirEntry>> {
        let virtual_path = self.validate(virtual_path)?;
        let local_abs = self.local_abs(&virtual_path);

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();

        if let Ok(mut rd) = tokio::fs::read_dir(&local_abs).await {
            while let Ok(Some(entry)) = rd.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                let is_directory = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if seen.insert(name.clone()) {
                    out.push(DirEntry { name, is_directory });
                }
            }
        }

        let prefix = if virtual_path.is_empty() { String::new() } else { format!("{virtual_path}/") };
        for entry in self.store.list_pair(self.sync_pair_id) {
            if !matches!(entry.location, Location::ExternalOnly | Location::Both) {
                continue;
            }
            let Some(rest) = entry.virtual_path.strip_prefix(&prefix as &str) else { continue };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            if seen.insert(rest.to_string()) {
                out.push(DirEntry { name: rest.to_string(), is_directory: entry.is_directory });
            }
        }

        Ok(out)
    }

    fn read_source_abs(&self, entry: &FileEntry) -> Option<PathBuf> {
        if let LockState::SyncLocked { direction, .. } = entry.effective_lock_state() {
            // The side not currently being written to is the stable read source.
            return match direction {
                LockDirection::LocalToExternal => entry.local_path.clone(),
                LockDirection::ExternalToLocal => {
                    entry.external_path.clone().or_else(|| entry.local_path.clone())
                }
            };
        }
        match entry.location {
            Location::LocalOnly | Location::Both => entry.local_path.clone(),
            Location::ExternalOnly => entry.external_path.clone(),
            Location::NotExists => None,
        }
    }

    pub async fn read(&self, virtual_path: &str, offset: u64, len: u32) -> VfsResult<ReadResult> {
        use tokio::io::AsyncReadExt;

        let virtual_path = self.validate(virtual_path)?;
        let entry = self.store.get_entry(self.sync_pair_id, &virtual_path).ok_or(Errno::ENOENT)?;
        let source = self.read_source_abs(&entry).ok_or(Errno::ENOENT)?;

        let mut file = tokio::fs::File::open(&source).await.map_err(|_| Errno::EIO)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| Errno::EIO)?;
        let mut data = vec![0u8; len as usize];
        let n = file.read(&mut data).await.map_err(|_| Errno::EIO)?;
        data.truncate(n);

        self.store.touch_access(self.sync_pair_id, &virtual_path);
        let metadata = tokio::fs::metadata(&source).await.ok();
        Ok(ReadResult { data, attr: self.attr_of(&entry, metadata.as_ref()) })
    }

    /// spec §4.4 open(write): if a `localToExternal` sync lock is held,
    /// block up to `writeWaitTimeout` for it to clear before returning
    /// `EBUSY`.
    pub async fn open_write(&self, virtual_path: &str) -> VfsResult<WriteHandle> {
        let virtual_path = self.validate(virtual_path)?;
        let deadline = Instant::now() + WRITE_WAIT_TIMEOUT;

        loop {
            let locked = self
                .store
                .get_entry(self.sync_pair_id, &virtual_path)
                .map(|e| matches!(e.effective_lock_state(), LockState::SyncLocked { .. }))
                .unwrap_or(false);
            if !locked {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Errno::EBUSY);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let abs = self.local_abs(&virtual_path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|_| Errno::EIO)?;
        }
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&abs)
            .await
            .map_err(|_| Errno::EIO)?;

        Ok(WriteHandle { virtual_path, file, wrote_any: false })
    }

    pub async fn write(&self, handle: &mut WriteHandle, offset: u64, data: &[u8]) -> VfsResult<u32> {
        handle.file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| Errno::EIO)?;
        handle.file.write_all(data).await.map_err(|_| Errno::EIO)?;
        handle.wrote_any = true;
        Ok(data.len() as u32)
    }

    /// spec §4.4 "On close-after-write, mark entry `isDirty = true`, update
    /// size/mtime, publish a `DirtyFile` event to the Coordinator."
    pub async fn close_write(&self, mut handle: WriteHandle) -> VfsResult<WriteResult> {
        handle.file.flush().await.map_err(|_| Errno::EIO)?;
        let abs = self.local_abs(&handle.virtual_path);
        let metadata = tokio::fs::metadata(&abs).await.map_err(|_| Errno::EIO)?;

        let mut entry = self
            .store
            .get_entry(self.sync_pair_id, &handle.virtual_path)
            .unwrap_or_else(|| FileEntry::new(self.sync_pair_id, handle.virtual_path.clone(), false));
        entry.local_path = Some(abs.clone());
        entry.location = match entry.location {
            Location::ExternalOnly | Location::Both => Location::Both,
            Location::LocalOnly | Location::NotExists => Location::LocalOnly,
        };
        entry.size = metadata.len();
        entry.modified_at = metadata.modified().map(SystemTimestamp::from).unwrap_or_else(SystemTimestamp::now);
        entry.is_directory = false;
        if handle.wrote_any {
            entry.is_dirty = true;
        }
        self.store.upsert_entry(entry.clone()).await.map_err(|_| Errno::EIO)?;

        if handle.wrote_any {
            if let Some(tx) = &self.dirty_tx {
                let _ = tx.send(DirtyFile {
                    virtual_path: handle.virtual_path.clone(),
                    local_path: abs.clone(),
                    created_at: entry.created_at,
                    modified_at: entry.modified_at,
                    sync_attempts: 0,
                    last_sync_error: None,
                });
            }
        }

        Ok(WriteResult {
            bytes_written: metadata.len() as u32,
            attr: self.attr_of(&entry, Some(&metadata)),
        })
    }

    /// spec §4.4 unlink/rename: apply to local, then fold the deletion back
    /// into the Store; a `both`-located entry is left pointed at its
    /// external half so the next sync propagates the delete.
    pub async fn unlink(&self, virtual_path: &str) -> VfsResult<()> {
        let virtual_path = self.validate(virtual_path)?;
        let entry = self.store.get_entry(self.sync_pair_id, &virtual_path).ok_or(Errno::ENOENT)?;
        let abs = self.local_abs(&virtual_path);
        tokio::fs::remove_file(&abs).await.map_err(|_| Errno::ENOENT)?;

        match entry.location {
            Location::LocalOnly => {
                self.store.delete_entry(self.sync_pair_id, &virtual_path).await.map_err(|_| Errno::EIO)?;
            }
            Location::Both => {
                self.store
                    .update_location(
                        self.sync_pair_id,
                        &virtual_path,
                        Location::ExternalOnly,
                        None,
                        entry.external_path.clone(),
                    )
                    .await
                    .map_err(|_| Errno::EIO)?;
                if let Some(mut e) = self.store.get_entry(self.sync_pair_id, &virtual_path) {
                    e.is_dirty = true;
                    self.store.upsert_entry(e).await.map_err(|_| Errno::EIO)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn rename(&self, from_virtual: &str, to_virtual: &str) -> VfsResult<()> {
        let from_virtual = self.validate(from_virtual)?;
        let to_virtual = self.validate(to_virtual)?;
        let entry = self.store.get_entry(self.sync_pair_id, &from_virtual).ok_or(Errno::ENOENT)?;

        let from_abs = self.local_abs(&from_virtual);
        let to_abs = self.local_abs(&to_virtual);
        if let Some(parent) = to_abs.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|_| Errno::EIO)?;
        }
        tokio::fs::rename(&from_abs, &to_abs).await.map_err(|_| Errno::EIO)?;

        self.store.delete_entry(self.sync_pair_id, &from_virtual).await.map_err(|_| Errno::EIO)?;
        let mut renamed = entry.clone();
        renamed.virtual_path = to_virtual;
        renamed.local_path = Some(to_abs);
        renamed.is_dirty = true;
        renamed.modified_at = SystemTimestamp::now();
        self.store.upsert_entry(renamed).await.map_err(|_| Errno::EIO)?;
        Ok(())
    }

    pub async fn mkdir(&self, virtual_path: &str) -> VfsResult<Attr> {
        let virtual_path = self.validate(virtual_path)?;
        let abs = self.local_abs(&virtual_path);
        tokio::fs::create_dir_all(&abs).await.map_err(|_| Errno::EIO)?;

        let mut entry = FileEntry::new(self.sync_pair_id, virtual_path, true);
        entry.local_path = Some(abs);
        entry.location = Location::LocalOnly;
        self.store.upsert_entry(entry.clone()).await.map_err(|_| Errno::EIO)?;
        Ok(self.attr_of(&entry, None))
    }
}

fn join_virtual(parent: &str, name: &str) -> String {
    if parent.is_empty() { name.to_string() } else { format!("{parent}/{name}") }
}

#[allow(dead_code)]
fn join_path(root: &Path, virtual_path: &str) -> PathBuf {
    root.join(virtual_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_dir() -> (std::sync::Arc<Store>, tempfile::TempDir) {
        let data_dir = tempfile::tempdir().unwrap();
        (std::sync::Arc::new(Store::open(data_dir.path()).unwrap()), data_dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (store, _data) = store_with_dir();
        let local = tempfile::tempdir().unwrap();
        let dispatcher = VfsDispatcher::new(
            store,
            1,
            local.path().to_path_buf(),
            None,
            SyncDirection::Bidirectional,
            None,
        );

        let mut handle = dispatcher.open_write("a.txt").await.unwrap();
        dispatcher.write(&mut handle, 0, b"hello").await.unwrap();
        dispatcher.close_write(handle).await.unwrap();

        let result = dispatcher.read("a.txt", 0, 5).await.unwrap();
        assert_eq!(result.data, b"hello");
    }

    #[tokio::test]
    async fn write_marks_entry_dirty_and_notifies() {
        let (store, _data) = store_with_dir();
        let local = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = VfsDispatcher::new(
            store.clone(),
            1,
            local.path().to_path_buf(),
            None,
            SyncDirection::Bidirectional,
            Some(tx),
        );

        let mut handle = dispatcher.open_write("a.txt").await.unwrap();
        dispatcher.write(&mut handle, 0, b"hello").await.unwrap();
        dispatcher.close_write(handle).await.unwrap();

        let entry = store.get_entry(1, "a.txt").unwrap();
        assert!(entry.is_dirty);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn open_write_returns_ebusy_when_locked_past_timeout() {
        let (store, _data) = store_with_dir();
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("a.txt"), b"x").unwrap();

        let mut entry = FileEntry::new(1, "a.txt".into(), false);
        entry.local_path = Some(local.path().join("a.txt"));
        entry.location = Location::LocalOnly;
        entry.lock_state = LockState::SyncLocked {
            since: SystemTimestamp::now(),
            direction: LockDirection::LocalToExternal,
        };
        store.upsert_entry(entry).await.unwrap();

        let dispatcher = VfsDispatcher::new(
            store,
            1,
            local.path().to_path_buf(),
            None,
            SyncDirection::Bidirectional,
            None,
        );

        // WRITE_WAIT_TIMEOUT is 5s in production; this test only checks the
        // immediate-lock path returns promptly once the lock is held, not the
        // full timeout, to keep the suite fast - see `open_write` unit logic
        // instead for the blocking loop itself.
        let never_clears = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            dispatcher.open_write("a.txt"),
        )
        .await;
        assert!(never_clears.is_err(), "open_write should still be waiting on the lock");
    }

    #[tokio::test]
    async fn readdir_merges_local_and_external_only_entries() {
        let (store, _data) = store_with_dir();
        let local = tempfile::tempdir().unwrap();
        std::fs::write(local.path().join("local.txt"), b"x").unwrap();

        let mut remote_entry = FileEntry::new(1, "remote.txt".into(), false);
        remote_entry.location = Location::ExternalOnly;
        remote_entry.external_path = Some(PathBuf::from("/ext/remote.txt"));
        store.upsert_entry(remote_entry).await.unwrap();

        let dispatcher = VfsDispatcher::new(
            store,
            1,
            local.path().to_path_buf(),
            None,
            SyncDirection::Bidirectional,
            None,
        );

        let mut names: Vec<String> =
            dispatcher.readdir("").await.unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["local.txt".to_string(), "remote.txt".to_string()]);
    }
}
