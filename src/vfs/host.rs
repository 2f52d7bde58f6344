//! Host-mount binding seam (spec §9 "the VFS layer is the one unavoidable
//! host integration").
//!
//! Generalizes the teacher's per-platform `mount`/NFS-loopback binding into a
//! small trait so the dispatch logic above stays host-neutral and testable
//! against a mock. A real FUSE/Dokan/NFS-loopback adapter is out of scope
//! here (spec.md Non-goals: "no filesystem-driver binding code"); this crate
//! ships the dispatcher plus the two backends below.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Errno;
use crate::model::SyncPairId;

#[async_trait]
pub trait HostMount: Send + Sync {
    async fn mount(&self, sync_pair_id: SyncPairId, target_dir: &PathBuf) -> Result<(), Errno>;
    async fn unmount(&self, sync_pair_id: SyncPairId) -> Result<(), Errno>;
}

/// Used by `--foreground` debug runs and anywhere a mount point isn't
/// actually needed: claims success without touching the host.
#[derive(Debug, Default)]
pub struct NoopHostMount;

#[async_trait]
impl HostMount for NoopHostMount {
    async fn mount(&self, _sync_pair_id: SyncPairId, _target_dir: &PathBuf) -> Result<(), Errno> {
        Ok(())
    }

    async fn unmount(&self, _sync_pair_id: SyncPairId) -> Result<(), Errno> {
        Ok(())
    }
}

/// Records mount/unmount calls for assertions in dispatcher tests.
#[derive(Debug, Default)]
pub struct MockHostMount {
    pub mounted: std::sync::Mutex<std::collections::HashSet<SyncPairId>>,
}

#[async_trait]
impl HostMount for MockHostMount {
    async fn mount(&self, sync_pair_id: SyncPairId, _target_dir: &PathBuf) -> Result<(), Errno> {
        self.mounted.lock().unwrap().insert(sync_pair_id);
        Ok(())
    }

    async fn unmount(&self, sync_pair_id: SyncPairId) -> Result<(), Errno> {
        self.mounted.lock().unwrap().remove(&sync_pair_id);
        Ok(())
    }
}
