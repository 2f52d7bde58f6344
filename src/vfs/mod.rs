//! In-process virtual filesystem layer (spec §4.4).
//!
//! Generalizes the teacher's NFSv3-shaped `vfs::Vfs` trait
//! (`src/vfs/mod.rs`, dropped in the trimming pass - see DESIGN.md) down to
//! a POSIX-ish surface: `lookup`, `getattr`, `readdir`, `open_read`/`read`,
//! `open_write`/`write`/`close_write`, `unlink`, `rename`, `mkdir`. The
//! wire-protocol framing the teacher needed
//! (`FileHandle` byte encoding, WCC data, cookie verifiers) has no
//! counterpart here: this crate's RPC surface is the in-process
//! [`crate::rpc::Request`]/[`crate::rpc::Response`] pair, not an NFS mount.

mod dispatch;
mod host;
mod types;

pub use dispatch::{VfsDispatcher, WriteHandle};
pub use host::{HostMount, MockHostMount, NoopHostMount};
pub use types::{Attr, DirEntry, ReadResult, VfsResult, WriteResult};

use async_trait::async_trait;

/// Object-safe facade over [`VfsDispatcher`] so the dispatch logic can be
/// driven through a trait object in tests (spec §9: "MUST be implementable
/// against a mock backend for tests").
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn getattr(&self, virtual_path: &str) -> VfsResult<Attr>;
    async fn lookup(&self, parent_virtual_dir: &str, name: &str) -> VfsResult<Attr>;
    async fn readdir(&self, virtual_path: &str) -> VfsResult<Vec<DirEntry>>;
    async fn read(&self, virtual_path: &str, offset: u64, len: u32) -> VfsResult<ReadResult>;
    async fn open_write(&self, virtual_path: &str) -> VfsResult<WriteHandle>;
    async fn write(&self, handle: &mut WriteHandle, offset: u64, data: &[u8]) -> VfsResult<u32>;
    async fn close_write(&self, handle: WriteHandle) -> VfsResult<WriteResult>;
    async fn mkdir(&self, virtual_path: &str) -> VfsResult<Attr>;
    async fn unlink(&self, virtual_path: &str) -> VfsResult<()>;
    async fn rename(&self, from_virtual: &str, to_virtual: &str) -> VfsResult<()>;
}

#[async_trait]
impl Vfs for VfsDispatcher {
    async fn getattr(&self, virtual_path: &str) -> VfsResult<Attr> {
        VfsDispatcher::getattr(self, virtual_path).await
    }

    async fn lookup(&self, parent_virtual_dir: &str, name: &str) -> VfsResult<Attr> {
        VfsDispatcher::lookup(self, parent_virtual_dir, name).await
    }

    async fn readdir(&self, virtual_path: &str) -> VfsResult<Vec<DirEntry>> {
        VfsDispatcher::readdir(self, virtual_path).await
    }

    async fn read(&self, virtual_path: &str, offset: u64, len: u32) -> VfsResult<ReadResult> {
        VfsDispatcher::read(self, virtual_path, offset, len).await
    }

    async fn open_write(&self, virtual_path: &str) -> VfsResult<WriteHandle> {
        VfsDispatcher::open_write(self, virtual_path).await
    }

    async fn write(&self, handle: &mut WriteHandle, offset: u64, data: &[u8]) -> VfsResult<u32> {
        VfsDispatcher::write(self, handle, offset, data).await
    }

    async fn close_write(&self, handle: WriteHandle) -> VfsResult<WriteResult> {
        VfsDispatcher::close_write(self, handle).await
    }

    async fn mkdir(&self, virtual_path: &str) -> VfsResult<Attr> {
        VfsDispatcher::mkdir(self, virtual_path).await
    }

    async fn unlink(&self, virtual_path: &str) -> VfsResult<()> {
        VfsDispatcher::unlink(self, virtual_path).await
    }

    async fn rename(&self, from_virtual: &str, to_virtual: &str) -> VfsResult<()> {
        VfsDispatcher::rename(self, from_virtual, to_virtual).await
    }
}
