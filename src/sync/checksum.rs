//! SHA-256 content checksums (spec §4.5 phase 3), computed in bounded
//! `IO_CHUNK_BYTES` chunks so the 64 KiB cancellation boundary (spec §5
//! "Timeouts") is honored while hashing, not just during copy.
//!
//! `sha2` is pulled in for this - the teacher crate has no hashing
//! dependency of its own.

use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{SyncError, SyncResult};
use crate::model::IO_CHUNK_BYTES;

/// Hashes `path` in `IO_CHUNK_BYTES` chunks, checking `cancelled` between
/// chunks. Returns the lowercase hex digest.
pub async fn checksum_file(
    path: &std::path::Path,
    cancelled: &AtomicBool,
) -> SyncResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::from_io(&e, format!("opening {}", path.display())))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_CHUNK_BYTES];
    loop {
        if cancelled.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| SyncError::from_io(&e, format!("reading {}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex_digest(hasher.finalize().as_slice()))
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String never fails");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_content_hashes_equal() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let cancelled = AtomicBool::new(false);
        let hash_a = checksum_file(&a, &cancelled).await.unwrap();
        let hash_b = checksum_file(&b, &cancelled).await.unwrap();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 64);
    }

    #[tokio::test]
    async fn different_content_hashes_differ() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"one").unwrap();
        std::fs::write(&b, b"two").unwrap();

        let cancelled = AtomicBool::new(false);
        let hash_a = checksum_file(&a, &cancelled).await.unwrap();
        let hash_b = checksum_file(&b, &cancelled).await.unwrap();
        assert_ne!(hash_a, hash_b);
    }

    #[tokio::test]
    async fn cancellation_flag_aborts_hashing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, vec![0u8; IO_CHUNK_BYTES * 3]).unwrap();

        let cancelled = AtomicBool::new(true);
        let result = checksum_file(&path, &cancelled).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
