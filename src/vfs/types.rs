//! Shared result/attribute types for the dispatch table (spec §4.4).

use crate::error::Errno;
use crate::model::SystemTimestamp;

pub type VfsResult<T> = Result<T, Errno>;

/// POSIX-ish attributes returned by `lookup`/`getattr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub size: u64,
    pub is_directory: bool,
    pub modified_at: SystemTimestamp,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Clone)]
pub struct ReadResult {
    pub data: Vec<u8>,
    pub attr: Attr,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub bytes_written: u32,
    pub attr: Attr,
}
