//! Append-only binary journal backing the [`super::Store`] (spec §4.1
//! durability guarantees, §6 "Persisted layout").
//!
//! Every file this module writes opens with a 4-byte magic and 2-byte
//! little-endian schema version (spec §6: "readers refuse unknown
//! versions"). Records are length-prefixed and carry a lightweight integrity
//! checksum; a record that fails its checksum is copied to a
//! `.quarantine` side file and replay continues from the next record
//! boundary (spec §4.1: "corrupted records are quarantined ... never
//! silently discarded").
//!
//! Encoding uses `byteorder` directly (a teacher dependency that previously
//! had no caller) rather than a general serialization framework for the
//! fixed-size header fields, with `serde_json` for the variable-length
//! record payload.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::model::{FileEntry, SyncHistory, SyncPairId, SyncStatistics};

pub const MAGIC: &[u8; 4] = b"SYNJ";
pub const SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    UpsertEntry(FileEntry),
    DeleteEntry { sync_pair_id: SyncPairId, virtual_path: String },
    MarkClean { sync_pair_id: SyncPairId, virtual_path: String },
    AppendHistory(SyncHistory),
    UpsertStatistics(SyncStatistics),
}

/// A single open journal file plus the path it was opened from, wrapped in
/// the caller's `tokio::sync::Mutex` to realize the "single active writer"
/// guarantee from spec §5.
pub struct Journal {
    path: PathBuf,
    file: File,
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

impl Journal {
    /// Open (creating if absent) the journal at `path`, writing the header
    /// if the file is new and refusing any other schema version.
    pub fn open(path: &Path) -> io::Result<Self> {
        let existed = path.exists();
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(path)?;

        if !existed || file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.write_u16::<LittleEndian>(SCHEMA_VERSION)?;
            file.flush()?;
        } else {
            let mut header_file = File::open(path)?;
            let mut magic = [0u8; 4];
            header_file.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "bad journal magic"));
            }
            let version = header_file.read_u16::<LittleEndian>()?;
            if version != SCHEMA_VERSION {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported journal schema version {version}"),
                ));
            }
        }

        Ok(Journal { path: path.to_path_buf(), file })
    }

    /// Append one record, durably. Durability on `upsertEntry`,
    /// `appendHistory`, `updateLocation`, `markClean` (spec §4.1) is realized
    /// by calling this for exactly those mutations and `sync_data`-ing
    /// before returning.
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let checksum = fnv1a(&payload);
        self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.file.write_u32::<LittleEndian>(checksum)?;
        self.file.write_all(&payload)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Truncate the journal back to just its header, used right after a
    /// snapshot makes the tail redundant (spec §4.1 "Snapshot + journal tail
    /// is the recovery unit").
    pub fn compact(&mut self) -> io::Result<()> {
        self.file.set_len(6)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Replay every record in the journal at `path`, handing each valid one to
/// `apply`. Corrupt records are appended to `<path>.quarantine` with a
/// reason line and replay continues at the next length-prefix boundary.
pub fn replay(path: &Path, mut apply: impl FnMut(JournalRecord)) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad journal magic"));
    }
    let version = file.read_u16::<LittleEndian>()?;
    if version != SCHEMA_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported journal schema version {version}"),
        ));
    }

    loop {
        let len = match file.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let expected_checksum = match file.read_u32::<LittleEndian>() {
            Ok(c) => c,
            Err(_) => break,
        };
        let mut payload = vec![0u8; len as usize];
        if file.read_exact(&mut payload).is_err() {
            break;
        }

        if fnv1a(&payload) != expected_checksum {
            quarantine(path, &payload, "checksum mismatch")?;
            continue;
        }

        match serde_json::from_slice::<JournalRecord>(&payload) {
            Ok(record) => apply(record),
            Err(e) => {
                quarantine(path, &payload, &format!("deserialize error: {e}"))?;
            }
        }
    }

    Ok(())
}

fn quarantine(journal_path: &Path, payload: &[u8], reason: &str) -> io::Result<()> {
    let quarantine_path = quarantine_path(journal_path);
    let mut out = OpenOptions::new().create(true).append(true).open(quarantine_path)?;
    writeln!(out, "-- reason: {reason}, {} bytes --", payload.len())?;
    out.write_all(payload)?;
    out.write_all(b"\n")?;
    tracing::warn!(journal = %journal_path.display(), reason, "quarantined corrupt journal record");
    Ok(())
}

fn quarantine_path(journal_path: &Path) -> PathBuf {
    let mut os_string = journal_path.as_os_str().to_owned();
    os_string.push(".quarantine");
    PathBuf::from(os_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Location, LockState};

    fn sample_entry() -> FileEntry {
        let mut e = FileEntry::new(1, "a.txt".into(), false);
        e.location = Location::LocalOnly;
        e.local_path = Some("/tmp/a.txt".into());
        e.lock_state = LockState::Unlocked;
        e
    }

    #[test]
    fn round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.bin");
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&JournalRecord::UpsertEntry(sample_entry())).unwrap();
            journal
                .append(&JournalRecord::DeleteEntry { sync_pair_id: 1, virtual_path: "b.txt".into() })
                .unwrap();
        }

        let mut seen = Vec::new();
        replay(&path, |record| seen.push(record)).unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn quarantines_corrupt_record_and_keeps_replaying() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.bin");
        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(&JournalRecord::UpsertEntry(sample_entry())).unwrap();
        }

        // Flip a byte in the payload to corrupt its checksum.
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let mut seen = Vec::new();
        replay(&path, |record| seen.push(record)).unwrap();
        assert!(seen.is_empty());
        assert!(quarantine_path(&path).exists());
    }

    #[test]
    fn refuses_unknown_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("j.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(MAGIC).unwrap();
        file.write_u16::<LittleEndian>(SCHEMA_VERSION + 1).unwrap();
        drop(file);

        assert!(Journal::open(&path).is_err());
    }
}
