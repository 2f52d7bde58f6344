//! Calculate and Resolve phases (spec §4.5 steps 2 and 4): turns a
//! reconciled snapshot of `FileEntry` records into a [`SyncPlan`], then
//! assigns a resolution to every [`ConflictInfo`] it raised.

use crate::model::{
    ConflictInfo, ConflictResolution, ConflictStrategy, ConflictType, FileEntry, Location,
    SideMeta, SyncAction, SyncDirection, SyncPairId,
};

/// Plain two-field diff outcome for the Calculate phase; not persisted.
enum Diff {
    New,
    Modified,
    Unchanged,
}

fn quick_diff(entry: &FileEntry) -> Diff {
    if !entry.is_dirty {
        Diff::Unchanged
    } else {
        Diff::Modified
    }
}

/// Builds the action list and raw conflict list for one run (spec §4.5
/// phase 2). `entries` is the post-Indexer snapshot for the pair; directory
/// entries are turned into `CreateDirectory` actions, file entries into
/// `Copy`/`Update`/`Skip`/`ResolveConflict`.
pub fn calculate(
    sync_pair_id: SyncPairId,
    direction: SyncDirection,
    entries: &[FileEntry],
) -> (Vec<SyncAction>, Vec<ConflictInfo>) {
    let mut actions = Vec::new();
    let mut conflicts = Vec::new();

    let mut sorted: Vec<&FileEntry> = entries.iter().filter(|e| e.sync_pair_id == sync_pair_id).collect();
    sorted.sort_by_key(|e| (depth(&e.virtual_path), !e.is_directory));

    for entry in sorted {
        if entry.is_directory {
            plan_directory(entry, direction, &mut actions);
            continue;
        }
        plan_file(entry, direction, &mut actions, &mut conflicts);
    }

    (actions, conflicts)
}

fn depth(virtual_path: &str) -> usize {
    virtual_path.matches('/').count()
}

fn plan_directory(entry: &FileEntry, direction: SyncDirection, actions: &mut Vec<SyncAction>) {
    match entry.location {
        Location::LocalOnly if direction.allows_push() => {
            actions.push(SyncAction::CreateDirectory { relative_path: entry.virtual_path.clone() })
        }
        Location::ExternalOnly if direction.allows_pull() => {
            actions.push(SyncAction::CreateDirectory { relative_path: entry.virtual_path.clone() })
        }
        _ => {}
    }
}

fn plan_file(
    entry: &FileEntry,
    direction: SyncDirection,
    actions: &mut Vec<SyncAction>,
    conflicts: &mut Vec<ConflictInfo>,
) {
    let path = entry.virtual_path.clone();
    match entry.location {
        Location::LocalOnly => {
            if direction.allows_push() {
                actions.push(SyncAction::Copy { relative_path: path });
            } else {
                actions.push(SyncAction::Skip { relative_path: path, reason: "push direction disabled".into() });
            }
        }
        Location::ExternalOnly => {
            if direction.allows_pull() {
                actions.push(SyncAction::Copy { relative_path: path });
            } else {
                // A push-only pair never pulls inbound, regardless of why
                // the file has no local counterpart. Raising a conflict here
                // would let the configured `ConflictStrategy` resolve into
                // an inbound copy - e.g. `keepExternal` or `newerWins` with
                // no local side - silently pulling data into a pair the
                // operator configured as one-directional.
                actions.push(SyncAction::Skip { relative_path: path, reason: "pull direction disabled".into() });
            }
        }
        Location::Both => match quick_diff(entry) {
            Diff::Unchanged | Diff::New => {}
            Diff::Modified => {
                if direction == SyncDirection::Bidirectional {
                    let meta = SideMeta { size: entry.size, mtime: entry.modified_at };
                    conflicts.push(ConflictInfo {
                        relative_path: path.clone(),
                        local_meta: Some(meta),
                        external_meta: Some(meta),
                        conflict_type: ConflictType::BothModified,
                        resolution: None,
                    });
                    actions.push(SyncAction::ResolveConflict { relative_path: path });
                } else {
                    actions.push(SyncAction::Update { relative_path: path });
                }
            }
        },
        Location::NotExists => {}
    }
}

/// Resolve phase (spec §4.5 step 4): assigns a [`ConflictResolution`] to
/// every conflict according to the pair's configured [`ConflictStrategy`].
/// `newerWins` compares modification time; ties break by size, then by
/// `localToExternal` direction (i.e. local wins on a total tie).
pub fn resolve(conflicts: &mut [ConflictInfo], strategy: ConflictStrategy) {
    for conflict in conflicts.iter_mut() {
        conflict.resolution = Some(resolve_one(conflict, strategy));
    }
}

fn resolve_one(conflict: &ConflictInfo, strategy: ConflictStrategy) -> ConflictResolution {
    match strategy {
        ConflictStrategy::KeepLocal => ConflictResolution::KeepLocal,
        ConflictStrategy::KeepExternal => ConflictResolution::KeepExternal,
        ConflictStrategy::LocalWinsWithBackup => ConflictResolution::LocalWinsWithBackup,
        ConflictStrategy::ExternalWinsWithBackup => ConflictResolution::ExternalWinsWithBackup,
        ConflictStrategy::KeepBoth => ConflictResolution::KeepBoth,
        ConflictStrategy::Skip => ConflictResolution::Skip,
        ConflictStrategy::NewerWins => newer_wins(conflict),
    }
}

fn newer_wins(conflict: &ConflictInfo) -> ConflictResolution {
    match (conflict.local_meta, conflict.external_meta) {
        (Some(local), Some(external)) => {
            if local.mtime > external.mtime {
                ConflictResolution::KeepLocal
            } else if external.mtime > local.mtime {
                ConflictResolution::KeepExternal
            } else if local.size != external.size {
                if local.size > external.size {
                    ConflictResolution::KeepLocal
                } else {
                    ConflictResolution::KeepExternal
                }
            } else {
                // Full tie: break toward localToExternal.
                ConflictResolution::KeepLocal
            }
        }
        (Some(_), None) => ConflictResolution::KeepLocal,
        (None, Some(_)) => ConflictResolution::KeepExternal,
        (None, None) => ConflictResolution::Skip,
    }
}

/// Naming template for the `keepBoth` resolution (spec §9 open question):
/// the secondary (losing) side's file is renamed with a timestamp suffix
/// inserted before the extension, e.g. `notes.txt` -> `notes.conflict-<ts>.txt`.
pub fn keep_both_backup_name(virtual_path: &str, unix_ts: u64) -> String {
    match virtual_path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.conflict-{unix_ts}.{ext}"),
        _ => format!("{virtual_path}.conflict-{unix_ts}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileEntry, SystemTimestamp};

    fn entry(path: &str, location: Location, dirty: bool, is_dir: bool) -> FileEntry {
        let mut e = FileEntry::new(1, path.to_string(), is_dir);
        e.location = location;
        e.is_dirty = dirty;
        e.local_path = matches!(location, Location::LocalOnly | Location::Both).then(|| "/l".into());
        e.external_path =
            matches!(location, Location::ExternalOnly | Location::Both).then(|| "/e".into());
        e
    }

    #[test]
    fn local_only_push_allowed_copies() {
        let entries = vec![entry("a.txt", Location::LocalOnly, false, false)];
        let (actions, conflicts) = calculate(1, SyncDirection::LocalToExternal, &entries);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], SyncAction::Copy { .. }));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn local_only_push_disabled_skips() {
        let entries = vec![entry("a.txt", Location::LocalOnly, false, false)];
        let (actions, _) = calculate(1, SyncDirection::ExternalToLocal, &entries);
        assert!(matches!(actions[0], SyncAction::Skip { .. }));
    }

    #[test]
    fn external_only_pull_disabled_skips_without_conflict() {
        let entries = vec![entry("a.txt", Location::ExternalOnly, false, false)];
        let (actions, conflicts) = calculate(1, SyncDirection::LocalToExternal, &entries);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], SyncAction::Skip { .. }));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn both_dirty_one_way_updates_without_conflict() {
        let entries = vec![entry("a.txt", Location::Both, true, false)];
        let (actions, conflicts) = calculate(1, SyncDirection::LocalToExternal, &entries);
        assert!(matches!(actions[0], SyncAction::Update { .. }));
        assert!(conflicts.is_empty());
    }

    #[test]
    fn both_dirty_bidirectional_raises_conflict() {
        let entries = vec![entry("a.txt", Location::Both, true, false)];
        let (actions, conflicts) = calculate(1, SyncDirection::Bidirectional, &entries);
        assert!(matches!(actions[0], SyncAction::ResolveConflict { .. }));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::BothModified);
    }

    #[test]
    fn both_clean_produces_no_action() {
        let entries = vec![entry("a.txt", Location::Both, false, false)];
        let (actions, _) = calculate(1, SyncDirection::Bidirectional, &entries);
        assert!(actions.is_empty());
    }

    #[test]
    fn newer_wins_prefers_later_mtime() {
        let mut c = ConflictInfo {
            relative_path: "a.txt".into(),
            local_meta: Some(SideMeta { size: 10, mtime: SystemTimestamp(200) }),
            external_meta: Some(SideMeta { size: 10, mtime: SystemTimestamp(100) }),
            conflict_type: ConflictType::BothModified,
            resolution: None,
        };
        resolve(std::slice::from_mut(&mut c), ConflictStrategy::NewerWins);
        assert_eq!(c.resolution, Some(ConflictResolution::KeepLocal));
    }

    #[test]
    fn newer_wins_full_tie_breaks_local() {
        let mut c = ConflictInfo {
            relative_path: "a.txt".into(),
            local_meta: Some(SideMeta { size: 10, mtime: SystemTimestamp(100) }),
            external_meta: Some(SideMeta { size: 10, mtime: SystemTimestamp(100) }),
            conflict_type: ConflictType::BothModified,
            resolution: None,
        };
        resolve(std::slice::from_mut(&mut c), ConflictStrategy::NewerWins);
        assert_eq!(c.resolution, Some(ConflictResolution::KeepLocal));
    }

    #[test]
    fn keep_both_name_inserts_timestamp_before_extension() {
        assert_eq!(keep_both_backup_name("notes.txt", 12345), "notes.conflict-12345.txt");
        assert_eq!(keep_both_backup_name("README", 1), "README.conflict-1");
    }
}
