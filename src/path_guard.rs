//! Pure path-normalization and whitelist validator (spec §4.2).
//!
//! `PathGuard` is the single chokepoint every boundary that accepts a
//! virtual or absolute path calls before touching the filesystem: VFS
//! dispatch, the RPC surface, and the SyncEngine. An invalid path yields
//! [`SyncError::InvalidPath`] without any filesystem access, matching the
//! teacher's `validate_name_component`-style "fail before I/O" idiom
//! (`examples/RMamonts-nfs-mamont/examples/shadow_fs/fs/utils.rs`).

use std::path::{Component, Path, PathBuf};

use crate::error::SyncError;

/// Length limits from spec §4.2.
pub const MAX_PATH_LEN: usize = 1024;
pub const MAX_COMPONENT_LEN: usize = 255;

const BLACKLISTED_SUBSTRINGS: &[&str] = &[
    "../", "/etc/", "/System/", "/usr/", "/bin/", "/sbin/", "/var/", "/tmp/", "/Library/", "\0",
];

/// Validate and normalize a virtual path (relative to a sync pair's mount
/// point). Strips leading/trailing slashes; rejects `..`, `//`, a leading
/// `.`, NUL bytes, and anything over the length limits.
pub fn validate_virtual(path: &str) -> Result<String, SyncError> {
    if path.len() > MAX_PATH_LEN {
        return Err(invalid(path, "path exceeds MAX_PATH_LEN"));
    }
    if path.contains('\0') {
        return Err(invalid(path, "path contains NUL byte"));
    }

    let trimmed = path.trim_matches('/');
    if trimmed.starts_with('.') && (trimmed == "." || trimmed.starts_with("./")) {
        return Err(invalid(path, "path starts with '.'"));
    }
    if trimmed.contains("//") {
        return Err(invalid(path, "path contains '//'"));
    }

    for component in trimmed.split('/') {
        if component == ".." {
            return Err(invalid(path, "path contains '..'"));
        }
        if component.is_empty() && !trimmed.is_empty() {
            return Err(invalid(path, "path contains an empty component"));
        }
        if component.len() > MAX_COMPONENT_LEN {
            return Err(invalid(path, "path component exceeds MAX_COMPONENT_LEN"));
        }
    }

    Ok(trimmed.to_string())
}

/// Validate an absolute host path against a base directory (spec §4.2).
/// Returns the canonicalized path iff, after tilde expansion and symlink
/// resolution, it is prefix-equal to `within_base` and contains none of the
/// blacklisted substrings, unless the resolved path is under the user's
/// home directory.
pub fn validate_absolute(path: &Path, within_base: &Path) -> Result<PathBuf, SyncError> {
    let path_str = path.to_string_lossy();
    if path_str.len() > MAX_PATH_LEN {
        return Err(invalid(&path_str, "path exceeds MAX_PATH_LEN"));
    }
    if path_str.contains('\0') {
        return Err(invalid(&path_str, "path contains NUL byte"));
    }

    let expanded = expand_tilde(path);
    let canonical = dunce_canonicalize(&expanded)
        .map_err(|_| invalid(&path_str, "path does not resolve to an existing location"))?;
    let canonical_base = dunce_canonicalize(within_base)
        .map_err(|_| invalid(&path_str, "base directory does not exist"))?;

    if !canonical.starts_with(&canonical_base) {
        return Err(invalid(&path_str, "path escapes the allowed base directory"));
    }

    let canonical_str = canonical.to_string_lossy();
    let under_home = home_dir().map(|home| canonical.starts_with(&home)).unwrap_or(false);
    if !under_home {
        for needle in BLACKLISTED_SUBSTRINGS {
            if canonical_str.contains(needle) {
                return Err(invalid(&path_str, "path touches a blacklisted system directory"));
            }
        }
    }

    Ok(canonical)
}

fn invalid(path: &str, reason: &'static str) -> SyncError {
    SyncError::InvalidPath { path: path.to_string(), reason }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// `Path::canonicalize` that tolerates a path whose final component does not
/// exist yet (the parent must exist and resolve cleanly; the tail is
/// appended lexically), matching the common case of validating a
/// not-yet-created destination file.
fn dunce_canonicalize(path: &Path) -> std::io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(err) => {
            let parent = path.parent().unwrap_or(Path::new("/"));
            let file_name = path.file_name();
            match (parent.canonicalize(), file_name) {
                (Ok(parent), Some(name)) => Ok(parent.join(name)),
                _ => Err(err),
            }
        }
    }
}

/// True iff every component of `path` is a plain `Normal` segment (no `..`,
/// no root, no prefix) - used when validating a single path component taken
/// from a directory listing, mirroring the teacher's
/// `validate_name_component`.
pub fn is_plain_component(path: &Path) -> bool {
    let mut components = path.components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_paths() {
        assert_eq!(validate_virtual("docs/readme.txt").unwrap(), "docs/readme.txt");
        assert_eq!(validate_virtual("/docs/readme.txt/").unwrap(), "docs/readme.txt");
    }

    #[test]
    fn rejects_dotdot() {
        assert!(validate_virtual("../etc/passwd").is_err());
        assert!(validate_virtual("docs/../../etc").is_err());
    }

    #[test]
    fn rejects_double_slash_and_nul() {
        assert!(validate_virtual("docs//readme.txt").is_err());
        assert!(validate_virtual("docs/\0readme.txt").is_err());
    }

    #[test]
    fn rejects_dot_prefix() {
        assert!(validate_virtual("./docs").is_err());
        assert!(validate_virtual(".").is_err());
    }

    #[test]
    fn rejects_overlong_component() {
        let long_name = "a".repeat(MAX_COMPONENT_LEN + 1);
        assert!(validate_virtual(&long_name).is_err());
    }

    #[test]
    fn absolute_validation_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        let outside = base.parent().unwrap();
        assert!(validate_absolute(outside, base).is_err());
        assert!(validate_absolute(base, base).is_ok());
    }

    #[test]
    fn absolute_validation_allows_not_yet_created_child() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        let child = base.join("new_file.txt");
        assert!(validate_absolute(&child, base).is_ok());
    }
}
