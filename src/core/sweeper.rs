//! Removal of `.TBPART` files left behind by interrupted transfers.
//!
//! Only temp files older than a safety threshold are removed, so a transfer
//! that is merely slow never loses its temp file.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::transfer_engine::TEMP_SUFFIX;

/// Temp files younger than this are assumed to belong to a live transfer.
pub const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Recursively remove temp files under `root` whose mtime is older than `max_age`.
///
/// Returns the number of files removed. Entries that cannot be read, stat'ed
/// or removed are logged at debug and skipped.
pub fn sweep_orphaned_temp_files(root: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        if !entry.file_type().is_file() || !is_temp_file(entry.path()) {
            continue;
        }

        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(modified) => modified,
            None => {
                debug!(path = %entry.path().display(), "Skipping temp file without mtime");
                continue;
            }
        };

        // Future mtimes (clock skew) count as fresh
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age <= max_age {
            debug!(
                path = %entry.path().display(),
                age_secs = age.as_secs(),
                "Keeping recent temp file"
            );
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                info!(path = %entry.path().display(), age_secs = age.as_secs(), "Removed orphaned temp file");
                removed += 1;
            }
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Failed to remove orphaned temp file");
            }
        }
    }

    removed
}

/// Run [`sweep_orphaned_temp_files`] on the blocking thread pool.
pub async fn cleanup_orphaned_temp_files(root: &Path, max_age: Duration) -> usize {
    let root: PathBuf = root.to_path_buf();

    match tokio::task::spawn_blocking(move || sweep_orphaned_temp_files(&root, max_age)).await {
        Ok(removed) => removed,
        Err(e) => {
            warn!(error = %e, "Orphaned temp file sweep did not complete");
            0
        }
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::fs;
    use tempfile::tempdir;

    fn write_aged(path: &Path, age: Duration) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"partial").unwrap();
        let mtime = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(path, mtime).unwrap();
    }

    #[test]
    fn test_only_old_temp_files_are_removed() {
        let temp = tempdir().unwrap();
        let fresh = temp.path().join("day1/A001.MOV.TBPART");
        let stale = temp.path().join("day1/cam_b/B002.MOV.TBPART");
        write_aged(&fresh, Duration::from_secs(60 * 60));
        write_aged(&stale, Duration::from_secs(25 * 60 * 60));

        let removed = sweep_orphaned_temp_files(temp.path(), DEFAULT_ORPHAN_MAX_AGE);

        assert_eq!(removed, 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[test]
    fn test_regular_files_are_never_touched() {
        let temp = tempdir().unwrap();
        let clip = temp.path().join("A001.MOV");
        let lookalike = temp.path().join("TBPART.notes");
        write_aged(&clip, Duration::from_secs(48 * 60 * 60));
        write_aged(&lookalike, Duration::from_secs(48 * 60 * 60));

        assert_eq!(sweep_orphaned_temp_files(temp.path(), DEFAULT_ORPHAN_MAX_AGE), 0);
        assert!(clip.exists());
        assert!(lookalike.exists());
    }

    #[test]
    fn test_missing_root_is_not_fatal() {
        let temp = tempdir().unwrap();
        assert_eq!(
            sweep_orphaned_temp_files(&temp.path().join("unplugged"), DEFAULT_ORPHAN_MAX_AGE),
            0
        );
    }

    #[tokio::test]
    async fn test_async_cleanup() {
        let temp = tempdir().unwrap();
        write_aged(&temp.path().join("x.TBPART"), Duration::from_secs(3 * 60 * 60));

        let removed = cleanup_orphaned_temp_files(temp.path(), Duration::from_secs(2 * 60 * 60)).await;
        assert_eq!(removed, 1);
    }
}
