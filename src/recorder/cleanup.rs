//! Disk guard, retention sweeps, and emergency cleanup.
//!
//! Emergency cleanup runs when free space drops below the configured
//! floor: it deletes segments one at a time, already-uploaded files first,
//! then oldest-first, rechecking free space after each delete. The file a
//! live muxer is currently writing is never touched.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

use super::lock;
use super::upload::save_upload_state;

/// Free-space probe signature; injected so tests can simulate a full disk.
pub(crate) type FreeMb<'a> = &'a dyn Fn(&Path) -> Option<u64>;

/// Free megabytes on the filesystem holding `path`.
pub(crate) fn fs_free_mb(path: &Path) -> Option<u64> {
    fs2::available_space(path).ok().map(|b| b / (1024 * 1024))
}

/// True when the recording filesystem has at least `min_disk_mb` free.
pub(crate) fn disk_ok(path: &Path, min_disk_mb: u64, free_mb: FreeMb<'_>) -> bool {
    free_mb(path).is_some_and(|mb| mb >= min_disk_mb)
}

/// Disk usage summary for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct DiskInfo {
    /// Total filesystem size in MB.
    pub total_mb: u64,
    /// Free space in MB.
    pub free_mb: u64,
    /// Used space in MB.
    pub used_mb: u64,
    /// Used percentage.
    pub used_pct: f64,
    /// The probed path.
    pub path: PathBuf,
    /// Whether free space clears the configured floor.
    pub ok: bool,
    /// Probe failure, if the filesystem could not be inspected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Build the disk usage summary for `path`.
pub fn disk_info(path: &Path, min_disk_mb: u64) -> DiskInfo {
    match (fs2::total_space(path), fs2::available_space(path)) {
        (Ok(total), Ok(free)) => {
            let total_mb = total / (1024 * 1024);
            let free_mb = free / (1024 * 1024);
            let used_mb = total_mb.saturating_sub(free_mb);
            let used_pct = if total_mb > 0 {
                (used_mb as f64 / total_mb as f64 * 1000.0).round() / 10.0
            } else {
                0.0
            };
            DiskInfo {
                total_mb,
                free_mb,
                used_mb,
                used_pct,
                path: path.to_path_buf(),
                ok: free_mb >= min_disk_mb,
                error: None,
            }
        }
        (total, free) => {
            let err = total.err().or(free.err()).map(|e| e.to_string());
            DiskInfo {
                total_mb: 0,
                free_mb: 0,
                used_mb: 0,
                used_pct: 0.0,
                path: path.to_path_buf(),
                ok: false,
                error: err,
            }
        }
    }
}

/// Newest-mtime `.mp4` in a channel directory.
pub(crate) fn newest_mp4(ch_dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(ch_dir).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "mp4"))
        .max_by_key(|p| mtime(p).unwrap_or(SystemTime::UNIX_EPOCH))
}

pub(crate) fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

/// All channel segment directories (`ch*`) under the record dir.
pub(crate) fn channel_dirs(record_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(record_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with("ch"))
        })
        .collect();
    dirs.sort();
    dirs
}

/// Delete segments until free space clears the floor, preferring files
/// already uploaded and then the oldest. `active` holds the per-channel
/// files currently being written; those are never deleted. Returns the
/// number of files removed.
pub(crate) fn emergency_cleanup(
    record_dir: &Path,
    min_disk_mb: u64,
    uploaded: &Mutex<HashSet<PathBuf>>,
    active: &HashSet<PathBuf>,
    free_mb: FreeMb<'_>,
) -> usize {
    log::warn!(
        "emergency cleanup: disk low on {} (min {min_disk_mb} MB)",
        record_dir.display()
    );

    // (not-uploaded flag, mtime, path) sorts uploaded-oldest first.
    let mut candidates: Vec<(u8, SystemTime, PathBuf)> = Vec::new();
    {
        let uploaded = lock(uploaded);
        for ch_dir in channel_dirs(record_dir) {
            let Ok(entries) = fs::read_dir(&ch_dir) else {
                continue;
            };
            for path in entries.flatten().map(|e| e.path()) {
                if !path.extension().is_some_and(|ext| ext == "mp4") {
                    continue;
                }
                if active.contains(&path) {
                    continue;
                }
                if let Some(modified) = mtime(&path) {
                    let rank = u8::from(!uploaded.contains(&path));
                    candidates.push((rank, modified, path));
                }
            }
        }
    }
    candidates.sort();

    let mut deleted = 0;
    for (_, _, path) in candidates {
        match fs::remove_file(&path) {
            Ok(()) => {
                lock(uploaded).remove(&path);
                deleted += 1;
                log::info!("emergency cleanup: removed {}", path.display());
                if disk_ok(record_dir, min_disk_mb, free_mb) {
                    break;
                }
            }
            Err(e) => log::warn!("emergency cleanup: {} not removed: {e}", path.display()),
        }
    }

    if deleted > 0 {
        let snapshot = lock(uploaded).clone();
        if let Err(e) = save_upload_state(record_dir, &snapshot) {
            log::warn!("could not persist upload state after cleanup: {e}");
        }
        log::info!("emergency cleanup: removed {deleted} files");
    }
    deleted
}

/// Delete segments older than the retention window and drop them from the
/// uploaded set.
pub(crate) fn retention_sweep(
    record_dir: &Path,
    retention_hours: u32,
    uploaded: &Mutex<HashSet<PathBuf>>,
) {
    let Some(cutoff) =
        SystemTime::now().checked_sub(std::time::Duration::from_secs(u64::from(retention_hours) * 3600))
    else {
        return;
    };
    for ch_dir in channel_dirs(record_dir) {
        let Ok(entries) = fs::read_dir(&ch_dir) else {
            continue;
        };
        for path in entries.flatten().map(|e| e.path()) {
            if !path.extension().is_some_and(|ext| ext == "mp4") {
                continue;
            }
            if mtime(&path).is_some_and(|m| m < cutoff) {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        lock(uploaded).remove(&path);
                        log::info!("cleanup: removed {}", path.display());
                    }
                    Err(e) => log::warn!("cleanup: {} not removed: {e}", path.display()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn touch(path: &Path) {
        fs::write(path, b"segment").unwrap();
    }

    #[test]
    fn test_newest_mp4_picks_latest_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let ch = dir.path().join("ch0");
        fs::create_dir_all(&ch).unwrap();
        touch(&ch.join("a.mp4"));
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&ch.join("b.mp4"));
        assert_eq!(newest_mp4(&ch).unwrap(), ch.join("b.mp4"));

        assert!(newest_mp4(&dir.path().join("ch9")).is_none());
    }

    #[test]
    fn test_emergency_cleanup_prefers_uploaded_then_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let ch = dir.path().join("ch0");
        fs::create_dir_all(&ch).unwrap();

        let old_uploaded = ch.join("old_uploaded.mp4");
        let old_plain = ch.join("old_plain.mp4");
        let newer_plain = ch.join("newer_plain.mp4");
        touch(&old_uploaded);
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&old_plain);
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&newer_plain);

        let uploaded = Mutex::new(HashSet::from([old_uploaded.clone()]));
        let active = HashSet::new();

        // Disk reads "low" until two files are gone.
        let record_dir = dir.path().to_path_buf();
        let probe = move |_: &Path| {
            let remaining = fs::read_dir(record_dir.join("ch0"))
                .map(|entries| {
                    entries
                        .flatten()
                        .filter(|e| e.path().extension().is_some_and(|x| x == "mp4"))
                        .count()
                })
                .unwrap_or(0);
            Some(if remaining <= 1 { 10_000 } else { 0 })
        };

        let deleted = emergency_cleanup(dir.path(), 500, &uploaded, &active, &probe);
        assert_eq!(deleted, 2);
        // Uploaded file went first, then the oldest non-uploaded one.
        assert!(!old_uploaded.exists());
        assert!(!old_plain.exists());
        assert!(newer_plain.exists());
        assert!(lock(&uploaded).is_empty());
        // State was persisted.
        assert!(dir.path().join(".upload_state.json").exists());
    }

    #[test]
    fn test_emergency_cleanup_spares_active_file() {
        let dir = tempfile::tempdir().unwrap();
        let ch = dir.path().join("ch0");
        fs::create_dir_all(&ch).unwrap();
        let open_file = ch.join("open.mp4");
        touch(&open_file);

        let uploaded = Mutex::new(HashSet::new());
        let active = HashSet::from([open_file.clone()]);
        let probe = |_: &Path| Some(0); // disk never recovers

        let deleted = emergency_cleanup(dir.path(), 500, &uploaded, &active, &probe);
        assert_eq!(deleted, 0);
        assert!(open_file.exists());
    }

    #[test]
    fn test_retention_sweep_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let ch = dir.path().join("ch1");
        fs::create_dir_all(&ch).unwrap();
        let fresh = ch.join("fresh.mp4");
        touch(&fresh);

        let uploaded = Mutex::new(HashSet::from([fresh.clone()]));
        // A fresh file is newer than any positive retention cutoff.
        retention_sweep(dir.path(), 24, &uploaded);
        assert!(fresh.exists());
        assert!(lock(&uploaded).contains(&fresh));
    }

    #[test]
    fn test_mtime_helper() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("x");
        fs::write(&f, "x").unwrap();
        assert!(mtime(&f).is_some());
        assert!(mtime(&dir.path().join("missing")).is_none());
    }

    #[test]
    fn test_disk_info_shape() {
        let dir = tempfile::tempdir().unwrap();
        let info = disk_info(dir.path(), 1);
        assert!(info.error.is_none());
        assert!(info.total_mb > 0);
        assert_eq!(info.used_mb, info.total_mb - info.free_mb);

        let missing = disk_info(Path::new("/definitely/not/here"), 1);
        assert!(!missing.ok);
        assert!(missing.error.is_some());
    }
}
