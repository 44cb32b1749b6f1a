//! Upload queue: discover closed segments, push them out, remember what
//! has already gone.
//!
//! The uploaded set is persisted as a sorted JSON array of absolute paths
//! at `<record-dir>/.upload_state.json`, rewritten atomically (temp file +
//! rename) after every mutation. Retry counts live only in the worker's
//! memory: after three failures a file is skipped until the next restart.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use super::{lock, sleep_while_running};
use crate::constants::{MAX_UPLOAD_RETRIES, SEGMENT_SETTLE, UPLOAD_INTERVAL};
use crate::uploader::{run_upload_command, Uploader};

/// Name of the persisted uploaded-set file inside the record dir.
pub const STATE_FILE: &str = ".upload_state.json";

/// Load the persisted uploaded set; a missing or malformed file is an
/// empty set.
pub fn load_upload_state(record_dir: &Path) -> HashSet<PathBuf> {
    match fs::read_to_string(record_dir.join(STATE_FILE)) {
        Ok(raw) => serde_json::from_str::<Vec<PathBuf>>(&raw)
            .map(|v| v.into_iter().collect())
            .unwrap_or_default(),
        Err(_) => HashSet::new(),
    }
}

/// Persist the uploaded set atomically as a sorted array.
pub fn save_upload_state(record_dir: &Path, uploaded: &HashSet<PathBuf>) -> Result<()> {
    let mut sorted: Vec<&PathBuf> = uploaded.iter().collect();
    sorted.sort();
    let json = serde_json::to_string(&sorted)?;
    let tmp = record_dir.join(format!("{STATE_FILE}.tmp"));
    fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, record_dir.join(STATE_FILE)).context("replacing upload state")?;
    Ok(())
}

/// Segments that look finished: mtime at least `min_age` old, non-empty,
/// and not in the uploaded set. Returns `(path, channel-dir-name)` pairs
/// in filesystem-listing order.
pub fn find_completed_segments(
    record_dir: &Path,
    uploaded: &HashSet<PathBuf>,
    min_age: Duration,
) -> Vec<(PathBuf, String)> {
    let now = SystemTime::now();
    let mut completed = Vec::new();
    let Ok(entries) = fs::read_dir(record_dir) else {
        return completed;
    };
    for ch_dir in entries.flatten().map(|e| e.path()) {
        let Some(ch_name) = ch_dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        if !ch_dir.is_dir() || !ch_name.starts_with("ch") {
            continue;
        }
        let Ok(files) = fs::read_dir(&ch_dir) else {
            continue;
        };
        for path in files.flatten().map(|e| e.path()) {
            if !path.extension().is_some_and(|ext| ext == "mp4") {
                continue;
            }
            if uploaded.contains(&path) {
                continue;
            }
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            let settled = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age >= min_age);
            if settled && meta.len() > 0 {
                completed.push((path, ch_name.clone()));
            }
        }
    }
    completed
}

/// Everything the upload worker needs, bundled for the thread.
pub(crate) struct UploadCtx {
    pub record_dir: PathBuf,
    pub running: Arc<AtomicBool>,
    pub uploaded: Arc<Mutex<HashSet<PathBuf>>>,
    pub uploader: Option<Arc<Mutex<Box<dyn Uploader>>>>,
    pub upload_command: String,
    pub delete_local: bool,
}

/// Worker loop: one discovery-and-upload pass every 15 s.
pub(crate) fn upload_worker(ctx: UploadCtx) {
    let mut failures: HashMap<PathBuf, u32> = HashMap::new();
    while ctx.running.load(Ordering::SeqCst) {
        sleep_while_running(&ctx.running, UPLOAD_INTERVAL);
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        upload_pass(&ctx, &mut failures, SEGMENT_SETTLE);
    }
}

/// One discovery-and-upload pass. `min_age` is injected for tests.
pub(crate) fn upload_pass(ctx: &UploadCtx, failures: &mut HashMap<PathBuf, u32>, min_age: Duration) {
    let snapshot = lock(&ctx.uploaded).clone();
    let pending = find_completed_segments(&ctx.record_dir, &snapshot, min_age);

    for (path, ch_name) in pending {
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        let retries = failures.get(&path).copied().unwrap_or(0);
        if retries >= MAX_UPLOAD_RETRIES {
            continue;
        }

        match upload_one(ctx, &path, &ch_name) {
            Ok(()) => {
                lock(&ctx.uploaded).insert(path.clone());
                failures.remove(&path);
                let snapshot = lock(&ctx.uploaded).clone();
                if let Err(e) = save_upload_state(&ctx.record_dir, &snapshot) {
                    log::warn!("could not persist upload state: {e}");
                }
                if ctx.delete_local {
                    match fs::remove_file(&path) {
                        Ok(()) => log::info!("deleted local (after upload): {}", path.display()),
                        Err(e) => log::warn!("could not delete {}: {e}", path.display()),
                    }
                }
            }
            Err(e) => {
                failures.insert(path.clone(), retries + 1);
                log::error!(
                    "upload failed ({}/{MAX_UPLOAD_RETRIES}) {}: {e}",
                    retries + 1,
                    path.file_name().unwrap_or_default().to_string_lossy()
                );
            }
        }
    }
}

/// Push one segment through the configured uploader(s): the API uploader
/// first, then the shell command; both when both are configured.
fn upload_one(ctx: &UploadCtx, path: &Path, ch_name: &str) -> Result<()> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("segment has no filename")?;

    if let Some(uploader) = &ctx.uploader {
        let mut uploader = lock(uploader);
        let folder = uploader.ensure_subfolder(ch_name)?;
        uploader.upload(path, &filename, folder.as_deref())?;
    }
    if !ctx.upload_command.is_empty() {
        run_upload_command(&ctx.upload_command, path, ch_name, &filename)?;
    }
    Ok(())
}

/// Count of segments currently awaiting upload (for the status surface).
pub(crate) fn count_pending(record_dir: &Path, uploaded: &Mutex<HashSet<PathBuf>>) -> usize {
    let snapshot = lock(uploaded).clone();
    find_completed_segments(record_dir, &snapshot, SEGMENT_SETTLE).len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_upload_state_round_trip_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let set: HashSet<PathBuf> =
            [PathBuf::from("/r/ch1/b.mp4"), PathBuf::from("/r/ch0/a.mp4")]
                .into_iter()
                .collect();
        save_upload_state(dir.path(), &set).unwrap();

        let raw = fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        let parsed: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec!["/r/ch0/a.mp4", "/r/ch1/b.mp4"]);

        assert_eq!(load_upload_state(dir.path()), set);
        // No temp file left behind.
        assert!(!dir.path().join(format!("{STATE_FILE}.tmp")).exists());
    }

    #[test]
    fn test_load_missing_or_malformed_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_upload_state(dir.path()).is_empty());
        fs::write(dir.path().join(STATE_FILE), "{not json").unwrap();
        assert!(load_upload_state(dir.path()).is_empty());
    }

    fn seed_segment(record_dir: &Path, ch: &str, name: &str, contents: &[u8]) -> PathBuf {
        let dir = record_dir.join(ch);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_find_completed_skips_empty_and_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let good = seed_segment(dir.path(), "ch0", "good.mp4", b"data");
        seed_segment(dir.path(), "ch0", "empty.mp4", b"");
        let done = seed_segment(dir.path(), "ch1", "done.mp4", b"data");
        seed_segment(dir.path(), "misc", "not_a_channel.mp4", b"data");

        let uploaded = HashSet::from([done]);
        let found = find_completed_segments(dir.path(), &uploaded, Duration::ZERO);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, good);
        assert_eq!(found[0].1, "ch0");
    }

    #[test]
    fn test_find_completed_respects_min_age() {
        let dir = tempfile::tempdir().unwrap();
        seed_segment(dir.path(), "ch0", "fresh.mp4", b"data");
        let found =
            find_completed_segments(dir.path(), &HashSet::new(), Duration::from_secs(60));
        assert!(found.is_empty());
    }

    /// Uploader that records calls and can be told to fail.
    struct TestUploader {
        attempts: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Uploader for TestUploader {
        fn ensure_subfolder(&mut self, _name: &str) -> Result<Option<String>> {
            Ok(Some("folder".into()))
        }
        fn upload(&mut self, _path: &Path, _filename: &str, _folder: Option<&str>) -> Result<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("simulated upload failure");
            }
            Ok("id".into())
        }
        fn list_files(&mut self, _folder: Option<&str>, _limit: usize) -> Result<Vec<crate::uploader::RemoteFile>> {
            Ok(Vec::new())
        }
        fn delete(&mut self, _file_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn test_ctx(dir: &Path, attempts: Arc<AtomicUsize>, fail: bool) -> UploadCtx {
        UploadCtx {
            record_dir: dir.to_path_buf(),
            running: Arc::new(AtomicBool::new(true)),
            uploaded: Arc::new(Mutex::new(HashSet::new())),
            uploader: Some(Arc::new(Mutex::new(
                Box::new(TestUploader { attempts, fail }) as Box<dyn Uploader>,
            ))),
            upload_command: String::new(),
            delete_local: false,
        }
    }

    #[test]
    fn test_upload_pass_is_idempotent_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        seed_segment(dir.path(), "ch0", "a.mp4", b"data");
        seed_segment(dir.path(), "ch0", "b.mp4", b"data");

        let attempts = Arc::new(AtomicUsize::new(0));
        let ctx = test_ctx(dir.path(), Arc::clone(&attempts), false);
        let mut failures = HashMap::new();

        upload_pass(&ctx, &mut failures, Duration::ZERO);
        upload_pass(&ctx, &mut failures, Duration::ZERO);
        assert_eq!(attempts.load(Ordering::SeqCst), 2); // each file exactly once

        // The persisted set survives a "restart".
        let reloaded = load_upload_state(dir.path());
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_upload_retries_cap_at_three() {
        let dir = tempfile::tempdir().unwrap();
        seed_segment(dir.path(), "ch0", "a.mp4", b"data");

        let attempts = Arc::new(AtomicUsize::new(0));
        let ctx = test_ctx(dir.path(), Arc::clone(&attempts), true);
        let mut failures = HashMap::new();

        for _ in 0..5 {
            upload_pass(&ctx, &mut failures, Duration::ZERO);
        }
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_UPLOAD_RETRIES as usize);
        assert!(lock(&ctx.uploaded).is_empty());
    }

    #[test]
    fn test_delete_local_after_upload() {
        let dir = tempfile::tempdir().unwrap();
        let seg = seed_segment(dir.path(), "ch0", "a.mp4", b"data");

        let attempts = Arc::new(AtomicUsize::new(0));
        let mut ctx = test_ctx(dir.path(), attempts, false);
        ctx.delete_local = true;
        let mut failures = HashMap::new();
        upload_pass(&ctx, &mut failures, Duration::ZERO);
        assert!(!seg.exists());
        assert!(lock(&ctx.uploaded).contains(&seg));
    }

}
