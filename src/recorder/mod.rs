//! Recording supervisor: per-channel feeder|muxer pipelines, disk
//! policing, retention, and the upload queue.
//!
//! Each recorded channel gets its own thread running [`record_loop`]: it
//! gates on the schedule and free disk, then spawns a feeder child (the
//! `dvr-feeder` binary, which speaks the whole DVR protocol and writes
//! clean H.264 to stdout) piped into an external ffmpeg segment muxer.
//! Two more workers handle uploads and cleanup. The supervisor is an
//! explicit value owned by the caller; there is no process-wide state.

mod cleanup;
mod config;
mod schedule;
mod upload;

pub use cleanup::{disk_info, DiskInfo};
pub use config::{RecorderConfig, RecorderConfigUpdate, DEFAULT_MIN_DISK_MB};
pub use schedule::{is_scheduled_now, parse_schedule};
pub use upload::{find_completed_segments, load_upload_state, save_upload_state, STATE_FILE};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;

use crate::constants::{
    CLEANUP_INTERVAL, DISK_LOW_WAIT, ERROR_RETRY_WAIT, FEEDER_GRACE, MONITOR_INTERVAL,
    MUXER_GRACE, RESTART_PAUSE, SCHEDULE_WAIT,
};
use crate::uploader::{DriveUploader, Uploader};
use upload::{count_pending, upload_worker, UploadCtx};

/// Lock a mutex, riding through poisoning so one panicked worker cannot
/// wedge the rest of the supervisor.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sleep up to `total`, waking early once `running` clears.
pub(crate) fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let left = deadline.saturating_duration_since(Instant::now());
        thread::sleep(left.min(Duration::from_millis(500)));
    }
}

/// Lifecycle state of one recorded channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Thread started, pipeline not yet up.
    Starting,
    /// Pipeline running.
    Recording,
    /// Outside the schedule window.
    WaitingSchedule,
    /// Free disk below the floor.
    PausedDiskLow,
    /// Something failed; retrying shortly.
    Error(String),
    /// Channel thread has exited.
    Stopped,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Recording => write!(f, "recording"),
            Self::WaitingSchedule => write!(f, "waiting (schedule)"),
            Self::PausedDiskLow => write!(f, "paused (disk low)"),
            Self::Error(detail) if !detail.is_empty() => write!(f, "error ({detail})"),
            Self::Error(_) => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Live status of one channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    /// Current state.
    pub state: ChannelState,
    /// Segment file currently being written, when known.
    pub file: Option<PathBuf>,
    /// When the current pipeline came up (RFC 3339, local time).
    pub started: Option<String>,
    /// `.mp4` count observed in the channel directory.
    pub segments: u32,
}

impl ChannelStatus {
    fn new() -> Self {
        Self { state: ChannelState::Starting, file: None, started: None, segments: 0 }
    }
}

/// JSON-safe view of a channel's status.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatusSnapshot {
    /// Display form of the state.
    pub state: String,
    /// Segment file currently being written.
    pub file: Option<PathBuf>,
    /// Pipeline start time.
    pub started: Option<String>,
    /// Observed segment count.
    pub segments: u32,
}

/// JSON-safe supervisor summary.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    /// Master switch.
    pub enabled: bool,
    /// Whether worker threads are up.
    pub running: bool,
    /// Per-channel status, keyed by channel number as a string.
    pub channels: BTreeMap<String, ChannelStatusSnapshot>,
    /// Whether a cloud uploader is connected.
    pub uploader_connected: bool,
    /// Whether a shell upload command is configured.
    pub upload_command: bool,
    /// Segments awaiting upload.
    pub upload_pending: usize,
    /// Recording hours, sorted.
    pub schedule: Vec<u8>,
    /// Segment length in minutes.
    pub segment_minutes: u32,
    /// 1 = main, 2 = sub.
    pub stream_type: u32,
    /// Local retention window in hours (0 = forever).
    pub retention_hours: u32,
    /// Segment root directory.
    pub record_dir: PathBuf,
    /// Free-space floor in MB.
    pub min_disk_mb: u64,
    /// Disk usage of the record dir.
    pub disk: DiskInfo,
}

/// One local recording, as listed by [`Supervisor::get_recordings`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    /// Channel directory name (`ch0`, `ch1`, …).
    pub channel: String,
    /// Segment file name.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: u64,
    /// Whether the upload queue has already shipped it.
    pub uploaded: bool,
}

/// The two children of one channel pipeline.
struct ChannelProcs {
    feeder: Child,
    muxer: Child,
}

/// Everything a channel thread needs.
#[derive(Clone)]
struct ChannelCtx {
    channel: u32,
    cfg: Arc<RecorderConfig>,
    schedule: Arc<std::collections::BTreeSet<u8>>,
    running: Arc<AtomicBool>,
    processes: Arc<Mutex<HashMap<u32, ChannelProcs>>>,
    status: Arc<Mutex<HashMap<u32, ChannelStatus>>>,
    uploaded: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ChannelCtx {
    fn set_state(&self, state: ChannelState) {
        let mut status = lock(&self.status);
        status.entry(self.channel).or_insert_with(ChannelStatus::new).state = state;
    }

    fn update<F: FnOnce(&mut ChannelStatus)>(&self, f: F) {
        let mut status = lock(&self.status);
        f(status.entry(self.channel).or_insert_with(ChannelStatus::new));
    }
}

/// Manages per-channel recording pipelines plus the upload and cleanup
/// workers.
pub struct Supervisor {
    config: RecorderConfig,
    persist_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    processes: Arc<Mutex<HashMap<u32, ChannelProcs>>>,
    status: Arc<Mutex<HashMap<u32, ChannelStatus>>>,
    uploaded: Arc<Mutex<HashSet<PathBuf>>>,
    uploader: Option<Arc<Mutex<Box<dyn Uploader>>>>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("channels", &self.config.channels)
            .field("record_dir", &self.config.record_dir)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// New supervisor. `persist_path` is where config updates are saved
    /// (`cache/recording_config.json` in the original deployment).
    pub fn new(config: RecorderConfig, persist_path: Option<PathBuf>) -> Self {
        Self {
            config,
            persist_path,
            running: Arc::new(AtomicBool::new(false)),
            processes: Arc::new(Mutex::new(HashMap::new())),
            status: Arc::new(Mutex::new(HashMap::new())),
            uploaded: Arc::new(Mutex::new(HashSet::new())),
            uploader: None,
            threads: Vec::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Whether the worker threads are up.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start recording on every configured channel. A disabled config is
    /// not an error; the call just logs and returns.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if !self.config.enabled {
            log::info!("recording disabled (set DVR_RECORD_ENABLED=true to enable)");
            return Ok(());
        }

        let schedule = Arc::new(parse_schedule(&self.config.schedule)?);
        fs::create_dir_all(&self.config.record_dir)
            .with_context(|| format!("creating {}", self.config.record_dir.display()))?;
        *lock(&self.uploaded) = load_upload_state(&self.config.record_dir);

        self.uploader = if self.config.gdrive_enabled {
            let folder = (!self.config.gdrive_folder_id.is_empty())
                .then(|| self.config.gdrive_folder_id.clone());
            match DriveUploader::from_token_file(&self.config.gdrive_token_file, folder) {
                Ok(uploader) => {
                    log::info!("Drive uploader ready");
                    Some(Arc::new(Mutex::new(Box::new(uploader) as Box<dyn Uploader>)))
                }
                Err(e) => {
                    log::warn!("Drive enabled but not usable: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        self.running.store(true, Ordering::SeqCst);
        let cfg = Arc::new(self.config.clone());

        for &channel in &self.config.channels {
            let ch_dir = self.config.record_dir.join(format!("ch{channel}"));
            fs::create_dir_all(&ch_dir)
                .with_context(|| format!("creating {}", ch_dir.display()))?;
            lock(&self.status).insert(channel, ChannelStatus::new());

            let ctx = ChannelCtx {
                channel,
                cfg: Arc::clone(&cfg),
                schedule: Arc::clone(&schedule),
                running: Arc::clone(&self.running),
                processes: Arc::clone(&self.processes),
                status: Arc::clone(&self.status),
                uploaded: Arc::clone(&self.uploaded),
            };
            let handle = thread::Builder::new()
                .name(format!("rec-ch{channel}"))
                .spawn(move || record_loop(ctx))
                .context("spawning channel thread")?;
            self.threads.push(handle);
        }

        if self.uploader.is_some() || !self.config.upload_command.is_empty() {
            let ctx = UploadCtx {
                record_dir: self.config.record_dir.clone(),
                running: Arc::clone(&self.running),
                uploaded: Arc::clone(&self.uploaded),
                uploader: self.uploader.clone(),
                upload_command: self.config.upload_command.clone(),
                delete_local: self.config.gdrive_delete_local,
            };
            let handle = thread::Builder::new()
                .name("rec-upload".into())
                .spawn(move || upload_worker(ctx))
                .context("spawning upload worker")?;
            self.threads.push(handle);
        }

        {
            let record_dir = self.config.record_dir.clone();
            let min_disk_mb = self.config.min_disk_mb;
            let retention_hours = self.config.retention_hours;
            let running = Arc::clone(&self.running);
            let uploaded = Arc::clone(&self.uploaded);
            let processes = Arc::clone(&self.processes);
            let handle = thread::Builder::new()
                .name("rec-cleanup".into())
                .spawn(move || {
                    cleanup_worker(record_dir, min_disk_mb, retention_hours, running, uploaded, processes)
                })
                .context("spawning cleanup worker")?;
            self.threads.push(handle);
        }

        log::info!(
            "recording started: channels={:?}, segment={}m, schedule={:?}",
            self.config.channels,
            self.config.segment_minutes,
            schedule
        );
        Ok(())
    }

    /// Stop all pipelines gracefully: feeders get SIGTERM and a short
    /// grace, muxers get time to finalize the open segment.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        {
            let mut processes = lock(&self.processes);
            for (channel, mut procs) in processes.drain() {
                log::debug!("stopping ch{channel} pipeline");
                terminate_child(&mut procs.feeder, FEEDER_GRACE);
                wait_child(&mut procs.muxer, MUXER_GRACE);
            }
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::info!("recording stopped");
    }

    /// Apply a partial config update, persist it, and restart so in-flight
    /// segments are finalized under the old settings.
    pub fn update_config(&mut self, update: &RecorderConfigUpdate) -> Result<()> {
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }

        if let Err(e) = self.config.apply_update(update) {
            // Bad update: put the old configuration back in service.
            if was_running {
                self.start()?;
            }
            return Err(e);
        }

        if let Some(path) = self.persist_path.clone() {
            self.config.save(&path)?;
        }

        if self.config.enabled {
            self.start()?;
        } else if was_running {
            log::info!("recording disabled; stopped");
        }
        Ok(())
    }

    /// JSON-safe status summary.
    pub fn status(&self) -> SupervisorStatus {
        let channels = lock(&self.status)
            .iter()
            .map(|(ch, s)| {
                (
                    ch.to_string(),
                    ChannelStatusSnapshot {
                        state: s.state.to_string(),
                        file: s.file.clone(),
                        started: s.started.clone(),
                        segments: s.segments,
                    },
                )
            })
            .collect();
        SupervisorStatus {
            enabled: self.config.enabled,
            running: self.is_running(),
            channels,
            uploader_connected: self.uploader.is_some(),
            upload_command: !self.config.upload_command.is_empty(),
            upload_pending: count_pending(&self.config.record_dir, &self.uploaded),
            schedule: parse_schedule(&self.config.schedule)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default(),
            segment_minutes: self.config.segment_minutes,
            stream_type: self.config.stream_type,
            retention_hours: self.config.retention_hours,
            record_dir: self.config.record_dir.clone(),
            min_disk_mb: self.config.min_disk_mb,
            disk: disk_info(&self.config.record_dir, self.config.min_disk_mb),
        }
    }

    /// List local recordings, newest first, excluding the file each live
    /// muxer is still writing (it has no moov atom yet).
    pub fn get_recordings(
        &self,
        channel: Option<u32>,
        limit: usize,
        offset: usize,
        date_filter: Option<&str>,
    ) -> Vec<RecordingEntry> {
        let in_progress = active_files(&self.config.record_dir, &self.processes);
        let uploaded = lock(&self.uploaded).clone();

        let dirs: Vec<PathBuf> = match channel {
            Some(ch) => vec![self.config.record_dir.join(format!("ch{ch}"))],
            None => cleanup::channel_dirs(&self.config.record_dir),
        };

        let mut recordings = Vec::new();
        for dir in dirs {
            let Some(ch_name) = dir.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for path in entries.flatten().map(|e| e.path()) {
                let Some(filename) = path.file_name().map(|n| n.to_string_lossy().to_string())
                else {
                    continue;
                };
                if !filename.ends_with(".mp4") {
                    continue;
                }
                if let Some(prefix) = date_filter {
                    if !filename.starts_with(prefix) {
                        continue;
                    }
                }
                if in_progress.contains(&path) {
                    continue; // moov not written yet
                }
                let Ok(meta) = fs::metadata(&path) else {
                    continue;
                };
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                recordings.push(RecordingEntry {
                    channel: ch_name.clone(),
                    filename,
                    size: meta.len(),
                    modified,
                    uploaded: uploaded.contains(&path),
                });
            }
        }

        recordings.sort_by(|a, b| b.modified.cmp(&a.modified));
        recordings.into_iter().skip(offset).take(limit).collect()
    }

    /// Distinct `YYYY-MM-DD` dates that have recordings, newest first.
    pub fn get_recording_dates(&self) -> Vec<String> {
        let mut dates = std::collections::BTreeSet::new();
        for dir in cleanup::channel_dirs(&self.config.record_dir) {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for path in entries.flatten().map(|e| e.path()) {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                    continue;
                };
                if name.ends_with(".mp4") && name.len() >= 10 {
                    dates.insert(name[..10].to_string());
                }
            }
        }
        dates.into_iter().rev().collect()
    }

    /// Delete one recording. `channel` is the directory name (`ch0`).
    pub fn delete_recording(&self, channel: &str, filename: &str) -> Result<()> {
        // Path traversal is rejected outright.
        if channel.contains("..") || channel.contains('/') || filename.contains("..")
            || filename.contains('/')
        {
            bail!("invalid channel or filename");
        }
        if !filename.ends_with(".mp4") {
            bail!("only .mp4 files may be deleted");
        }
        let path = self.config.record_dir.join(channel).join(filename);
        if !path.is_file() {
            bail!("{channel}/{filename} not found");
        }
        fs::remove_file(&path).with_context(|| format!("deleting {}", path.display()))?;
        lock(&self.uploaded).remove(&path);
        log::info!("deleted recording {channel}/{filename}");
        Ok(())
    }

    /// Delete all recordings, optionally filtered by date prefix. Returns
    /// the number deleted.
    pub fn delete_all_recordings(&self, date_filter: Option<&str>) -> usize {
        let mut count = 0;
        for entry in self.get_recordings(None, usize::MAX, 0, date_filter) {
            match self.delete_recording(&entry.channel, &entry.filename) {
                Ok(()) => count += 1,
                Err(e) => {
                    log::warn!("could not delete {}/{}: {e}", entry.channel, entry.filename);
                }
            }
        }
        count
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Files currently being written: the newest `.mp4` of each channel that
/// has a live muxer.
fn active_files(
    record_dir: &Path,
    processes: &Mutex<HashMap<u32, ChannelProcs>>,
) -> HashSet<PathBuf> {
    let channels: Vec<u32> = lock(processes).keys().copied().collect();
    channels
        .into_iter()
        .filter_map(|ch| cleanup::newest_mp4(&record_dir.join(format!("ch{ch}"))))
        .collect()
}

/// The feeder binary: a sibling of the current executable when present,
/// otherwise resolved from `PATH`.
fn feeder_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("dvr-feeder")))
        .filter(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from("dvr-feeder"))
}

/// Spawn the feeder|muxer pipeline for one channel.
fn spawn_pipeline(cfg: &RecorderConfig, channel: u32, ch_dir: &Path) -> Result<ChannelProcs> {
    let seg_sec = cfg.segment_minutes * 60;
    let pattern = ch_dir.join("%Y-%m-%d_%H-%M-%S.mp4");

    let feeder_bin = feeder_program();
    let mut feeder = Command::new(&feeder_bin)
        .arg("--channel")
        .arg(channel.to_string())
        .arg("--stream-type")
        .arg(cfg.stream_type.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawning feeder {}", feeder_bin.display()))?;
    let feeder_out = feeder.stdout.take().context("feeder stdout missing")?;

    let muxer = Command::new("ffmpeg")
        .args([
            "-y",
            // Raw H.264 carries no timestamps; declare the framerate and
            // generate PTS so the moov timestamps come out valid.
            "-fflags", "+genpts",
            "-r", "25",
            "-f", "h264",
            "-i", "pipe:0",
            "-c", "copy",
            // moov at the front so finished segments play immediately.
            "-movflags", "+faststart",
            "-f", "segment",
            "-segment_time",
        ])
        .arg(seg_sec.to_string())
        .args(["-segment_format", "mp4", "-strftime", "1", "-reset_timestamps", "1"])
        .arg(&pattern)
        .stdin(Stdio::from(feeder_out))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning ffmpeg segment muxer");

    let muxer = match muxer {
        Ok(muxer) => muxer,
        Err(e) => {
            let _ = feeder.kill();
            let _ = feeder.wait();
            return Err(e);
        }
    };

    Ok(ChannelProcs { feeder, muxer })
}

/// SIGTERM, bounded grace, then SIGKILL.
fn terminate_child(child: &mut Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    #[cfg(unix)]
    {
        let _ = Command::new("kill").arg(child.id().to_string()).output();
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Wait for a child to exit on its own, killing it after the grace.
fn wait_child(child: &mut Child, grace: Duration) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn count_mp4(ch_dir: &Path) -> u32 {
    fs::read_dir(ch_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "mp4"))
                .count() as u32
        })
        .unwrap_or(0)
}

/// Continuous recording loop for one channel.
fn record_loop(ctx: ChannelCtx) {
    let channel = ctx.channel;
    let ch_dir = ctx.cfg.record_dir.join(format!("ch{channel}"));

    while ctx.running.load(Ordering::SeqCst) {
        if !is_scheduled_now(&ctx.schedule) {
            ctx.set_state(ChannelState::WaitingSchedule);
            sleep_while_running(&ctx.running, SCHEDULE_WAIT);
            continue;
        }

        if !cleanup::disk_ok(&ctx.cfg.record_dir, ctx.cfg.min_disk_mb, &cleanup::fs_free_mb) {
            ctx.set_state(ChannelState::PausedDiskLow);
            log::warn!(
                "ch{channel}: disk low ({} MB min), pausing recording",
                ctx.cfg.min_disk_mb
            );
            let active = active_files(&ctx.cfg.record_dir, &ctx.processes);
            cleanup::emergency_cleanup(
                &ctx.cfg.record_dir,
                ctx.cfg.min_disk_mb,
                &ctx.uploaded,
                &active,
                &cleanup::fs_free_mb,
            );
            if !cleanup::disk_ok(&ctx.cfg.record_dir, ctx.cfg.min_disk_mb, &cleanup::fs_free_mb) {
                sleep_while_running(&ctx.running, DISK_LOW_WAIT);
                continue;
            }
        }

        // The USB disk may have been re-mounted underneath us.
        if let Err(e) = fs::create_dir_all(&ch_dir) {
            ctx.set_state(ChannelState::Error(format!("dir: {e}")));
            log::error!("ch{channel}: cannot create {}: {e}", ch_dir.display());
            sleep_while_running(&ctx.running, SCHEDULE_WAIT);
            continue;
        }

        ctx.update(|s| {
            s.state = ChannelState::Recording;
            s.started = Some(Local::now().to_rfc3339());
        });

        match spawn_pipeline(&ctx.cfg, channel, &ch_dir) {
            Ok(procs) => {
                lock(&ctx.processes).insert(channel, procs);
            }
            Err(e) => {
                ctx.set_state(ChannelState::Error(e.to_string()));
                log::error!("recording error ch{channel}: {e:#}");
                sleep_while_running(&ctx.running, ERROR_RETRY_WAIT);
                continue;
            }
        }
        log::info!(
            "recording ch{channel} -> {} (segment={}s)",
            ch_dir.display(),
            ctx.cfg.segment_minutes * 60
        );

        // Monitor until shutdown, schedule exit, muxer death, or low disk.
        while ctx.running.load(Ordering::SeqCst) && is_scheduled_now(&ctx.schedule) {
            let muxer_exited = match lock(&ctx.processes).get_mut(&channel) {
                Some(procs) => !matches!(procs.muxer.try_wait(), Ok(None)),
                None => true, // stop() already reaped it
            };
            if muxer_exited {
                break;
            }
            if !cleanup::disk_ok(&ctx.cfg.record_dir, ctx.cfg.min_disk_mb, &cleanup::fs_free_mb) {
                log::warn!("ch{channel}: disk low during recording, stopping");
                ctx.set_state(ChannelState::PausedDiskLow);
                break;
            }
            let segments = count_mp4(&ch_dir);
            let open_file = cleanup::newest_mp4(&ch_dir);
            ctx.update(|s| {
                s.segments = segments;
                s.file = open_file.clone();
            });
            sleep_while_running(&ctx.running, MONITOR_INTERVAL);
        }

        // Graceful teardown: terminating the feeder closes the pipe, which
        // lets ffmpeg finalize the open segment.
        if let Some(mut procs) = lock(&ctx.processes).remove(&channel) {
            terminate_child(&mut procs.feeder, FEEDER_GRACE);
            wait_child(&mut procs.muxer, MUXER_GRACE);
        }
        ctx.update(|s| s.file = None);

        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        sleep_while_running(&ctx.running, RESTART_PAUSE);
    }

    ctx.set_state(ChannelState::Stopped);
}

/// Periodic retention and emergency-cleanup worker.
fn cleanup_worker(
    record_dir: PathBuf,
    min_disk_mb: u64,
    retention_hours: u32,
    running: Arc<AtomicBool>,
    uploaded: Arc<Mutex<HashSet<PathBuf>>>,
    processes: Arc<Mutex<HashMap<u32, ChannelProcs>>>,
) {
    while running.load(Ordering::SeqCst) {
        sleep_while_running(&running, CLEANUP_INTERVAL);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if !cleanup::disk_ok(&record_dir, min_disk_mb, &cleanup::fs_free_mb) {
            let active = active_files(&record_dir, &processes);
            cleanup::emergency_cleanup(
                &record_dir,
                min_disk_mb,
                &uploaded,
                &active,
                &cleanup::fs_free_mb,
            );
        }
        if retention_hours > 0 {
            cleanup::retention_sweep(&record_dir, retention_hours, &uploaded);
        }
    }
}
