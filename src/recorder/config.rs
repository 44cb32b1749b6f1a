//! Recorder configuration: environment defaults, JSON persistence, and
//! validated partial updates.
//!
//! Precedence at startup: a persisted `recording_config.json` wins over
//! environment variables, which win over the built-in defaults. Updates
//! arriving from the web layer are applied as a validated subset and then
//! persisted.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::schedule::parse_schedule;

/// Default free-space floor before recording pauses.
pub const DEFAULT_MIN_DISK_MB: u64 = 500;

/// Full recorder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Master switch.
    pub enabled: bool,
    /// Channels to record.
    pub channels: Vec<u32>,
    /// Segment length in minutes.
    pub segment_minutes: u32,
    /// 1 = main stream, 2 = sub stream.
    pub stream_type: u32,
    /// Hours to keep local segments; 0 keeps them forever.
    pub retention_hours: u32,
    /// Hour-range schedule string, e.g. `"0-23"` or `"8-17,22-6"`.
    pub schedule: String,
    /// Root directory for `ch<N>/` segment directories.
    pub record_dir: PathBuf,
    /// Free-space floor in MB.
    pub min_disk_mb: u64,
    /// Enable the Drive uploader.
    pub gdrive_enabled: bool,
    /// Cached OAuth token file (written by the web layer's device flow).
    pub gdrive_token_file: PathBuf,
    /// Drive folder that receives the per-channel subfolders.
    pub gdrive_folder_id: String,
    /// Delete local segments after a successful upload.
    pub gdrive_delete_local: bool,
    /// Optional shell upload command with `{file}` `{channel}` `{filename}`
    /// placeholders.
    pub upload_command: String,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        let record_dir = std::env::current_dir()
            .map(|d| d.join("recordings"))
            .unwrap_or_else(|_| PathBuf::from("recordings"));
        Self {
            enabled: false,
            channels: vec![0],
            segment_minutes: 15,
            stream_type: 1,
            retention_hours: 24,
            schedule: "0-23".into(),
            record_dir,
            min_disk_mb: DEFAULT_MIN_DISK_MB,
            gdrive_enabled: false,
            gdrive_token_file: PathBuf::from("cache/gdrive_token.json"),
            gdrive_folder_id: String::new(),
            gdrive_delete_local: false,
            upload_command: String::new(),
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl RecorderConfig {
    /// Defaults with `DVR_RECORD_*` / `DVR_GDRIVE_*` environment overrides
    /// applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_bool("DVR_RECORD_ENABLED") {
            self.enabled = v;
        }
        if let Ok(v) = std::env::var("DVR_RECORD_CHANNELS") {
            let channels: Vec<u32> = v
                .split(',')
                .filter_map(|c| c.trim().parse().ok())
                .collect();
            if !channels.is_empty() {
                self.channels = channels;
            }
        }
        if let Some(v) = env_parse("DVR_RECORD_SEGMENT_MIN") {
            self.segment_minutes = v;
        }
        if let Some(v) = env_parse("DVR_RECORD_STREAM_TYPE") {
            self.stream_type = v;
        }
        if let Some(v) = env_parse("DVR_RECORD_RETENTION_HR") {
            self.retention_hours = v;
        }
        if let Ok(v) = std::env::var("DVR_RECORD_SCHEDULE") {
            self.schedule = v;
        }
        if let Ok(v) = std::env::var("DVR_RECORD_DIR") {
            self.record_dir = PathBuf::from(v);
        }
        if let Some(v) = env_parse("DVR_RECORD_MIN_DISK_MB") {
            self.min_disk_mb = v;
        }
        if let Some(v) = env_bool("DVR_GDRIVE_ENABLED") {
            self.gdrive_enabled = v;
        }
        if let Ok(v) = std::env::var("DVR_GDRIVE_TOKEN_FILE") {
            self.gdrive_token_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DVR_GDRIVE_FOLDER_ID") {
            self.gdrive_folder_id = v;
        }
        if let Some(v) = env_bool("DVR_GDRIVE_DELETE_LOCAL") {
            self.gdrive_delete_local = v;
        }
        if let Ok(v) = std::env::var("DVR_UPLOAD_COMMAND") {
            self.upload_command = v;
        }
    }

    /// Load from the persisted JSON file when present, otherwise fall back
    /// to environment defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("ignoring malformed recorder config {}: {e}", path.display());
                    Self::from_env()
                }
            },
            Err(_) => Self::from_env(),
        }
    }

    /// Persist as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("recorder config saved to {}", path.display());
        Ok(())
    }

    /// Apply a validated partial update. Fields the update does not name
    /// are left untouched; validation failures leave the whole config
    /// unchanged.
    pub fn apply_update(&mut self, update: &RecorderConfigUpdate) -> Result<()> {
        if let Some(schedule) = &update.schedule {
            parse_schedule(schedule).context("invalid schedule")?;
        }
        if let Some(dir) = &update.record_dir {
            validate_record_dir(dir)?;
        }

        if let Some(v) = update.enabled {
            self.enabled = v;
        }
        if let Some(v) = &update.channels {
            self.channels = v.clone();
        }
        if let Some(v) = update.segment_minutes {
            self.segment_minutes = v;
        }
        if let Some(v) = update.stream_type {
            self.stream_type = v;
        }
        if let Some(v) = update.retention_hours {
            self.retention_hours = v;
        }
        if let Some(v) = &update.schedule {
            self.schedule = v.clone();
        }
        if let Some(v) = &update.record_dir {
            self.record_dir = v.clone();
        }
        if let Some(v) = update.min_disk_mb {
            self.min_disk_mb = v;
        }
        if let Some(v) = update.gdrive_enabled {
            self.gdrive_enabled = v;
        }
        if let Some(v) = &update.gdrive_token_file {
            self.gdrive_token_file = v.clone();
        }
        if let Some(v) = &update.gdrive_folder_id {
            self.gdrive_folder_id = v.clone();
        }
        if let Some(v) = update.gdrive_delete_local {
            self.gdrive_delete_local = v;
        }
        if let Some(v) = &update.upload_command {
            self.upload_command = v.clone();
        }
        Ok(())
    }
}

/// Partial update, deserialized straight from the web layer's JSON body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderConfigUpdate {
    /// See [`RecorderConfig::enabled`].
    pub enabled: Option<bool>,
    /// See [`RecorderConfig::channels`].
    pub channels: Option<Vec<u32>>,
    /// See [`RecorderConfig::segment_minutes`].
    pub segment_minutes: Option<u32>,
    /// See [`RecorderConfig::stream_type`].
    pub stream_type: Option<u32>,
    /// See [`RecorderConfig::retention_hours`].
    pub retention_hours: Option<u32>,
    /// See [`RecorderConfig::schedule`].
    pub schedule: Option<String>,
    /// See [`RecorderConfig::record_dir`].
    pub record_dir: Option<PathBuf>,
    /// See [`RecorderConfig::min_disk_mb`].
    pub min_disk_mb: Option<u64>,
    /// See [`RecorderConfig::gdrive_enabled`].
    pub gdrive_enabled: Option<bool>,
    /// See [`RecorderConfig::gdrive_token_file`].
    pub gdrive_token_file: Option<PathBuf>,
    /// See [`RecorderConfig::gdrive_folder_id`].
    pub gdrive_folder_id: Option<String>,
    /// See [`RecorderConfig::gdrive_delete_local`].
    pub gdrive_delete_local: Option<bool>,
    /// See [`RecorderConfig::upload_command`].
    pub upload_command: Option<String>,
}

/// A new record dir must be absolute, its parent must exist, and it must
/// be writable (verified with a probe file).
fn validate_record_dir(dir: &Path) -> Result<()> {
    if !dir.is_absolute() {
        bail!("record_dir must be an absolute path, got: {}", dir.display());
    }
    let parent = dir
        .parent()
        .with_context(|| format!("record_dir has no parent: {}", dir.display()))?;
    if !parent.is_dir() {
        bail!("record_dir parent does not exist: {}", parent.display());
    }
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let probe = dir.join(".write_test");
    fs::write(&probe, "ok").with_context(|| format!("record_dir not writable: {}", dir.display()))?;
    fs::remove_file(&probe).ok();
    Ok(())
}
