//! Segment uploaders.
//!
//! The recording supervisor depends only on the [`Uploader`] trait; the
//! shipped implementation speaks the Google Drive v3 REST API with a
//! bearer token. Obtaining that token (the OAuth device flow) happens in
//! the web layer, outside this crate — here we only read the cached token
//! file. An opaque shell command can run instead of, or in addition to,
//! the API uploader.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::constants::{HTTP_REQUEST_TIMEOUT, UPLOAD_TIMEOUT};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// A file as listed by the remote store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    /// Remote file id.
    pub id: String,
    /// Remote file name.
    pub name: String,
    /// Size in bytes (the Drive API reports it as a string).
    #[serde(default)]
    pub size: Option<String>,
    /// RFC 3339 creation time.
    #[serde(default)]
    pub created_time: Option<String>,
}

/// Interface the recording supervisor expects from a cloud uploader.
pub trait Uploader: Send {
    /// Get or create a subfolder under the upload root; `None` when no
    /// root folder is configured.
    fn ensure_subfolder(&mut self, name: &str) -> Result<Option<String>>;

    /// Upload a local file, returning the remote file id.
    fn upload(&mut self, path: &Path, filename: &str, folder_id: Option<&str>) -> Result<String>;

    /// List files in a folder, newest first.
    fn list_files(&mut self, folder_id: Option<&str>, limit: usize) -> Result<Vec<RemoteFile>>;

    /// Delete a remote file.
    fn delete(&mut self, file_id: &str) -> Result<()>;
}

/// Google Drive uploader using a pre-obtained OAuth access token.
pub struct DriveUploader {
    client: reqwest::blocking::Client,
    token: String,
    root_folder: Option<String>,
    subfolder_cache: HashMap<String, String>,
}

impl std::fmt::Debug for DriveUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveUploader")
            .field("root_folder", &self.root_folder)
            .finish_non_exhaustive()
    }
}

/// Shape of the cached OAuth token file.
#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
}

impl DriveUploader {
    /// Uploader from a token string.
    pub fn new(token: impl Into<String>, root_folder: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            token: token.into(),
            root_folder,
            subfolder_cache: HashMap::new(),
        })
    }

    /// Uploader from a cached token file: either the JSON the OAuth flow
    /// writes (`{"access_token": …}`) or a bare token string.
    pub fn from_token_file(path: &Path, root_folder: Option<String>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading Drive token file {}", path.display()))?;
        let token = match serde_json::from_str::<TokenFile>(&raw) {
            Ok(parsed) => parsed.access_token,
            Err(_) => raw.trim().to_string(),
        };
        if token.is_empty() {
            bail!("Drive token file {} is empty", path.display());
        }
        Self::new(token, root_folder)
    }

    fn files_query(&self, q: &str, fields: &str, limit: Option<usize>) -> Result<serde_json::Value> {
        let mut req = self
            .client
            .get(format!("{DRIVE_API}/files"))
            .bearer_auth(&self.token)
            .query(&[("q", q), ("fields", fields)]);
        if let Some(limit) = limit {
            req = req.query(&[
                ("pageSize", limit.to_string().as_str()),
                ("orderBy", "createdTime desc"),
            ]);
        }
        let resp = req.send().context("Drive list request")?.error_for_status()?;
        resp.json().context("Drive list response")
    }
}

impl Uploader for DriveUploader {
    fn ensure_subfolder(&mut self, name: &str) -> Result<Option<String>> {
        if let Some(id) = self.subfolder_cache.get(name) {
            return Ok(Some(id.clone()));
        }
        let Some(parent) = self.root_folder.clone() else {
            return Ok(None);
        };

        let q = format!(
            "name='{name}' and '{parent}' in parents and mimeType='{FOLDER_MIME}' and trashed=false"
        );
        let found = self.files_query(&q, "files(id)", None)?;
        let id = match found["files"].get(0).and_then(|f| f["id"].as_str()) {
            Some(id) => id.to_string(),
            None => {
                let body = serde_json::json!({
                    "name": name,
                    "mimeType": FOLDER_MIME,
                    "parents": [parent],
                });
                let resp = self
                    .client
                    .post(format!("{DRIVE_API}/files"))
                    .bearer_auth(&self.token)
                    .query(&[("fields", "id")])
                    .json(&body)
                    .send()
                    .context("Drive folder create")?
                    .error_for_status()?;
                let created: serde_json::Value = resp.json()?;
                let id = created["id"]
                    .as_str()
                    .context("Drive folder create returned no id")?
                    .to_string();
                log::info!("created Drive subfolder {name} ({id})");
                id
            }
        };
        self.subfolder_cache.insert(name.to_string(), id.clone());
        Ok(Some(id))
    }

    fn upload(&mut self, path: &Path, filename: &str, folder_id: Option<&str>) -> Result<String> {
        let mut meta = serde_json::json!({ "name": filename });
        let folder = folder_id
            .map(str::to_string)
            .or_else(|| self.root_folder.clone());
        if let Some(folder) = folder {
            meta["parents"] = serde_json::json!([folder]);
        }

        // Resumable upload: initiate, then PUT the content in one shot.
        let initiate = self
            .client
            .post(format!("{DRIVE_UPLOAD_API}/files?uploadType=resumable"))
            .bearer_auth(&self.token)
            .json(&meta)
            .send()
            .context("Drive upload initiate")?
            .error_for_status()?;
        let location = initiate
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .context("Drive upload initiate returned no session URI")?
            .to_string();

        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {} for upload", path.display()))?;
        let size = bytes.len();
        let resp = self
            .client
            .put(&location)
            .bearer_auth(&self.token)
            .timeout(UPLOAD_TIMEOUT)
            .body(bytes)
            .send()
            .context("Drive upload content")?
            .error_for_status()?;
        let result: serde_json::Value = resp.json()?;
        let id = result["id"]
            .as_str()
            .context("Drive upload returned no id")?
            .to_string();
        log::info!("uploaded {filename} -> Drive (id={id}, {size} bytes)");
        Ok(id)
    }

    fn list_files(&mut self, folder_id: Option<&str>, limit: usize) -> Result<Vec<RemoteFile>> {
        let folder = folder_id
            .map(str::to_string)
            .or_else(|| self.root_folder.clone());
        let q = match folder {
            Some(folder) => format!("'{folder}' in parents and trashed=false"),
            None => "trashed=false".to_string(),
        };
        let resp = self.files_query(&q, "files(id,name,size,createdTime)", Some(limit))?;
        let files = serde_json::from_value(resp["files"].clone()).unwrap_or_default();
        Ok(files)
    }

    fn delete(&mut self, file_id: &str) -> Result<()> {
        self.client
            .delete(format!("{DRIVE_API}/files/{file_id}"))
            .bearer_auth(&self.token)
            .send()
            .context("Drive delete")?
            .error_for_status()?;
        log::info!("deleted Drive file {file_id}");
        Ok(())
    }
}

/// Run the configured shell upload command with its placeholders expanded.
///
/// The command runs through `sh -c` and is killed after the upload
/// timeout elapses.
pub fn run_upload_command(template: &str, file: &Path, channel: &str, filename: &str) -> Result<()> {
    let cmd = template
        .replace("{file}", &file.to_string_lossy())
        .replace("{channel}", channel)
        .replace("{filename}", filename);
    log::info!("running upload command: {cmd}");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .spawn()
        .with_context(|| format!("spawning upload command: {cmd}"))?;

    let deadline = Instant::now() + UPLOAD_TIMEOUT;
    loop {
        match child.try_wait().context("waiting for upload command")? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => bail!("upload command exited with {status}"),
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("upload command timed out after {UPLOAD_TIMEOUT:?}");
            }
            None => thread::sleep(Duration::from_millis(500)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_token_file_json_and_raw() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("token.json");
        std::fs::write(&json_path, r#"{"access_token": "ya29.abc", "expiry": 1}"#).unwrap();
        let uploader = DriveUploader::from_token_file(&json_path, None).unwrap();
        assert_eq!(uploader.token, "ya29.abc");

        let raw_path = dir.path().join("token.txt");
        std::fs::write(&raw_path, "raw-token\n").unwrap();
        let uploader = DriveUploader::from_token_file(&raw_path, Some("root".into())).unwrap();
        assert_eq!(uploader.token, "raw-token");
        assert_eq!(uploader.root_folder.as_deref(), Some("root"));
    }

    #[test]
    fn test_empty_token_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, "").unwrap();
        assert!(DriveUploader::from_token_file(&path, None).is_err());
    }

    #[test]
    fn test_ensure_subfolder_without_root_is_none() {
        let mut uploader = DriveUploader::new("tok", None).unwrap();
        assert!(uploader.ensure_subfolder("ch0").unwrap().is_none());
    }

    #[test]
    fn test_upload_command_expands_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("2024-06-01_10-00-00.mp4");
        let mut f = std::fs::File::create(&segment).unwrap();
        f.write_all(b"x").unwrap();

        let out = dir.path().join("out.txt");
        let template = format!("echo {{channel}}/{{filename}} > {}", out.display());
        run_upload_command(&template, &segment, "ch0", "2024-06-01_10-00-00.mp4").unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "ch0/2024-06-01_10-00-00.mp4");
    }

    #[test]
    fn test_upload_command_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("a.mp4");
        std::fs::write(&segment, "x").unwrap();
        assert!(run_upload_command("exit 3", &segment, "ch0", "a.mp4").is_err());
    }
}
