//! Resumable-session descriptors.
//!
//! Two small JSON files per in-flight transfer live alongside the state
//! database: `session_upload.<nonce>` and `resume_download.<nonce>`.
//! They are written atomically (temp file + rename) after every
//! successful fragment so a crash can resume, and removed on success or
//! definitive failure.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use odmirror_core::domain::errors::SyncError;

/// Persistent state of an in-flight session upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSessionDescriptor {
    pub upload_url: String,
    pub expiration: Option<DateTime<Utc>>,
    pub next_expected_ranges: Vec<String>,
    pub local_path: PathBuf,
    pub target_drive_id: String,
    pub target_parent_id: String,
    pub target_name: String,
    /// ETag of the item being replaced, when this is a modify-upload.
    pub current_etag: Option<String>,
}

impl UploadSessionDescriptor {
    /// The offset the next fragment starts at.
    pub fn next_offset(&self) -> Option<u64> {
        let first = self.next_expected_ranges.first()?;
        first.split('-').next()?.parse().ok()
    }

    /// A descriptor is resumable when its local file still exists with at
    /// least the already-acknowledged length and the session has not
    /// expired.
    pub fn is_resumable(&self, now: DateTime<Utc>) -> bool {
        if let Some(expiration) = self.expiration {
            if expiration <= now {
                return false;
            }
        }
        let Some(offset) = self.next_offset() else {
            return false;
        };
        match std::fs::metadata(&self.local_path) {
            Ok(meta) => meta.len() >= offset,
            Err(_) => false,
        }
    }
}

/// Persistent state of an interrupted download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadResumeDescriptor {
    pub drive_id: String,
    pub item_id: String,
    /// The partial file on disk.
    pub download_path: PathBuf,
    /// The name the completed file will take.
    pub original_name: String,
    pub resume_offset: u64,
    pub quick_xor_hash: Option<String>,
    pub sha256_hash: Option<String>,
}

/// Manages descriptor files in the state directory.
pub struct SessionManager {
    dir: PathBuf,
}

const UPLOAD_PREFIX: &str = "session_upload.";
const DOWNLOAD_PREFIX: &str = "resume_download.";

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| SyncError::filesystem(dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    pub fn new_nonce() -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), SyncError> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| {
            SyncError::filesystem(
                path.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4().simple()));
        std::fs::write(&tmp, &json)
            .map_err(|e| SyncError::filesystem(tmp.display().to_string(), e))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
        Ok(())
    }

    /// Path a given upload nonce persists to.
    pub fn upload_descriptor_path(&self, nonce: &str) -> PathBuf {
        self.dir.join(format!("{UPLOAD_PREFIX}{nonce}"))
    }

    /// Persists an upload descriptor under the given nonce.
    pub fn save_upload(
        &self,
        nonce: &str,
        descriptor: &UploadSessionDescriptor,
    ) -> Result<PathBuf, SyncError> {
        let path = self.dir.join(format!("{UPLOAD_PREFIX}{nonce}"));
        self.write_atomic(&path, descriptor)?;
        debug!(path = %path.display(), "upload session descriptor saved");
        Ok(path)
    }

    /// Persists a download-resume descriptor under the given nonce.
    pub fn save_download(
        &self,
        nonce: &str,
        descriptor: &DownloadResumeDescriptor,
    ) -> Result<PathBuf, SyncError> {
        let path = self.dir.join(format!("{DOWNLOAD_PREFIX}{nonce}"));
        self.write_atomic(&path, descriptor)?;
        debug!(path = %path.display(), "download resume descriptor saved");
        Ok(path)
    }

    pub fn remove(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not remove descriptor");
            }
        }
    }

    fn load_with_prefix<T: for<'de> Deserialize<'de>>(
        &self,
        prefix: &str,
    ) -> Vec<(PathBuf, T)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(prefix) {
                continue;
            }
            let path = entry.path();
            match std::fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice::<T>(&bytes).ok())
            {
                Some(descriptor) => found.push((path, descriptor)),
                None => {
                    // Unreadable descriptors cannot be resumed; drop them
                    // so they stop being rediscovered every cycle.
                    warn!(path = %path.display(), "discarding unreadable descriptor");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        found
    }

    /// All persisted upload sessions, for startup discovery.
    pub fn pending_uploads(&self) -> Vec<(PathBuf, UploadSessionDescriptor)> {
        self.load_with_prefix(UPLOAD_PREFIX)
    }

    /// All persisted download resumes.
    pub fn pending_downloads(&self) -> Vec<(PathBuf, DownloadResumeDescriptor)> {
        self.load_with_prefix(DOWNLOAD_PREFIX)
    }

    /// Looks up a download resume for a specific item.
    pub fn find_download(
        &self,
        drive_id: &str,
        item_id: &str,
    ) -> Option<(PathBuf, DownloadResumeDescriptor)> {
        self.pending_downloads()
            .into_iter()
            .find(|(_, d)| d.drive_id == drive_id && d.item_id == item_id)
    }
}
