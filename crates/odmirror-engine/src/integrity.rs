//! Post-transfer integrity validation.
//!
//! Compares logical size plus content hash (quickXorHash first, SHA-256
//! as fallback) between a local file and the remote record. `.heic` files
//! are known to be silently altered by the service; a mismatch there is a
//! data-loss warning, never a re-transfer trigger.

use std::path::Path;

use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::Item;
use odmirror_core::ports::remote::RemoteItem;

use crate::fsutil;

/// Result of comparing a local file against the remote record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    /// Validation disabled by configuration.
    Skipped,
    SizeMismatch {
        local: i64,
        remote: i64,
    },
    HashMismatch {
        local: String,
        remote: String,
    },
    /// `.heic`: the service re-encodes these; mismatch is expected loss.
    KnownDataLoss,
}

impl ValidationOutcome {
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self,
            ValidationOutcome::Valid | ValidationOutcome::Skipped | ValidationOutcome::KnownDataLoss
        )
    }
}

/// Extensions the service silently re-encodes.
pub fn is_known_rewritten_format(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("heic") || e.eq_ignore_ascii_case("heif"))
        .unwrap_or(false)
}

async fn compare(
    local_path: &Path,
    expected_size: i64,
    quick_xor: Option<&str>,
    sha256: Option<&str>,
    disabled: bool,
) -> Result<ValidationOutcome, SyncError> {
    if disabled {
        return Ok(ValidationOutcome::Skipped);
    }

    let metadata = std::fs::metadata(local_path)
        .map_err(|e| SyncError::filesystem(local_path.display().to_string(), e))?;
    let local_size = metadata.len() as i64;
    if local_size != expected_size {
        return Ok(ValidationOutcome::SizeMismatch {
            local: local_size,
            remote: expected_size,
        });
    }

    if local_size == 0 {
        return Ok(ValidationOutcome::Valid);
    }

    // quickXorHash is primary; SHA-256 only when it is all we have.
    let (local_hash, remote_hash) = if let Some(remote) = quick_xor {
        (fsutil::quick_xor_file(local_path).await?, remote.to_string())
    } else if let Some(remote) = sha256 {
        (fsutil::sha256_file(local_path).await?, remote.to_string())
    } else {
        // No remote hash supplied (OneNote objects); size agreement is
        // all that can be checked.
        return Ok(ValidationOutcome::Valid);
    };

    if local_hash == remote_hash {
        Ok(ValidationOutcome::Valid)
    } else if is_known_rewritten_format(local_path) {
        Ok(ValidationOutcome::KnownDataLoss)
    } else {
        Ok(ValidationOutcome::HashMismatch {
            local: local_hash,
            remote: remote_hash,
        })
    }
}

/// Validates a downloaded file against its store record.
pub async fn validate_download(
    local_path: &Path,
    item: &Item,
    disabled: bool,
) -> Result<ValidationOutcome, SyncError> {
    compare(
        local_path,
        item.size,
        item.quick_xor_hash.as_deref(),
        item.sha256_hash.as_deref(),
        disabled,
    )
    .await
}

/// Validates a local file against the item the server returned after an
/// upload.
pub async fn validate_upload(
    local_path: &Path,
    uploaded: &RemoteItem,
    disabled: bool,
) -> Result<ValidationOutcome, SyncError> {
    let file = uploaded.file.as_ref();
    compare(
        local_path,
        uploaded.size.unwrap_or(0),
        file.and_then(|f| f.quick_xor_hash.as_deref()),
        file.and_then(|f| f.sha256_hash.as_deref()),
        disabled,
    )
    .await
}

/// Whether a local file already matches the stored record (size + hash),
/// used to decide between "persist only" and "transfer".
pub async fn local_matches_item(local_path: &Path, item: &Item) -> Result<bool, SyncError> {
    match validate_download(local_path, item, false).await? {
        ValidationOutcome::Valid => Ok(true),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use odmirror_core::domain::item::ItemKind;

    fn item_with(size: i64, qxor: Option<&str>) -> Item {
        Item {
            drive_id: "abcdef0123456789".to_string(),
            id: "X".to_string(),
            parent_id: Some("P".to_string()),
            name: "x.bin".to_string(),
            remote_name: None,
            kind: ItemKind::File,
            etag: None,
            ctag: None,
            mtime: Utc::now(),
            size,
            quick_xor_hash: qxor.map(|s| s.to_string()),
            sha256_hash: None,
            reloc_drive_id: None,
            reloc_parent_id: None,
            in_sync: true,
        }
    }

    #[tokio::test]
    async fn test_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"abc").unwrap();

        let expected = crate::fsutil::quick_xor_file(&path).await.unwrap();
        let item = item_with(3, Some(&expected));

        let outcome = validate_download(&path, &item, false).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Valid);
        assert!(local_matches_item(&path, &item).await.unwrap());
    }

    #[tokio::test]
    async fn test_size_mismatch_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"abc").unwrap();

        let item = item_with(99, Some("irrelevant"));
        let outcome = validate_download(&path, &item, false).await.unwrap();
        assert!(matches!(outcome, ValidationOutcome::SizeMismatch { local: 3, remote: 99 }));
    }

    #[tokio::test]
    async fn test_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"abc").unwrap();

        let item = item_with(3, Some("definitely-not-the-hash"));
        let outcome = validate_download(&path, &item, false).await.unwrap();
        assert!(matches!(outcome, ValidationOutcome::HashMismatch { .. }));
        assert!(!outcome.is_acceptable());
    }

    #[tokio::test]
    async fn test_heic_mismatch_is_known_data_loss() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.HEIC");
        std::fs::write(&path, b"jpegish").unwrap();

        let item = item_with(7, Some("server-side-hash"));
        let outcome = validate_download(&path, &item, false).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::KnownDataLoss);
        assert!(outcome.is_acceptable());
    }

    #[tokio::test]
    async fn test_disabled_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"whatever").unwrap();

        let item = item_with(3, Some("h"));
        let outcome = validate_download(&path, &item, true).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_no_remote_hash_accepts_on_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.one");
        std::fs::write(&path, b"12345").unwrap();

        let item = item_with(5, None);
        let outcome = validate_download(&path, &item, false).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Valid);
    }
}
