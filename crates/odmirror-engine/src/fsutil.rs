//! Local filesystem helpers: content hashing, safe-backup renames, the
//! free-space probe, encoded path-length guard, symlink classification
//! and xattr author stamps.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use odmirror_core::domain::errors::SyncError;
use odmirror_filter::SymlinkClass;

/// Read buffer for hashing.
const HASH_BLOCK: usize = 256 * 1024;

// ============================================================================
// quickXorHash
// ============================================================================

/// OneDrive-compatible quickXorHash.
///
/// A 160-bit state; each input byte is XOR-ed in at the current bit
/// position, which advances 11 bits per byte (mod 160). The total length
/// is XOR-ed into the first 8 bytes at the end, and the 20-byte result is
/// base64-encoded.
pub struct QuickXorHash {
    data: [u8; 20],
    shift: usize,
    length: u64,
}

impl QuickXorHash {
    const WIDTH_BITS: usize = 160;
    const SHIFT_STEP: usize = 11;

    pub fn new() -> Self {
        Self {
            data: [0u8; 20],
            shift: 0,
            length: 0,
        }
    }

    pub fn update(&mut self, input: &[u8]) {
        for &byte in input {
            let byte_pos = self.shift / 8;
            let bit_offset = self.shift % 8;

            self.data[byte_pos % 20] ^= byte << bit_offset;
            if bit_offset > 0 {
                self.data[(byte_pos + 1) % 20] ^= byte >> (8 - bit_offset);
            }

            self.shift = (self.shift + Self::SHIFT_STEP) % Self::WIDTH_BITS;
        }
        self.length += input.len() as u64;
    }

    pub fn finalize(mut self) -> [u8; 20] {
        let length_bytes = self.length.to_le_bytes();
        for (i, &lb) in length_bytes.iter().enumerate() {
            self.data[i] ^= lb;
        }
        self.data
    }

    /// Base64 of the final state.
    pub fn finalize_base64(self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.finalize())
    }
}

impl Default for QuickXorHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the quickXorHash of a file, streaming in blocks.
pub async fn quick_xor_file(path: &Path) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
    let mut hasher = QuickXorHash::new();
    let mut buffer = vec![0u8; HASH_BLOCK];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_base64())
}

/// Computes the uppercase-hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:X}", hasher.finalize()))
}

// ============================================================================
// Safe backup
// ============================================================================

/// Derives the sibling name a file is renamed to before being
/// overwritten: `b.txt` becomes `b.local-20240601T123045.txt`.
pub fn safe_backup_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format("%Y%m%dT%H%M%S");
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let backup_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem}.local-{stamp}.{ext}"),
        None => format!("{stem}.local-{stamp}"),
    };
    path.with_file_name(backup_name)
}

/// Renames `path` to its timestamped sibling, preserving the original
/// content for the user. Returns the backup path.
pub fn safe_backup(path: &Path) -> Result<PathBuf, SyncError> {
    let backup = safe_backup_path(path, Utc::now());
    std::fs::rename(path, &backup)
        .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
    warn!(
        original = %path.display(),
        backup = %backup.display(),
        "existing file preserved by safe-backup rename"
    );
    Ok(backup)
}

// ============================================================================
// Free space
// ============================================================================

/// Bytes available to unprivileged writers on the filesystem holding
/// `path` (statvfs `f_bavail * f_frsize`).
pub fn available_space(path: &Path) -> Result<u64, SyncError> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SyncError::filesystem(
            path.display().to_string(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path contains NUL"),
        ))?;

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(SyncError::filesystem(
            path.display().to_string(),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(stats.f_bavail as u64 * stats.f_frsize as u64)
}

// ============================================================================
// Path length guard
// ============================================================================

/// Length of the fully percent-encoded form of a drive-relative path,
/// which is what the remote namespace limit applies to.
pub fn encoded_path_len(path: &str) -> usize {
    utf8_percent_encode(path, NON_ALPHANUMERIC).to_string().len()
}

// ============================================================================
// Symlink classification
// ============================================================================

/// Classifies a directory entry for the filter pipeline. Dangling
/// relative symlinks are resolved a second time against the sync root; a
/// target that exists there keeps the link syncable.
pub fn classify_symlink(path: &Path, sync_root: &Path) -> SymlinkClass {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return SymlinkClass::NotSymlink;
    };
    if !metadata.file_type().is_symlink() {
        return SymlinkClass::NotSymlink;
    }

    if path.exists() {
        // exists() follows the link.
        return SymlinkClass::Resolvable;
    }

    let Ok(target) = std::fs::read_link(path) else {
        return SymlinkClass::DanglingOutsideRoot;
    };
    if target.is_relative() && sync_root.join(&target).exists() {
        SymlinkClass::DanglingInsideRoot
    } else {
        SymlinkClass::DanglingOutsideRoot
    }
}

// ============================================================================
// Timestamps and xattrs
// ============================================================================

/// Sets a file's modification time.
pub fn set_mtime(path: &Path, mtime: DateTime<Utc>) -> Result<(), SyncError> {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
    let system_time: std::time::SystemTime = mtime.into();
    file.set_modified(system_time)
        .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
    Ok(())
}

/// Stamps the remote author identities onto a downloaded file.
pub fn write_author_xattrs(
    path: &Path,
    created_by: Option<&str>,
    modified_by: Option<&str>,
) {
    // Best effort: xattr support varies by filesystem.
    if let Some(author) = created_by {
        if let Err(e) = xattr::set(path, "user.onedrive.createdBy", author.as_bytes()) {
            debug!(path = %path.display(), error = %e, "could not write createdBy xattr");
        }
    }
    if let Some(author) = modified_by {
        if let Err(e) = xattr::set(path, "user.onedrive.lastModifiedBy", author.as_bytes()) {
            debug!(path = %path.display(), error = %e, "could not write lastModifiedBy xattr");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    mod quickxor {
        use super::*;

        #[test]
        fn test_empty_input() {
            // All-zero state XOR length 0 stays zero.
            let hash = QuickXorHash::new().finalize_base64();
            assert_eq!(hash, "AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        }

        #[test]
        fn test_split_updates_equal_single_update() {
            let mut one = QuickXorHash::new();
            one.update(b"hello world, this is a test vector");

            let mut two = QuickXorHash::new();
            two.update(b"hello world, ");
            two.update(b"this is a test vector");

            assert_eq!(one.finalize(), two.finalize());
        }

        #[test]
        fn test_length_affects_hash() {
            let mut a = QuickXorHash::new();
            a.update(&[0u8; 10]);
            let mut b = QuickXorHash::new();
            b.update(&[0u8; 11]);
            assert_ne!(a.finalize(), b.finalize());
        }

        #[tokio::test]
        async fn test_file_hash_matches_buffer_hash() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("data.bin");
            let content = vec![42u8; 100_000];
            std::fs::write(&path, &content).unwrap();

            let mut reference = QuickXorHash::new();
            reference.update(&content);

            let from_file = quick_xor_file(&path).await.unwrap();
            assert_eq!(from_file, reference.finalize_base64());
        }
    }

    mod backup {
        use super::*;

        #[test]
        fn test_backup_name_keeps_extension() {
            let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
            let backup = safe_backup_path(Path::new("/sync/A/b.txt"), now);
            assert_eq!(
                backup,
                PathBuf::from("/sync/A/b.local-20240601T123045.txt")
            );
        }

        #[test]
        fn test_backup_name_without_extension() {
            let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
            let backup = safe_backup_path(Path::new("/sync/Makefile"), now);
            assert_eq!(backup, PathBuf::from("/sync/Makefile.local-20240601T123045"));
        }

        #[test]
        fn test_safe_backup_moves_content() {
            let dir = tempfile::tempdir().unwrap();
            let original = dir.path().join("doc.txt");
            std::fs::write(&original, b"precious").unwrap();

            let backup = safe_backup(&original).unwrap();
            assert!(!original.exists());
            assert_eq!(std::fs::read(&backup).unwrap(), b"precious");
        }
    }

    mod space_and_paths {
        use super::*;

        #[test]
        fn test_available_space_nonzero_on_tmp() {
            let space = available_space(Path::new("/tmp")).unwrap();
            assert!(space > 0);
        }

        #[test]
        fn test_encoded_path_len_expands_specials() {
            assert_eq!(encoded_path_len("/A/b"), "%2FA%2Fb".len());
            let plain = encoded_path_len("/Documents/report.txt");
            let spaced = encoded_path_len("/Documents/my report.txt");
            assert!(spaced > plain);
        }
    }

    mod symlinks {
        use super::*;

        #[test]
        fn test_regular_file_is_not_symlink() {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("plain.txt");
            std::fs::write(&file, b"x").unwrap();
            assert_eq!(
                classify_symlink(&file, dir.path()),
                SymlinkClass::NotSymlink
            );
        }

        #[test]
        fn test_resolvable_symlink() {
            let dir = tempfile::tempdir().unwrap();
            let target = dir.path().join("target.txt");
            std::fs::write(&target, b"x").unwrap();
            let link = dir.path().join("link.txt");
            std::os::unix::fs::symlink(&target, &link).unwrap();
            assert_eq!(classify_symlink(&link, dir.path()), SymlinkClass::Resolvable);
        }

        #[test]
        fn test_dangling_relative_symlink_resolving_via_root() {
            let dir = tempfile::tempdir().unwrap();
            let sub = dir.path().join("sub");
            std::fs::create_dir(&sub).unwrap();
            // Target exists relative to the root, not relative to the link.
            std::fs::write(dir.path().join("present.txt"), b"x").unwrap();
            let link = sub.join("link.txt");
            std::os::unix::fs::symlink("present.txt", &link).unwrap();

            // Relative to `sub` the target is missing; relative to the
            // sync root it exists.
            assert_eq!(
                classify_symlink(&link, dir.path()),
                SymlinkClass::DanglingInsideRoot
            );
        }

        #[test]
        fn test_dangling_symlink_nowhere() {
            let dir = tempfile::tempdir().unwrap();
            let link = dir.path().join("broken");
            std::os::unix::fs::symlink("missing-entirely.txt", &link).unwrap();
            assert_eq!(
                classify_symlink(&link, dir.path()),
                SymlinkClass::DanglingOutsideRoot
            );
        }
    }

    #[test]
    fn test_set_mtime_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stamped.txt");
        std::fs::write(&file, b"x").unwrap();

        let target = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        set_mtime(&file, target).unwrap();

        let observed: DateTime<Utc> = std::fs::metadata(&file)
            .unwrap()
            .modified()
            .unwrap()
            .into();
        assert_eq!(observed.timestamp(), target.timestamp());
    }
}
