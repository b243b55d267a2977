//! Remote API port (driven/secondary port).
//!
//! The engine talks to the cloud exclusively through [`RemoteApi`]. The
//! trait is deliberately close to the remote service's own vocabulary
//! (drives, items, delta links, upload sessions) so the HTTP adapter stays
//! a thin translation layer, while tests can implement the trait with an
//! in-memory fake.
//!
//! Transient HTTP 408/429/503/504 are retried *inside* the adapter with
//! exponential backoff; every other status surfaces as a
//! [`RemoteError`](crate::domain::errors::RemoteError) carrying the code,
//! which the engine branches on (410 expired token, 412 precondition, ...).

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::drive::{DriveKind, DriveQuota};
use crate::domain::errors::RemoteError;

// ============================================================================
// DTOs
// ============================================================================

/// Parent reference of a remote item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub drive_id: Option<String>,
    pub id: Option<String>,
    /// Raw parent path as reported (`/drive/root:/A/B` shape), used to
    /// compute virtual paths for items whose parent is not yet known
    /// locally.
    pub path: Option<String>,
}

/// File facet: content metadata present on file items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacet {
    pub mime_type: Option<String>,
    pub quick_xor_hash: Option<String>,
    pub sha256_hash: Option<String>,
}

/// Shared-folder pointer facet: present on items that are shortcuts into
/// another drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFacet {
    pub drive_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub is_directory: bool,
}

/// Provider-agnostic view of one remote item, as parsed from a change
/// page, a children listing or a single-item fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub etag: Option<String>,
    pub ctag: Option<String>,
    pub size: Option<i64>,
    /// `fileSystemInfo.lastModifiedDateTime` when present, otherwise the
    /// item-level modification time.
    pub modified: Option<DateTime<Utc>>,
    pub parent: Option<ParentRef>,
    pub file: Option<FileFacet>,
    pub is_folder: bool,
    /// The `root` facet was present.
    pub is_root: bool,
    /// The `deleted` facet was present.
    pub deleted: bool,
    /// The `malware` facet was present; the item must never be downloaded.
    pub malware: bool,
    /// `package.type` (`oneNote` packages and their descendants are not
    /// syncable).
    pub package_type: Option<String>,
    pub remote: Option<RemoteFacet>,
    pub created_by: Option<String>,
    pub modified_by: Option<String>,
    pub web_url: Option<String>,
}

impl RemoteItem {
    /// The OneNote recycle-bin folder is not a real folder for sync
    /// purposes; it and its contents are dropped during page intake.
    pub fn is_onenote_recycle_bin(&self) -> bool {
        self.is_folder && self.name == "OneNote_RecycleBin"
    }

    /// OneNote payloads that must be skipped: `oneNote` packages, plus
    /// notebook files the API labels with a OneNote or opaque MIME type.
    pub fn is_onenote_payload(&self) -> bool {
        if self.package_type.as_deref() == Some("oneNote") {
            return true;
        }
        if let Some(file) = &self.file {
            let onenote_ext = std::path::Path::new(&self.name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("one") || e.eq_ignore_ascii_case("onetoc2"))
                .unwrap_or(false);
            let onenote_mime = matches!(
                file.mime_type.as_deref(),
                Some("application/msonenote") | Some("application/octet-stream")
            );
            return onenote_ext && onenote_mime;
        }
        false
    }
}

/// One page of a change feed or children listing.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub items: Vec<RemoteItem>,
    pub next_link: Option<String>,
    pub delta_link: Option<String>,
}

/// Descriptor of a drive.
#[derive(Debug, Clone)]
pub struct DriveInfo {
    pub id: String,
    pub kind: DriveKind,
    pub quota: DriveQuota,
    pub root_id: Option<String>,
}

/// Server-side resumable upload context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_url: String,
    pub expiration: Option<DateTime<Utc>>,
    /// Ranges the server still expects, e.g. `["26214400-"]`.
    pub next_expected_ranges: Vec<String>,
}

impl UploadSession {
    /// The offset the next fragment must start at, parsed from the first
    /// expected range. `None` when the server reported no pending ranges.
    pub fn next_offset(&self) -> Option<u64> {
        let first = self.next_expected_ranges.first()?;
        let start = first.split('-').next()?;
        start.parse().ok()
    }
}

/// Result of pushing one fragment to an upload session.
#[derive(Debug, Clone)]
pub enum FragmentOutcome {
    /// Intermediate fragment accepted; the session reports the next ranges.
    Accepted(UploadSession),
    /// Final fragment: the server returned the completed item.
    Completed(RemoteItem),
}

/// One page of a site search.
#[derive(Debug, Clone, Default)]
pub struct SitePage {
    pub sites: Vec<SiteInfo>,
    pub next_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SiteInfo {
    pub id: String,
    pub display_name: String,
    pub web_url: Option<String>,
}

/// One page of a site's document libraries.
#[derive(Debug, Clone, Default)]
pub struct DrivePage {
    pub drives: Vec<DriveInfo>,
    pub next_link: Option<String>,
}

/// Parameters for creating a shareable link.
#[derive(Debug, Clone)]
pub struct ShareLinkRequest {
    /// `view` or `edit`.
    pub link_type: String,
    /// `anonymous` or `organization`.
    pub scope: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ShareLink {
    pub url: String,
}

// ============================================================================
// The port
// ============================================================================

/// Minimum remote capability the engine consumes.
///
/// A handle is *not* shared across transfer workers; each worker borrows or
/// creates one for a unit of work (see the engine's worker pool).
#[async_trait::async_trait]
pub trait RemoteApi: Send + Sync {
    // --- drives ---

    async fn get_default_drive(&self) -> Result<DriveInfo, RemoteError>;

    async fn get_default_root(&self) -> Result<RemoteItem, RemoteError>;

    async fn get_drive_quota(&self, drive_id: &str) -> Result<DriveQuota, RemoteError>;

    async fn get_drive_root(&self, drive_id: &str) -> Result<RemoteItem, RemoteError>;

    // --- item lookup ---

    async fn get_path_details(&self, path: &str) -> Result<RemoteItem, RemoteError>;

    async fn get_item_by_id(&self, drive_id: &str, item_id: &str)
        -> Result<RemoteItem, RemoteError>;

    async fn get_path_details_by_drive(
        &self,
        drive_id: &str,
        path: &str,
    ) -> Result<RemoteItem, RemoteError>;

    // --- enumeration ---

    /// Lists one page of children. Pass the previous page's `next_link` to
    /// continue; pages carry at most 200 items.
    async fn list_children(
        &self,
        drive_id: &str,
        item_id: &str,
        next_link: Option<&str>,
    ) -> Result<ChangePage, RemoteError>;

    /// Lists one page of incremental changes. HTTP 410 means the token
    /// expired and the caller must restart with `delta_link = None`.
    async fn list_changes(
        &self,
        drive_id: &str,
        item_id: &str,
        delta_link: Option<&str>,
    ) -> Result<ChangePage, RemoteError>;

    // --- mutation ---

    async fn create_folder(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteItem, RemoteError>;

    async fn update_item(
        &self,
        drive_id: &str,
        item_id: &str,
        patch: &serde_json::Value,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, RemoteError>;

    async fn delete_item(
        &self,
        drive_id: &str,
        item_id: &str,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError>;

    /// Bypasses the recycle bin where the deployment supports it.
    async fn permanent_delete_item(
        &self,
        drive_id: &str,
        item_id: &str,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError>;

    // --- transfers ---

    async fn simple_upload(
        &self,
        local_path: &Path,
        drive_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteItem, RemoteError>;

    async fn simple_upload_replace(
        &self,
        local_path: &Path,
        drive_id: &str,
        item_id: &str,
    ) -> Result<RemoteItem, RemoteError>;

    async fn create_upload_session(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
        if_match: Option<&str>,
        fs_info: &serde_json::Value,
    ) -> Result<UploadSession, RemoteError>;

    /// PUTs `[offset, offset+len)` of `local_path` against the session URL.
    async fn upload_fragment(
        &self,
        upload_url: &str,
        local_path: &Path,
        offset: u64,
        len: u64,
        total_size: u64,
    ) -> Result<FragmentOutcome, RemoteError>;

    async fn request_upload_status(&self, upload_url: &str)
        -> Result<UploadSession, RemoteError>;

    /// Ranged download into `dest`, starting at `resume_offset` (0 for a
    /// fresh transfer). Returns the total bytes now present in `dest`.
    async fn download_item(
        &self,
        drive_id: &str,
        item_id: &str,
        dest: &Path,
        expected_size: i64,
        resume_offset: u64,
    ) -> Result<u64, RemoteError>;

    // --- sharing and sites ---

    async fn get_shared_with_me(&self) -> Result<Vec<RemoteItem>, RemoteError>;

    async fn search_sites(
        &self,
        query: &str,
        next_link: Option<&str>,
    ) -> Result<SitePage, RemoteError>;

    async fn list_site_drives(
        &self,
        site_id: &str,
        next_link: Option<&str>,
    ) -> Result<DrivePage, RemoteError>;

    async fn create_share_link(
        &self,
        drive_id: &str,
        item_id: &str,
        request: &ShareLinkRequest,
    ) -> Result<ShareLink, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_session_next_offset() {
        let session = UploadSession {
            upload_url: "https://example.invalid/up/1".to_string(),
            expiration: None,
            next_expected_ranges: vec!["26214400-104857599".to_string()],
        };
        assert_eq!(session.next_offset(), Some(26214400));

        let open_ended = UploadSession {
            upload_url: "https://example.invalid/up/2".to_string(),
            expiration: None,
            next_expected_ranges: vec!["0-".to_string()],
        };
        assert_eq!(open_ended.next_offset(), Some(0));

        let done = UploadSession {
            upload_url: "https://example.invalid/up/3".to_string(),
            expiration: None,
            next_expected_ranges: vec![],
        };
        assert_eq!(done.next_offset(), None);
    }

    mod onenote_detection {
        use super::*;

        fn base_item(name: &str) -> RemoteItem {
            RemoteItem {
                id: "X".to_string(),
                name: name.to_string(),
                etag: None,
                ctag: None,
                size: None,
                modified: None,
                parent: None,
                file: None,
                is_folder: false,
                is_root: false,
                deleted: false,
                malware: false,
                package_type: None,
                remote: None,
                created_by: None,
                modified_by: None,
                web_url: None,
            }
        }

        #[test]
        fn test_onenote_package() {
            let mut item = base_item("Notebook");
            item.package_type = Some("oneNote".to_string());
            assert!(item.is_onenote_payload());
        }

        #[test]
        fn test_onenote_file_by_mime_and_extension() {
            let mut item = base_item("Section.one");
            item.file = Some(FileFacet {
                mime_type: Some("application/msonenote".to_string()),
                quick_xor_hash: None,
                sha256_hash: None,
            });
            assert!(item.is_onenote_payload());

            let mut toc = base_item("Notebook.onetoc2");
            toc.file = Some(FileFacet {
                mime_type: Some("application/octet-stream".to_string()),
                quick_xor_hash: None,
                sha256_hash: None,
            });
            assert!(toc.is_onenote_payload());
        }

        #[test]
        fn test_plain_octet_stream_is_not_onenote() {
            let mut item = base_item("data.bin");
            item.file = Some(FileFacet {
                mime_type: Some("application/octet-stream".to_string()),
                quick_xor_hash: None,
                sha256_hash: None,
            });
            assert!(!item.is_onenote_payload());
        }

        #[test]
        fn test_recycle_bin_folder() {
            let mut item = base_item("OneNote_RecycleBin");
            item.is_folder = true;
            assert!(item.is_onenote_recycle_bin());

            let mut file = base_item("OneNote_RecycleBin");
            file.is_folder = false;
            assert!(!file.is_onenote_recycle_bin());
        }
    }
}
