//! Graph API resource types (JSON deserialization) and their conversion
//! into the port-level DTOs from `odmirror-core`.
//!
//! Fields are `Option` because the API omits facets freely: deleted items
//! lack sizes, folders lack hashes, root objects may lack a parent
//! reference. See <https://learn.microsoft.com/en-us/graph/api/resources/driveitem>.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use odmirror_core::domain::drive::{DriveKind, DriveQuota};
use odmirror_core::ports::remote::{
    ChangePage, DriveInfo, FileFacet, ParentRef, RemoteFacet, RemoteItem, SiteInfo, UploadSession,
};

// ============================================================================
// DriveItem and facets
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItemResource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub e_tag: Option<String>,
    pub c_tag: Option<String>,
    pub size: Option<i64>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
    pub file_system_info: Option<FileSystemInfo>,
    pub parent_reference: Option<ItemReference>,
    pub file: Option<FileFacetResource>,
    pub folder: Option<FolderFacet>,
    pub root: Option<serde_json::Value>,
    pub deleted: Option<serde_json::Value>,
    pub malware: Option<serde_json::Value>,
    pub package: Option<PackageFacet>,
    pub remote_item: Option<RemoteItemFacet>,
    pub created_by: Option<IdentitySet>,
    pub last_modified_by: Option<IdentitySet>,
    pub web_url: Option<String>,
}

/// Client-visible timestamps; preferred over the item-level modification
/// time because the latter moves on metadata-only changes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    pub created_date_time: Option<DateTime<Utc>>,
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    pub drive_id: Option<String>,
    pub drive_type: Option<String>,
    pub id: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacetResource {
    pub mime_type: Option<String>,
    pub hashes: Option<HashesResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashesResource {
    pub quick_xor_hash: Option<String>,
    #[serde(rename = "sha256Hash")]
    pub sha256_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    pub child_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PackageFacet {
    #[serde(rename = "type")]
    pub package_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteItemFacet {
    pub id: Option<String>,
    pub parent_reference: Option<ItemReference>,
    pub folder: Option<FolderFacet>,
    pub file: Option<FileFacetResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySet {
    pub user: Option<Identity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl IdentitySet {
    fn label(&self) -> Option<String> {
        let user = self.user.as_ref()?;
        user.display_name.clone().or_else(|| user.email.clone())
    }
}

impl DriveItemResource {
    /// Converts to the port-level [`RemoteItem`].
    pub fn into_remote_item(self) -> RemoteItem {
        let modified = self
            .file_system_info
            .as_ref()
            .and_then(|f| f.last_modified_date_time)
            .or(self.last_modified_date_time);

        let remote = self.remote_item.as_ref().and_then(|facet| {
            let drive_id = facet
                .parent_reference
                .as_ref()
                .and_then(|p| p.drive_id.clone())?;
            let id = facet.id.clone()?;
            Some(RemoteFacet {
                drive_id,
                id,
                parent_id: facet.parent_reference.as_ref().and_then(|p| p.id.clone()),
                is_directory: facet.folder.is_some(),
            })
        });

        RemoteItem {
            id: self.id,
            name: self.name,
            etag: self.e_tag,
            ctag: self.c_tag,
            size: self.size,
            modified,
            parent: self.parent_reference.map(|p| ParentRef {
                drive_id: p.drive_id,
                id: p.id,
                path: p.path,
            }),
            file: self.file.map(|f| FileFacet {
                mime_type: f.mime_type,
                quick_xor_hash: f.hashes.as_ref().and_then(|h| h.quick_xor_hash.clone()),
                sha256_hash: f.hashes.as_ref().and_then(|h| h.sha256_hash.clone()),
            }),
            is_folder: self.folder.is_some(),
            is_root: self.root.is_some(),
            deleted: self.deleted.is_some(),
            malware: self.malware.is_some(),
            package_type: self.package.and_then(|p| p.package_type),
            remote,
            created_by: self.created_by.as_ref().and_then(IdentitySet::label),
            modified_by: self.last_modified_by.as_ref().and_then(IdentitySet::label),
            web_url: self.web_url,
        }
    }
}

// ============================================================================
// Collections and pagination
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ItemCollection {
    #[serde(default)]
    pub value: Vec<DriveItemResource>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    pub delta_link: Option<String>,
}

impl ItemCollection {
    pub fn into_change_page(self) -> ChangePage {
        ChangePage {
            items: self
                .value
                .into_iter()
                .map(DriveItemResource::into_remote_item)
                .collect(),
            next_link: self.next_link,
            delta_link: self.delta_link,
        }
    }
}

// ============================================================================
// Drives, sites, sessions
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveResource {
    pub id: String,
    pub drive_type: Option<String>,
    pub quota: Option<QuotaResource>,
}

#[derive(Debug, Deserialize)]
pub struct QuotaResource {
    pub total: Option<i64>,
    pub used: Option<i64>,
    pub remaining: Option<i64>,
}

impl DriveResource {
    pub fn into_drive_info(self) -> DriveInfo {
        let kind = self
            .drive_type
            .as_deref()
            .map(DriveKind::from_drive_type)
            .unwrap_or(DriveKind::Business);
        DriveInfo {
            id: self.id,
            kind,
            quota: DriveQuota::from_remaining(self.quota.and_then(|q| q.remaining)),
            root_id: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DriveCollection {
    #[serde(default)]
    pub value: Vec<DriveResource>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteResource {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub name: Option<String>,
    pub web_url: Option<String>,
}

impl SiteResource {
    pub fn into_site_info(self) -> SiteInfo {
        let display_name = self
            .display_name
            .or(self.name)
            .unwrap_or_else(|| self.id.clone());
        SiteInfo {
            id: self.id,
            display_name,
            web_url: self.web_url,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SiteCollection {
    #[serde(default)]
    pub value: Vec<SiteResource>,
    #[serde(rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionResource {
    pub upload_url: Option<String>,
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadSessionResource {
    /// Converts to the port DTO. `fallback_url` covers status responses,
    /// which omit `uploadUrl`.
    pub fn into_upload_session(self, fallback_url: &str) -> UploadSession {
        UploadSession {
            upload_url: self.upload_url.unwrap_or_else(|| fallback_url.to_string()),
            expiration: self.expiration_date_time,
            next_expected_ranges: self.next_expected_ranges,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResource {
    pub link: Option<SharingLinkResource>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharingLinkResource {
    pub web_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_item_full_facets() {
        let json = r#"{
            "id": "01ABC",
            "name": "report.pdf",
            "eTag": "\"{AAA},1\"",
            "cTag": "\"c:{AAA},1\"",
            "size": 524288,
            "lastModifiedDateTime": "2025-07-01T14:00:05Z",
            "fileSystemInfo": {
                "createdDateTime": "2025-06-01T08:00:00Z",
                "lastModifiedDateTime": "2025-07-01T13:59:59Z"
            },
            "parentReference": {
                "driveId": "abcdef0123456789",
                "driveType": "personal",
                "id": "PARENT",
                "path": "/drive/root:/Documents"
            },
            "file": {
                "mimeType": "application/pdf",
                "hashes": {
                    "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=",
                    "sha256Hash": "DEADBEEF"
                }
            },
            "webUrl": "https://onedrive.live.com/x",
            "lastModifiedBy": {"user": {"displayName": "Ada", "email": "ada@example.com"}}
        }"#;

        let resource: DriveItemResource = serde_json::from_str(json).unwrap();
        let item = resource.into_remote_item();

        assert_eq!(item.id, "01ABC");
        assert_eq!(item.etag.as_deref(), Some("\"{AAA},1\""));
        // fileSystemInfo wins over the item-level timestamp.
        assert_eq!(
            item.modified.unwrap().to_rfc3339(),
            "2025-07-01T13:59:59+00:00"
        );
        let file = item.file.as_ref().unwrap();
        assert_eq!(file.quick_xor_hash.as_deref(), Some("AAAAAAAAAAAAAAAAAAAAAAAAAAA="));
        assert_eq!(file.sha256_hash.as_deref(), Some("DEADBEEF"));
        assert_eq!(item.modified_by.as_deref(), Some("Ada"));
        assert!(!item.is_folder && !item.deleted && !item.malware);
    }

    #[test]
    fn test_deleted_item_minimal() {
        let json = r#"{"id": "GONE", "name": "old.txt", "deleted": {"state": "deleted"}}"#;
        let item: DriveItemResource = serde_json::from_str(json).unwrap();
        let item = item.into_remote_item();
        assert!(item.deleted);
        assert!(item.size.is_none());
        assert!(item.parent.is_none());
    }

    #[test]
    fn test_root_marker() {
        let json = r#"{"id": "ROOT", "name": "root", "root": {}, "folder": {"childCount": 3}}"#;
        let item = serde_json::from_str::<DriveItemResource>(json).unwrap().into_remote_item();
        assert!(item.is_root);
        assert!(item.is_folder);
    }

    #[test]
    fn test_remote_item_facet() {
        let json = r#"{
            "id": "PTR",
            "name": "Shared Folder",
            "parentReference": {"driveId": "abcdef0123456789", "id": "ROOT"},
            "remoteItem": {
                "id": "TARGET",
                "parentReference": {"driveId": "fedcba9876543210", "id": "TROOT"},
                "folder": {"childCount": 9}
            }
        }"#;
        let item = serde_json::from_str::<DriveItemResource>(json).unwrap().into_remote_item();
        let remote = item.remote.unwrap();
        assert_eq!(remote.drive_id, "fedcba9876543210");
        assert_eq!(remote.id, "TARGET");
        assert!(remote.is_directory);
    }

    #[test]
    fn test_onenote_package() {
        let json = r#"{"id": "NB", "name": "My Notebook", "package": {"type": "oneNote"}}"#;
        let item = serde_json::from_str::<DriveItemResource>(json).unwrap().into_remote_item();
        assert_eq!(item.package_type.as_deref(), Some("oneNote"));
    }

    #[test]
    fn test_malware_marker() {
        let json = r#"{"id": "BAD", "name": "virus.exe", "malware": {"description": "detected"}}"#;
        let item = serde_json::from_str::<DriveItemResource>(json).unwrap().into_remote_item();
        assert!(item.malware);
    }

    #[test]
    fn test_collection_pagination_links() {
        let json = r#"{
            "value": [{"id": "1", "name": "a"}, {"id": "2", "name": "b"}],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/next?skiptoken=x"
        }"#;
        let page: ItemCollection = serde_json::from_str(json).unwrap();
        let page = page.into_change_page();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_link.is_some());
        assert!(page.delta_link.is_none());
    }

    #[test]
    fn test_collection_delta_link_final_page() {
        let json = r#"{
            "value": [],
            "@odata.deltaLink": "https://graph.microsoft.com/v1.0/me/drive/root/delta?token=final"
        }"#;
        let page = serde_json::from_str::<ItemCollection>(json).unwrap().into_change_page();
        assert!(page.items.is_empty());
        assert!(page.delta_link.is_some());
    }

    #[test]
    fn test_drive_resource_quota() {
        let json = r#"{
            "id": "abcdef0123456789",
            "driveType": "personal",
            "quota": {"total": 5368709120, "used": 1073741824, "remaining": 4294967296}
        }"#;
        let drive: DriveResource = serde_json::from_str(json).unwrap();
        let info = drive.into_drive_info();
        assert_eq!(info.kind, DriveKind::Personal);
        assert!(info.quota.available);
        assert_eq!(info.quota.remaining, 4294967296);
    }

    #[test]
    fn test_drive_resource_restricted_quota() {
        let json = r#"{"id": "b!x", "driveType": "business"}"#;
        let info: DriveInfo = serde_json::from_str::<DriveResource>(json)
            .unwrap()
            .into_drive_info();
        assert!(info.quota.restricted);
    }

    #[test]
    fn test_upload_session_resource() {
        let json = r#"{
            "uploadUrl": "https://sn3302.up.1drv.com/up/abc",
            "expirationDateTime": "2025-06-15T12:00:00Z",
            "nextExpectedRanges": ["26214400-"]
        }"#;
        let session: UploadSessionResource = serde_json::from_str(json).unwrap();
        let session = session.into_upload_session("ignored");
        assert_eq!(session.upload_url, "https://sn3302.up.1drv.com/up/abc");
        assert_eq!(session.next_offset(), Some(26214400));
    }

    #[test]
    fn test_upload_status_without_url_uses_fallback() {
        let json = r#"{"expirationDateTime": "2025-06-15T12:00:00Z", "nextExpectedRanges": ["0-"]}"#;
        let session: UploadSessionResource = serde_json::from_str(json).unwrap();
        let session = session.into_upload_session("https://fallback.example/up");
        assert_eq!(session.upload_url, "https://fallback.example/up");
    }
}
