//! `RemoteApi` implementation over [`GraphClient`].
//!
//! Thin translation from the port vocabulary to Graph endpoints. Children
//! listings request 200-item pages (the service's pagination contract);
//! continuation always follows the absolute `@odata.nextLink` /
//! `@odata.deltaLink` URLs verbatim.

use std::path::Path;

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::Method;
use tracing::debug;

use odmirror_core::domain::drive::DriveQuota;
use odmirror_core::domain::errors::RemoteError;
use odmirror_core::ports::remote::{
    ChangePage, DriveInfo, DrivePage, FragmentOutcome, RemoteApi, RemoteItem, ShareLink,
    ShareLinkRequest, SitePage, UploadSession,
};

use crate::client::GraphClient;
use crate::types::{
    DriveCollection, DriveItemResource, DriveResource, ItemCollection, PermissionResource,
    SiteCollection,
};
use crate::{download, upload};

/// Characters percent-encoded inside a path segment sent to the API.
const SEGMENT_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\');

/// Percent-encodes a drive-relative path, preserving `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait::async_trait]
impl RemoteApi for GraphClient {
    async fn get_default_drive(&self) -> Result<DriveInfo, RemoteError> {
        let drive: DriveResource = self
            .expect_json("get_default_drive", || self.request(Method::GET, "/me/drive"))
            .await?;
        Ok(drive.into_drive_info())
    }

    async fn get_default_root(&self) -> Result<RemoteItem, RemoteError> {
        let item: DriveItemResource = self
            .expect_json("get_default_root", || {
                self.request(Method::GET, "/me/drive/root")
            })
            .await?;
        Ok(item.into_remote_item())
    }

    async fn get_drive_quota(&self, drive_id: &str) -> Result<DriveQuota, RemoteError> {
        let path = format!("/drives/{drive_id}?$select=id,driveType,quota");
        let drive: DriveResource = self
            .expect_json("get_drive_quota", || self.request(Method::GET, &path))
            .await?;
        Ok(drive.into_drive_info().quota)
    }

    async fn get_drive_root(&self, drive_id: &str) -> Result<RemoteItem, RemoteError> {
        let path = format!("/drives/{drive_id}/root");
        let item: DriveItemResource = self
            .expect_json("get_drive_root", || self.request(Method::GET, &path))
            .await?;
        Ok(item.into_remote_item())
    }

    async fn get_path_details(&self, path: &str) -> Result<RemoteItem, RemoteError> {
        let encoded = encode_path(path.trim_start_matches('/'));
        let api_path = format!("/me/drive/root:/{encoded}");
        let item: DriveItemResource = self
            .expect_json("get_path_details", || self.request(Method::GET, &api_path))
            .await?;
        Ok(item.into_remote_item())
    }

    async fn get_item_by_id(
        &self,
        drive_id: &str,
        item_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let path = format!("/drives/{drive_id}/items/{item_id}");
        let item: DriveItemResource = self
            .expect_json("get_item_by_id", || self.request(Method::GET, &path))
            .await?;
        Ok(item.into_remote_item())
    }

    async fn get_path_details_by_drive(
        &self,
        drive_id: &str,
        path: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let encoded = encode_path(path.trim_start_matches('/'));
        let api_path = format!("/drives/{drive_id}/root:/{encoded}");
        let item: DriveItemResource = self
            .expect_json("get_path_details_by_drive", || {
                self.request(Method::GET, &api_path)
            })
            .await?;
        Ok(item.into_remote_item())
    }

    async fn list_children(
        &self,
        drive_id: &str,
        item_id: &str,
        next_link: Option<&str>,
    ) -> Result<ChangePage, RemoteError> {
        let collection: ItemCollection = match next_link {
            Some(link) => {
                self.expect_json("list_children", || {
                    self.request_absolute(Method::GET, link)
                })
                .await?
            }
            None => {
                let path = format!("/drives/{drive_id}/items/{item_id}/children?$top=200");
                self.expect_json("list_children", || self.request(Method::GET, &path))
                    .await?
            }
        };
        Ok(collection.into_change_page())
    }

    async fn list_changes(
        &self,
        drive_id: &str,
        item_id: &str,
        delta_link: Option<&str>,
    ) -> Result<ChangePage, RemoteError> {
        let collection: ItemCollection = match delta_link {
            Some(link) => {
                self.expect_json("list_changes", || self.request_absolute(Method::GET, link))
                    .await?
            }
            None => {
                let path = format!("/drives/{drive_id}/items/{item_id}/delta?$top=200");
                self.expect_json("list_changes", || self.request(Method::GET, &path))
                    .await?
            }
        };
        Ok(collection.into_change_page())
    }

    async fn create_folder(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        let path = format!("/drives/{drive_id}/items/{parent_id}/children");
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        debug!(name, parent_id, "creating folder online");
        let item: DriveItemResource = self
            .expect_json("create_folder", || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;
        Ok(item.into_remote_item())
    }

    async fn update_item(
        &self,
        drive_id: &str,
        item_id: &str,
        patch: &serde_json::Value,
        if_match: Option<&str>,
    ) -> Result<RemoteItem, RemoteError> {
        let path = format!("/drives/{drive_id}/items/{item_id}");
        let item: DriveItemResource = self
            .expect_json("update_item", || {
                let mut request = self.request(Method::PATCH, &path).json(patch);
                if let Some(etag) = if_match {
                    request = request.header("If-Match", etag);
                }
                request
            })
            .await?;
        Ok(item.into_remote_item())
    }

    async fn delete_item(
        &self,
        drive_id: &str,
        item_id: &str,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError> {
        let path = format!("/drives/{drive_id}/items/{item_id}");
        self.expect_ok("delete_item", || {
            let mut request = self.request(Method::DELETE, &path);
            if let Some(etag) = if_match {
                request = request.header("If-Match", etag);
            }
            request
        })
        .await
    }

    async fn permanent_delete_item(
        &self,
        drive_id: &str,
        item_id: &str,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError> {
        let path = format!("/drives/{drive_id}/items/{item_id}/permanentDelete");
        self.expect_ok("permanent_delete_item", || {
            let mut request = self.request(Method::POST, &path);
            if let Some(etag) = if_match {
                request = request.header("If-Match", etag);
            }
            request
        })
        .await
    }

    async fn simple_upload(
        &self,
        local_path: &Path,
        drive_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteItem, RemoteError> {
        upload::simple_upload(self, local_path, drive_id, parent_id, name).await
    }

    async fn simple_upload_replace(
        &self,
        local_path: &Path,
        drive_id: &str,
        item_id: &str,
    ) -> Result<RemoteItem, RemoteError> {
        upload::simple_upload_replace(self, local_path, drive_id, item_id).await
    }

    async fn create_upload_session(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
        if_match: Option<&str>,
        fs_info: &serde_json::Value,
    ) -> Result<UploadSession, RemoteError> {
        upload::create_upload_session(self, drive_id, parent_id, name, if_match, fs_info).await
    }

    async fn upload_fragment(
        &self,
        upload_url: &str,
        local_path: &Path,
        offset: u64,
        len: u64,
        total_size: u64,
    ) -> Result<FragmentOutcome, RemoteError> {
        upload::upload_fragment(self, upload_url, local_path, offset, len, total_size).await
    }

    async fn request_upload_status(
        &self,
        upload_url: &str,
    ) -> Result<UploadSession, RemoteError> {
        upload::request_upload_status(self, upload_url).await
    }

    async fn download_item(
        &self,
        drive_id: &str,
        item_id: &str,
        dest: &Path,
        _expected_size: i64,
        resume_offset: u64,
    ) -> Result<u64, RemoteError> {
        download::download_to(self, drive_id, item_id, dest, resume_offset).await
    }

    async fn get_shared_with_me(&self) -> Result<Vec<RemoteItem>, RemoteError> {
        let collection: ItemCollection = self
            .expect_json("get_shared_with_me", || {
                self.request(Method::GET, "/me/drive/sharedWithMe")
            })
            .await?;
        Ok(collection.into_change_page().items)
    }

    async fn search_sites(
        &self,
        query: &str,
        next_link: Option<&str>,
    ) -> Result<SitePage, RemoteError> {
        let collection: SiteCollection = match next_link {
            Some(link) => {
                self.expect_json("search_sites", || self.request_absolute(Method::GET, link))
                    .await?
            }
            None => {
                let encoded = utf8_percent_encode(query, SEGMENT_SET).to_string();
                let path = format!("/sites?search={encoded}");
                self.expect_json("search_sites", || self.request(Method::GET, &path))
                    .await?
            }
        };
        Ok(SitePage {
            sites: collection
                .value
                .into_iter()
                .map(|s| s.into_site_info())
                .collect(),
            next_link: collection.next_link,
        })
    }

    async fn list_site_drives(
        &self,
        site_id: &str,
        next_link: Option<&str>,
    ) -> Result<DrivePage, RemoteError> {
        let collection: DriveCollection = match next_link {
            Some(link) => {
                self.expect_json("list_site_drives", || {
                    self.request_absolute(Method::GET, link)
                })
                .await?
            }
            None => {
                let path = format!("/sites/{site_id}/drives");
                self.expect_json("list_site_drives", || self.request(Method::GET, &path))
                    .await?
            }
        };
        Ok(DrivePage {
            drives: collection
                .value
                .into_iter()
                .map(|d| d.into_drive_info())
                .collect(),
            next_link: collection.next_link,
        })
    }

    async fn create_share_link(
        &self,
        drive_id: &str,
        item_id: &str,
        request: &ShareLinkRequest,
    ) -> Result<ShareLink, RemoteError> {
        let path = format!("/drives/{drive_id}/items/{item_id}/createLink");
        let mut body = serde_json::json!({
            "type": request.link_type,
            "scope": request.scope,
        });
        if let Some(password) = &request.password {
            body["password"] = serde_json::Value::String(password.clone());
        }

        let permission: PermissionResource = self
            .expect_json("create_share_link", || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;

        let url = permission
            .link
            .and_then(|l| l.web_url)
            .ok_or_else(|| RemoteError::Decode {
                operation: "create_share_link".to_string(),
                message: "response carried no link.webUrl".to_string(),
            })?;
        Ok(ShareLink { url })
    }
}
