//! Upload protocol: simple PUT and resumable upload sessions.
//!
//! Small files go up in one `PUT .../content`. Larger files use an upload
//! session: fragments are PUT against the session URL with a
//! `Content-Range` header. Fragment sizes must be 320 KiB multiples and
//! stay below 60 MiB; [`align_fragment_size`] enforces both.
//!
//! Fragment status handling:
//! - 200/201: final fragment, body is the completed item;
//! - 202: accepted, body carries `nextExpectedRanges`;
//! - 416: the server already has this range; the caller re-queries the
//!   session status and continues from there.

use std::io::SeekFrom;
use std::path::Path;

use reqwest::Method;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use odmirror_core::domain::errors::RemoteError;
use odmirror_core::ports::remote::{FragmentOutcome, RemoteItem, UploadSession};

use crate::client::{error_from_response, GraphClient};
use crate::types::{DriveItemResource, UploadSessionResource};

/// 320 KiB, the server's required fragment granularity.
const FRAGMENT_QUANTUM: u64 = 320 * 1024;

/// Hard ceiling on a single fragment.
const FRAGMENT_CEILING: u64 = 60 * 1024 * 1024;

/// Rounds a configured fragment size (MiB) down to a 320 KiB multiple,
/// strictly below 60 MiB and at least one quantum.
pub fn align_fragment_size(config_mib: u64) -> u64 {
    let requested = config_mib.saturating_mul(1024 * 1024);
    let capped = requested.min(FRAGMENT_CEILING - FRAGMENT_QUANTUM);
    let aligned = (capped / FRAGMENT_QUANTUM) * FRAGMENT_QUANTUM;
    aligned.max(FRAGMENT_QUANTUM)
}

async fn read_file_slice(
    operation: &str,
    local_path: &Path,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, RemoteError> {
    let io_err = |e: std::io::Error| RemoteError::Transport {
        operation: operation.to_string(),
        message: format!("reading {}: {e}", local_path.display()),
    };

    let mut file = tokio::fs::File::open(local_path).await.map_err(io_err)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer).await.map_err(io_err)?;
    Ok(buffer)
}

/// Single-request upload of a new file into a parent folder.
pub async fn simple_upload(
    client: &GraphClient,
    local_path: &Path,
    drive_id: &str,
    parent_id: &str,
    name: &str,
) -> Result<RemoteItem, RemoteError> {
    let data = tokio::fs::read(local_path)
        .await
        .map_err(|e| RemoteError::Transport {
            operation: "simple_upload".to_string(),
            message: format!("reading {}: {e}", local_path.display()),
        })?;

    let encoded_name = super::provider::encode_path(name);
    let path = format!("/drives/{drive_id}/items/{parent_id}:/{encoded_name}:/content");
    debug!(name, bytes = data.len(), "simple upload");

    let resource: DriveItemResource = client
        .expect_json("simple_upload", || {
            client
                .request(Method::PUT, &path)
                .header("Content-Type", "application/octet-stream")
                .body(data.clone())
        })
        .await?;

    Ok(resource.into_remote_item())
}

/// Single-request replacement of an existing item's content.
pub async fn simple_upload_replace(
    client: &GraphClient,
    local_path: &Path,
    drive_id: &str,
    item_id: &str,
) -> Result<RemoteItem, RemoteError> {
    let data = tokio::fs::read(local_path)
        .await
        .map_err(|e| RemoteError::Transport {
            operation: "simple_upload_replace".to_string(),
            message: format!("reading {}: {e}", local_path.display()),
        })?;

    let path = format!("/drives/{drive_id}/items/{item_id}/content");
    debug!(item_id, bytes = data.len(), "simple upload replace");

    let resource: DriveItemResource = client
        .expect_json("simple_upload_replace", || {
            client
                .request(Method::PUT, &path)
                .header("Content-Type", "application/octet-stream")
                .body(data.clone())
        })
        .await?;

    Ok(resource.into_remote_item())
}

/// Creates a resumable upload session for `name` under `parent_id`.
pub async fn create_upload_session(
    client: &GraphClient,
    drive_id: &str,
    parent_id: &str,
    name: &str,
    if_match: Option<&str>,
    fs_info: &serde_json::Value,
) -> Result<UploadSession, RemoteError> {
    let encoded_name = super::provider::encode_path(name);
    let path = format!("/drives/{drive_id}/items/{parent_id}:/{encoded_name}:/createUploadSession");

    let body = serde_json::json!({
        "item": {
            "@microsoft.graph.conflictBehavior": "replace",
            "name": name,
            "fileSystemInfo": fs_info,
        }
    });

    debug!(name, "creating upload session");
    let resource: UploadSessionResource = client
        .expect_json("create_upload_session", || {
            let mut request = client.request(Method::POST, &path).json(&body);
            if let Some(etag) = if_match {
                request = request.header("If-Match", etag);
            }
            request
        })
        .await?;

    Ok(resource.into_upload_session(""))
}

/// PUTs one fragment of `local_path` against the session URL.
pub async fn upload_fragment(
    client: &GraphClient,
    upload_url: &str,
    local_path: &Path,
    offset: u64,
    len: u64,
    total_size: u64,
) -> Result<FragmentOutcome, RemoteError> {
    let data = read_file_slice("upload_fragment", local_path, offset, len).await?;
    let content_range = format!("bytes {}-{}/{}", offset, offset + len - 1, total_size);
    debug!(range = %content_range, "uploading fragment");

    let response = client
        .send_with_retry("upload_fragment", || {
            client
                .request_absolute(Method::PUT, upload_url)
                .header("Content-Length", len.to_string())
                .header("Content-Range", content_range.clone())
                .body(data.clone())
        })
        .await?;

    match response.status().as_u16() {
        200 | 201 => {
            let resource: DriveItemResource =
                response.json().await.map_err(|e| RemoteError::Decode {
                    operation: "upload_fragment".to_string(),
                    message: e.to_string(),
                })?;
            Ok(FragmentOutcome::Completed(resource.into_remote_item()))
        }
        202 => {
            let resource: UploadSessionResource =
                response.json().await.map_err(|e| RemoteError::Decode {
                    operation: "upload_fragment".to_string(),
                    message: e.to_string(),
                })?;
            Ok(FragmentOutcome::Accepted(
                resource.into_upload_session(upload_url),
            ))
        }
        // The server already holds this range; resynchronise from status.
        416 => {
            let session = request_upload_status(client, upload_url).await?;
            Ok(FragmentOutcome::Accepted(session))
        }
        _ => Err(error_from_response("upload_fragment", response).await),
    }
}

/// Queries a session for its remaining expected ranges.
pub async fn request_upload_status(
    client: &GraphClient,
    upload_url: &str,
) -> Result<UploadSession, RemoteError> {
    let resource: UploadSessionResource = client
        .expect_json("request_upload_status", || {
            client.request_absolute(Method::GET, upload_url)
        })
        .await?;
    Ok(resource.into_upload_session(upload_url))
}
