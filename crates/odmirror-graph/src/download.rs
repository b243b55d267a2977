//! Ranged, resumable content downloads.
//!
//! Issues `GET .../content` with a `Range` header when resuming and
//! streams the body straight to disk. A mid-stream transport failure
//! leaves the partial file in place; the caller persists a resume
//! descriptor and retries from the new offset on the next cycle.

use std::path::Path;

use futures_util::StreamExt;
use reqwest::Method;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use odmirror_core::domain::errors::RemoteError;

use crate::client::GraphClient;

/// Downloads item content into `dest`, starting at `resume_offset`.
/// Returns the number of bytes now present in `dest`.
pub async fn download_to(
    client: &GraphClient,
    drive_id: &str,
    item_id: &str,
    dest: &Path,
    resume_offset: u64,
) -> Result<u64, RemoteError> {
    let path = format!("/drives/{drive_id}/items/{item_id}/content");
    let io_err = |e: std::io::Error| RemoteError::Transport {
        operation: "download_item".to_string(),
        message: format!("writing {}: {e}", dest.display()),
    };

    let response = client
        .send_with_retry("download_item", || {
            let mut request = client.request(Method::GET, &path);
            if resume_offset > 0 {
                request = request.header("Range", format!("bytes={resume_offset}-"));
            }
            request
        })
        .await?;
    let response = client.check_status("download_item", response).await?;

    // A 200 despite a Range request means the server restarted the
    // transfer from zero; truncate and take the whole body.
    let appending = resume_offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(!appending)
        .open(dest)
        .await
        .map_err(io_err)?;

    let mut written = if appending {
        file.set_len(resume_offset).await.map_err(io_err)?;
        file.seek(std::io::SeekFrom::End(0)).await.map_err(io_err)?;
        resume_offset
    } else {
        0
    };

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RemoteError::Transport {
            operation: "download_item".to_string(),
            message: format!("stream interrupted after {written} bytes: {e}"),
        })?;
        file.write_all(&chunk).await.map_err(io_err)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(io_err)?;
    debug!(item_id, written, "download complete");
    Ok(written)
}
