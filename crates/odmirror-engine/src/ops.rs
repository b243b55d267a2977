//! One-shot operations surfaced by the CLI: link retrieval, share-link
//! creation, authorship lookup, SharePoint drive discovery and online
//! moves. All are thin flows over the remote port; none touch the state
//! store.

use tracing::info;

use odmirror_core::domain::errors::{RemoteError, SyncError};
use odmirror_core::ports::remote::{RemoteApi, ShareLinkRequest};

/// Returns the web URL of the item at a drive-relative path.
pub async fn get_file_link(api: &dyn RemoteApi, path: &str) -> Result<String, SyncError> {
    let item = api.get_path_details(path).await?;
    item.web_url.ok_or_else(|| {
        RemoteError::Decode {
            operation: "get_path_details".to_string(),
            message: format!("'{path}' has no web URL"),
        }
        .into()
    })
}

/// Returns the display identity that last modified the item at `path`.
pub async fn get_modified_by(api: &dyn RemoteApi, path: &str) -> Result<String, SyncError> {
    let item = api.get_path_details(path).await?;
    Ok(item
        .modified_by
        .unwrap_or_else(|| "unknown".to_string()))
}

/// Creates a shareable link for the item at `path`.
pub async fn create_share_link(
    api: &dyn RemoteApi,
    path: &str,
    with_editing_perms: bool,
    password: Option<String>,
) -> Result<String, SyncError> {
    let item = api.get_path_details(path).await?;
    let drive_id = item
        .parent
        .as_ref()
        .and_then(|p| p.drive_id.clone())
        .ok_or_else(|| RemoteError::Decode {
            operation: "get_path_details".to_string(),
            message: "item carries no drive id".to_string(),
        })?;

    let request = ShareLinkRequest {
        link_type: if with_editing_perms { "edit" } else { "view" }.to_string(),
        scope: "anonymous".to_string(),
        password,
    };
    let link = api.create_share_link(&drive_id, &item.id, &request).await?;
    Ok(link.url)
}

/// Walks site search results and each site's document libraries,
/// returning `(library display name, drive id)` pairs.
pub async fn list_sharepoint_drive_ids(
    api: &dyn RemoteApi,
    site_query: &str,
) -> Result<Vec<(String, String)>, SyncError> {
    let mut results = Vec::new();
    let mut site_link: Option<String> = None;

    loop {
        let page = api.search_sites(site_query, site_link.as_deref()).await?;
        for site in page.sites {
            let mut drive_link: Option<String> = None;
            loop {
                let drives = api.list_site_drives(&site.id, drive_link.as_deref()).await?;
                for drive in drives.drives {
                    results.push((site.display_name.clone(), drive.id));
                }
                match drives.next_link {
                    Some(link) => drive_link = Some(link),
                    None => break,
                }
            }
        }
        match page.next_link {
            Some(link) => site_link = Some(link),
            None => break,
        }
    }

    Ok(results)
}

/// Moves or renames an item entirely online: the source path's item is
/// re-parented (and possibly renamed) to the destination path. A 412
/// from a stale ETag retries without the precondition.
pub async fn move_online(
    api: &dyn RemoteApi,
    source_path: &str,
    destination_path: &str,
) -> Result<(), SyncError> {
    let source = api.get_path_details(source_path).await?;

    let destination = destination_path.trim_end_matches('/');
    let (dest_parent_path, dest_name) = match destination.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() => (parent.to_string(), name.to_string()),
        Some((_, name)) => ("/".to_string(), name.to_string()),
        None => ("/".to_string(), destination.to_string()),
    };

    let dest_parent = api.get_path_details(&dest_parent_path).await?;
    let drive_id = source
        .parent
        .as_ref()
        .and_then(|p| p.drive_id.clone())
        .ok_or_else(|| RemoteError::Decode {
            operation: "get_path_details".to_string(),
            message: "source item carries no drive id".to_string(),
        })?;

    let patch = serde_json::json!({
        "parentReference": { "id": dest_parent.id },
        "name": dest_name,
    });

    match api
        .update_item(&drive_id, &source.id, &patch, source.etag.as_deref())
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_precondition() => {
            api.update_item(&drive_id, &source.id, &patch, None).await?;
        }
        Err(e) => return Err(e.into()),
    }

    info!(from = source_path, to = destination_path, "online move complete");
    Ok(())
}
