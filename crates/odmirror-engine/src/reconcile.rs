//! Remote reconciler: applies batched remote changes to local state.
//!
//! For each incoming item, in feed order: materialise its path, check
//! parent liveness (skip-propagation, cross-drive tie synthesis), run the
//! filter pipeline, then branch on store presence:
//!
//! - unknown item → [`Reconciler::apply_potentially_new`];
//! - known item → [`Reconciler::apply_potentially_changed`].
//!
//! Downloads are never executed inline; they accumulate as
//! [`DownloadTask`]s for the transfer pool.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::{Item, ItemKind};
use odmirror_core::ports::remote::RemoteItem;
use odmirror_filter::{Decision, FilterPipeline};

use crate::context::SyncContext;
use crate::fsutil;
use crate::integrity;
use crate::shared::SharedFolderHandler;

/// A download queued for the transfer pool.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub item: Item,
    /// Hash the store held before this change, for the modified-local
    /// safe-backup check in the download worker.
    pub previous_hash: Option<String>,
    /// The remote item carried the malware marker.
    pub malware: bool,
    /// Author identities for the optional xattr stamps.
    pub created_by: Option<String>,
    pub modified_by: Option<String>,
}

/// Per-item facts carried from the raw remote record into the branches.
#[derive(Debug, Clone, Default)]
struct RemoteMeta {
    malware: bool,
    created_by: Option<String>,
    modified_by: Option<String>,
}

impl RemoteMeta {
    fn of(remote: &RemoteItem) -> Self {
        Self {
            malware: remote.malware,
            created_by: remote.created_by.clone(),
            modified_by: remote.modified_by.clone(),
        }
    }
}

pub struct Reconciler {
    ctx: Arc<SyncContext>,
    filter: Arc<FilterPipeline>,
    /// Parents whose descendants must be dropped (OneNote packages, the
    /// OneNote recycle bin), propagated by parent id.
    skip_parents: HashSet<(String, String)>,
    pub downloads: Vec<DownloadTask>,
    pub skipped: Vec<(String, String)>,
}

impl Reconciler {
    pub fn new(ctx: Arc<SyncContext>, filter: Arc<FilterPipeline>) -> Self {
        Self {
            ctx,
            filter,
            skip_parents: HashSet::new(),
            downloads: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn add_skip_parent(&mut self, drive_id: &str, id: &str) {
        self.skip_parents
            .insert((drive_id.to_string(), id.to_string()));
    }

    fn parent_is_skipped(&self, drive_id: &str, parent_id: &str) -> bool {
        self.skip_parents
            .contains(&(drive_id.to_string(), parent_id.to_string()))
    }

    /// Applies one batch strictly in order.
    pub async fn process_batch(
        &mut self,
        feed_drive_id: &str,
        batch: Vec<RemoteItem>,
    ) -> Result<(), SyncError> {
        for remote in batch {
            self.apply(feed_drive_id, remote).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, feed_drive_id: &str, remote: RemoteItem) -> Result<(), SyncError> {
        // Shared-folder pointers go through tie materialisation instead of
        // the normal flow.
        if remote.remote.is_some() {
            let pointer = Item::from_remote(&remote, self.ctx.drive_kind)?;
            SharedFolderHandler::new(&self.ctx)
                .materialise(&pointer)
                .await?;
            return Ok(());
        }

        let item = Item::from_remote(&remote, self.ctx.drive_kind)?;

        // Skip-propagation: a dropped parent drops its whole subtree.
        if let Some(parent_id) = &item.parent_id {
            if self.parent_is_skipped(&item.drive_id, parent_id) {
                self.add_skip_parent(&item.drive_id, &item.id);
                return Ok(());
            }
        }

        // Parent liveness. A parent on a different drive than the feed is
        // the shared-folder edge: synthesise the root tie rather than fail.
        if item.drive_id != feed_drive_id {
            SharedFolderHandler::new(&self.ctx)
                .ensure_root_tie(&item.drive_id)
                .await?;
        }

        let rel_path = self.materialise_path(&item, &remote).await?;

        match self.filter.evaluate_remote(&remote, &rel_path) {
            Decision::Include => {}
            Decision::Exclude(reason) => {
                debug!(path = %rel_path, %reason, "remote item filtered out");
                self.skipped.push((rel_path, reason.to_string()));
                return Ok(());
            }
        }

        let existing = if self.ctx.shadow.has_item(&item.drive_id, &item.id) {
            None
        } else {
            self.ctx.store.get(&item.drive_id, &item.id).await?
        };

        let meta = RemoteMeta::of(&remote);
        match existing {
            None => self.apply_potentially_new(item, &rel_path, meta).await,
            Some(current) => {
                self.apply_potentially_changed(current, item, &rel_path, meta)
                    .await
            }
        }
    }

    /// Computes the item's drive-relative path: through the stored parent
    /// chain when the parent is known, otherwise via the remote parent
    /// reference.
    async fn materialise_path(
        &self,
        item: &Item,
        remote: &RemoteItem,
    ) -> Result<String, SyncError> {
        if let Some(parent_id) = &item.parent_id {
            if self
                .ctx
                .store
                .get(&item.drive_id, parent_id)
                .await?
                .is_some()
            {
                let parent_path = self.ctx.store.compute_path(&item.drive_id, parent_id).await?;
                return Ok(if parent_path == "/" {
                    format!("/{}", item.name)
                } else {
                    format!("{parent_path}/{}", item.name)
                });
            }
        }

        Ok(FilterPipeline::virtual_remote_path(remote)
            .unwrap_or_else(|| format!("/{}", item.name)))
    }

    /// The item is not in the store: decide between adopting local
    /// content, preserving divergent local content, and downloading.
    async fn apply_potentially_new(
        &mut self,
        item: Item,
        rel_path: &str,
        meta: RemoteMeta,
    ) -> Result<(), SyncError> {
        if item.is_dir() || item.is_root() {
            let local = self.ctx.local_path(&item.drive_id, rel_path).await?;
            if self.ctx.dry_run() {
                self.ctx.shadow.fake_item(&item.drive_id, &item.id);
                self.ctx.shadow.fake_path(rel_path);
                return Ok(());
            }
            if item.is_dir() && !local.exists() {
                std::fs::create_dir_all(&local)
                    .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
            }
            self.ctx.store.upsert(&item).await?;
            return Ok(());
        }

        let local = self.ctx.local_path(&item.drive_id, rel_path).await?;
        if local.exists() {
            if integrity::local_matches_item(&local, &item).await? {
                // Content agrees; at most the timestamp needs adjusting.
                let local_mtime: chrono::DateTime<chrono::Utc> = std::fs::metadata(&local)
                    .and_then(|m| m.modified())
                    .map(Into::into)
                    .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
                if !item.same_mtime(local_mtime) && !self.ctx.dry_run() {
                    fsutil::set_mtime(&local, item.mtime)?;
                }
                if !self.ctx.dry_run() {
                    self.ctx.store.upsert(&item).await?;
                } else {
                    self.ctx.shadow.fake_item(&item.drive_id, &item.id);
                }
                return Ok(());
            }

            // Divergent content that the store never tracked: preserve it
            // before the download overwrites, unless the user opted out.
            if self.ctx.dry_run() || self.ctx.config.transfers.bypass_data_preservation {
                warn!(path = %local.display(), "divergent local file will be overwritten (preservation bypassed)");
            } else {
                fsutil::safe_backup(&local)?;
            }
        }

        self.queue_download(item, None, meta);
        Ok(())
    }

    /// The item is in the store: rename, download or refresh metadata.
    async fn apply_potentially_changed(
        &mut self,
        current: Item,
        mut incoming: Item,
        new_rel_path: &str,
        meta: RemoteMeta,
    ) -> Result<(), SyncError> {
        incoming.remote_name = current.remote_name.clone();

        let etag_changed = current.etag != incoming.etag;
        let moved = current.name != incoming.name || current.parent_id != incoming.parent_id;

        if etag_changed && moved {
            let old_rel = self.ctx.store.compute_path(&current.drive_id, &current.id).await?;
            if old_rel != new_rel_path {
                let old_local = self.ctx.local_path(&current.drive_id, &old_rel).await?;
                let new_local = self.ctx.local_path(&incoming.drive_id, new_rel_path).await?;
                if !self.ctx.dry_run() && old_local.exists() {
                    // A tracked occupant of the destination is preserved,
                    // never overwritten.
                    if new_local.exists()
                        && self
                            .ctx
                            .store
                            .get_by_path(&incoming.drive_id, new_rel_path)
                            .await?
                            .is_some()
                    {
                        fsutil::safe_backup(&new_local)?;
                    }
                    if let Some(parent) = new_local.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| SyncError::filesystem(parent.display().to_string(), e))?;
                    }
                    std::fs::rename(&old_local, &new_local)
                        .map_err(|e| SyncError::filesystem(old_local.display().to_string(), e))?;
                    if incoming.is_file() {
                        fsutil::set_mtime(&new_local, incoming.mtime)?;
                    }
                    debug!(from = %old_local.display(), to = %new_local.display(), "applied online rename");
                }
            }
        }

        let content_changed = incoming.is_file()
            && etag_changed
            && current.content_hash() != incoming.content_hash();

        if content_changed {
            // Persist first so the download worker resolves the new path
            // even when the change also moved the item.
            if self.ctx.dry_run() {
                self.ctx.shadow.fake_item(&incoming.drive_id, &incoming.id);
            } else {
                self.ctx.store.upsert(&incoming).await?;
            }
            self.queue_download(incoming, current.content_hash().map(|s| s.to_string()), meta);
            return Ok(());
        }

        // Metadata-only change (timestamps, etag): refresh the row.
        if self.ctx.dry_run() {
            self.ctx.shadow.fake_item(&incoming.drive_id, &incoming.id);
            return Ok(());
        }
        let local = self.ctx.local_path(&incoming.drive_id, new_rel_path).await?;
        if incoming.is_file() && local.exists() && !current.same_mtime(incoming.mtime) {
            fsutil::set_mtime(&local, incoming.mtime)?;
        }
        self.ctx.store.upsert(&incoming).await?;
        Ok(())
    }

    fn queue_download(&mut self, item: Item, previous_hash: Option<String>, meta: RemoteMeta) {
        self.downloads.push(DownloadTask {
            item,
            previous_hash,
            malware: meta.malware,
            created_by: meta.created_by,
            modified_by: meta.modified_by,
        });
    }
}
