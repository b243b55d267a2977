//! Shared-folder tie materialisation.
//!
//! A shared folder arrives in the feed as a pointer item (`remoteItem`
//! facet). Before any child of the shared subtree can be persisted, two
//! records must exist in the target drive:
//!
//! - a **root tie**: the remote drive's root, `kind = root`, no parent,
//!   carrying the graft point (`reloc_*`) when a business share is
//!   mounted inside a local sub-directory rather than at the account
//!   root;
//! - a **folder tie**: the shared folder itself, `kind = dir`, parented
//!   directly under the root tie and named with the *local* name the
//!   user sees. Every child of the shared subtree hangs off this record,
//!   which is what flattens a deep remote path to a shallow local one.

use tracing::{debug, info};

use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::{Item, ItemKind};

use crate::context::SyncContext;

/// What happened to a pointer item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieOutcome {
    /// Ties exist; the subtree will sync.
    Materialised,
    /// Recorded online-only; the subtree is not synced.
    SkippedOnlineOnly,
}

pub struct SharedFolderHandler<'a> {
    ctx: &'a SyncContext,
}

impl<'a> SharedFolderHandler<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Ensures the tie records for a pointer item exist, then persists the
    /// pointer itself.
    pub async fn materialise(&self, pointer: &Item) -> Result<TieOutcome, SyncError> {
        let ItemKind::Remote(ptr) = &pointer.kind else {
            return Ok(TieOutcome::Materialised);
        };

        let key = (pointer.drive_id.clone(), pointer.id.clone());
        if self.ctx.online_only.contains(&key) {
            return Ok(TieOutcome::SkippedOnlineOnly);
        }

        let business = self.ctx.drive_kind.is_sharepoint_family();
        if business && !self.ctx.config.shared.sync_business_shared_items {
            info!(
                name = %pointer.name,
                "business shared folder recorded online-only (sync_business_shared_items is off)"
            );
            self.ctx.online_only.insert(key);
            return Ok(TieOutcome::SkippedOnlineOnly);
        }
        // Individually shared files need their own opt-in.
        if business && !ptr.is_directory && !self.ctx.config.shared.sync_business_shared_files {
            info!(
                name = %pointer.name,
                "shared file recorded online-only (sync_business_shared_files is off)"
            );
            self.ctx.online_only.insert(key);
            return Ok(TieOutcome::SkippedOnlineOnly);
        }

        if self.ctx.dry_run() {
            self.ctx.shadow.fake_item(&ptr.drive_id, &ptr.id);
            return Ok(TieOutcome::Materialised);
        }

        // Root tie: the remote drive's own root.
        let remote_root = self.ctx.api.get_drive_root(&ptr.drive_id).await?;

        // A business share mounted inside a local sub-directory records
        // where the subtree grafts; a share at the account root does not.
        let mounted_in_subdir = business
            && pointer
                .parent_id
                .as_deref()
                .is_some_and(|p| p != self.ctx.default_root_id);
        let (reloc_drive_id, reloc_parent_id) = if mounted_in_subdir {
            (Some(pointer.drive_id.clone()), pointer.parent_id.clone())
        } else {
            (None, None)
        };

        let root_tie = Item {
            drive_id: ptr.drive_id.clone(),
            id: remote_root.id.clone(),
            parent_id: None,
            name: "root".to_string(),
            remote_name: None,
            kind: ItemKind::Root,
            etag: remote_root.etag.clone(),
            ctag: remote_root.ctag.clone(),
            mtime: pointer.mtime,
            size: 0,
            quick_xor_hash: None,
            sha256_hash: None,
            reloc_drive_id,
            reloc_parent_id,
            in_sync: true,
        };
        self.ctx.store.upsert(&root_tie).await?;

        // Folder tie: the shared folder under the local name. A renamed
        // mount keeps the true remote name alongside.
        let remote_name = self.fetch_remote_name(ptr).await;
        let folder_tie = Item {
            drive_id: ptr.drive_id.clone(),
            id: ptr.id.clone(),
            parent_id: Some(remote_root.id.clone()),
            name: pointer.name.clone(),
            remote_name: remote_name.filter(|n| *n != pointer.name),
            kind: ItemKind::Dir,
            etag: pointer.etag.clone(),
            ctag: pointer.ctag.clone(),
            mtime: pointer.mtime,
            size: 0,
            quick_xor_hash: None,
            sha256_hash: None,
            reloc_drive_id: None,
            reloc_parent_id: None,
            in_sync: true,
        };
        self.ctx.store.upsert(&folder_tie).await?;

        // Finally the pointer row itself, in the local drive.
        self.ctx.store.upsert(pointer).await?;

        debug!(
            drive = %ptr.drive_id,
            folder = %ptr.id,
            name = %pointer.name,
            "shared-folder ties materialised"
        );
        Ok(TieOutcome::Materialised)
    }

    /// Ensures a root tie exists for `drive_id`, for children that arrive
    /// from a different drive before their pointer was seen.
    pub async fn ensure_root_tie(&self, drive_id: &str) -> Result<String, SyncError> {
        let existing = self.ctx.store.items_in_drive(drive_id).await?;
        if let Some(root) = existing.iter().find(|i| i.is_root()) {
            return Ok(root.id.clone());
        }

        let remote_root = self.ctx.api.get_drive_root(drive_id).await?;
        let root_tie = Item {
            drive_id: drive_id.to_string(),
            id: remote_root.id.clone(),
            parent_id: None,
            name: "root".to_string(),
            remote_name: None,
            kind: ItemKind::Root,
            etag: remote_root.etag.clone(),
            ctag: remote_root.ctag.clone(),
            mtime: remote_root
                .modified
                .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
            size: 0,
            quick_xor_hash: None,
            sha256_hash: None,
            reloc_drive_id: None,
            reloc_parent_id: None,
            in_sync: true,
        };
        if !self.ctx.dry_run() {
            self.ctx.store.upsert(&root_tie).await?;
        } else {
            self.ctx.shadow.fake_item(drive_id, &remote_root.id);
        }
        Ok(remote_root.id)
    }

    async fn fetch_remote_name(
        &self,
        ptr: &odmirror_core::domain::item::RemotePointer,
    ) -> Option<String> {
        match self.ctx.api.get_item_by_id(&ptr.drive_id, &ptr.id).await {
            Ok(target) => Some(target.name),
            Err(_) => None,
        }
    }

    /// Removes stale tie records when a share disappears from the feed.
    pub async fn remove_tie(&self, pointer: &Item) -> Result<(), SyncError> {
        if let ItemKind::Remote(ptr) = &pointer.kind {
            self.ctx.store.delete_by_id(&ptr.drive_id, &ptr.id).await?;
        }
        self.ctx
            .store
            .delete_by_id(&pointer.drive_id, &pointer.id)
            .await?;
        Ok(())
    }
}
