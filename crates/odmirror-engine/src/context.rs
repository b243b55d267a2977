//! Shared services handed to every engine component.
//!
//! Process-wide mutable state (the drive cache, the dry-run shadow set,
//! the cancellation token) lives here as explicit services passed by
//! `Arc`, never as globals.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashSet;
use tokio_util::sync::CancellationToken;

use odmirror_core::config::Config;
use odmirror_core::domain::drive::DriveKind;
use odmirror_core::domain::errors::StoreError;
use odmirror_core::ports::notify::Notifier;
use odmirror_core::ports::remote::RemoteApi;
use odmirror_core::ports::store::ItemStore;

use crate::drive_cache::DriveCache;

/// Factory handing each transfer worker its own `RemoteApi` handle, so no
/// HTTP state is shared across concurrent transfers.
pub type ApiFactory = Arc<dyn Fn() -> Arc<dyn RemoteApi> + Send + Sync>;

/// Dry-run shadow state: keys of items "created" by planning stages so
/// later stages believe they exist without any disk, database or remote
/// mutation.
#[derive(Debug, Default)]
pub struct ShadowSet {
    keys: DashSet<(String, String)>,
    paths: DashSet<String>,
}

impl ShadowSet {
    pub fn fake_item(&self, drive_id: &str, id: &str) {
        self.keys.insert((drive_id.to_string(), id.to_string()));
    }

    pub fn has_item(&self, drive_id: &str, id: &str) -> bool {
        self.keys
            .contains(&(drive_id.to_string(), id.to_string()))
    }

    pub fn fake_path(&self, path: &str) {
        self.paths.insert(path.to_string());
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.paths.contains(path)
    }
}

/// Everything a sync stage needs.
pub struct SyncContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn ItemStore>,
    /// Coordinator-owned handle for non-transfer calls.
    pub api: Arc<dyn RemoteApi>,
    /// Per-worker handle factory for the transfer pool.
    pub api_factory: ApiFactory,
    pub notifier: Arc<dyn Notifier>,
    pub drive_cache: Arc<DriveCache>,
    /// Process-wide exit request, polled at pagination boundaries and
    /// between transfer batches.
    pub cancel: CancellationToken,
    /// Kind of the account's default drive; drives id normalisation and
    /// validation policy.
    pub drive_kind: DriveKind,
    /// The account's default drive id (normalised).
    pub default_drive_id: String,
    /// Root item id of the default drive.
    pub default_root_id: String,
    /// Directory for `session_upload.*` / `resume_download.*` descriptors.
    pub descriptor_dir: PathBuf,
    pub shadow: ShadowSet,
    /// Shared folders recorded as online-only (business shares with
    /// syncing disabled), so they are not re-processed every cycle.
    pub online_only: DashSet<(String, String)>,
}

impl SyncContext {
    pub fn dry_run(&self) -> bool {
        self.config.mode.dry_run
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Maps a drive-relative path to its on-disk location.
    ///
    /// The default drive's root is the sync root. A shared drive's root
    /// tie may carry a graft point (`reloc_*`); its subtree then lives
    /// under that local parent. Without a graft point the subtree mounts
    /// directly under the sync root.
    pub async fn local_path(&self, drive_id: &str, rel_path: &str) -> Result<PathBuf, StoreError> {
        let rel = rel_path.trim_start_matches('/');
        if drive_id == self.default_drive_id {
            return Ok(self.config.sync_dir.join(rel));
        }

        // Shared drive: find the root tie and honour its graft point.
        let base = match self.find_root_tie(drive_id).await? {
            Some(tie) => match (&tie.reloc_drive_id, &tie.reloc_parent_id) {
                (Some(reloc_drive), Some(reloc_parent)) => {
                    let parent_rel = self.store.compute_path(reloc_drive, reloc_parent).await?;
                    self.config
                        .sync_dir
                        .join(parent_rel.trim_start_matches('/'))
                }
                _ => self.config.sync_dir.clone(),
            },
            None => self.config.sync_dir.clone(),
        };

        Ok(base.join(rel))
    }

    async fn find_root_tie(
        &self,
        drive_id: &str,
    ) -> Result<Option<odmirror_core::domain::item::Item>, StoreError> {
        let items = self.store.items_in_drive(drive_id).await?;
        Ok(items.into_iter().find(|i| i.is_root()))
    }
}
