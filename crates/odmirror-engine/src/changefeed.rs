//! Change-feed consumer.
//!
//! Three modes, selected before each run:
//!
//! - **native**: incremental `listChanges` pages, consumed strictly in
//!   order, finalised by the `deltaLink` checkpoint;
//! - **simulated**: for deployments without a native feed, single-directory
//!   scopes and download-only cleanups. The target subtree's rows are
//!   flagged stale, children are enumerated recursively emitting the same
//!   event shape, and rows still stale afterwards become synthetic delete
//!   events (the simulated feed has no real ones);
//! - **shared-folder**: the simulated machinery run against the remote
//!   drive of a mounted share; tie records make the deep remote paths
//!   land at the shallow local mount.
//!
//! Pages interleave a 100 ms pause to reduce burstiness, and the
//! cancellation token is polled at every pagination boundary.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::{Item, ItemKind};
use odmirror_core::ports::remote::RemoteItem;
use odmirror_filter::FilterPipeline;

use crate::context::SyncContext;
use crate::reconcile::{DownloadTask, Reconciler};

/// Items accumulated before handing a chunk to the reconciler.
const BATCH_SIZE: usize = 500;

/// Pause between change-feed pages.
const PAGE_PAUSE: Duration = Duration::from_millis(100);

/// Result of one feed run over one drive scope.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    pub downloads: Vec<DownloadTask>,
    /// Store rows deleted online, to be removed locally (children first).
    pub deletions: Vec<Item>,
    pub pages: u32,
    pub items_seen: u64,
    pub skipped: Vec<(String, String)>,
    /// True when the run was interrupted by cancellation.
    pub cancelled: bool,
}

pub struct ChangeFeedConsumer {
    ctx: Arc<SyncContext>,
    filter: Arc<FilterPipeline>,
}

impl ChangeFeedConsumer {
    pub fn new(ctx: Arc<SyncContext>, filter: Arc<FilterPipeline>) -> Self {
        Self { ctx, filter }
    }

    /// Runs the feed for one `(drive, root)` scope in the configured mode.
    pub async fn run(&self, drive_id: &str, root_id: &str) -> Result<FeedOutcome, SyncError> {
        if self.ctx.config.wants_simulated_delta() {
            self.run_simulated(drive_id, root_id).await
        } else {
            self.run_native(drive_id, root_id).await
        }
    }

    /// Shared-folder scope: always the simulated machinery, against the
    /// remote drive of the tie.
    pub async fn run_shared(
        &self,
        remote_drive_id: &str,
        tie_root_id: &str,
    ) -> Result<FeedOutcome, SyncError> {
        self.run_simulated(remote_drive_id, tie_root_id).await
    }

    // ========================================================================
    // Native delta
    // ========================================================================

    async fn run_native(&self, drive_id: &str, root_id: &str) -> Result<FeedOutcome, SyncError> {
        let mut reconciler = Reconciler::new(self.ctx.clone(), self.filter.clone());
        let mut outcome = FeedOutcome::default();
        let mut batch: Vec<RemoteItem> = Vec::new();

        let mut link = self.ctx.store.get_delta_link(drive_id, root_id).await?;
        let mut token_cleared = false;

        loop {
            if self.ctx.cancelled() {
                outcome.cancelled = true;
                break;
            }

            let page = match self
                .ctx
                .api
                .list_changes(drive_id, root_id, link.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_gone() => {
                    // Expired checkpoint: full rescan from an empty token.
                    warn!(drive_id, "delta token rejected (410); restarting with full enumeration");
                    self.ctx.store.clear_delta_link(drive_id, root_id).await?;
                    link = None;
                    continue;
                }
                Err(e) if e.status() == Some(400) && !token_cleared => {
                    // Invalid paging token: drop it and retry the window.
                    warn!(drive_id, error = %e, "paging token rejected (400); clearing and retrying");
                    token_cleared = true;
                    link = None;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            outcome.pages += 1;
            outcome.items_seen += page.items.len() as u64;

            // Server semantics require in-order application.
            for remote in page.items {
                self.intake(
                    drive_id,
                    root_id,
                    remote,
                    &mut reconciler,
                    &mut batch,
                    &mut outcome,
                )
                .await?;
                if batch.len() >= BATCH_SIZE {
                    let chunk = std::mem::take(&mut batch);
                    reconciler.process_batch(drive_id, chunk).await?;
                }
            }

            match (page.next_link, page.delta_link) {
                (Some(next), _) => {
                    link = Some(next);
                    tokio::time::sleep(PAGE_PAUSE).await;
                }
                (None, Some(delta)) => {
                    if !batch.is_empty() {
                        let chunk = std::mem::take(&mut batch);
                        reconciler.process_batch(drive_id, chunk).await?;
                    }
                    // Committed only after the bundle finished normally.
                    // A failed download inside this page run does not hold
                    // the checkpoint back; failed rows are purged at end
                    // of run and re-discovered later.
                    if !self.ctx.dry_run() {
                        self.ctx.store.set_delta_link(drive_id, root_id, &delta).await?;
                    }
                    break;
                }
                (None, None) => {
                    warn!(drive_id, "feed page carried neither nextLink nor deltaLink");
                    if !batch.is_empty() {
                        let chunk = std::mem::take(&mut batch);
                        reconciler.process_batch(drive_id, chunk).await?;
                    }
                    break;
                }
            }
        }

        info!(
            drive_id,
            pages = outcome.pages,
            items = outcome.items_seen,
            downloads = reconciler.downloads.len(),
            deletions = outcome.deletions.len(),
            "change feed consumed"
        );
        outcome.downloads = std::mem::take(&mut reconciler.downloads);
        outcome.skipped.append(&mut reconciler.skipped);
        Ok(outcome)
    }

    // ========================================================================
    // Simulated delta
    // ========================================================================

    async fn run_simulated(&self, drive_id: &str, root_id: &str) -> Result<FeedOutcome, SyncError> {
        let mut reconciler = Reconciler::new(self.ctx.clone(), self.filter.clone());
        let mut outcome = FeedOutcome::default();
        let mut batch: Vec<RemoteItem> = Vec::new();

        // Flag the whole subtree provisionally stale; whatever the
        // enumeration does not refresh was deleted online.
        let downgraded = if self.ctx.dry_run() {
            0
        } else {
            self.ctx.store.downgrade_sync_status(drive_id, root_id).await?
        };
        debug!(drive_id, root_id, downgraded, "simulated delta: sync flags downgraded");

        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(root_id.to_string());

        'outer: while let Some(dir_id) = queue.pop_front() {
            if !self.ctx.dry_run() {
                self.ctx.store.mark_in_sync(drive_id, &dir_id).await.ok();
            }

            let mut next_link: Option<String> = None;
            loop {
                if self.ctx.cancelled() {
                    outcome.cancelled = true;
                    break 'outer;
                }

                let page = self
                    .ctx
                    .api
                    .list_children(drive_id, &dir_id, next_link.as_deref())
                    .await?;
                outcome.pages += 1;
                outcome.items_seen += page.items.len() as u64;

                for remote in page.items {
                    let traversable = remote.is_folder
                        && !remote.deleted
                        && !remote.is_onenote_payload()
                        && !remote.is_onenote_recycle_bin();
                    if traversable {
                        queue.push_back(remote.id.clone());
                    }
                    self.intake(
                        drive_id,
                        root_id,
                        remote,
                        &mut reconciler,
                        &mut batch,
                        &mut outcome,
                    )
                    .await?;
                    if batch.len() >= BATCH_SIZE {
                        let chunk = std::mem::take(&mut batch);
                        reconciler.process_batch(drive_id, chunk).await?;
                    }
                }

                match page.next_link {
                    Some(link) => {
                        next_link = Some(link);
                        tokio::time::sleep(PAGE_PAUSE).await;
                    }
                    None => break,
                }
            }
        }

        if !batch.is_empty() {
            let chunk = std::mem::take(&mut batch);
            reconciler.process_batch(drive_id, chunk).await?;
        }

        // Rows the enumeration never touched no longer exist online.
        if !outcome.cancelled && !self.ctx.dry_run() {
            let stale = self.ctx.store.out_of_sync_items(drive_id).await?;
            for item in stale {
                if item.is_root() {
                    continue;
                }
                outcome.deletions.push(item);
            }
        }

        info!(
            drive_id,
            pages = outcome.pages,
            items = outcome.items_seen,
            inferred_deletions = outcome.deletions.len(),
            "simulated delta complete"
        );
        outcome.downloads = std::mem::take(&mut reconciler.downloads);
        outcome.skipped.append(&mut reconciler.skipped);
        Ok(outcome)
    }

    // ========================================================================
    // Page intake
    // ========================================================================

    /// Classifies one feed item: root objects and deletions are applied
    /// inline, OneNote payloads are dropped with parent-id propagation,
    /// everything else accumulates into the reconciler batch.
    async fn intake(
        &self,
        drive_id: &str,
        root_id: &str,
        remote: RemoteItem,
        reconciler: &mut Reconciler,
        batch: &mut Vec<RemoteItem>,
        outcome: &mut FeedOutcome,
    ) -> Result<(), SyncError> {
        // OneNote objects are not syncable; drop them and everything below.
        if remote.is_onenote_payload() || remote.is_onenote_recycle_bin() {
            debug!(name = %remote.name, "dropping OneNote object");
            reconciler.add_skip_parent(drive_id, &remote.id);
            outcome
                .skipped
                .push((remote.name.clone(), "OneNote object".to_string()));
            return Ok(());
        }

        if remote.deleted {
            if let Some(row) = self.ctx.store.get(drive_id, &remote.id).await? {
                outcome.deletions.push(row);
            }
            return Ok(());
        }

        if self.is_root_object(&remote, root_id) {
            let root = root_item_from(&remote, drive_id);
            if !self.ctx.dry_run() {
                self.ctx.store.upsert(&root).await?;
            } else {
                self.ctx.shadow.fake_item(drive_id, &root.id);
            }
            return Ok(());
        }

        batch.push(remote);
        Ok(())
    }

    /// Root-object heuristic: the drive's root id, an explicit `root`
    /// marker, or a missing parent id.
    fn is_root_object(&self, remote: &RemoteItem, root_id: &str) -> bool {
        remote.id == root_id
            || remote.is_root
            || remote
                .parent
                .as_ref()
                .map(|p| p.id.is_none())
                .unwrap_or(true)
    }
}

/// Builds the persistent root row for a feed's root object.
fn root_item_from(remote: &RemoteItem, drive_id: &str) -> Item {
    Item {
        drive_id: drive_id.to_string(),
        id: remote.id.clone(),
        parent_id: None,
        name: "root".to_string(),
        remote_name: None,
        kind: ItemKind::Root,
        etag: remote.etag.clone(),
        ctag: remote.ctag.clone(),
        mtime: remote
            .modified
            .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
        size: 0,
        quick_xor_hash: None,
        sha256_hash: None,
        reloc_drive_id: None,
        reloc_parent_id: None,
        in_sync: true,
    }
}
