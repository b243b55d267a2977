//! Sync-cycle orchestration.
//!
//! One cycle runs the stages in their contract order: change feed →
//! reconciler → downloads → local deletions → local scan → online
//! directory creation (with the POSIX collision check) → uploads →
//! remote deletions. At the end of the run, rows for failed transfers
//! are purged from the store (so a stale local file cannot cause phantom
//! deletions next cycle), and the database WAL is checkpointed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use odmirror_core::config::Config;
use odmirror_core::domain::drive::DriveKind;
use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::{Item, ItemKind};
use odmirror_core::domain::normalize_drive_id;
use odmirror_core::ports::notify::{Notifier, Severity};
use odmirror_core::ports::remote::RemoteApi;
use odmirror_core::ports::store::ItemStore;
use odmirror_filter::{find_case_collision, FilterPipeline};

use crate::changefeed::ChangeFeedConsumer;
use crate::context::{ApiFactory, ShadowSet, SyncContext};
use crate::deleter::DeleteExecutor;
use crate::drive_cache::DriveCache;
use crate::scanner::{LocalScanner, ScanOutcome};
use crate::transfer::{TransferJob, TransferPool};
use crate::watcher::{DebouncedChangeQueue, FileWatcher};

/// Summary of one completed cycle.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub downloaded: u32,
    pub uploaded: u32,
    pub deleted_local: u32,
    pub deleted_remote: u32,
    pub dirs_created: u32,
    pub cleaned_up: u32,
    pub skipped: usize,
    /// Paths refused because a remote sibling differs only by case.
    pub posix_violations: Vec<String>,
    pub failures: Vec<(String, String)>,
    /// Store keys behind failed transfers, purged at end of run.
    failed_keys: Vec<(String, String)>,
}

impl SyncReport {
    /// Non-zero-exit condition for the CLI.
    pub fn sync_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    filter: Arc<FilterPipeline>,
}

impl SyncEngine {
    /// Builds the engine: validates configuration, resolves the default
    /// drive and root (normalising personal drive ids), primes the drive
    /// cache and persists the root row.
    pub async fn bootstrap(
        config: Arc<Config>,
        store: Arc<dyn ItemStore>,
        api: Arc<dyn RemoteApi>,
        api_factory: ApiFactory,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, SyncError> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(SyncError::InvalidName {
                name: "configuration".to_string(),
                reason: problems.join("; "),
            });
        }

        if config.mode.resync && !config.mode.dry_run {
            warn!("resync requested: dropping state database and delta checkpoints");
            store.wipe().await?;
        }

        let drive = api.get_default_drive().await?;
        let drive_kind = drive.kind;
        let default_drive_id = normalize_drive_id(drive_kind, &drive.id)?;
        let root = api.get_default_root().await?;

        let drive_cache = Arc::new(DriveCache::new());
        drive_cache.refresh(api.as_ref(), &default_drive_id).await?;

        let filter = Arc::new(
            FilterPipeline::from_config(&config.filters, config.skip_size_bytes()).map_err(
                |reason| SyncError::InvalidName {
                    name: "filter configuration".to_string(),
                    reason,
                },
            )?,
        );

        let descriptor_dir = config.data_dir();
        let ctx = Arc::new(SyncContext {
            config,
            store,
            api,
            api_factory,
            notifier,
            drive_cache,
            cancel: tokio_util::sync::CancellationToken::new(),
            drive_kind,
            default_drive_id: default_drive_id.clone(),
            default_root_id: root.id.clone(),
            descriptor_dir,
            shadow: ShadowSet::default(),
            online_only: dashmap::DashSet::new(),
        });

        // The root row anchors every path computation.
        if ctx.store.get(&default_drive_id, &root.id).await?.is_none() && !ctx.dry_run() {
            let root_row = Item {
                drive_id: default_drive_id.clone(),
                id: root.id.clone(),
                parent_id: None,
                name: "root".to_string(),
                remote_name: None,
                kind: ItemKind::Root,
                etag: root.etag.clone(),
                ctag: root.ctag.clone(),
                mtime: root
                    .modified
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
                size: 0,
                quick_xor_hash: None,
                sha256_hash: None,
                reloc_drive_id: None,
                reloc_parent_id: None,
                in_sync: true,
            };
            ctx.store.upsert(&root_row).await?;
        }

        info!(
            drive = %default_drive_id,
            kind = ?drive_kind,
            "engine bootstrapped"
        );
        Ok(Self { ctx, filter })
    }

    pub fn context(&self) -> Arc<SyncContext> {
        self.ctx.clone()
    }

    /// Requests a clean stop; stages notice at their next boundary.
    pub fn request_stop(&self) {
        self.ctx.cancel.cancel();
    }

    // ========================================================================
    // The cycle
    // ========================================================================

    pub async fn run_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let ctx = &self.ctx;
        let drive_id = ctx.default_drive_id.clone();

        std::fs::create_dir_all(&ctx.config.sync_dir)
            .map_err(|e| SyncError::filesystem(ctx.config.sync_dir.display().to_string(), e))?;

        // ---- Pull side -----------------------------------------------------
        if !ctx.config.mode.upload_only {
            self.pull_drive(&drive_id, &mut report).await?;
            self.pull_shared_drives(&mut report).await?;
        }

        if ctx.cancelled() {
            return Ok(report);
        }

        // ---- Push side -----------------------------------------------------
        let cleanup_mode =
            ctx.config.mode.download_only && ctx.config.mode.cleanup_local_files;
        if !ctx.config.mode.download_only || cleanup_mode {
            let scanner = LocalScanner::new(ctx.clone(), self.filter.clone());
            let scan = scanner.scan(&drive_id).await?;
            report.skipped += scan.skipped.len();

            if cleanup_mode {
                let deleter = DeleteExecutor::new(ctx.clone());
                report.cleaned_up = deleter.cleanup_local(scan.local_cleanups).await?;
            } else {
                self.push_changes(&drive_id, scan, &mut report).await?;
            }
        }

        // ---- End of run ----------------------------------------------------
        self.purge_failed_rows(&report).await?;
        if !ctx.dry_run() {
            ctx.store.checkpoint().await?;
        }

        info!(
            downloaded = report.downloaded,
            uploaded = report.uploaded,
            deleted_local = report.deleted_local,
            deleted_remote = report.deleted_remote,
            dirs_created = report.dirs_created,
            failures = report.failures.len(),
            "sync cycle complete"
        );
        Ok(report)
    }

    /// Change feed plus downloads plus local deletions for one drive.
    async fn pull_drive(&self, drive_id: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let consumer = ChangeFeedConsumer::new(ctx.clone(), self.filter.clone());

        // A single-directory scope anchors the feed at that folder.
        let root_id = match &ctx.config.mode.single_directory {
            Some(dir) => {
                let details = ctx
                    .api
                    .get_path_details_by_drive(drive_id, &format!("/{}", dir.trim_matches('/')))
                    .await?;
                details.id
            }
            None => ctx.default_root_id.clone(),
        };

        let feed = consumer.run(drive_id, &root_id).await?;
        report.skipped += feed.skipped.len();

        let jobs: Vec<TransferJob> = feed
            .downloads
            .into_iter()
            .map(TransferJob::Download)
            .collect();
        let transfer = TransferPool::new(ctx.clone()).run(jobs).await?;
        report.downloaded += transfer.downloaded;
        report.skipped += transfer.skipped as usize;
        report.failures.extend(transfer.failures);
        report.failed_keys.extend(transfer.failed_keys);

        let deleter = DeleteExecutor::new(ctx.clone());
        let deletions = deleter.delete_local(feed.deletions).await?;
        report.deleted_local += deletions.deleted_local;
        Ok(())
    }

    /// Runs the simulated feed against every shared drive with a root
    /// tie in the store.
    async fn pull_shared_drives(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        if ctx.config.mode.single_directory.is_some() {
            return Ok(());
        }

        let consumer = ChangeFeedConsumer::new(ctx.clone(), self.filter.clone());
        for shared_drive in ctx.store.distinct_drive_ids().await? {
            if shared_drive == ctx.default_drive_id || ctx.cancelled() {
                continue;
            }
            let Some(root_tie) = ctx
                .store
                .items_in_drive(&shared_drive)
                .await?
                .into_iter()
                .find(|i| i.is_root())
            else {
                continue;
            };

            debug!(drive = %shared_drive, "consuming shared-folder drive");
            let feed = consumer.run_shared(&shared_drive, &root_tie.id).await?;
            report.skipped += feed.skipped.len();

            let jobs: Vec<TransferJob> = feed
                .downloads
                .into_iter()
                .map(TransferJob::Download)
                .collect();
            let transfer = TransferPool::new(ctx.clone()).run(jobs).await?;
            report.downloaded += transfer.downloaded;
            report.failures.extend(transfer.failures);
            report.failed_keys.extend(transfer.failed_keys);

            let deleter = DeleteExecutor::new(ctx.clone());
            let deletions = deleter.delete_local(feed.deletions).await?;
            report.deleted_local += deletions.deleted_local;
        }
        Ok(())
    }

    /// Directory creation, uploads and remote deletions.
    async fn push_changes(
        &self,
        drive_id: &str,
        scan: ScanOutcome,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let ctx = &self.ctx;
        let mut children_cache: HashMap<String, Vec<String>> = HashMap::new();
        let mut violated_prefixes: Vec<String> = Vec::new();

        // Ancestors first; the set ordering guarantees it.
        for rel in &scan.dirs_to_create {
            if ctx.cancelled() {
                break;
            }
            if under_violated_prefix(rel, &violated_prefixes) {
                continue;
            }

            let name = rel.rsplit('/').next().unwrap_or(rel);
            let parent_rel = parent_of(rel);
            let Some(parent_id) = self.resolve_parent_id(drive_id, &parent_rel).await? else {
                debug!(path = %rel, "parent unresolved; skipping directory creation");
                continue;
            };

            let siblings = self
                .remote_children_names(&mut children_cache, drive_id, &parent_id)
                .await?;
            if let Some(existing) =
                find_case_collision(name, siblings.iter().map(|s| s.as_str()))
            {
                let message = SyncError::PosixCollision {
                    candidate: name.to_string(),
                    existing: existing.to_string(),
                };
                ctx.notifier.notify(Severity::Error, &message.to_string());
                report.posix_violations.push(rel.clone());
                violated_prefixes.push(rel.clone());
                continue;
            }

            if ctx.dry_run() {
                info!(path = %rel, "dry-run: would create directory online");
                ctx.shadow.fake_path(rel);
                report.dirs_created += 1;
                continue;
            }

            let created = match ctx.api.create_folder(drive_id, &parent_id, name).await {
                Ok(item) => item,
                Err(e) if e.is_precondition() => {
                    // Create race: adopt the existing folder when the name
                    // matches exactly; otherwise it is a case clash.
                    let refreshed = self
                        .remote_children_page(drive_id, &parent_id, name)
                        .await?;
                    match refreshed {
                        Some(existing) => existing,
                        None => {
                            report.posix_violations.push(rel.clone());
                            violated_prefixes.push(rel.clone());
                            continue;
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            };

            let mut row = Item::from_remote(&created, ctx.drive_kind)?;
            row.kind = ItemKind::Dir;
            ctx.store.upsert(&row).await?;
            report.dirs_created += 1;
        }

        // Uploads: new files (after their parents exist) and modified files.
        let mut jobs: Vec<TransferJob> = Vec::new();
        for upload in scan.new_uploads {
            if under_violated_prefix(&upload.rel_path, &violated_prefixes) {
                continue;
            }
            let name = upload
                .rel_path
                .rsplit('/')
                .next()
                .unwrap_or(&upload.rel_path)
                .to_string();
            let parent_rel = parent_of(&upload.rel_path);
            let Some(parent_id) = self.resolve_parent_id(drive_id, &parent_rel).await? else {
                report.failures.push((
                    upload.rel_path.clone(),
                    "parent directory was not created online".to_string(),
                ));
                continue;
            };

            let siblings = self
                .remote_children_names(&mut children_cache, drive_id, &parent_id)
                .await?;
            if let Some(existing) = find_case_collision(&name, siblings.iter().map(|s| s.as_str()))
            {
                let message = SyncError::PosixCollision {
                    candidate: name.clone(),
                    existing: existing.to_string(),
                };
                ctx.notifier.notify(Severity::Error, &message.to_string());
                report.posix_violations.push(upload.rel_path.clone());
                continue;
            }

            jobs.push(TransferJob::UploadNew {
                local: upload.local,
                rel_path: upload.rel_path,
                drive_id: drive_id.to_string(),
                parent_id,
                name,
                size: upload.size,
            });
        }
        for upload in scan.modified_uploads {
            jobs.push(TransferJob::UploadModified {
                local: upload.local,
                item: upload.item,
            });
        }

        // Timestamp-only changes patch the online record in place. The
        // personal API resents ETag preconditions here (spurious 412s),
        // so none is sent on personal drives.
        for patch in scan.mtime_patches {
            if ctx.cancelled() {
                break;
            }
            if ctx.dry_run() {
                info!(name = %patch.item.name, "dry-run: would patch online timestamp");
                continue;
            }
            let body = serde_json::json!({
                "fileSystemInfo": {
                    "lastModifiedDateTime": patch
                        .local_mtime
                        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                }
            });
            let if_match = if ctx.drive_kind == DriveKind::Personal {
                None
            } else {
                patch.item.etag.as_deref()
            };
            let result = match ctx
                .api
                .update_item(&patch.item.drive_id, &patch.item.id, &body, if_match)
                .await
            {
                Ok(updated) => Ok(updated),
                Err(e) if e.is_precondition() && if_match.is_some() => {
                    ctx.api
                        .update_item(&patch.item.drive_id, &patch.item.id, &body, None)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {
                    let mut row = patch.item.clone();
                    row.mtime = odmirror_core::domain::item::truncate_to_seconds(patch.local_mtime);
                    ctx.store.upsert(&row).await?;
                }
                Err(e) => {
                    report
                        .failures
                        .push((patch.item.name.clone(), e.to_string()));
                }
            }
        }

        let transfer = TransferPool::new(ctx.clone()).run(jobs).await?;
        report.uploaded += transfer.uploaded;
        report.skipped += transfer.skipped as usize;
        report.failures.extend(transfer.failures);
        report.failed_keys.extend(transfer.failed_keys);

        // Remote deletions last; the guard may abort the whole cycle.
        let deleter = DeleteExecutor::new(ctx.clone());
        let deletions = deleter.delete_remote(scan.remote_deletions).await?;
        report.deleted_remote += deletions.deleted_remote;
        Ok(())
    }

    async fn resolve_parent_id(
        &self,
        drive_id: &str,
        parent_rel: &str,
    ) -> Result<Option<String>, SyncError> {
        if parent_rel == "/" {
            return Ok(Some(self.ctx.default_root_id.clone()));
        }
        Ok(self
            .ctx
            .store
            .get_by_path(drive_id, parent_rel)
            .await?
            .map(|item| item.id))
    }

    /// All children names of a remote folder, cached per cycle.
    async fn remote_children_names(
        &self,
        cache: &mut HashMap<String, Vec<String>>,
        drive_id: &str,
        parent_id: &str,
    ) -> Result<Vec<String>, SyncError> {
        if let Some(names) = cache.get(parent_id) {
            return Ok(names.clone());
        }
        let mut names = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let page = self
                .ctx
                .api
                .list_children(drive_id, parent_id, next.as_deref())
                .await?;
            names.extend(page.items.into_iter().map(|i| i.name));
            match page.next_link {
                Some(link) => next = Some(link),
                None => break,
            }
        }
        cache.insert(parent_id.to_string(), names.clone());
        Ok(names)
    }

    /// Finds an exact-name child, for 409-create resolution.
    async fn remote_children_page(
        &self,
        drive_id: &str,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<odmirror_core::ports::remote::RemoteItem>, SyncError> {
        let mut next: Option<String> = None;
        loop {
            let page = self
                .ctx
                .api
                .list_children(drive_id, parent_id, next.as_deref())
                .await?;
            if let Some(found) = page.items.into_iter().find(|i| i.name == name) {
                return Ok(Some(found));
            }
            match page.next_link {
                Some(link) => next = Some(link),
                None => return Ok(None),
            }
        }
    }

    /// Removes store rows behind failed transfers, so a stale local file
    /// cannot cause a phantom deletion next cycle.
    async fn purge_failed_rows(&self, report: &SyncReport) -> Result<(), SyncError> {
        if self.ctx.dry_run() {
            return Ok(());
        }
        for (drive_id, id) in &report.failed_keys {
            debug!(drive_id, id, "purging store row for failed transfer");
            self.ctx.store.delete_by_id(drive_id, id).await?;
        }
        // Upload-new failures have no key yet; resolve them by path.
        for (path, _) in &report.failures {
            if let Ok(Some(item)) = self
                .ctx
                .store
                .get_by_path(&self.ctx.default_drive_id, path)
                .await
            {
                self.ctx
                    .store
                    .delete_by_id(&item.drive_id, &item.id)
                    .await?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Daemon mode
    // ========================================================================

    /// Monitor loop: full cycles, interleaved with debounced filesystem
    /// events; ends when cancellation is requested.
    pub async fn run_monitor(&self, poll_interval: Duration) -> Result<(), SyncError> {
        let (tx, mut rx) = mpsc::channel(1024);
        let _watcher = FileWatcher::start(&self.ctx.config.sync_dir, tx)?;
        let mut queue = DebouncedChangeQueue::new(Duration::from_secs(2));

        loop {
            if self.ctx.cancelled() {
                return Ok(());
            }

            match self.run_cycle().await {
                Ok(report) => {
                    if report.sync_failures() {
                        warn!(failures = report.failures.len(), "cycle finished with failures");
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "cycle failed; retrying next interval"),
            }

            // Wait for settled changes or the periodic interval.
            let deadline = tokio::time::Instant::now() + poll_interval;
            loop {
                if self.ctx.cancelled() {
                    return Ok(());
                }
                let timeout = tokio::time::sleep_until(deadline);
                tokio::select! {
                    _ = timeout => break,
                    event = rx.recv() => {
                        match event {
                            Some(event) => queue.push(event.path),
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        if !queue.settled().is_empty() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn parent_of(rel: &str) -> String {
    match rel.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

fn under_violated_prefix(rel: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| rel == p || rel.starts_with(&format!("{p}/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/A"), "/");
        assert_eq!(parent_of("/A/B"), "/A");
        assert_eq!(parent_of("/A/B/c.txt"), "/A/B");
    }

    #[test]
    fn test_violated_prefix_matching() {
        let prefixes = vec!["/A/report".to_string()];
        assert!(under_violated_prefix("/A/report", &prefixes));
        assert!(under_violated_prefix("/A/report/sub/file.txt", &prefixes));
        assert!(!under_violated_prefix("/A/reports", &prefixes));
    }
}
