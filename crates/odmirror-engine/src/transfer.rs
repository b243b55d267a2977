//! Parallel transfer pool.
//!
//! A fixed-size pool of workers drains a bounded job channel. Each worker
//! takes its own `RemoteApi` handle from the factory for the lifetime of
//! the pool, so no HTTP state is shared across concurrent transfers.
//! Outcomes travel back over a result channel; the coordinator alone owns
//! the counters and failure lists.
//!
//! Download protocol (per job): malware refusal, free-space reservation,
//! safe-backup of divergent local content, ranged GET resuming from a
//! persisted descriptor, integrity validation, mtime restoration and
//! optional author xattrs, then store persistence.
//!
//! Upload protocol: simple PUT at or below the session threshold,
//! otherwise an upload session with 320 KiB-aligned fragments. After each
//! accepted fragment the session descriptor is re-persisted so a crash
//! resumes; a `tempauth`-expired 403 or a 404 on a fragment recreates the
//! session from offset zero; a transient status gets one same-fragment
//! retry before propagating.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use odmirror_core::config::TransferOrder;
use odmirror_core::domain::drive::DriveKind;
use odmirror_core::domain::errors::{RemoteError, SyncError};
use odmirror_core::domain::item::{Item, ItemKind};
use odmirror_core::ports::notify::Severity;
use odmirror_core::ports::remote::{FragmentOutcome, RemoteApi, RemoteItem, UploadSession};

use crate::context::SyncContext;
use crate::fsutil;
use crate::integrity::{self, ValidationOutcome};
use crate::reconcile::DownloadTask;
use crate::session::{DownloadResumeDescriptor, SessionManager, UploadSessionDescriptor};

/// Fragment sizes must stay 320 KiB-aligned.
const FRAGMENT_QUANTUM: u64 = 320 * 1024;

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub enum TransferJob {
    Download(DownloadTask),
    UploadNew {
        local: PathBuf,
        rel_path: String,
        drive_id: String,
        parent_id: String,
        name: String,
        size: u64,
    },
    UploadModified {
        local: PathBuf,
        item: Item,
    },
}

impl TransferJob {
    /// Store key of the row this job concerns, when one exists.
    fn store_key(&self) -> Option<(String, String)> {
        match self {
            TransferJob::Download(task) => Some(task.item.key()),
            TransferJob::UploadModified { item, .. } => Some(item.key()),
            TransferJob::UploadNew { .. } => None,
        }
    }

    fn display_path(&self) -> String {
        match self {
            TransferJob::Download(task) => task.item.name.clone(),
            TransferJob::UploadNew { rel_path, .. } => rel_path.clone(),
            TransferJob::UploadModified { local, .. } => local.display().to_string(),
        }
    }

    fn sort_name(&self) -> String {
        match self {
            TransferJob::Download(task) => task.item.name.clone(),
            TransferJob::UploadNew { name, .. } => name.clone(),
            TransferJob::UploadModified { local, .. } => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    fn sort_size(&self) -> i64 {
        match self {
            TransferJob::Download(task) => task.item.size,
            TransferJob::UploadNew { size, .. } => *size as i64,
            TransferJob::UploadModified { item, .. } => item.size,
        }
    }
}

/// What a worker did with one job.
#[derive(Debug)]
enum WorkerOutcome {
    Downloaded,
    Uploaded,
    Skipped(String),
    Failed {
        path: String,
        key: Option<(String, String)>,
        error: SyncError,
    },
}

/// Aggregated result of one pool run.
#[derive(Debug, Default)]
pub struct TransferReport {
    pub downloaded: u32,
    pub uploaded: u32,
    pub skipped: u32,
    /// Paths whose transfer definitively failed this cycle.
    pub failures: Vec<(String, String)>,
    /// Store keys of failed transfers, for the end-of-run purge.
    pub failed_keys: Vec<(String, String)>,
}

impl TransferReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct TransferPool {
    ctx: Arc<SyncContext>,
}

impl TransferPool {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Runs the jobs to completion over the configured worker count.
    pub async fn run(&self, mut jobs: Vec<TransferJob>) -> Result<TransferReport, SyncError> {
        if jobs.is_empty() {
            return Ok(TransferReport::default());
        }
        sort_jobs(&mut jobs, self.ctx.config.transfers.transfer_order);

        let workers = self.ctx.config.threads.max(1);
        let (job_tx, job_rx) = mpsc::channel::<TransferJob>(workers * 2);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<WorkerOutcome>(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = self.ctx.clone();
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                // One handle per worker for its whole lifetime.
                let api = (ctx.api_factory)();
                let sessions = match SessionManager::new(&ctx.descriptor_dir) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(worker_id, error = %e, "worker could not open descriptor dir");
                        return;
                    }
                };
                loop {
                    // Finish the current file, then honour cancellation.
                    if ctx.cancelled() {
                        break;
                    }
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let path = job.display_path();
                    let key = job.store_key();
                    let outcome = process_job(&ctx, api.as_ref(), &sessions, job).await;
                    let outcome = match outcome {
                        Ok(o) => o,
                        Err(error) => WorkerOutcome::Failed { path, key, error },
                    };
                    if tx.send(outcome).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);
        drop(job_rx);

        let total = jobs.len();
        let feeder = tokio::spawn(async move {
            for job in jobs {
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
        });

        let mut report = TransferReport::default();
        let mut received = 0usize;
        while let Some(outcome) = result_rx.recv().await {
            received += 1;
            match outcome {
                WorkerOutcome::Downloaded => report.downloaded += 1,
                WorkerOutcome::Uploaded => report.uploaded += 1,
                WorkerOutcome::Skipped(reason) => {
                    debug!(%reason, "transfer skipped");
                    report.skipped += 1;
                }
                WorkerOutcome::Failed { path, key, error } => {
                    warn!(%path, error = %error, "transfer failed");
                    if error.is_fatal() {
                        self.ctx.cancel.cancel();
                    }
                    if let Some(key) = key {
                        report.failed_keys.push(key);
                    }
                    report.failures.push((path, error.to_string()));
                }
            }
            if received == total {
                break;
            }
        }

        feeder.abort();
        for handle in handles {
            let _ = handle.await;
        }

        info!(
            downloaded = report.downloaded,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failures.len(),
            "transfer pool drained"
        );
        Ok(report)
    }
}

fn sort_jobs(jobs: &mut [TransferJob], order: TransferOrder) {
    match order {
        TransferOrder::Default => {}
        TransferOrder::NameAsc => jobs.sort_by_key(|j| j.sort_name()),
        TransferOrder::NameDsc => {
            jobs.sort_by_key(|j| j.sort_name());
            jobs.reverse();
        }
        TransferOrder::SizeAsc => jobs.sort_by_key(|j| j.sort_size()),
        TransferOrder::SizeDsc => {
            jobs.sort_by_key(|j| j.sort_size());
            jobs.reverse();
        }
    }
}

async fn process_job(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    sessions: &SessionManager,
    job: TransferJob,
) -> Result<WorkerOutcome, SyncError> {
    match job {
        TransferJob::Download(task) => process_download(ctx, api, sessions, task).await,
        TransferJob::UploadNew {
            local,
            rel_path,
            drive_id,
            parent_id,
            name,
            size,
        } => process_upload_new(ctx, api, sessions, &local, &rel_path, &drive_id, &parent_id, &name, size).await,
        TransferJob::UploadModified { local, item } => {
            process_upload_modified(ctx, api, sessions, &local, item).await
        }
    }
}

// ============================================================================
// Downloads
// ============================================================================

async fn process_download(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    sessions: &SessionManager,
    task: DownloadTask,
) -> Result<WorkerOutcome, SyncError> {
    let item = task.item;

    if task.malware {
        ctx.notifier.notify(
            Severity::Error,
            &format!("'{}' is flagged as malware online and will not be downloaded", item.name),
        );
        return Ok(WorkerOutcome::Skipped("malware flagged".to_string()));
    }

    // New downloads have no persisted row yet; derive the path from the
    // parent chain, which the reconciler has already materialised.
    let rel_path = match ctx.store.compute_path(&item.drive_id, &item.id).await {
        Ok(path) => path,
        Err(_) => match &item.parent_id {
            Some(parent) => {
                let base = ctx.store.compute_path(&item.drive_id, parent).await?;
                if base == "/" {
                    format!("/{}", item.name)
                } else {
                    format!("{base}/{}", item.name)
                }
            }
            None => format!("/{}", item.name),
        },
    };
    let dest = ctx.local_path(&item.drive_id, &rel_path).await?;

    if ctx.dry_run() {
        info!(path = %rel_path, "dry-run: would download");
        ctx.shadow.fake_item(&item.drive_id, &item.id);
        ctx.shadow.fake_path(&rel_path);
        return Ok(WorkerOutcome::Skipped("dry-run".to_string()));
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| SyncError::filesystem(parent.display().to_string(), e))?;
    }

    // Free-space reservation.
    let reservation = ctx.config.space_reservation_bytes();
    let parent_dir = dest.parent().unwrap_or(&ctx.config.sync_dir);
    let available = fsutil::available_space(parent_dir)?;
    let needed = item.size.max(0) as u64 + reservation;
    if available < needed {
        return Err(SyncError::InsufficientSpace {
            path: rel_path,
            needed,
            available,
        });
    }

    // Local content the store did not produce is preserved first.
    if dest.exists() {
        let local_hash = fsutil::quick_xor_file(&dest).await?;
        let matches_previous = task
            .previous_hash
            .as_deref()
            .map(|h| h == local_hash)
            .unwrap_or(false);
        if !matches_previous && !ctx.config.transfers.bypass_data_preservation {
            fsutil::safe_backup(&dest)?;
        }
    }

    // Resume from a persisted descriptor when its identity still matches.
    let partial = partial_path(&dest);
    let (resume_offset, old_descriptor) = match sessions.find_download(&item.drive_id, &item.id) {
        Some((path, desc))
            if desc.quick_xor_hash == item.quick_xor_hash
                && desc.sha256_hash == item.sha256_hash
                && partial.exists() =>
        {
            (desc.resume_offset, Some(path))
        }
        Some((path, _)) => {
            // Content changed online since the interruption; restart.
            sessions.remove(&path);
            let _ = std::fs::remove_file(&partial);
            (0, None)
        }
        None => (0, None),
    };

    let result = api
        .download_item(&item.drive_id, &item.id, &partial, item.size, resume_offset)
        .await;

    let written = match result {
        Ok(written) => written,
        Err(e @ RemoteError::Transport { .. }) => {
            // Persist a resume point; the next cycle retries from here.
            // A superseded descriptor is dropped, not accumulated.
            if let Some(path) = &old_descriptor {
                sessions.remove(path);
            }
            let offset = std::fs::metadata(&partial).map(|m| m.len()).unwrap_or(0);
            let descriptor = DownloadResumeDescriptor {
                drive_id: item.drive_id.clone(),
                item_id: item.id.clone(),
                download_path: partial.clone(),
                original_name: item.name.clone(),
                resume_offset: offset,
                quick_xor_hash: item.quick_xor_hash.clone(),
                sha256_hash: item.sha256_hash.clone(),
            };
            sessions.save_download(&SessionManager::new_nonce(), &descriptor)?;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    debug!(path = %rel_path, written, "download transferred");

    // Validate before the partial becomes the real file.
    let validation = integrity::validate_download(
        &partial,
        &item,
        ctx.config.transfers.disable_download_validation,
    )
    .await?;
    match validation {
        ValidationOutcome::Valid | ValidationOutcome::Skipped => {}
        ValidationOutcome::KnownDataLoss => {
            ctx.notifier.notify(
                Severity::Warning,
                &format!(
                    "'{}': the service altered this file's content; the local copy will not match byte-for-byte",
                    rel_path
                ),
            );
        }
        outcome => {
            let _ = std::fs::remove_file(&partial);
            if ctx.drive_kind.is_sharepoint_family() {
                ctx.notifier.notify(
                    Severity::Warning,
                    &format!("'{rel_path}': SharePoint enriched the file during download validation ({outcome:?}); it will be re-fetched next cycle"),
                );
                ctx.store.delete_by_id(&item.drive_id, &item.id).await?;
            } else {
                ctx.notifier.notify(
                    Severity::Warning,
                    &format!("'{rel_path}': download failed integrity validation ({outcome:?})"),
                );
            }
            return Err(SyncError::IntegrityMismatch { path: rel_path });
        }
    }

    std::fs::rename(&partial, &dest)
        .map_err(|e| SyncError::filesystem(partial.display().to_string(), e))?;
    fsutil::set_mtime(&dest, item.mtime)?;
    if ctx.config.transfers.write_xattr_data {
        // Author identities travel on the task's remote record only when
        // configured.
        fsutil::write_author_xattrs(&dest, task.created_by.as_deref(), task.modified_by.as_deref());
    }

    ctx.store.upsert(&item).await?;
    if let Some(path) = old_descriptor {
        sessions.remove(&path);
    }

    if ctx.config.transfers.notify_file_actions {
        ctx.notifier
            .notify(Severity::Info, &format!("downloaded {rel_path}"));
    }
    Ok(WorkerOutcome::Downloaded)
}

fn partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.download"))
}

// ============================================================================
// Uploads
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn process_upload_new(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    sessions: &SessionManager,
    local: &Path,
    rel_path: &str,
    drive_id: &str,
    parent_id: &str,
    name: &str,
    size: u64,
) -> Result<WorkerOutcome, SyncError> {
    if ctx.dry_run() {
        info!(path = %rel_path, "dry-run: would upload new file");
        ctx.shadow.fake_path(rel_path);
        return Ok(WorkerOutcome::Skipped("dry-run".to_string()));
    }

    if !ctx.drive_cache.has_room(drive_id, size as i64) {
        return Err(SyncError::QuotaExhausted {
            drive_id: drive_id.to_string(),
        });
    }

    let use_session =
        size > ctx.config.session_threshold_bytes() || ctx.config.transfers.force_session_upload;

    let uploaded = if use_session {
        session_upload(ctx, api, sessions, local, drive_id, parent_id, name, None, size).await?
    } else {
        match api.simple_upload(local, drive_id, parent_id, name).await {
            Ok(item) => item,
            Err(e) if e.status() == Some(409) => {
                // Create race: another writer produced the name first;
                // adopt the existing item and replace its content.
                let existing = resolve_create_conflict(api, drive_id, parent_id, name).await?;
                api.simple_upload_replace(local, drive_id, &existing.id)
                    .await
                    .map_err(SyncError::from)?
            }
            Err(e) if e.is_permission_denied() => {
                ctx.notifier.notify(
                    Severity::Warning,
                    &format!("'{rel_path}': no permission to upload (read-only share?); skipping"),
                );
                return Ok(WorkerOutcome::Skipped("permission denied".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    };

    finish_upload(ctx, api, local, rel_path, drive_id, uploaded, size).await
}

async fn process_upload_modified(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    sessions: &SessionManager,
    local: &Path,
    item: Item,
) -> Result<WorkerOutcome, SyncError> {
    let rel_path = ctx.store.compute_path(&item.drive_id, &item.id).await?;
    if ctx.dry_run() {
        info!(path = %rel_path, "dry-run: would upload modified file");
        return Ok(WorkerOutcome::Skipped("dry-run".to_string()));
    }

    let size = std::fs::metadata(local)
        .map(|m| m.len())
        .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
    if !ctx.drive_cache.has_room(&item.drive_id, size as i64) {
        return Err(SyncError::QuotaExhausted {
            drive_id: item.drive_id.clone(),
        });
    }

    let use_session =
        size > ctx.config.session_threshold_bytes() || ctx.config.transfers.force_session_upload;

    let uploaded = if use_session {
        let parent = item.parent_id.clone().unwrap_or_default();
        session_upload(
            ctx,
            api,
            sessions,
            local,
            &item.drive_id,
            &parent,
            &item.name,
            item.etag.as_deref(),
            size,
        )
        .await?
    } else {
        match api.simple_upload_replace(local, &item.drive_id, &item.id).await {
            Ok(uploaded) => uploaded,
            Err(e) if e.is_permission_denied() => {
                ctx.notifier.notify(
                    Severity::Warning,
                    &format!("'{rel_path}': no permission to replace (read-only share?); skipping"),
                );
                return Ok(WorkerOutcome::Skipped("permission denied".to_string()));
            }
            Err(e) if e.is_locked() => {
                ctx.notifier.notify(
                    Severity::Warning,
                    &format!("'{rel_path}': file is locked online; skipping this cycle"),
                );
                return Ok(WorkerOutcome::Skipped("locked".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
    };

    finish_upload(ctx, api, local, &rel_path, &item.drive_id, uploaded, size).await
}

/// Looks up the item a 409-create collided with.
async fn resolve_create_conflict(
    api: &dyn RemoteApi,
    drive_id: &str,
    parent_id: &str,
    name: &str,
) -> Result<RemoteItem, SyncError> {
    let mut next: Option<String> = None;
    loop {
        let page = api.list_children(drive_id, parent_id, next.as_deref()).await?;
        if let Some(found) = page.items.into_iter().find(|i| i.name == name) {
            return Ok(found);
        }
        match page.next_link {
            Some(link) => next = Some(link),
            None => {
                return Err(RemoteError::status_error(
                    409,
                    "simple_upload",
                    format!("create conflict for '{name}' but no sibling matches"),
                )
                .into())
            }
        }
    }
}

/// Session upload with crash-resumable descriptors.
#[allow(clippy::too_many_arguments)]
async fn session_upload(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    sessions: &SessionManager,
    local: &Path,
    drive_id: &str,
    parent_id: &str,
    name: &str,
    if_match: Option<&str>,
    total_size: u64,
) -> Result<RemoteItem, SyncError> {
    let fs_info = serde_json::json!({
        "lastModifiedDateTime": local_mtime_rfc3339(local)?,
    });

    // Resume a persisted session for this exact file when it still
    // validates against the server.
    let mut nonce = SessionManager::new_nonce();
    let mut session: Option<UploadSession> = None;
    for (path, descriptor) in sessions.pending_uploads() {
        if descriptor.local_path == local
            && descriptor.target_drive_id == drive_id
            && descriptor.target_name == name
        {
            if descriptor.is_resumable(Utc::now()) {
                match api.request_upload_status(&descriptor.upload_url).await {
                    Ok(status) if status.next_offset().is_some() => {
                        info!(name, offset = status.next_offset().unwrap(), "resuming upload session");
                        nonce = descriptor_nonce(&path).unwrap_or(nonce);
                        session = Some(UploadSession {
                            upload_url: descriptor.upload_url.clone(),
                            expiration: descriptor.expiration,
                            next_expected_ranges: status.next_expected_ranges,
                        });
                        break;
                    }
                    _ => sessions.remove(&path),
                }
            } else {
                sessions.remove(&path);
            }
        }
    }

    let mut session = match session {
        Some(s) => s,
        None => {
            api.create_upload_session(drive_id, parent_id, name, if_match, &fs_info)
                .await?
        }
    };

    let fragment_size = aligned_fragment_bytes(ctx.config.transfers.file_fragment_size);
    let mut offset = session.next_offset().unwrap_or(0);
    let mut retried_transient = false;

    loop {
        persist_upload_descriptor(
            sessions, &nonce, &session, local, drive_id, parent_id, name, if_match,
        )?;

        if ctx.cancelled() {
            // Descriptor stays on disk; the next run resumes.
            return Err(RemoteError::Transport {
                operation: "upload_fragment".to_string(),
                message: "cancelled between fragments".to_string(),
            }
            .into());
        }

        let len = fragment_size.min(total_size.saturating_sub(offset));
        if len == 0 {
            // The server expects bytes past the end of the file; the
            // session state is unusable.
            sessions.remove(&sessions_path(sessions, &nonce));
            return Err(RemoteError::Decode {
                operation: "upload_fragment".to_string(),
                message: format!("session expects offset {offset} beyond file size {total_size}"),
            }
            .into());
        }
        match api
            .upload_fragment(&session.upload_url, local, offset, len, total_size)
            .await
        {
            Ok(FragmentOutcome::Completed(item)) => {
                sessions.remove(&sessions_path(sessions, &nonce));
                return Ok(item);
            }
            Ok(FragmentOutcome::Accepted(next)) => {
                offset = next.next_offset().unwrap_or(offset + len);
                session.next_expected_ranges = next.next_expected_ranges;
                if next.expiration.is_some() {
                    session.expiration = next.expiration;
                }
                retried_transient = false;
            }
            Err(e) if e.is_tempauth_expiry() || e.status() == Some(404) => {
                // The session URL died; a fresh session restarts at zero.
                warn!(name, error = %e, "upload session invalidated; recreating");
                session = api
                    .create_upload_session(drive_id, parent_id, name, if_match, &fs_info)
                    .await?;
                offset = 0;
                retried_transient = false;
            }
            Err(e) if e.is_transient() && !retried_transient => {
                warn!(name, offset, error = %e, "transient fragment failure; retrying once");
                retried_transient = true;
            }
            Err(e) => {
                // Transient exhaustion keeps the descriptor for resume;
                // anything else is definitive.
                if !e.is_transient() {
                    sessions.remove(&sessions_path(sessions, &nonce));
                }
                return Err(e.into());
            }
        }
    }
}

/// Post-upload validation, timestamp patch and bookkeeping.
async fn finish_upload(
    ctx: &SyncContext,
    api: &dyn RemoteApi,
    local: &Path,
    rel_path: &str,
    drive_id: &str,
    uploaded: RemoteItem,
    size: u64,
) -> Result<WorkerOutcome, SyncError> {
    let validation = integrity::validate_upload(
        local,
        &uploaded,
        ctx.config.transfers.disable_upload_validation,
    )
    .await?;

    let mut final_remote = uploaded.clone();
    if !validation.is_acceptable() {
        let sharepoint = ctx.drive_kind.is_sharepoint_family();
        if ctx.config.transfers.create_new_file_version {
            // Mint a new online version carrying the local timestamp.
            let patch = serde_json::json!({
                "fileSystemInfo": {"lastModifiedDateTime": local_mtime_rfc3339(local)?}
            });
            final_remote = api
                .update_item(drive_id, &uploaded.id, &patch, None)
                .await?;
            ctx.notifier.notify(
                Severity::Warning,
                &format!("'{rel_path}': upload hash differs; created a new online version"),
            );
        } else if sharepoint {
            // SharePoint rewrote the file; pull the enriched copy back so
            // local and remote agree.
            ctx.notifier.notify(
                Severity::Warning,
                &format!("'{rel_path}': SharePoint enriched the uploaded file; downloading the online copy back"),
            );
            api.download_item(drive_id, &uploaded.id, local, uploaded.size.unwrap_or(0), 0)
                .await?;
        } else {
            ctx.notifier.notify(
                Severity::Warning,
                &format!("'{rel_path}': uploaded content hash differs from the local file"),
            );
        }
    } else if validation == ValidationOutcome::KnownDataLoss {
        ctx.notifier.notify(
            Severity::Warning,
            &format!("'{rel_path}': the service altered this file during upload (known for this format)"),
        );
    }

    // Patch the online timestamp to the local mtime. Personal accounts
    // skip the ETag precondition to avoid spurious 412s; elsewhere a 412
    // retries without the precondition.
    let patch = serde_json::json!({
        "fileSystemInfo": {"lastModifiedDateTime": local_mtime_rfc3339(local)?}
    });
    let if_match = if ctx.drive_kind == DriveKind::Personal {
        None
    } else {
        final_remote.etag.as_deref()
    };
    let patched = match api.update_item(drive_id, &final_remote.id, &patch, if_match).await {
        Ok(item) => item,
        Err(e) if e.is_precondition() && if_match.is_some() => {
            api.update_item(drive_id, &final_remote.id, &patch, None).await?
        }
        Err(e) => return Err(e.into()),
    };

    let mut row = Item::from_remote(&patched, ctx.drive_kind)?;
    if !matches!(row.kind, ItemKind::File) {
        row.kind = ItemKind::File;
    }
    ctx.store.upsert(&row).await?;
    ctx.drive_cache.update(drive_id, size as i64);

    if ctx.config.mode.upload_only && ctx.config.mode.remove_source_files {
        std::fs::remove_file(local)
            .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
        debug!(path = %rel_path, "removed source file after validated upload");
    }

    if ctx.config.transfers.notify_file_actions {
        ctx.notifier
            .notify(Severity::Info, &format!("uploaded {rel_path}"));
    }
    Ok(WorkerOutcome::Uploaded)
}

// ============================================================================
// Helpers
// ============================================================================

fn aligned_fragment_bytes(config_mib: u64) -> u64 {
    let requested = config_mib.saturating_mul(1024 * 1024);
    let ceiling = 60 * 1024 * 1024 - FRAGMENT_QUANTUM;
    let aligned = (requested.min(ceiling) / FRAGMENT_QUANTUM) * FRAGMENT_QUANTUM;
    aligned.max(FRAGMENT_QUANTUM)
}

fn local_mtime_rfc3339(local: &Path) -> Result<String, SyncError> {
    let mtime: chrono::DateTime<Utc> = std::fs::metadata(local)
        .and_then(|m| m.modified())
        .map(Into::into)
        .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
    Ok(mtime.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[allow(clippy::too_many_arguments)]
fn persist_upload_descriptor(
    sessions: &SessionManager,
    nonce: &str,
    session: &UploadSession,
    local: &Path,
    drive_id: &str,
    parent_id: &str,
    name: &str,
    if_match: Option<&str>,
) -> Result<(), SyncError> {
    let descriptor = UploadSessionDescriptor {
        upload_url: session.upload_url.clone(),
        expiration: session.expiration,
        next_expected_ranges: session.next_expected_ranges.clone(),
        local_path: local.to_path_buf(),
        target_drive_id: drive_id.to_string(),
        target_parent_id: parent_id.to_string(),
        target_name: name.to_string(),
        current_etag: if_match.map(|s| s.to_string()),
    };
    sessions.save_upload(nonce, &descriptor)?;
    Ok(())
}

fn sessions_path(sessions: &SessionManager, nonce: &str) -> PathBuf {
    sessions.upload_descriptor_path(nonce)
}

fn descriptor_nonce(path: &Path) -> Option<String> {
    path.file_name()?
        .to_str()?
        .strip_prefix("session_upload.")
        .map(|s| s.to_string())
}
