//! Local filesystem scanner.
//!
//! Walks the sync root, classifies every entry against the filter
//! pipeline and the state store, and produces the work queues for the
//! upload side of the cycle:
//!
//! - directories unknown to the store → `dirs_to_create` (a sorted set,
//!   so ancestors are created before descendants and each exactly once);
//! - files unknown to the store → new uploads;
//! - known files with changed content → modified uploads;
//! - store rows whose local path vanished → remote deletions.
//!
//! In `--download-only --cleanup-local-files` mode classification
//! inverts: unknown local entries are deleted locally instead of
//! uploaded.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use odmirror_core::domain::errors::SyncError;
use odmirror_core::domain::item::Item;
use odmirror_core::ports::notify::Severity;
use odmirror_filter::{Decision, EntryFacts, EntryKind, FilterPipeline, SymlinkClass};

use crate::context::SyncContext;
use crate::fsutil;

/// A file the store does not know about yet.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub local: PathBuf,
    /// Drive-relative path (`/A/b.txt`).
    pub rel_path: String,
    pub size: u64,
}

/// A tracked file whose content changed locally.
#[derive(Debug, Clone)]
pub struct ModifiedUpload {
    pub local: PathBuf,
    pub item: Item,
}

/// A tracked file whose content is unchanged but whose local timestamp
/// moved; the online timestamp is patched instead of re-uploading.
#[derive(Debug, Clone)]
pub struct MtimePatch {
    pub item: Item,
    pub local_mtime: chrono::DateTime<chrono::Utc>,
}

/// Everything one scan discovered.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Drive-relative directory paths to create online, shallowest first.
    pub dirs_to_create: BTreeSet<String>,
    pub new_uploads: Vec<NewUpload>,
    pub modified_uploads: Vec<ModifiedUpload>,
    pub mtime_patches: Vec<MtimePatch>,
    /// Tracked items whose local path disappeared.
    pub remote_deletions: Vec<Item>,
    /// Cleanup mode: local paths to remove.
    pub local_cleanups: Vec<PathBuf>,
    pub skipped: Vec<(String, String)>,
}

pub struct LocalScanner {
    ctx: Arc<SyncContext>,
    filter: Arc<FilterPipeline>,
}

impl LocalScanner {
    pub fn new(ctx: Arc<SyncContext>, filter: Arc<FilterPipeline>) -> Self {
        Self { ctx, filter }
    }

    pub async fn scan(&self, drive_id: &str) -> Result<ScanOutcome, SyncError> {
        let mut outcome = ScanOutcome::default();
        let sync_root = self.ctx.config.sync_dir.clone();

        let walk_root = match &self.ctx.config.mode.single_directory {
            Some(sub) => sync_root.join(sub.trim_start_matches('/')),
            None => sync_root.clone(),
        };
        if !walk_root.exists() {
            warn!(root = %walk_root.display(), "scan root does not exist locally");
            return Ok(outcome);
        }

        let cleanup_mode =
            self.ctx.config.mode.download_only && self.ctx.config.mode.cleanup_local_files;
        let max_path = self.ctx.drive_kind.max_encoded_path_len();

        let mut walker = WalkDir::new(&walk_root).sort_by_file_name().into_iter();
        while let Some(entry) = walker.next() {
            if self.ctx.cancelled() {
                break;
            }

            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "unreadable entry during scan");
                    outcome
                        .skipped
                        .push((e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                               "unreadable entry".to_string()));
                    continue;
                }
            };
            if entry.path() == walk_root {
                continue;
            }

            // Names that are not valid UTF-8 cannot exist online.
            let Some(rel_path) = relative_path(&sync_root, entry.path()) else {
                warn!(path = %entry.path().display(), "name is not valid UTF-8; skipping");
                outcome.skipped.push((
                    entry.path().display().to_string(),
                    "invalid UTF-8 in name".to_string(),
                ));
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            };

            let is_dir = entry.file_type().is_dir();
            let facts = self.gather_facts(&entry, is_dir)?;
            let decision = self.filter.evaluate(&rel_path, &facts);

            if let Decision::Exclude(reason) = decision {
                // A sync-list exclusion may still require descending: an
                // anywhere-rule could match somewhere below.
                if is_dir && self.filter.must_descend(&rel_path) {
                    debug!(path = %rel_path, "excluded but descending for sync_list descendants");
                    continue;
                }
                debug!(path = %rel_path, %reason, "local entry filtered out");
                outcome.skipped.push((rel_path, reason.to_string()));
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            if fsutil::encoded_path_len(&rel_path) > max_path {
                self.ctx.notifier.notify(
                    Severity::Warning,
                    &format!("path too long for the remote namespace: {rel_path}"),
                );
                outcome
                    .skipped
                    .push((rel_path, "encoded path exceeds remote limit".to_string()));
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            let in_shadow = self.ctx.shadow.has_path(&rel_path);
            let stored = if in_shadow {
                None
            } else {
                self.ctx.store.get_by_path(drive_id, &rel_path).await?
            };

            if is_dir {
                if stored.is_none() && !in_shadow && !cleanup_mode {
                    outcome.dirs_to_create.insert(rel_path);
                }
                continue;
            }

            match stored {
                None if in_shadow => {}
                None if cleanup_mode => {
                    outcome.local_cleanups.push(entry.path().to_path_buf());
                }
                None => {
                    self.queue_new_upload(&mut outcome, drive_id, entry.path(), &rel_path, facts.size)
                        .await?;
                }
                Some(item) if !cleanup_mode => {
                    if self.content_changed(entry.path(), &item).await? {
                        outcome.modified_uploads.push(ModifiedUpload {
                            local: entry.path().to_path_buf(),
                            item,
                        });
                    } else {
                        // Same content, moved timestamp: the online
                        // record is patched, nothing is re-uploaded.
                        let local_mtime: chrono::DateTime<chrono::Utc> = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .map(Into::into)
                            .unwrap_or(item.mtime);
                        if !item.same_mtime(local_mtime) {
                            outcome.mtime_patches.push(MtimePatch { item, local_mtime });
                        }
                    }
                }
                Some(_) => {}
            }
        }

        if !cleanup_mode {
            self.collect_vanished(drive_id, &mut outcome).await?;
        }

        info!(
            new_uploads = outcome.new_uploads.len(),
            modified = outcome.modified_uploads.len(),
            dirs_to_create = outcome.dirs_to_create.len(),
            deletions = outcome.remote_deletions.len(),
            cleanups = outcome.local_cleanups.len(),
            skipped = outcome.skipped.len(),
            "local scan complete"
        );
        Ok(outcome)
    }

    fn gather_facts(
        &self,
        entry: &walkdir::DirEntry,
        is_dir: bool,
    ) -> Result<EntryFacts, SyncError> {
        let symlink = fsutil::classify_symlink(entry.path(), &self.ctx.config.sync_dir);
        let size = if is_dir || symlink != SymlinkClass::NotSymlink {
            0
        } else {
            entry
                .metadata()
                .map(|m| m.len())
                .map_err(|e| SyncError::filesystem(
                    entry.path().display().to_string(),
                    std::io::Error::other(e),
                ))?
        };
        let nosync_marker = if self.ctx.config.filters.check_nosync && is_dir {
            entry.path().join(".nosync").exists()
        } else {
            false
        };

        Ok(EntryFacts {
            kind: if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size,
            symlink,
            nosync_marker,
        })
    }

    /// Queues a new upload and makes sure every untracked ancestor
    /// directory is queued for online creation first.
    async fn queue_new_upload(
        &self,
        outcome: &mut ScanOutcome,
        drive_id: &str,
        local: &std::path::Path,
        rel_path: &str,
        size: u64,
    ) -> Result<(), SyncError> {
        let segments: Vec<&str> = rel_path.trim_start_matches('/').split('/').collect();
        let mut ancestor = String::new();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            ancestor.push('/');
            ancestor.push_str(segment);
            let tracked = self.ctx.shadow.has_path(&ancestor)
                || self
                    .ctx
                    .store
                    .get_by_path(drive_id, &ancestor)
                    .await?
                    .is_some();
            if !tracked {
                outcome.dirs_to_create.insert(ancestor.clone());
            }
        }

        outcome.new_uploads.push(NewUpload {
            local: local.to_path_buf(),
            rel_path: rel_path.to_string(),
            size,
        });
        Ok(())
    }

    /// Size first, then quickXorHash, so unchanged files cost one stat.
    async fn content_changed(
        &self,
        local: &std::path::Path,
        item: &Item,
    ) -> Result<bool, SyncError> {
        let metadata = std::fs::metadata(local)
            .map_err(|e| SyncError::filesystem(local.display().to_string(), e))?;
        if metadata.len() as i64 != item.size {
            return Ok(true);
        }
        match &item.quick_xor_hash {
            Some(stored) => {
                let local_hash = fsutil::quick_xor_file(local).await?;
                Ok(&local_hash != stored)
            }
            None => match &item.sha256_hash {
                Some(stored) => {
                    let local_hash = fsutil::sha256_file(local).await?;
                    Ok(&local_hash != stored)
                }
                None => Ok(false),
            },
        }
    }

    /// Tracked rows whose local path is gone were deleted locally; they
    /// are queued for remote deletion unless deletions are suppressed.
    async fn collect_vanished(
        &self,
        drive_id: &str,
        outcome: &mut ScanOutcome,
    ) -> Result<(), SyncError> {
        if self.ctx.config.mode.upload_only && self.ctx.config.deletes.no_remote_delete {
            return Ok(());
        }

        let single_prefix = self
            .ctx
            .config
            .mode
            .single_directory
            .as_ref()
            .map(|s| format!("/{}", s.trim_matches('/')));

        for item in self.ctx.store.items_in_drive(drive_id).await? {
            if item.is_root() || item.is_remote() {
                continue;
            }
            let rel = self.ctx.store.compute_path(drive_id, &item.id).await?;
            if let Some(prefix) = &single_prefix {
                if !rel.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let local = self.ctx.local_path(drive_id, &rel).await?;
            if !local.exists() && !local.is_symlink() {
                debug!(path = %rel, "tracked item vanished locally");
                outcome.remote_deletions.push(item);
            }
        }
        Ok(())
    }
}

fn relative_path(root: &std::path::Path, path: &std::path::Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let s = rel.to_str()?;
    Some(format!("/{s}"))
}
