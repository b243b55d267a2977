//! Delete executor.
//!
//! Remote deletions come from the local scanner (a tracked path vanished)
//! and pass the big-delete guard before anything is issued: when the
//! deletion scope reaches the configured threshold without `--force`, the
//! whole cycle aborts with zero deletions performed. Directories delete
//! children-first because the service refuses non-empty folder deletes.
//!
//! Local deletions come from online delete events and honour
//! `use_recycle_bin`: files move into a FreeDesktop-layout trash
//! (`$XDG_DATA_HOME/Trash`) with a `.trashinfo` record, or are unlinked
//! outright.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, info, warn};

use odmirror_core::domain::errors::{RemoteError, SyncError};
use odmirror_core::domain::item::Item;
use odmirror_core::ports::notify::Severity;

use crate::context::SyncContext;

/// Result of a deletion pass.
#[derive(Debug, Default)]
pub struct DeleteReport {
    pub deleted_remote: u32,
    pub deleted_local: u32,
}

pub struct DeleteExecutor {
    ctx: Arc<SyncContext>,
}

impl DeleteExecutor {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    // ========================================================================
    // Remote deletions
    // ========================================================================

    /// Deletes the given store items online, expanding each to its full
    /// subtree, children first. Enforces the big-delete guard *before*
    /// issuing anything.
    pub async fn delete_remote(&self, roots: Vec<Item>) -> Result<DeleteReport, SyncError> {
        let mut report = DeleteReport::default();
        if roots.is_empty() {
            return Ok(report);
        }
        if self.ctx.config.mode.upload_only && self.ctx.config.deletes.no_remote_delete {
            debug!("remote deletions suppressed by --no-remote-delete");
            return Ok(report);
        }

        // Expand to subtrees and deduplicate.
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut victims: Vec<Item> = Vec::new();
        for root in &roots {
            for item in self.ctx.store.subtree(&root.drive_id, &root.id).await? {
                if seen.insert(item.key()) {
                    victims.push(item);
                }
            }
        }

        let threshold = self.ctx.config.deletes.classify_as_big_delete;
        if victims.len() >= threshold && !self.ctx.config.mode.force {
            self.ctx.notifier.notify(
                Severity::Error,
                &format!(
                    "refusing to delete {} items online (threshold {}); re-run with --force if intended",
                    victims.len(),
                    threshold
                ),
            );
            return Err(SyncError::BigDelete {
                count: victims.len(),
                threshold,
            });
        }

        // Children first: deepest paths go before their parents.
        let mut ordered: Vec<(String, Item)> = Vec::with_capacity(victims.len());
        for item in victims {
            let path = self.ctx.store.compute_path(&item.drive_id, &item.id).await?;
            ordered.push((path, item));
        }
        ordered.sort_by(|(a, _), (b, _)| {
            let depth = |p: &str| p.matches('/').count();
            depth(b).cmp(&depth(a)).then_with(|| b.cmp(a))
        });

        for (path, item) in ordered {
            if self.ctx.cancelled() {
                break;
            }
            if self.ctx.dry_run() {
                info!(%path, "dry-run: would delete online");
                continue;
            }

            match self.issue_remote_delete(&item, item.etag.as_deref()).await {
                Ok(()) => {}
                // Already gone online; converge.
                Err(e) if e.is_not_found() => {
                    debug!(%path, "item already absent online");
                }
                Err(e) if e.is_precondition() => {
                    // Stale ETag; repeat the same delete unconditionally.
                    match self.issue_remote_delete(&item, None).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            debug!(%path, "item already absent online");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }

            self.ctx.store.delete_by_id(&item.drive_id, &item.id).await?;
            report.deleted_remote += 1;
            if self.ctx.config.transfers.notify_file_actions {
                self.ctx
                    .notifier
                    .notify(Severity::Info, &format!("deleted online: {path}"));
            }
        }

        Ok(report)
    }

    /// Issues one online delete through the API the configuration
    /// selected, so an ETag retry cannot downgrade a permanent delete to
    /// a recycle-bin delete.
    async fn issue_remote_delete(
        &self,
        item: &Item,
        if_match: Option<&str>,
    ) -> Result<(), RemoteError> {
        if self.ctx.config.deletes.permanent_delete {
            self.ctx
                .api
                .permanent_delete_item(&item.drive_id, &item.id, if_match)
                .await
        } else {
            self.ctx
                .api
                .delete_item(&item.drive_id, &item.id, if_match)
                .await
        }
    }

    // ========================================================================
    // Local deletions
    // ========================================================================

    /// Applies online delete events locally, children first.
    pub async fn delete_local(&self, mut items: Vec<Item>) -> Result<DeleteReport, SyncError> {
        let mut report = DeleteReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        // Children before parents, so directory removal meets empty dirs.
        let mut with_paths: Vec<(String, Item)> = Vec::new();
        for item in items.drain(..) {
            match self.ctx.store.compute_path(&item.drive_id, &item.id).await {
                Ok(path) => with_paths.push((path, item)),
                Err(_) => {
                    // Parent chain already gone; drop the row.
                    self.ctx.store.delete_by_id(&item.drive_id, &item.id).await?;
                }
            }
        }
        with_paths.sort_by(|(a, _), (b, _)| {
            let depth = |p: &str| p.matches('/').count();
            depth(b).cmp(&depth(a)).then_with(|| b.cmp(a))
        });

        for (rel_path, item) in with_paths {
            let local = self.ctx.local_path(&item.drive_id, &rel_path).await?;

            if self.ctx.dry_run() {
                info!(path = %local.display(), "dry-run: would delete locally");
                continue;
            }

            if local.exists() || local.is_symlink() {
                if self.ctx.config.deletes.use_recycle_bin && !item.is_dir() {
                    trash::move_to_trash(&local)?;
                } else if item.is_dir() {
                    match std::fs::remove_dir(&local) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(_) => {
                            // Leftover untracked content; keep the user's
                            // files and leave the directory behind.
                            warn!(path = %local.display(), "directory not empty after sync; leaving in place");
                        }
                    }
                } else {
                    match std::fs::remove_file(&local) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(SyncError::filesystem(local.display().to_string(), e))
                        }
                    }
                }
            }

            self.ctx.store.delete_by_id(&item.drive_id, &item.id).await?;
            report.deleted_local += 1;
            if self.ctx.config.transfers.notify_file_actions {
                self.ctx
                    .notifier
                    .notify(Severity::Info, &format!("deleted locally: {rel_path}"));
            }
        }

        Ok(report)
    }

    /// Cleanup mode: removes local paths the store does not track.
    pub async fn cleanup_local(&self, paths: Vec<PathBuf>) -> Result<u32, SyncError> {
        let mut removed = 0;
        for path in paths {
            if self.ctx.dry_run() {
                info!(path = %path.display(), "dry-run: would clean up local file");
                continue;
            }
            if self.ctx.config.deletes.use_recycle_bin {
                trash::move_to_trash(&path)?;
            } else if path.is_dir() {
                std::fs::remove_dir_all(&path)
                    .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
            } else {
                std::fs::remove_file(&path)
                    .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

// ============================================================================
// FreeDesktop trash
// ============================================================================

pub mod trash {
    //! Minimal FreeDesktop trash implementation: `files/` holds the
    //! payload, `info/` the `.trashinfo` metadata. Name collisions
    //! resolve as `name.N.ext`.

    use super::*;

    fn trash_root() -> PathBuf {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("~/.local/share"))
            })
            .join("Trash")
    }

    /// Finds a free name in `files/`, resolving collisions as `name.N.ext`.
    fn free_name(files_dir: &Path, original: &str) -> String {
        if !files_dir.join(original).exists() {
            return original.to_string();
        }
        let path = Path::new(original);
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(original);
        let ext = path.extension().and_then(|e| e.to_str());
        for n in 1.. {
            let candidate = match ext {
                Some(ext) => format!("{stem}.{n}.{ext}"),
                None => format!("{stem}.{n}"),
            };
            if !files_dir.join(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!("collision counter exhausted");
    }

    /// Moves `path` into the trash with its `.trashinfo` record.
    pub fn move_to_trash(path: &Path) -> Result<(), SyncError> {
        move_to_trash_at(path, &trash_root())
    }

    /// Testable variant with an explicit trash root.
    pub fn move_to_trash_at(path: &Path, root: &Path) -> Result<(), SyncError> {
        let files_dir = root.join("files");
        let info_dir = root.join("info");
        std::fs::create_dir_all(&files_dir)
            .map_err(|e| SyncError::filesystem(files_dir.display().to_string(), e))?;
        std::fs::create_dir_all(&info_dir)
            .map_err(|e| SyncError::filesystem(info_dir.display().to_string(), e))?;

        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("deleted");
        let trash_name = free_name(&files_dir, original_name);

        // Original absolute path, percent-encoded, with a local-time
        // deletion stamp, per the FreeDesktop trash spec.
        let encoded_path =
            utf8_percent_encode(&path.display().to_string(), NON_ALPHANUMERIC).to_string();
        let deletion_date = Local::now().format("%Y-%m-%dT%H:%M:%S");
        let info = format!(
            "[Trash Info]\nPath={encoded_path}\nDeletionDate={deletion_date}\n"
        );

        let info_path = info_dir.join(format!("{trash_name}.trashinfo"));
        std::fs::write(&info_path, info)
            .map_err(|e| SyncError::filesystem(info_path.display().to_string(), e))?;

        let dest = files_dir.join(&trash_name);
        match std::fs::rename(path, &dest) {
            Ok(()) => Ok(()),
            Err(_) => {
                // Cross-device move: copy then unlink.
                std::fs::copy(path, &dest)
                    .map_err(|e| SyncError::filesystem(path.display().to_string(), e))?;
                std::fs::remove_file(path)
                    .map_err(|e| SyncError::filesystem(path.display().to_string(), e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trash_layout_and_info() {
        let sandbox = tempfile::tempdir().unwrap();
        let trash_root = sandbox.path().join("Trash");
        let victim = sandbox.path().join("doc.txt");
        std::fs::write(&victim, b"payload").unwrap();

        trash::move_to_trash_at(&victim, &trash_root).unwrap();

        assert!(!victim.exists());
        assert_eq!(
            std::fs::read(trash_root.join("files/doc.txt")).unwrap(),
            b"payload"
        );
        let info = std::fs::read_to_string(trash_root.join("info/doc.txt.trashinfo")).unwrap();
        assert!(info.starts_with("[Trash Info]\n"));
        assert!(info.contains("Path="));
        assert!(info.contains("DeletionDate="));
    }

    #[test]
    fn test_trash_collision_names() {
        let sandbox = tempfile::tempdir().unwrap();
        let trash_root = sandbox.path().join("Trash");

        for round in 0..3 {
            let victim = sandbox.path().join("doc.txt");
            std::fs::write(&victim, format!("round {round}")).unwrap();
            trash::move_to_trash_at(&victim, &trash_root).unwrap();
        }

        let files = trash_root.join("files");
        assert!(files.join("doc.txt").exists());
        assert!(files.join("doc.1.txt").exists());
        assert!(files.join("doc.2.txt").exists());
        assert!(trash_root.join("info/doc.2.txt.trashinfo").exists());
    }
}
