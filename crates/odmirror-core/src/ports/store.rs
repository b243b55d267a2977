//! State store port (driven/secondary port).
//!
//! An ordered key-value view over the persistent item table, keyed by
//! `(drive_id, id)`, with the secondary lookups the engine needs. The
//! SQLite adapter in `odmirror-store` implements this; engine tests use an
//! in-memory fake.
//!
//! Concurrency contract: multiple readers, single writer; writers
//! serialise via transactions inside the adapter. A tree-walk failure
//! during path computation is a [`StoreError::Consistency`] — the engine
//! does not attempt repair.

use crate::domain::errors::StoreError;
use crate::domain::item::Item;

#[async_trait::async_trait]
pub trait ItemStore: Send + Sync {
    /// Idempotent insert-or-update of one row.
    async fn upsert(&self, item: &Item) -> Result<(), StoreError>;

    async fn get(&self, drive_id: &str, id: &str) -> Result<Option<Item>, StoreError>;

    /// Single-row delete; silently OK when the row is absent.
    async fn delete_by_id(&self, drive_id: &str, id: &str) -> Result<(), StoreError>;

    /// Resolves a drive-relative path (`/A/b.txt`) to an item by walking
    /// name segments from the drive root.
    async fn get_by_path(&self, drive_id: &str, path: &str) -> Result<Option<Item>, StoreError>;

    /// Computes the drive-relative path of an item by walking its parent
    /// chain. A cycle or a dangling parent raises
    /// [`StoreError::Consistency`].
    async fn compute_path(&self, drive_id: &str, id: &str) -> Result<String, StoreError>;

    async fn children(&self, drive_id: &str, id: &str) -> Result<Vec<Item>, StoreError>;

    async fn items_in_drive(&self, drive_id: &str) -> Result<Vec<Item>, StoreError>;

    /// The item plus all its descendants. Used for the big-delete count and
    /// for reverse-order deletion.
    async fn subtree(&self, drive_id: &str, id: &str) -> Result<Vec<Item>, StoreError>;

    /// `remote`-kind rows whose pointer targets `(remote_drive_id, remote_id)`.
    async fn find_ties(
        &self,
        remote_drive_id: &str,
        remote_id: &str,
    ) -> Result<Vec<Item>, StoreError>;

    async fn distinct_drive_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Rows still flagged out-of-sync after a simulated-delta enumeration.
    async fn out_of_sync_items(&self, drive_id: &str) -> Result<Vec<Item>, StoreError>;

    /// Marks the whole subtree under `(drive_id, root_id)` provisionally
    /// stale (`in_sync = false`). Returns the number of rows touched.
    async fn downgrade_sync_status(&self, drive_id: &str, root_id: &str)
        -> Result<u64, StoreError>;

    async fn mark_in_sync(&self, drive_id: &str, id: &str) -> Result<(), StoreError>;

    // --- delta-link checkpoints ---

    async fn set_delta_link(
        &self,
        drive_id: &str,
        root_id: &str,
        token: &str,
    ) -> Result<(), StoreError>;

    async fn get_delta_link(
        &self,
        drive_id: &str,
        root_id: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn clear_delta_link(&self, drive_id: &str, root_id: &str) -> Result<(), StoreError>;

    // --- maintenance ---

    /// Flushes the WAL without blocking readers (PASSIVE checkpoint).
    async fn checkpoint(&self) -> Result<(), StoreError>;

    /// Drops all rows and tokens; used by `--resync`.
    async fn wipe(&self) -> Result<(), StoreError>;
}
