//! SQLite-backed state store for odmirror.
//!
//! Implements the [`ItemStore`](odmirror_core::ports::store::ItemStore)
//! port over a WAL-mode SQLite database. One `items` table keyed by
//! `(drive_id, id)` holds the unified tree; a `delta_tokens` table holds
//! one change-feed checkpoint per `(drive_id, root_id)`.
//!
//! Concurrency follows SQLite's model: any number of readers, one writer
//! at a time; the pool's busy timeout absorbs short write contention.

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteItemStore;
