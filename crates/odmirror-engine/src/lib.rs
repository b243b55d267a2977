//! The odmirror synchronisation engine.
//!
//! Coordinates the full cycle over the ports defined in `odmirror-core`:
//!
//! ```text
//! change feed ─→ reconciler ─→ transfer pool (downloads)
//!      │                              │
//!      └─→ delete executor (local)    │
//!                                     ▼
//! local scanner ─→ filter ─→ transfer pool (uploads) ─→ delete executor (remote)
//! ```
//!
//! Every stage reads and writes the state store; all network traffic goes
//! through `RemoteApi` handles, one per worker. Cancellation is polled at
//! pagination boundaries and between transfer batches; workers finish
//! their current fragment or file and then exit.

pub mod changefeed;
pub mod context;
pub mod deleter;
pub mod drive_cache;
pub mod engine;
pub mod fsutil;
pub mod integrity;
pub mod ops;
pub mod reconcile;
pub mod scanner;
pub mod session;
pub mod shared;
pub mod transfer;
pub mod watcher;

pub use context::SyncContext;
pub use engine::{SyncEngine, SyncReport};
