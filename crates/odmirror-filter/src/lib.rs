//! Client-side filtering pipeline.
//!
//! Three filter families evaluated in order; the first match decides:
//!
//! 1. remote naming rules (always on) — [`naming`];
//! 2. configured include/exclude rules — [`rules`] and [`sync_list`];
//! 3. the POSIX case-collision check — [`collision`].
//!
//! The pipeline is pure: it never touches the filesystem or the network.
//! Facts that require I/O (symlink targets, `.nosync` markers, file sizes)
//! are gathered by the caller and passed in as values, which keeps every
//! decision testable in isolation.

pub mod collision;
pub mod naming;
pub mod pipeline;
pub mod rules;
pub mod sync_list;

pub use collision::find_case_collision;
pub use pipeline::{Decision, EntryFacts, EntryKind, ExcludeReason, FilterPipeline, SymlinkClass};
pub use sync_list::{SyncList, SyncListDecision};
