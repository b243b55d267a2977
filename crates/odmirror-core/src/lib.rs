//! Core domain logic for odmirror.
//!
//! This crate defines everything the rest of the workspace agrees on:
//!
//! - the [`domain`] module: the persistent [`Item`](domain::Item) entity,
//!   drive classification and id normalisation, and the error taxonomy;
//! - the [`config`] module: the immutable configuration consumed by the
//!   engine and adapters;
//! - the [`ports`] module: the `RemoteApi`, `ItemStore` and `Notifier`
//!   traits together with their provider-agnostic DTOs.
//!
//! No I/O happens here. Adapters (`odmirror-graph`, `odmirror-store`) and
//! the engine (`odmirror-engine`) depend on this crate, never the other
//! way around.

pub mod config;
pub mod domain;
pub mod ports;

pub use config::Config;
pub use domain::errors::{RemoteError, StoreError, SyncError};
pub use domain::item::{Item, ItemKind};
