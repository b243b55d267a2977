//! Microsoft Graph adapter for odmirror.
//!
//! Implements the [`RemoteApi`](odmirror_core::ports::remote::RemoteApi)
//! port over the Graph v1.0 REST surface:
//!
//! - [`client`]: the authenticated HTTP client with transient-status
//!   retry (408/429/503/504, exponential backoff, `Retry-After` aware);
//! - [`types`]: JSON resource types and their conversion to the
//!   port-level DTOs;
//! - [`provider`]: the `RemoteApi` implementation (lookup, enumeration,
//!   mutation, sharing);
//! - [`upload`] / [`download`]: the transfer protocol details (simple
//!   PUT, upload sessions with 320 KiB-aligned fragments, ranged
//!   streaming downloads).

pub mod client;
pub mod download;
pub mod provider;
pub mod types;
pub mod upload;

pub use client::GraphClient;
