//! Error taxonomy shared across the workspace.
//!
//! Three layers:
//!
//! - [`StoreError`]: raised by the state database adapter. A consistency
//!   failure (broken parent chain, cycle) is unrecoverable and tells the
//!   user to resync.
//! - [`RemoteError`]: raised by the remote API adapter. Carries the HTTP
//!   status where one exists so callers can branch on the documented
//!   semantics (410 = expired delta token, 412 = ETag precondition, ...).
//! - [`SyncError`]: raised by the engine for conditions that are neither
//!   storage nor transport: POSIX case collisions, the big-delete guard,
//!   naming-rule violations, integrity mismatches.

use thiserror::Error;

/// Errors raised by the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying storage failed (I/O, SQL, serialization).
    #[error("storage failure: {0}")]
    Storage(String),

    /// The database content violates a structural invariant. Not repaired
    /// automatically; the user must run `--resync`.
    #[error("state database is inconsistent ({0}); run --resync to rebuild it")]
    Consistency(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

/// Errors raised by the remote API adapter.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} during {operation}: {message}")]
    Status {
        status: u16,
        operation: String,
        message: String,
    },

    /// The request never produced a server answer (DNS, TLS, timeout...).
    #[error("transport failure during {operation}: {message}")]
    Transport { operation: String, message: String },

    /// The server answered but the body could not be decoded.
    #[error("malformed response from {operation}: {message}")]
    Decode { operation: String, message: String },
}

impl RemoteError {
    /// HTTP status code, if the server produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 408/429/503/504: already retried with backoff inside the adapter;
    /// seeing one here means retries were exhausted.
    pub fn is_transient(&self) -> bool {
        matches!(self.status(), Some(408 | 429 | 503 | 504))
    }

    /// 410 on a changes query: the delta token expired.
    pub fn is_gone(&self) -> bool {
        self.status() == Some(410)
    }

    /// 409/412: ETag or create-name precondition failed.
    pub fn is_precondition(&self) -> bool {
        matches!(self.status(), Some(409 | 412))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_locked(&self) -> bool {
        self.status() == Some(423)
    }

    pub fn is_permission_denied(&self) -> bool {
        self.status() == Some(403)
    }

    /// 400/401: the token is bad; the user must re-authenticate.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status(), Some(400 | 401))
    }

    /// 507 or the quota facets say the drive is full.
    pub fn is_quota_exhausted(&self) -> bool {
        self.status() == Some(507)
    }

    /// A 403 whose message indicates the `tempauth` token embedded in an
    /// upload-session URL expired; the session must be recreated.
    pub fn is_tempauth_expiry(&self) -> bool {
        match self {
            RemoteError::Status {
                status: 403,
                message,
                ..
            } => {
                let lower = message.to_lowercase();
                lower.contains("tempauth") || lower.contains("access denied")
            }
            _ => false,
        }
    }

    /// Helper for adapters building a status error.
    pub fn status_error(
        status: u16,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        RemoteError::Status {
            status,
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Engine-level failures.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A local name differs only by case from an existing remote sibling.
    /// The user must rename; the engine never merges.
    #[error("'{candidate}' collides with existing '{existing}' (names differ only by case); rename the local item")]
    PosixCollision { candidate: String, existing: String },

    /// The number of queued remote deletions crossed the configured
    /// threshold and `--force` was not given.
    #[error("refusing to delete {count} items online (threshold {threshold}); re-run with --force to proceed")]
    BigDelete { count: usize, threshold: usize },

    /// Encoded path length exceeds what the remote namespace accepts.
    #[error("path '{path}' is {encoded_len} characters when encoded, above the {max} limit")]
    PathTooLong {
        path: String,
        encoded_len: usize,
        max: usize,
    },

    /// The name violates the remote naming rules.
    #[error("name '{name}' is not allowed online: {reason}")]
    InvalidName { name: String, reason: String },

    /// Post-transfer validation failed.
    #[error("integrity validation failed for '{path}'")]
    IntegrityMismatch { path: String },

    /// The drive has no space for a required upload.
    #[error("quota exhausted on drive {drive_id}")]
    QuotaExhausted { drive_id: String },

    /// Not enough local disk space to accept a download.
    #[error("insufficient local disk space for '{path}': {needed} bytes needed, {available} available")]
    InsufficientSpace {
        path: String,
        needed: u64,
        available: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("filesystem error on '{path}': {source}")]
    Filesystem {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    /// True when the whole run must stop rather than skip the item.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::BigDelete { .. } => true,
            SyncError::Store(StoreError::Consistency(_)) => true,
            SyncError::Remote(e) => e.is_auth_failure(),
            _ => false,
        }
    }

    pub fn filesystem(path: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            source,
        }
    }
}
