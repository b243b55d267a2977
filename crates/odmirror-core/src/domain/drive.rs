//! Drive classification, id normalisation and quota snapshots.

use serde::{Deserialize, Serialize};

use super::errors::SyncError;

/// The kind of drive an account or document library presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriveKind {
    /// Consumer OneDrive. Drive ids are 16 lowercase hex characters.
    Personal,
    /// OneDrive for Business.
    Business,
    /// A SharePoint document library.
    DocumentLibrary,
}

impl DriveKind {
    /// Maps the `driveType` string returned by the remote API.
    /// Unrecognised values are treated as business drives, which applies
    /// the least normalisation.
    pub fn from_drive_type(s: &str) -> Self {
        match s {
            "personal" => DriveKind::Personal,
            "documentLibrary" => DriveKind::DocumentLibrary,
            _ => DriveKind::Business,
        }
    }

    /// Whether the SharePoint enrichment caveat applies (uploaded files may
    /// be rewritten server-side, failing hash validation).
    pub fn is_sharepoint_family(&self) -> bool {
        matches!(self, DriveKind::Business | DriveKind::DocumentLibrary)
    }

    /// Maximum encoded path length the remote namespace accepts.
    pub fn max_encoded_path_len(&self) -> usize {
        match self {
            DriveKind::Personal => 430,
            _ => 400,
        }
    }
}

/// Canonicalises a drive id before persistence.
///
/// Personal drive ids are defined as 16 lowercase hex characters, but the
/// API is inconsistent: it may return variable case, or 15 characters with
/// the leading zero stripped. Both defects are corrected here; anything
/// else is rejected. Business and SharePoint ids pass through untouched.
pub fn normalize_drive_id(kind: DriveKind, raw: &str) -> Result<String, SyncError> {
    if kind != DriveKind::Personal {
        return Ok(raw.to_string());
    }

    let lowered = raw.to_ascii_lowercase();
    if !lowered.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SyncError::InvalidName {
            name: raw.to_string(),
            reason: "personal drive id contains non-hex characters".to_string(),
        });
    }

    match lowered.len() {
        16 => Ok(lowered),
        15 => Ok(format!("0{lowered}")),
        n => Err(SyncError::InvalidName {
            name: raw.to_string(),
            reason: format!("personal drive id has {n} characters, expected 15 or 16"),
        }),
    }
}

/// Process-lifetime quota snapshot for one drive.
///
/// Refreshed on startup and decremented locally after each successful
/// upload; periodically re-queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveQuota {
    /// The drive hides its quota (legitimate on business tenants).
    pub restricted: bool,
    /// There is still room to upload.
    pub available: bool,
    /// Bytes remaining, when known.
    pub remaining: i64,
}

impl DriveQuota {
    /// Builds a snapshot from the raw `remaining` value the quota endpoint
    /// returned. A missing or negative value means the tenant restricts
    /// quota visibility; only an explicit zero marks the drive full.
    pub fn from_remaining(remaining: Option<i64>) -> Self {
        match remaining {
            Some(r) if r > 0 => DriveQuota {
                restricted: false,
                available: true,
                remaining: r,
            },
            Some(0) => DriveQuota {
                restricted: false,
                available: false,
                remaining: 0,
            },
            // Negative values behave like a hidden quota: the server
            // stays the authority on whether uploads fit.
            Some(_) | None => DriveQuota {
                restricted: true,
                available: true,
                remaining: 0,
            },
        }
    }

    /// Accounts for `uploaded` bytes just written to the drive.
    pub fn consume(&mut self, uploaded: i64) {
        if self.restricted {
            return;
        }
        self.remaining = (self.remaining - uploaded).max(0);
        if self.remaining == 0 {
            self.available = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod normalize {
        use super::*;

        #[test]
        fn test_personal_id_lowercased() {
            let id = normalize_drive_id(DriveKind::Personal, "ABCDEF0123456789").unwrap();
            assert_eq!(id, "abcdef0123456789");
        }

        #[test]
        fn test_personal_id_zero_padded() {
            // The API strips a leading zero from some personal ids.
            let id = normalize_drive_id(DriveKind::Personal, "bcdef0123456789").unwrap();
            assert_eq!(id, "0bcdef0123456789");
            assert_eq!(id.len(), 16);
        }

        #[test]
        fn test_personal_id_rejects_non_hex() {
            assert!(normalize_drive_id(DriveKind::Personal, "zzzzzzzzzzzzzzzz").is_err());
        }

        #[test]
        fn test_personal_id_rejects_wrong_length() {
            assert!(normalize_drive_id(DriveKind::Personal, "abc").is_err());
            assert!(normalize_drive_id(DriveKind::Personal, "abcdef0123456789ab").is_err());
        }

        #[test]
        fn test_business_id_passthrough() {
            let raw = "b!CCtTwJCmGUqFakYgU2RT9TIaK1BJHEVMrbIQ1eAAlFM";
            let id = normalize_drive_id(DriveKind::Business, raw).unwrap();
            assert_eq!(id, raw);
        }
    }

    mod quota {
        use super::*;

        #[test]
        fn test_from_remaining_positive() {
            let q = DriveQuota::from_remaining(Some(1024));
            assert!(!q.restricted);
            assert!(q.available);
            assert_eq!(q.remaining, 1024);
        }

        #[test]
        fn test_from_remaining_missing_is_restricted() {
            let q = DriveQuota::from_remaining(None);
            assert!(q.restricted);
            assert!(q.available);
        }

        #[test]
        fn test_from_remaining_zero_is_unavailable() {
            let q = DriveQuota::from_remaining(Some(0));
            assert!(!q.restricted);
            assert!(!q.available);
        }

        #[test]
        fn test_from_remaining_negative_is_restricted() {
            let q = DriveQuota::from_remaining(Some(-1));
            assert!(q.restricted);
            assert!(q.available);
            assert_eq!(q.remaining, 0);
        }

        #[test]
        fn test_consume_drains_to_unavailable() {
            let mut q = DriveQuota::from_remaining(Some(100));
            q.consume(60);
            assert_eq!(q.remaining, 40);
            assert!(q.available);
            q.consume(60);
            assert_eq!(q.remaining, 0);
            assert!(!q.available);
        }

        #[test]
        fn test_consume_ignored_when_restricted() {
            let mut q = DriveQuota::from_remaining(None);
            q.consume(1 << 30);
            assert!(q.available);
        }
    }

    #[test]
    fn test_drive_kind_mapping() {
        assert_eq!(DriveKind::from_drive_type("personal"), DriveKind::Personal);
        assert_eq!(DriveKind::from_drive_type("business"), DriveKind::Business);
        assert_eq!(
            DriveKind::from_drive_type("documentLibrary"),
            DriveKind::DocumentLibrary
        );
        assert_eq!(DriveKind::from_drive_type("weird"), DriveKind::Business);
    }

    #[test]
    fn test_path_limits() {
        assert_eq!(DriveKind::Personal.max_encoded_path_len(), 430);
        assert_eq!(DriveKind::Business.max_encoded_path_len(), 400);
        assert_eq!(DriveKind::DocumentLibrary.max_encoded_path_len(), 400);
    }
}
