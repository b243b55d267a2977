//! Per-drive quota snapshots shared across workers.
//!
//! A read-mostly map initialised lazily per drive by querying the remote
//! quota endpoint. After each successful upload the owning worker
//! decrements the remaining count; the entry is replaced atomically.

use dashmap::DashMap;
use tracing::{debug, warn};

use odmirror_core::domain::drive::DriveQuota;
use odmirror_core::domain::errors::RemoteError;
use odmirror_core::ports::remote::RemoteApi;

#[derive(Debug, Default)]
pub struct DriveCache {
    entries: DashMap<String, DriveQuota>,
}

impl DriveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached snapshot, querying the quota endpoint on first
    /// use of a drive.
    pub async fn get_or_init(
        &self,
        api: &dyn RemoteApi,
        drive_id: &str,
    ) -> Result<DriveQuota, RemoteError> {
        if let Some(entry) = self.entries.get(drive_id) {
            return Ok(*entry);
        }
        self.refresh(api, drive_id).await
    }

    /// Re-queries the quota endpoint and replaces the snapshot.
    pub async fn refresh(
        &self,
        api: &dyn RemoteApi,
        drive_id: &str,
    ) -> Result<DriveQuota, RemoteError> {
        let quota = api.get_drive_quota(drive_id).await?;
        if quota.restricted {
            debug!(drive_id, "drive does not expose quota; treating as restricted");
        }
        self.entries.insert(drive_id.to_string(), quota);
        Ok(quota)
    }

    /// Accounts for bytes just uploaded by the calling worker.
    pub fn update(&self, drive_id: &str, uploaded: i64) {
        if let Some(mut entry) = self.entries.get_mut(drive_id) {
            entry.consume(uploaded);
            if !entry.available {
                warn!(drive_id, "drive quota exhausted");
            }
        }
    }

    /// Whether an upload of `size` bytes can proceed. Restricted drives
    /// never block uploads here; the server is the authority.
    pub fn has_room(&self, drive_id: &str, size: i64) -> bool {
        match self.entries.get(drive_id) {
            Some(entry) => {
                entry.restricted || (entry.available && entry.remaining >= size)
            }
            None => true,
        }
    }

    pub fn snapshot(&self, drive_id: &str) -> Option<DriveQuota> {
        self.entries.get(drive_id).map(|e| *e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(drive_id: &str, remaining: Option<i64>) -> DriveCache {
        let cache = DriveCache::new();
        cache
            .entries
            .insert(drive_id.to_string(), DriveQuota::from_remaining(remaining));
        cache
    }

    #[test]
    fn test_update_decrements_and_flips_availability() {
        let cache = seeded("d1", Some(150));
        cache.update("d1", 100);
        assert!(cache.has_room("d1", 50));
        cache.update("d1", 50);
        assert!(!cache.has_room("d1", 1));
        assert!(!cache.snapshot("d1").unwrap().available);
    }

    #[test]
    fn test_restricted_drive_never_blocks() {
        let cache = seeded("biz", None);
        assert!(cache.has_room("biz", i64::MAX));
        cache.update("biz", 1 << 40);
        assert!(cache.has_room("biz", 1 << 40));
    }

    #[test]
    fn test_unknown_drive_has_room_until_initialised() {
        let cache = DriveCache::new();
        assert!(cache.has_room("unseen", 1024));
        assert!(cache.snapshot("unseen").is_none());
    }
}
