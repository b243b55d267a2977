//! The persistent `Item` entity.
//!
//! An [`Item`] is one node of the unified remote/local tree, keyed by
//! `(drive_id, id)`. Kind is a sum type: files, directories, drive roots,
//! pointers into other drives (mounted shared folders) and an `Unknown`
//! fallback for item shapes the reconciler cannot classify. Many engine
//! methods fan out on [`ItemKind`].

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::drive::{normalize_drive_id, DriveKind};
use super::errors::SyncError;
use crate::ports::remote::RemoteItem;

/// Target of a shared-folder pointer: the `(driveId, id)` of the real item
/// in the other drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePointer {
    pub drive_id: String,
    pub id: String,
    pub parent_id: Option<String>,
    /// Whether the target is a folder. Shared files are pointers too.
    pub is_directory: bool,
}

/// Discriminator for [`Item`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Dir,
    /// A drive root, including the synthetic root-tie rows that graft a
    /// shared subtree into the local namespace.
    Root,
    /// A pointer into another drive (a mounted shared folder).
    Remote(RemotePointer),
    Unknown,
}

impl ItemKind {
    pub fn is_file(&self) -> bool {
        matches!(self, ItemKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ItemKind::Dir)
    }

    pub fn is_root(&self) -> bool {
        matches!(self, ItemKind::Root)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ItemKind::Remote(_))
    }

    /// Stable tag used by the state store.
    pub fn tag(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Dir => "dir",
            ItemKind::Root => "root",
            ItemKind::Remote(_) => "remote",
            ItemKind::Unknown => "unknown",
        }
    }
}

/// One node in the unified remote-local tree.
///
/// Fields mirror what the remote API reports, after normalisation:
/// personal drive ids are canonical 16-char lowercase hex, `mtime` is
/// truncated to whole seconds (the remote API does not preserve
/// sub-second precision), and `name` may be a local override of the true
/// remote name (`remote_name` keeps the original when so).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub drive_id: String,
    pub id: String,
    /// Parent item id within the same drive; `None` for roots.
    pub parent_id: Option<String>,
    pub name: String,
    /// The item's true remote name when `name` has been overridden (shared
    /// folders mounted under a different local name).
    pub remote_name: Option<String>,
    pub kind: ItemKind,
    pub etag: Option<String>,
    pub ctag: Option<String>,
    pub mtime: DateTime<Utc>,
    pub size: i64,
    pub quick_xor_hash: Option<String>,
    pub sha256_hash: Option<String>,
    /// Only on shared-folder root ties: the local drive the subtree is
    /// grafted under.
    pub reloc_drive_id: Option<String>,
    /// Only on shared-folder root ties: the local parent item id.
    pub reloc_parent_id: Option<String>,
    /// Full-scan reconciliation flag. `false` marks the row provisionally
    /// stale; rows still `false` after a simulated delta pass are treated
    /// as deleted online.
    pub in_sync: bool,
}

impl Item {
    /// Primary key.
    pub fn key(&self) -> (String, String) {
        (self.drive_id.clone(), self.id.clone())
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_root(&self) -> bool {
        self.kind.is_root()
    }

    pub fn is_remote(&self) -> bool {
        self.kind.is_remote()
    }

    /// The hash to compare local content against: quickXorHash first,
    /// falling back to SHA-256 when only it is supplied.
    pub fn content_hash(&self) -> Option<&str> {
        self.quick_xor_hash
            .as_deref()
            .or(self.sha256_hash.as_deref())
    }

    /// True when `other`'s timestamp equals ours at second resolution.
    pub fn same_mtime(&self, other: DateTime<Utc>) -> bool {
        truncate_to_seconds(self.mtime) == truncate_to_seconds(other)
    }

    /// Builds an `Item` from a remote API item, normalising the drive id
    /// for personal accounts.
    ///
    /// Classification:
    /// - `remoteItem` facet → [`ItemKind::Remote`] pointing at the target;
    /// - `root` facet or missing parent id → [`ItemKind::Root`];
    /// - `folder` facet → [`ItemKind::Dir`];
    /// - `file` facet → [`ItemKind::File`];
    /// - anything else → [`ItemKind::Unknown`].
    pub fn from_remote(remote: &RemoteItem, drive_kind: DriveKind) -> Result<Self, SyncError> {
        let raw_drive_id = remote
            .parent
            .as_ref()
            .and_then(|p| p.drive_id.as_deref())
            .unwrap_or_default();
        let drive_id = normalize_drive_id(drive_kind, raw_drive_id)?;

        let parent_id = remote.parent.as_ref().and_then(|p| p.id.clone());

        let kind = if let Some(target) = &remote.remote {
            let remote_drive_id = normalize_drive_id(drive_kind, &target.drive_id)?;
            ItemKind::Remote(RemotePointer {
                drive_id: remote_drive_id,
                id: target.id.clone(),
                parent_id: target.parent_id.clone(),
                is_directory: target.is_directory,
            })
        } else if remote.is_root || parent_id.is_none() {
            ItemKind::Root
        } else if remote.is_folder {
            ItemKind::Dir
        } else if remote.file.is_some() {
            ItemKind::File
        } else {
            ItemKind::Unknown
        };

        let file = remote.file.as_ref();

        Ok(Item {
            drive_id,
            id: remote.id.clone(),
            parent_id: if kind.is_root() { None } else { parent_id },
            name: remote.name.clone(),
            remote_name: None,
            kind,
            etag: remote.etag.clone(),
            ctag: remote.ctag.clone(),
            mtime: truncate_to_seconds(remote.modified.unwrap_or_else(default_epoch)),
            size: remote.size.unwrap_or(0),
            quick_xor_hash: file.and_then(|f| f.quick_xor_hash.clone()),
            sha256_hash: file.and_then(|f| f.sha256_hash.clone()),
            reloc_drive_id: None,
            reloc_parent_id: None,
            in_sync: true,
        })
    }
}

/// Drops sub-second precision; all timestamp comparisons in the engine
/// happen at second resolution because the remote API truncates.
pub fn truncate_to_seconds(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.trunc_subsecs(0)
}

fn default_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
