//! The ordered filter pipeline.
//!
//! Combines the naming rules, the configured skip rules and the sync list
//! into one evaluation with a stable order; the first family that matches
//! decides. The same pipeline runs over local paths and over remote items
//! (via a computed virtual path), so inclusion decisions cannot drift
//! between the scanner and the reconciler.

use odmirror_core::config::FilterConfig;
use odmirror_core::ports::remote::RemoteItem;
use percent_encoding::percent_decode_str;

use crate::naming;
use crate::rules::SkipRules;
use crate::sync_list::{SyncList, SyncListDecision};

/// What kind of entry is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Symlink classification, computed by the caller (it requires I/O).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymlinkClass {
    #[default]
    NotSymlink,
    /// Symlink whose target exists.
    Resolvable,
    /// Dangling relative symlink whose target resolves when interpreted
    /// against the sync root.
    DanglingInsideRoot,
    /// Dangling symlink that cannot be resolved at all.
    DanglingOutsideRoot,
}

/// I/O-derived facts about a local entry, gathered by the scanner.
#[derive(Debug, Clone, Copy)]
pub struct EntryFacts {
    pub kind: EntryKind,
    pub size: u64,
    pub symlink: SymlinkClass,
    /// A `.nosync` marker exists in the entry's directory.
    pub nosync_marker: bool,
}

impl EntryFacts {
    pub fn file(size: u64) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            symlink: SymlinkClass::NotSymlink,
            nosync_marker: false,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            symlink: SymlinkClass::NotSymlink,
            nosync_marker: false,
        }
    }
}

/// Why an entry was excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExcludeReason {
    InvalidName(String),
    NosyncMarker,
    Dotfile,
    Symlink,
    DanglingSymlink,
    SkipDir(String),
    SkipFile(String),
    NotInSyncList,
    TooLarge { size: u64, limit: u64 },
}

impl std::fmt::Display for ExcludeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExcludeReason::InvalidName(r) => write!(f, "invalid name: {r}"),
            ExcludeReason::NosyncMarker => write!(f, ".nosync marker present"),
            ExcludeReason::Dotfile => write!(f, "dotfile"),
            ExcludeReason::Symlink => write!(f, "symlink"),
            ExcludeReason::DanglingSymlink => write!(f, "dangling symlink"),
            ExcludeReason::SkipDir(p) => write!(f, "matches skip_dir '{p}'"),
            ExcludeReason::SkipFile(p) => write!(f, "matches skip_file '{p}'"),
            ExcludeReason::NotInSyncList => write!(f, "not included by sync_list"),
            ExcludeReason::TooLarge { size, limit } => {
                write!(f, "size {size} exceeds skip_size limit {limit}")
            }
        }
    }
}

/// Outcome of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Include,
    Exclude(ExcludeReason),
}

impl Decision {
    pub fn is_include(&self) -> bool {
        matches!(self, Decision::Include)
    }
}

/// The compiled pipeline. Pure and side-effect free.
#[derive(Debug)]
pub struct FilterPipeline {
    skip: SkipRules,
    sync_list: SyncList,
    sync_root_files: bool,
}

impl FilterPipeline {
    pub fn from_config(filters: &FilterConfig, skip_size_bytes: Option<u64>) -> Result<Self, String> {
        Ok(Self {
            skip: SkipRules::compile(
                &filters.skip_dir,
                &filters.skip_file,
                filters.skip_dotfiles,
                filters.skip_symlinks,
                skip_size_bytes,
                filters.check_nosync,
            )?,
            sync_list: SyncList::compile(&filters.sync_list)?,
            sync_root_files: filters.sync_root_files,
        })
    }

    /// Evaluates a drive-relative path (`/A/b.txt`) with the given facts.
    pub fn evaluate(&self, path: &str, facts: &EntryFacts) -> Decision {
        let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);

        // 1. Remote naming rules, always on.
        if let Err(reason) = naming::validate_name(name) {
            return Decision::Exclude(ExcludeReason::InvalidName(reason));
        }

        // 2. Configured rules, in a stable order.
        if self.skip.check_nosync && facts.nosync_marker {
            return Decision::Exclude(ExcludeReason::NosyncMarker);
        }

        if self.skip.skip_dotfiles && SkipRules::is_dotfile(path) {
            return Decision::Exclude(ExcludeReason::Dotfile);
        }

        match facts.symlink {
            SymlinkClass::NotSymlink => {}
            SymlinkClass::DanglingOutsideRoot => {
                return Decision::Exclude(ExcludeReason::DanglingSymlink)
            }
            SymlinkClass::Resolvable | SymlinkClass::DanglingInsideRoot => {
                if self.skip.skip_symlinks {
                    return Decision::Exclude(ExcludeReason::Symlink);
                }
            }
        }

        match facts.kind {
            EntryKind::Directory => {
                if let Some(pattern) = self.skip.dir_excluded(path) {
                    return Decision::Exclude(ExcludeReason::SkipDir(pattern));
                }
            }
            EntryKind::File => {
                if let Some(pattern) = self.skip.file_excluded(path) {
                    return Decision::Exclude(ExcludeReason::SkipFile(pattern));
                }
            }
        }

        if !self.sync_list.is_empty() {
            let is_dir = facts.kind == EntryKind::Directory;
            let decision = self.sync_list.evaluate(path, is_dir);
            let root_file_pass = self.sync_root_files
                && facts.kind == EntryKind::File
                && !path.trim_start_matches('/').contains('/');
            match decision {
                SyncListDecision::Include => {}
                SyncListDecision::DescendOnly | SyncListDecision::Exclude => {
                    if !root_file_pass {
                        return Decision::Exclude(ExcludeReason::NotInSyncList);
                    }
                }
            }
        }

        if facts.kind == EntryKind::File {
            if let Some(limit) = self.skip.skip_size {
                if facts.size > limit {
                    return Decision::Exclude(ExcludeReason::TooLarge {
                        size: facts.size,
                        limit,
                    });
                }
            }
        }

        Decision::Include
    }

    /// Evaluates a remote item against the same rules, using a virtual
    /// path computed by the caller (parent chain from the store, or
    /// [`FilterPipeline::virtual_remote_path`]).
    pub fn evaluate_remote(&self, item: &RemoteItem, virtual_path: &str) -> Decision {
        let facts = EntryFacts {
            kind: if item.is_folder {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
            size: item.size.unwrap_or(0).max(0) as u64,
            symlink: SymlinkClass::NotSymlink,
            nosync_marker: false,
        };
        self.evaluate(virtual_path, &facts)
    }

    /// Whether the scanner must walk into an excluded directory because a
    /// sync-list rule could match below it.
    pub fn must_descend(&self, dir_path: &str) -> bool {
        !self.sync_list.is_empty()
            && self.sync_list.evaluate(dir_path, true) == SyncListDecision::DescendOnly
    }

    /// Computes the drive-relative virtual path of a remote item whose
    /// parent is not yet known locally, from its `parentReference.path`.
    ///
    /// Strips the `.../root:` drive prefix and percent-decodes the
    /// remainder.
    pub fn virtual_remote_path(item: &RemoteItem) -> Option<String> {
        let raw = item.parent.as_ref()?.path.as_deref()?;
        let after_colon = match raw.split_once(':') {
            Some((_, rest)) => rest,
            None => raw,
        };
        let decoded = percent_decode_str(after_colon)
            .decode_utf8()
            .ok()?
            .into_owned();
        let parent = decoded.trim_end_matches('/');
        if parent.is_empty() {
            Some(format!("/{}", item.name))
        } else {
            Some(format!("{parent}/{}", item.name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odmirror_core::ports::remote::{FileFacet, ParentRef};

    fn filters() -> FilterConfig {
        FilterConfig {
            skip_dir: vec!["node_modules".to_string()],
            skip_file: vec!["*.tmp".to_string()],
            sync_list: Vec::new(),
            skip_dotfiles: true,
            skip_symlinks: false,
            skip_size: 0,
            check_nosync: true,
            sync_root_files: false,
        }
    }

    fn pipeline(config: &FilterConfig, skip_size: Option<u64>) -> FilterPipeline {
        FilterPipeline::from_config(config, skip_size).unwrap()
    }

    mod local {
        use super::*;

        #[test]
        fn test_plain_file_included() {
            let p = pipeline(&filters(), None);
            assert!(p.evaluate("/A/report.txt", &EntryFacts::file(100)).is_include());
        }

        #[test]
        fn test_naming_rules_run_first() {
            let p = pipeline(&filters(), None);
            let d = p.evaluate("/A/bad:name.txt", &EntryFacts::file(1));
            assert!(matches!(d, Decision::Exclude(ExcludeReason::InvalidName(_))));
        }

        #[test]
        fn test_nosync_marker() {
            let p = pipeline(&filters(), None);
            let mut facts = EntryFacts::directory();
            facts.nosync_marker = true;
            assert_eq!(
                p.evaluate("/A/project", &facts),
                Decision::Exclude(ExcludeReason::NosyncMarker)
            );
        }

        #[test]
        fn test_dotfiles() {
            let p = pipeline(&filters(), None);
            assert_eq!(
                p.evaluate("/A/.env", &EntryFacts::file(10)),
                Decision::Exclude(ExcludeReason::Dotfile)
            );
        }

        #[test]
        fn test_symlink_classification() {
            let mut config = filters();
            config.skip_symlinks = true;
            let p = pipeline(&config, None);

            let mut facts = EntryFacts::file(1);
            facts.symlink = SymlinkClass::Resolvable;
            assert_eq!(
                p.evaluate("/A/link", &facts),
                Decision::Exclude(ExcludeReason::Symlink)
            );

            // Dangling-outside-root is rejected even without skip_symlinks.
            let permissive = pipeline(&filters(), None);
            facts.symlink = SymlinkClass::DanglingOutsideRoot;
            assert_eq!(
                permissive.evaluate("/A/link", &facts),
                Decision::Exclude(ExcludeReason::DanglingSymlink)
            );

            // Dangling-inside-root passes when symlinks are allowed.
            facts.symlink = SymlinkClass::DanglingInsideRoot;
            assert!(permissive.evaluate("/A/link", &facts).is_include());
        }

        #[test]
        fn test_skip_dir_and_file_patterns() {
            let p = pipeline(&filters(), None);
            assert!(matches!(
                p.evaluate("/web/node_modules", &EntryFacts::directory()),
                Decision::Exclude(ExcludeReason::SkipDir(_))
            ));
            assert!(matches!(
                p.evaluate("/A/build.tmp", &EntryFacts::file(5)),
                Decision::Exclude(ExcludeReason::SkipFile(_))
            ));
        }

        #[test]
        fn test_skip_size() {
            let p = pipeline(&filters(), Some(1024));
            assert!(p.evaluate("/A/small.bin", &EntryFacts::file(1024)).is_include());
            assert!(matches!(
                p.evaluate("/A/big.bin", &EntryFacts::file(1025)),
                Decision::Exclude(ExcludeReason::TooLarge { .. })
            ));
        }
    }

    mod with_sync_list {
        use super::*;

        fn config() -> FilterConfig {
            let mut c = filters();
            c.sync_list = vec!["/Documents/Work".to_string()];
            c
        }

        #[test]
        fn test_inclusion_and_exclusion() {
            let p = pipeline(&config(), None);
            assert!(p
                .evaluate("/Documents/Work/a.txt", &EntryFacts::file(1))
                .is_include());
            assert_eq!(
                p.evaluate("/Pictures/photo.jpg", &EntryFacts::file(1)),
                Decision::Exclude(ExcludeReason::NotInSyncList)
            );
        }

        #[test]
        fn test_must_descend_through_ancestors() {
            let p = pipeline(&config(), None);
            assert!(p.must_descend("/Documents"));
            assert!(!p.must_descend("/Pictures"));
        }

        #[test]
        fn test_anywhere_rule_descends_everywhere() {
            let mut c = filters();
            c.sync_list = vec!["Music".to_string()];
            let p = pipeline(&c, None);
            assert!(p.must_descend("/AnythingAtAll"));
        }

        #[test]
        fn test_sync_root_files() {
            let mut c = config();
            c.sync_root_files = true;
            let p = pipeline(&c, None);
            assert!(p.evaluate("/readme.txt", &EntryFacts::file(1)).is_include());
            assert_eq!(
                p.evaluate("/Pictures/photo.jpg", &EntryFacts::file(1)),
                Decision::Exclude(ExcludeReason::NotInSyncList)
            );
        }
    }

    mod remote {
        use super::*;

        fn remote_item(name: &str, parent_path: Option<&str>, folder: bool) -> RemoteItem {
            RemoteItem {
                id: "X".to_string(),
                name: name.to_string(),
                etag: None,
                ctag: None,
                size: Some(10),
                modified: None,
                parent: Some(ParentRef {
                    drive_id: Some("abcdef0123456789".to_string()),
                    id: Some("P".to_string()),
                    path: parent_path.map(|s| s.to_string()),
                }),
                file: if folder {
                    None
                } else {
                    Some(FileFacet::default())
                },
                is_folder: folder,
                is_root: false,
                deleted: false,
                malware: false,
                package_type: None,
                remote: None,
                created_by: None,
                modified_by: None,
                web_url: None,
            }
        }

        #[test]
        fn test_virtual_path_from_parent_reference() {
            let item = remote_item("c.txt", Some("/drive/root:/A/B"), false);
            assert_eq!(
                FilterPipeline::virtual_remote_path(&item),
                Some("/A/B/c.txt".to_string())
            );
        }

        #[test]
        fn test_virtual_path_at_root() {
            let item = remote_item("c.txt", Some("/drive/root:"), false);
            assert_eq!(
                FilterPipeline::virtual_remote_path(&item),
                Some("/c.txt".to_string())
            );
        }

        #[test]
        fn test_virtual_path_percent_decoding() {
            let item = remote_item("c.txt", Some("/drive/root:/My%20Files"), false);
            assert_eq!(
                FilterPipeline::virtual_remote_path(&item),
                Some("/My Files/c.txt".to_string())
            );
        }

        #[test]
        fn test_remote_item_through_pipeline() {
            let p = pipeline(&filters(), None);
            let item = remote_item("job.tmp", Some("/drive/root:/A"), false);
            let path = FilterPipeline::virtual_remote_path(&item).unwrap();
            assert!(matches!(
                p.evaluate_remote(&item, &path),
                Decision::Exclude(ExcludeReason::SkipFile(_))
            ));
        }
    }
}
