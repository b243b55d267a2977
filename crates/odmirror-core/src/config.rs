//! Configuration for odmirror.
//!
//! One immutable [`Config`] consolidates every knob the engine consumes,
//! grouped into typed sub-sections that map to the YAML configuration
//! file. CLI flags overlay the file through [`RunMode`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Order in which queued transfers are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOrder {
    /// Filesystem / discovery order.
    #[default]
    Default,
    NameAsc,
    NameDsc,
    SizeAsc,
    SizeDsc,
}

impl std::str::FromStr for TransferOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(TransferOrder::Default),
            "name_asc" => Ok(TransferOrder::NameAsc),
            "name_dsc" => Ok(TransferOrder::NameDsc),
            "size_asc" => Ok(TransferOrder::SizeAsc),
            "size_dsc" => Ok(TransferOrder::SizeDsc),
            other => Err(format!("unknown transfer order '{other}'")),
        }
    }
}

/// National-cloud deployment the account lives in. The sovereign clouds do
/// not implement the native change feed, forcing the simulated mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AzureEndpoint {
    #[default]
    #[serde(rename = "global")]
    Global,
    #[serde(rename = "USL4")]
    UsL4,
    #[serde(rename = "USL5")]
    UsL5,
    #[serde(rename = "DE")]
    Germany,
    #[serde(rename = "CN")]
    China,
}

impl AzureEndpoint {
    /// Whether `listChanges` is available on this deployment.
    pub fn supports_native_delta(&self) -> bool {
        matches!(self, AzureEndpoint::Global)
    }

    /// Graph API base URL for the deployment.
    pub fn graph_base_url(&self) -> &'static str {
        match self {
            AzureEndpoint::Global => "https://graph.microsoft.com/v1.0",
            AzureEndpoint::UsL4 => "https://graph.microsoft.us/v1.0",
            AzureEndpoint::UsL5 => "https://dod-graph.microsoft.us/v1.0",
            AzureEndpoint::Germany => "https://graph.microsoft.de/v1.0",
            AzureEndpoint::China => "https://microsoftgraph.chinacloudapi.cn/v1.0",
        }
    }
}

/// Transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Upload-session fragment size in MiB. Rounded to a 320 KiB multiple
    /// and capped below 60 MiB at use.
    pub file_fragment_size: u64,
    /// Always use upload sessions, even for small files.
    pub force_session_upload: bool,
    pub transfer_order: TransferOrder,
    /// Local free-space floor kept when accepting downloads, in MiB.
    pub space_reservation: u64,
    pub disable_download_validation: bool,
    pub disable_upload_validation: bool,
    /// On post-upload hash mismatch, mint a new online version instead of
    /// re-downloading the remote copy.
    pub create_new_file_version: bool,
    /// Stamp `user.onedrive.createdBy` / `user.onedrive.lastModifiedBy`
    /// xattrs on downloaded files.
    pub write_xattr_data: bool,
    /// Surface per-file actions through the notification sink.
    pub notify_file_actions: bool,
    /// Optional transfer-rate ceiling in bytes per second (0 = unlimited).
    pub rate_limit: u64,
    /// Skip the safe-backup rename before overwriting divergent local
    /// files. Data in the overwritten copy is lost.
    pub bypass_data_preservation: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            file_fragment_size: 10,
            force_session_upload: false,
            transfer_order: TransferOrder::Default,
            space_reservation: 50,
            disable_download_validation: false,
            disable_upload_validation: false,
            create_new_file_version: false,
            write_xattr_data: false,
            notify_file_actions: false,
            rate_limit: 0,
            bypass_data_preservation: false,
        }
    }
}

/// Client-side filtering rules (see `odmirror-filter`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Glob patterns excluding directories.
    pub skip_dir: Vec<String>,
    /// Glob patterns excluding files.
    pub skip_file: Vec<String>,
    /// Inclusion list; when non-empty, paths must match to sync.
    pub sync_list: Vec<String>,
    pub skip_dotfiles: bool,
    pub skip_symlinks: bool,
    /// Skip files larger than this many MiB (0 = no limit).
    pub skip_size: u64,
    /// A `.nosync` marker file excludes its directory.
    pub check_nosync: bool,
    /// With a sync_list, still sync files sitting directly in the root.
    pub sync_root_files: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            skip_dir: Vec::new(),
            skip_file: vec![
                "~*".to_string(),
                ".~*".to_string(),
                "*.tmp".to_string(),
                "*.swp".to_string(),
                "*.partial".to_string(),
            ],
            sync_list: Vec::new(),
            skip_dotfiles: false,
            skip_symlinks: false,
            skip_size: 0,
            check_nosync: false,
            sync_root_files: false,
        }
    }
}

/// Deletion safety and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteConfig {
    /// Queued remote deletions at or above this count abort the cycle
    /// unless `--force` is given.
    pub classify_as_big_delete: usize,
    /// Move locally deleted files to the FreeDesktop trash instead of
    /// unlinking.
    pub use_recycle_bin: bool,
    /// Bypass the online recycle bin where the deployment allows it.
    pub permanent_delete: bool,
    /// Suppress remote deletions entirely (`--upload-only --no-remote-delete`).
    pub no_remote_delete: bool,
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            classify_as_big_delete: 1000,
            use_recycle_bin: true,
            permanent_delete: false,
            no_remote_delete: false,
        }
    }
}

/// Shared-folder handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// Materialise ties for business shared folders.
    pub sync_business_shared_items: bool,
    /// Also sync individually shared files.
    pub sync_business_shared_files: bool,
}

/// Remote endpoint tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub azure_ad_endpoint: AzureEndpoint,
    /// Pin the HTTP client to HTTP/1.1.
    pub force_http_11: bool,
    /// Use children enumeration instead of the change feed even where the
    /// feed is available.
    pub force_children_scan: bool,
}

/// Mode flags overlaid from the command line for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMode {
    /// Plan and log, but mutate nothing (disk, DB or remote).
    pub dry_run: bool,
    pub upload_only: bool,
    pub download_only: bool,
    /// With `download_only`: delete local entries the store does not know.
    pub cleanup_local_files: bool,
    /// With `upload_only`: remove local files after a validated upload.
    pub remove_source_files: bool,
    /// Drop the state database and rebuild from a full enumeration.
    pub resync: bool,
    /// Restrict the run to one drive-relative directory.
    pub single_directory: Option<String>,
    /// Override the big-delete guard.
    pub force: bool,
    /// Keep running, consuming filesystem events between cycles.
    pub monitor: bool,
}

/// Logging bootstrap options, consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace` | `debug` | `info` | `warn` | `error`.
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the local mirror.
    pub sync_dir: PathBuf,
    /// Override for the state directory (database and transfer
    /// descriptors); defaults to the XDG data directory.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Transfer worker count.
    pub threads: usize,
    #[serde(default)]
    pub transfers: TransferConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub deletes: DeleteConfig,
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("OneDrive"),
            state_dir: None,
            threads: 8,
            transfers: TransferConfig::default(),
            filters: FilterConfig::default(),
            deletes: DeleteConfig::default(),
            shared: SharedConfig::default(),
            remote: RemoteConfig::default(),
            mode: RunMode::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file,
    /// typically `$XDG_CONFIG_HOME/odmirror/config.yaml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("odmirror")
            .join("config.yaml")
    }

    /// Directory holding the state database and the transient
    /// `session_upload.*` / `resume_download.*` descriptors.
    pub fn data_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("odmirror")
        })
    }

    /// Upload-session threshold in bytes: files at or below it go through
    /// the single-PUT path unless sessions are forced.
    pub fn session_threshold_bytes(&self) -> u64 {
        4 * 1024 * 1024
    }

    /// Space reservation in bytes.
    pub fn space_reservation_bytes(&self) -> u64 {
        self.transfers.space_reservation * 1024 * 1024
    }

    /// Skip-size threshold in bytes, `None` when unlimited.
    pub fn skip_size_bytes(&self) -> Option<u64> {
        match self.filters.skip_size {
            0 => None,
            mib => Some(mib * 1024 * 1024),
        }
    }

    /// Validates the configuration, returning each problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.threads == 0 {
            problems.push("threads must be at least 1".to_string());
        }
        if self.transfers.file_fragment_size == 0 {
            problems.push("transfers.file_fragment_size must be at least 1 MiB".to_string());
        }
        if self.transfers.file_fragment_size >= 60 {
            problems.push("transfers.file_fragment_size must be below 60 MiB".to_string());
        }
        if self.deletes.classify_as_big_delete == 0 {
            problems.push("deletes.classify_as_big_delete must be at least 1".to_string());
        }
        if self.mode.upload_only && self.mode.download_only {
            problems.push("upload_only and download_only are mutually exclusive".to_string());
        }
        if self.mode.cleanup_local_files && !self.mode.download_only {
            problems.push("cleanup_local_files requires download_only".to_string());
        }
        if self.mode.remove_source_files && !self.mode.upload_only {
            problems.push("remove_source_files requires upload_only".to_string());
        }

        problems
    }

    /// Whether this run must use the simulated change feed.
    pub fn wants_simulated_delta(&self) -> bool {
        !self.remote.azure_ad_endpoint.supports_native_delta()
            || self.remote.force_children_scan
            || self.mode.single_directory.is_some()
            || (self.mode.download_only && self.mode.cleanup_local_files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.threads, 8);
        assert_eq!(config.transfers.file_fragment_size, 10);
        assert_eq!(config.deletes.classify_as_big_delete, 1000);
        assert!(config.deletes.use_recycle_bin);
        assert_eq!(config.session_threshold_bytes(), 4 * 1024 * 1024);
        assert_eq!(config.space_reservation_bytes(), 50 * 1024 * 1024);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_skip_size_conversion() {
        let mut config = Config::default();
        assert_eq!(config.skip_size_bytes(), None);
        config.filters.skip_size = 2;
        assert_eq!(config.skip_size_bytes(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn test_validation_catches_conflicts() {
        let mut config = Config::default();
        config.mode.upload_only = true;
        config.mode.download_only = true;
        config.threads = 0;
        let problems = config.validate();
        assert!(problems.iter().any(|p| p.contains("mutually exclusive")));
        assert!(problems.iter().any(|p| p.contains("threads")));
    }

    #[test]
    fn test_simulated_delta_selection() {
        let mut config = Config::default();
        assert!(!config.wants_simulated_delta());

        config.remote.azure_ad_endpoint = AzureEndpoint::Germany;
        assert!(config.wants_simulated_delta());

        config.remote.azure_ad_endpoint = AzureEndpoint::Global;
        config.mode.single_directory = Some("Documents/Work".to_string());
        assert!(config.wants_simulated_delta());

        config.mode.single_directory = None;
        config.mode.download_only = true;
        config.mode.cleanup_local_files = true;
        assert!(config.wants_simulated_delta());
    }

    #[test]
    fn test_endpoint_urls() {
        assert!(AzureEndpoint::Global.supports_native_delta());
        assert!(!AzureEndpoint::China.supports_native_delta());
        assert!(AzureEndpoint::UsL5.graph_base_url().contains("dod-graph"));
    }

    #[test]
    fn test_transfer_order_parsing() {
        assert_eq!(
            TransferOrder::from_str("size_dsc").unwrap(),
            TransferOrder::SizeDsc
        );
        assert!(TransferOrder::from_str("alphabetical").is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
sync_dir: /home/user/OneDrive
threads: 4
transfers:
  file_fragment_size: 20
  force_session_upload: true
  transfer_order: size_asc
  space_reservation: 100
  disable_download_validation: false
  disable_upload_validation: false
  create_new_file_version: false
  write_xattr_data: true
  notify_file_actions: false
  rate_limit: 0
filters:
  skip_dir: ["node_modules"]
  skip_file: ["*.tmp"]
  sync_list: []
  skip_dotfiles: true
  skip_symlinks: false
  skip_size: 0
  check_nosync: true
  sync_root_files: false
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.transfers.file_fragment_size, 20);
        assert_eq!(config.transfers.transfer_order, TransferOrder::SizeAsc);
        assert!(config.filters.skip_dotfiles);
        assert_eq!(config.filters.skip_dir, vec!["node_modules".to_string()]);
        // Sections absent from the file take defaults.
        assert_eq!(config.deletes.classify_as_big_delete, 1000);
    }
}
