//! odmirror command-line interface.
//!
//! A flag-driven front end: the default invocation performs one sync
//! cycle; `--monitor` keeps running as a daemon; the link/metadata
//! one-shots bypass the engine entirely.
//!
//! Exit codes: 0 on a clean run; 1 on an unrecoverable state-integrity
//! error, quota exhaustion blocking required uploads, a big-delete
//! refusal without `--force`, or any per-file sync failures.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use odmirror_core::config::Config;
use odmirror_core::ports::notify::LogNotifier;
use odmirror_core::ports::remote::RemoteApi;
use odmirror_engine::{ops, SyncEngine};
use odmirror_graph::GraphClient;
use odmirror_store::{DatabasePool, SqliteItemStore};

#[derive(Debug, Parser)]
#[command(name = "odmirror", version, about = "Mirror a OneDrive-compatible drive to a local directory")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Plan and log without mutating disk, database or the remote drive.
    #[arg(long)]
    dry_run: bool,

    /// Only push local changes online.
    #[arg(long)]
    upload_only: bool,

    /// Only pull remote changes down.
    #[arg(long)]
    download_only: bool,

    /// With --download-only: delete local files the database does not track.
    #[arg(long, requires = "download_only")]
    cleanup_local_files: bool,

    /// With --upload-only: delete local files after their upload validates.
    #[arg(long, requires = "upload_only")]
    remove_source_files: bool,

    /// With --upload-only: never delete items online.
    #[arg(long)]
    no_remote_delete: bool,

    /// Drop the local state database and rebuild from a full enumeration.
    #[arg(long)]
    resync: bool,

    /// Restrict the run to one drive-relative directory.
    #[arg(long, value_name = "PATH")]
    single_directory: Option<String>,

    /// Override the big-delete safety guard.
    #[arg(long)]
    force: bool,

    /// Keep running, syncing on filesystem changes and a periodic timer.
    #[arg(long)]
    monitor: bool,

    /// Skip post-download hash validation.
    #[arg(long)]
    disable_download_validation: bool,

    /// Skip post-upload hash validation.
    #[arg(long)]
    disable_upload_validation: bool,

    /// Skip the safe-backup rename before overwriting local files.
    #[arg(long)]
    bypass_data_preservation: bool,

    /// Print the web URL of a remote file and exit.
    #[arg(long, value_name = "PATH")]
    get_file_link: Option<String>,

    /// Print who last modified a remote file and exit.
    #[arg(long, value_name = "PATH")]
    modified_by: Option<String>,

    /// Create a shareable link for a remote file and exit.
    #[arg(long, value_name = "PATH")]
    create_share_link: Option<String>,

    /// With --create-share-link: grant edit permissions.
    #[arg(long, requires = "create_share_link")]
    with_editing_perms: bool,

    /// With --create-share-link: protect the link with a password.
    #[arg(long, value_name = "PASSWORD", requires = "create_share_link")]
    share_password: Option<String>,

    /// List the drive ids of SharePoint document libraries matching a
    /// site search and exit.
    #[arg(long, value_name = "SITE")]
    get_sharepoint_drive_id: Option<String>,

    /// Move an item online: source path (requires --destination-directory).
    #[arg(long, value_name = "PATH", requires = "destination_directory")]
    source_directory: Option<String>,

    /// Online move destination path.
    #[arg(long, value_name = "PATH", requires = "source_directory")]
    destination_directory: Option<String>,
}

impl Cli {
    /// Overlays the command-line flags onto the loaded configuration.
    fn overlay(&self, config: &mut Config) {
        let mode = &mut config.mode;
        mode.dry_run |= self.dry_run;
        mode.upload_only |= self.upload_only;
        mode.download_only |= self.download_only;
        mode.cleanup_local_files |= self.cleanup_local_files;
        mode.remove_source_files |= self.remove_source_files;
        mode.resync |= self.resync;
        mode.force |= self.force;
        mode.monitor |= self.monitor;
        if self.single_directory.is_some() {
            mode.single_directory = self.single_directory.clone();
        }
        config.deletes.no_remote_delete |= self.no_remote_delete;
        config.transfers.disable_download_validation |= self.disable_download_validation;
        config.transfers.disable_upload_validation |= self.disable_upload_validation;
        config.transfers.bypass_data_preservation |= self.bypass_data_preservation;
    }
}

fn init_tracing(config: &Config, verbose: u8) {
    let level = match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Loads the access token from the environment or the token file the
/// authentication helper maintains. Credential acquisition itself lives
/// outside this binary.
fn load_access_token() -> anyhow::Result<String> {
    if let Ok(token) = std::env::var("ODMIRROR_ACCESS_TOKEN") {
        return Ok(token.trim().to_string());
    }
    let token_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("odmirror")
        .join("access_token");
    let token = std::fs::read_to_string(&token_path).with_context(|| {
        format!(
            "no access token: set ODMIRROR_ACCESS_TOKEN or place one at {}",
            token_path.display()
        )
    })?;
    Ok(token.trim().to_string())
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path);
    cli.overlay(&mut config);
    init_tracing(&config, cli.verbose);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!("configuration: {problem}");
        }
        return Ok(ExitCode::FAILURE);
    }

    let token = load_access_token()?;
    let client = GraphClient::from_config(token, &config)?;
    let api: Arc<dyn RemoteApi> = Arc::new(client.clone());

    // One-shot operations bypass the engine and the state database.
    if let Some(path) = &cli.get_file_link {
        println!("{}", ops::get_file_link(api.as_ref(), path).await?);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(path) = &cli.modified_by {
        println!("{}", ops::get_modified_by(api.as_ref(), path).await?);
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(path) = &cli.create_share_link {
        let url = ops::create_share_link(
            api.as_ref(),
            path,
            cli.with_editing_perms,
            cli.share_password.clone(),
        )
        .await?;
        println!("{url}");
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(site) = &cli.get_sharepoint_drive_id {
        for (library, drive_id) in ops::list_sharepoint_drive_ids(api.as_ref(), site).await? {
            println!("{library}\t{drive_id}");
        }
        return Ok(ExitCode::SUCCESS);
    }
    if let (Some(source), Some(destination)) =
        (&cli.source_directory, &cli.destination_directory)
    {
        ops::move_online(api.as_ref(), source, destination).await?;
        return Ok(ExitCode::SUCCESS);
    }

    // Full engine run.
    let db_path = config.data_dir().join("items.sqlite3");
    let db = DatabasePool::new(&db_path).await?;
    let store = Arc::new(SqliteItemStore::new(&db));

    let factory_client = client;
    let engine = SyncEngine::bootstrap(
        Arc::new(config.clone()),
        store,
        api,
        Arc::new(move || Arc::new(factory_client.clone()) as Arc<dyn RemoteApi>),
        Arc::new(LogNotifier),
    )
    .await?;

    // Ctrl-C requests a clean stop; workers finish their current file.
    let ctx = engine.context();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            ctx.cancel.cancel();
        }
    });

    if config.mode.monitor {
        engine.run_monitor(Duration::from_secs(300)).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let report = engine.run_cycle().await?;
    info!(
        downloaded = report.downloaded,
        uploaded = report.uploaded,
        deleted_local = report.deleted_local,
        deleted_remote = report.deleted_remote,
        "run finished"
    );
    for path in &report.posix_violations {
        warn!(%path, "blocked by case collision; rename the local item");
    }

    if report.sync_failures() {
        for (path, reason) in &report.failures {
            error!(%path, %reason, "sync failure");
        }
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_sync_flags() {
        let cli = Cli::parse_from([
            "odmirror",
            "--dry-run",
            "--upload-only",
            "--no-remote-delete",
            "--force",
        ]);
        assert!(cli.dry_run && cli.upload_only && cli.no_remote_delete && cli.force);
        assert!(!cli.monitor);
    }

    #[test]
    fn test_cleanup_requires_download_only() {
        assert!(Cli::try_parse_from(["odmirror", "--cleanup-local-files"]).is_err());
        assert!(Cli::try_parse_from([
            "odmirror",
            "--download-only",
            "--cleanup-local-files"
        ])
        .is_ok());
    }

    #[test]
    fn test_share_password_requires_share_link() {
        assert!(Cli::try_parse_from(["odmirror", "--share-password", "pw"]).is_err());
        assert!(Cli::try_parse_from([
            "odmirror",
            "--create-share-link",
            "/A/b.txt",
            "--share-password",
            "pw",
            "--with-editing-perms",
        ])
        .is_ok());
    }

    #[test]
    fn test_online_move_needs_both_ends() {
        assert!(Cli::try_parse_from(["odmirror", "--source-directory", "/A"]).is_err());
        assert!(Cli::try_parse_from([
            "odmirror",
            "--source-directory",
            "/A",
            "--destination-directory",
            "/B/A",
        ])
        .is_ok());
    }

    #[test]
    fn test_overlay_applies_flags() {
        let cli = Cli::parse_from([
            "odmirror",
            "--dry-run",
            "--single-directory",
            "Documents/Work",
            "--bypass-data-preservation",
        ]);
        let mut config = Config::default();
        cli.overlay(&mut config);
        assert!(config.mode.dry_run);
        assert_eq!(
            config.mode.single_directory.as_deref(),
            Some("Documents/Work")
        );
        assert!(config.transfers.bypass_data_preservation);
    }
}
