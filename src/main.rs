//! WAL archive/restore sidecar for PostgreSQL
//!
//! Provides the CLI dispatched from PostgreSQL's archive_command and
//! restore_command, plus an operator-triggered base backup entry point.

// walbackuptool/src/main.rs
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use walbackuptool::archiver::WalArchiver;
use walbackuptool::backup;
use walbackuptool::command;
use walbackuptool::config::AppConfig;
use walbackuptool::credentials;
use walbackuptool::restorer::WalRestorer;
use walbackuptool::runner::{ProcessRunner, StreamingRunner};

/// Main entry point for the WAL archive/restore sidecar
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // Expects the config next to the executable or at the path given in
    // WALBACKUPTOOL_CONFIG, the way PostgreSQL invokes us.
    let config_path = PathBuf::from(
        env::var("WALBACKUPTOOL_CONFIG").unwrap_or_else(|_| "config.json".to_string()),
    );
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let cancel = cancellation_on_shutdown_signals();
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("wal-archive") => {
            let wal_path = args
                .get(2)
                .context("Usage: walbackuptool wal-archive <wal-path>")?;
            run_wal_archive(&app_config, wal_path, &cancel)
                .await
                .context("WAL archive process failed")?;
        }
        Some("wal-restore") => {
            let (wal_name, destination) = match (args.get(2), args.get(3)) {
                (Some(wal), Some(dest)) => (wal, dest),
                _ => anyhow::bail!("Usage: walbackuptool wal-restore <wal-name> <destination>"),
            };
            run_wal_restore(&app_config, wal_name, destination, &cancel)
                .await
                .context("WAL restore process failed")?;
        }
        Some("backup") => {
            let backup_name = args
                .get(2)
                .context("Usage: walbackuptool backup <backup-name>")?;
            let runner = Arc::new(StreamingRunner) as Arc<dyn ProcessRunner>;
            backup::take(&cancel, &app_config, backup_name, &runner)
                .await
                .context("Backup process failed")?;
        }
        _ => {
            anyhow::bail!(
                "Invalid choice. Please use 'wal-archive', 'wal-restore' or 'backup'."
            );
        }
    }
    Ok(())
}

/// Archives the WAL file PostgreSQL asked for, plus a window of `.ready`
/// segments uploaded concurrently and remembered in the spool.
async fn run_wal_archive(
    config: &AppConfig,
    wal_path: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    find_barman_executable(command::BARMAN_CLOUD_WAL_ARCHIVE)?;
    let env = credentials::environment_for_backup(config)?;
    let runner = Arc::new(StreamingRunner) as Arc<dyn ProcessRunner>;
    let archiver = WalArchiver::new(
        env,
        &config.spool_directory,
        &config.pg_data_directory,
        runner,
    )?;

    let wal_name = base_wal_name(wal_path)?;

    // A segment uploaded by a previous batch only needs its spool entry
    // dropped: reporting success here completes the archive_command.
    if archiver.delete_from_spool(wal_name)? {
        info!(wal_name, "WAL was already archived by a previous batch");
        return Ok(());
    }

    if archiver.must_check_destination() {
        let options = command::cloud_check_wal_archive_options(&config.store, &config.cluster_name);
        archiver
            .check_wal_archive_destination(cancel, &options)
            .await
            .context("the object store is not safe for first-time WAL archival")?;
    }

    let requested = resolve_wal_path(&config.pg_data_directory, wal_path);
    let wal_list = archiver.gather_wal_files_to_archive(&requested, config.parallel_wal_jobs);
    let options = command::cloud_wal_archive_options(&config.store, &config.cluster_name);

    let mut results = archiver.archive_list(cancel, &wal_list, &options).await;

    // Only the requested WAL decides the archive_command outcome; the
    // speculative ones will be retried by PostgreSQL if they failed.
    let requested_result = results.swap_remove(0);
    match requested_result.err {
        Some(err) => Err(err.context(format!("while archiving {}", requested_result.wal_name))),
        None => Ok(()),
    }
}

/// Restores the requested WAL into the destination chosen by
/// PostgreSQL, serving it from the spool when it was prefetched.
async fn run_wal_restore(
    config: &AppConfig,
    wal_path: &str,
    destination: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    find_barman_executable(command::BARMAN_CLOUD_WAL_RESTORE)?;
    let env = credentials::environment_for_restore(config)?;
    let runner = Arc::new(StreamingRunner) as Arc<dyn ProcessRunner>;
    let restorer = WalRestorer::new(env, &config.spool_directory, runner)?;

    let wal_name = base_wal_name(wal_path)?;

    if restorer.restore_from_spool(wal_name, Path::new(destination))? {
        info!(wal_name, destination, "Restored WAL file from the spool");
        return Ok(());
    }

    // The recovery driver recorded that the archive is exhausted: fail
    // fast once instead of asking the object store again.
    if restorer.is_end_of_wal_stream()? {
        restorer.reset_end_of_wal_stream()?;
        anyhow::bail!(
            "WAL {} is past the end of the WAL stream served by the archive",
            wal_name
        );
    }

    let options = command::cloud_wal_restore_options(&config.store, &config.cluster_name);
    let fetch_list = vec![wal_name.to_string()];
    let mut results = restorer
        .restore_list(cancel, &fetch_list, destination, &options)
        .await;

    match results.swap_remove(0).err {
        Some(err) => Err(err).context(format!("while restoring {}", wal_name)),
        None => Ok(()),
    }
}

/// Checks the barman binary is reachable before doing any work.
fn find_barman_executable(name: &str) -> Result<PathBuf> {
    which::which(name).context(format!(
        "{} executable not found in PATH. Please ensure barman-cli-cloud is installed and in your PATH.",
        name
    ))
}

/// WAL paths arrive as `pg_wal/<name>` (or absolute); spool entries and
/// log lines use the bare segment name.
fn base_wal_name(wal_path: &str) -> Result<&str> {
    Path::new(wal_path)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .with_context(|| format!("invalid WAL path: {}", wal_path))
}

fn resolve_wal_path(pg_data_directory: &Path, wal_path: &str) -> String {
    let path = Path::new(wal_path);
    if path.is_absolute() {
        wal_path.to_string()
    } else {
        pg_data_directory.join(path).display().to_string()
    }
}

/// PostgreSQL stops its archive and restore commands with SIGTERM on
/// shutdown; both that and Ctrl-C cancel the in-flight child processes.
fn cancellation_on_shutdown_signals() -> CancellationToken {
    let cancel = CancellationToken::new();

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => return,
        };
        tokio::select! {
            _ = sigterm.recv() => (),
            _ = tokio::signal::ctrl_c() => (),
        }
        on_signal.cancel();
    });

    cancel
}
