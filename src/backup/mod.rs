// walbackuptool/src/backup/mod.rs
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::command::{self, BARMAN_CLOUD_BACKUP};
use crate::config::AppConfig;
use crate::credentials;
use crate::runner::ProcessRunner;

/// Takes a base backup with barman-cloud-backup.
///
/// The physical streaming is entirely delegated to the binary; this
/// function only assembles its options and environment and interprets
/// the outcome.
pub async fn take(
    cancel: &CancellationToken,
    config: &AppConfig,
    backup_name: &str,
    runner: &Arc<dyn ProcessRunner>,
) -> Result<()> {
    let options = command::cloud_backup_options(&config.store, backup_name, &config.cluster_name);
    let env = credentials::environment_for_backup(config)?;

    info!(backup_name, ?options, "Starting barman-cloud-backup");

    match runner
        .run_streaming(BARMAN_CLOUD_BACKUP, &options, &env, cancel)
        .await
    {
        Ok(()) => Ok(()),
        Err(err) if err.exit_code() == Some(3) => {
            error!(?options, "barman-cloud-backup rejected its arguments");
            Err(err).context(
                "invalid arguments for barman-cloud-backup. \
                 Ensure that the additional_command_args field is correctly populated",
            )
        }
        Err(err) => {
            Err(err).with_context(|| format!("unexpected failure invoking {}", BARMAN_CLOUD_BACKUP))
        }
    }
}
