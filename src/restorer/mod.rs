// walbackuptool/src/restorer/mod.rs
//! Parallel WAL download through `barman-cloud-wal-restore`.
//!
//! PostgreSQL asks for one segment per `restore_command` invocation; the
//! restorer downloads it plus a speculative window of future segments
//! into the spool, so the following invocations can be served locally.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::BARMAN_CLOUD_WAL_RESTORE;
use crate::errors::{RunError, SpoolError, WalRestoreError};
use crate::runner::ProcessRunner;
use crate::spool::WalSpool;

const END_OF_WAL_STREAM_FLAG_FILENAME: &str = "end-of-wal-stream";

const EXIT_CODE_BUCKET_OR_WAL_NOT_FOUND: i32 = 1;
const EXIT_CODE_CONNECTIVITY_ERROR: i32 = 2;
const EXIT_CODE_INVALID_WAL_NAME: i32 = 3;
const EXIT_CODE_GENERIC: i32 = 4;

/// The outcome of restoring one WAL file.
#[derive(Debug)]
pub struct RestorerResult {
    /// The name of the WAL file to restore.
    pub wal_name: String,

    /// Where the restored WAL file was written.
    pub destination_path: String,

    /// Set if the restoration failed.
    pub err: Option<WalRestoreError>,

    /// When barman-cloud-wal-restore was started.
    pub start_time: DateTime<Utc>,

    /// When barman-cloud-wal-restore ended.
    pub end_time: DateTime<Utc>,
}

/// Downloads WAL files from the object store, serving cache hits from
/// the spool.
pub struct WalRestorer {
    spool: WalSpool,
    env: Vec<(String, String)>,
    runner: Arc<dyn ProcessRunner>,
}

impl WalRestorer {
    /// Creates a new WAL restorer, initialising its spool directory.
    pub fn new(
        env: Vec<(String, String)>,
        spool_directory: &Path,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<WalRestorer> {
        let spool = WalSpool::new(spool_directory).with_context(|| {
            format!(
                "while creating spool directory {}",
                spool_directory.display()
            )
        })?;

        Ok(WalRestorer { spool, env, runner })
    }

    /// Serves `wal_name` from the spool if it was prefetched, moving it
    /// to `destination_path`. A miss is reported as `Ok(false)`, not as
    /// an error.
    pub fn restore_from_spool(
        &self,
        wal_name: &str,
        destination_path: &Path,
    ) -> Result<bool, SpoolError> {
        match self.spool.move_out(wal_name, destination_path) {
            Ok(()) => Ok(true),
            Err(SpoolError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remembers that the archive has served its last WAL, so further
    /// prefetches can short-circuit. Idempotent.
    pub fn set_end_of_wal_stream(&self) -> Result<(), SpoolError> {
        if self.is_end_of_wal_stream()? {
            return Ok(());
        }

        self.spool.touch(END_OF_WAL_STREAM_FLAG_FILENAME)
    }

    /// Whether the end-of-wal-stream flag is present in the spool.
    pub fn is_end_of_wal_stream(&self) -> Result<bool, SpoolError> {
        self.spool.contains(END_OF_WAL_STREAM_FLAG_FILENAME)
    }

    /// Clears the end-of-wal-stream flag.
    pub fn reset_end_of_wal_stream(&self) -> Result<(), SpoolError> {
        self.spool.remove(END_OF_WAL_STREAM_FLAG_FILENAME)
    }

    /// Restores a list of WAL files in parallel.
    ///
    /// Index 0 is the segment PostgreSQL demanded and goes straight to
    /// `destination_path`; every other index is a speculative prefetch
    /// adopted by the spool. Result slot `i` always corresponds to
    /// `fetch_list[i]`.
    pub async fn restore_list(
        &self,
        cancel: &CancellationToken,
        fetch_list: &[String],
        destination_path: &str,
        options: &[String],
    ) -> Vec<RestorerResult> {
        let mut join_set = JoinSet::new();

        for (index, wal_name) in fetch_list.iter().enumerate() {
            let destination = if index == 0 {
                destination_path.to_string()
            } else {
                self.spool.file_name(wal_name).display().to_string()
            };

            let env = self.env.clone();
            let runner = Arc::clone(&self.runner);
            let options = options.to_vec();
            let wal_name = wal_name.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let start_time = Utc::now();
                let err = restore(&runner, &env, &wal_name, &destination, &options, &cancel)
                    .await
                    .err();
                let end_time = Utc::now();

                log_restore_outcome(index, &wal_name, &err, start_time, end_time);

                (
                    index,
                    RestorerResult {
                        wal_name,
                        destination_path: destination,
                        err,
                        start_time,
                        end_time,
                    },
                )
            });
        }

        let mut slots: Vec<Option<RestorerResult>> = fetch_list.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_err) => warn!(error = %join_err, "a restore task aborted"),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| RestorerResult {
                    wal_name: fetch_list[index].clone(),
                    destination_path: String::new(),
                    err: Some(WalRestoreError::Run(RunError::Terminated {
                        command: BARMAN_CLOUD_WAL_RESTORE.to_string(),
                    })),
                    start_time: Utc::now(),
                    end_time: Utc::now(),
                })
            })
            .collect()
    }

    /// Restores one WAL file from the object store into
    /// `destination_path`.
    pub async fn restore(
        &self,
        cancel: &CancellationToken,
        wal_name: &str,
        destination_path: &str,
        options: &[String],
    ) -> Result<(), WalRestoreError> {
        restore(
            &self.runner,
            &self.env,
            wal_name,
            destination_path,
            options,
            cancel,
        )
        .await
    }

    /// Path the spool would give to a prefetched `wal_name`.
    pub fn spool_file_name(&self, wal_name: &str) -> PathBuf {
        self.spool.file_name(wal_name)
    }
}

async fn restore(
    runner: &Arc<dyn ProcessRunner>,
    env: &[(String, String)],
    wal_name: &str,
    destination_path: &str,
    base_options: &[String],
    cancel: &CancellationToken,
) -> Result<(), WalRestoreError> {
    if base_options.len() >= usize::MAX - 2 {
        return Err(WalRestoreError::Generic);
    }
    let mut options = Vec::with_capacity(base_options.len() + 2);
    options.extend_from_slice(base_options);
    options.push(wal_name.to_string());
    options.push(destination_path.to_string());

    match runner
        .run_streaming(BARMAN_CLOUD_WAL_RESTORE, &options, env, cancel)
        .await
    {
        Ok(()) => Ok(()),
        Err(err) => Err(map_restore_error(wal_name, err)),
    }
}

/// Maps the restore binary outcome onto the error taxonomy. The exit
/// codes come from barman's own test suite and are relied upon by ours.
fn map_restore_error(wal_name: &str, err: RunError) -> WalRestoreError {
    let Some(code) = err.exit_code() else {
        return WalRestoreError::Run(err);
    };

    match code {
        EXIT_CODE_BUCKET_OR_WAL_NOT_FOUND => WalRestoreError::WalNotFound(wal_name.to_string()),
        EXIT_CODE_CONNECTIVITY_ERROR => WalRestoreError::Connectivity,
        EXIT_CODE_INVALID_WAL_NAME => WalRestoreError::InvalidWalName(wal_name.to_string()),
        EXIT_CODE_GENERIC => WalRestoreError::Generic,
        other => WalRestoreError::Unrecognized(other),
    }
}

/// Only the WAL PostgreSQL demanded (index 0) affects user-visible
/// logs; prefetch misses are speculative and stay at debug level. A
/// not-found on index 0 is informational too, since it is the normal
/// end-of-archive signal.
fn log_restore_outcome(
    index: usize,
    wal_name: &str,
    err: &Option<WalRestoreError>,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) {
    let elapsed = end_time - start_time;
    match err {
        None => info!(
            wal_name,
            %start_time,
            %end_time,
            elapsed = %elapsed,
            "Restored WAL file"
        ),
        Some(err) if index > 0 => {
            debug!(wal_name, error = %err, "Speculative WAL prefetch failed")
        }
        Some(err) if err.is_wal_not_found() => info!(
            wal_name,
            %start_time,
            %end_time,
            elapsed = %elapsed,
            "WAL file not found in the recovery object store"
        ),
        Some(err) => warn!(
            wal_name,
            %start_time,
            %end_time,
            elapsed = %elapsed,
            error = %err,
            "Failed restoring WAL file (Postgres might retry)"
        ),
    }
}
