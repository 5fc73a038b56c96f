// walbackuptool/src/archiver/mod.rs
//! Parallel WAL upload through `barman-cloud-wal-archive`.
//!
//! PostgreSQL archives one segment per `archive_command` invocation; the
//! archiver turns that single request into a bounded batch by also
//! uploading the next `.ready` segments, and marks the extra ones in the
//! spool so the following invocations are served without touching the
//! object store.

mod fadvise;
mod gather;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::command::{BARMAN_CLOUD_CHECK_WAL_ARCHIVE, BARMAN_CLOUD_WAL_ARCHIVE};
use crate::errors::SpoolError;
use crate::runner::ProcessRunner;
use crate::spool::WalSpool;

/// Flag file in PGDATA whose presence means the bucket is believed
/// empty and the destination precheck must still run.
pub const CHECK_EMPTY_WAL_ARCHIVE_FILE: &str = ".check-empty-wal-archive";

/// The outcome of archiving one WAL file.
#[derive(Debug)]
pub struct WalArchiverResult {
    /// The WAL that has been archived.
    pub wal_name: String,

    /// Set if the archival failed.
    pub err: Option<anyhow::Error>,

    /// When barman-cloud-wal-archive was started.
    pub start_time: DateTime<Utc>,

    /// When barman-cloud-wal-archive ended.
    pub end_time: DateTime<Utc>,
}

/// Uploads batches of WAL files to the object store, keeping the spool
/// in sync.
pub struct WalArchiver {
    spool: WalSpool,
    env: Vec<(String, String)>,
    pg_data_directory: PathBuf,
    runner: Arc<dyn ProcessRunner>,
}

impl WalArchiver {
    /// Creates a new WAL archiver, initialising its spool directory.
    pub fn new(
        env: Vec<(String, String)>,
        spool_directory: &Path,
        pg_data_directory: &Path,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<WalArchiver> {
        let spool = WalSpool::new(spool_directory).with_context(|| {
            format!(
                "while creating spool directory {}",
                spool_directory.display()
            )
        })?;

        Ok(WalArchiver {
            spool,
            env,
            pg_data_directory: pg_data_directory.to_path_buf(),
            runner,
        })
    }

    /// If `wal_name` was already uploaded by a previous batch, drop its
    /// spool entry and report true: the segment needs no new upload.
    ///
    /// This assumes at most one `archive_command` in flight, which
    /// PostgreSQL guarantees by calling it sequentially.
    pub fn delete_from_spool(&self, wal_name: &str) -> Result<bool, SpoolError> {
        if !self.spool.contains(wal_name)? {
            return Ok(false);
        }

        self.spool.remove(wal_name)?;
        Ok(true)
    }

    /// Archives a list of WAL files in parallel, one upload task per
    /// entry.
    ///
    /// Result slot `i` always corresponds to `wal_names[i]`. Index 0 is
    /// the segment PostgreSQL asked for and is never recorded in the
    /// spool; all other indices are speculative and get a spool entry on
    /// success. A failed spool mark replaces the success, so the
    /// segment is retried rather than silently lost.
    pub async fn archive_list(
        &self,
        cancel: &CancellationToken,
        wal_names: &[String],
        options: &[String],
    ) -> Vec<WalArchiverResult> {
        let mut join_set = JoinSet::new();

        for (index, wal_name) in wal_names.iter().enumerate() {
            let spool = self.spool.clone();
            let env = self.env.clone();
            let runner = Arc::clone(&self.runner);
            let pg_data_directory = self.pg_data_directory.clone();
            let options = options.to_vec();
            let wal_name = wal_name.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let start_time = Utc::now();
                let mut err = archive(
                    runner.as_ref(),
                    &env,
                    &pg_data_directory,
                    &wal_name,
                    &options,
                    &cancel,
                )
                .await
                .err();
                let end_time = Utc::now();

                if err.is_none() && index != 0 {
                    err = spool.touch(&wal_name).err().map(anyhow::Error::from);
                }

                let elapsed = end_time - start_time;
                match &err {
                    Some(err) => info!(
                        wal_name = %wal_name,
                        %start_time,
                        %end_time,
                        elapsed = %elapsed,
                        error = %err,
                        "Failed archiving WAL: PostgreSQL will retry"
                    ),
                    None => info!(
                        wal_name = %wal_name,
                        %start_time,
                        %end_time,
                        elapsed = %elapsed,
                        "Archived WAL file"
                    ),
                }

                (
                    index,
                    WalArchiverResult {
                        wal_name,
                        err,
                        start_time,
                        end_time,
                    },
                )
            });
        }

        let mut slots: Vec<Option<WalArchiverResult>> =
            wal_names.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_err) => warn!(error = %join_err, "an archive task aborted"),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| WalArchiverResult {
                    wal_name: wal_names[index].clone(),
                    err: Some(anyhow::anyhow!("the archive task aborted")),
                    start_time: Utc::now(),
                    end_time: Utc::now(),
                })
            })
            .collect()
    }

    /// Checks that the destination object store is safe for first-time
    /// archival: the check binary fails when the bucket already holds
    /// WALs of another server.
    ///
    /// Called from the single-threaded init path, before the very first
    /// upload against a bucket.
    pub async fn check_wal_archive_destination(
        &self,
        cancel: &CancellationToken,
        options: &[String],
    ) -> Result<()> {
        info!("barman-cloud-check-wal-archive checking the first wal");

        self.runner
            .run_streaming(BARMAN_CLOUD_CHECK_WAL_ARCHIVE, options, &self.env, cancel)
            .await
            .with_context(|| {
                format!("unexpected failure invoking {}", BARMAN_CLOUD_CHECK_WAL_ARCHIVE)
            })?;

        info!("barman-cloud-check-wal-archive command execution completed");
        Ok(())
    }

    /// True while the first-archival precheck still has to run.
    pub fn must_check_destination(&self) -> bool {
        self.pg_data_directory
            .join(CHECK_EMPTY_WAL_ARCHIVE_FILE)
            .exists()
    }
}

/// Archives one WAL file using barman-cloud-wal-archive.
async fn archive(
    runner: &dyn ProcessRunner,
    env: &[(String, String)],
    pg_data_directory: &Path,
    wal_name: &str,
    base_options: &[String],
    cancel: &CancellationToken,
) -> Result<()> {
    if base_options.len() >= usize::MAX - 1 {
        anyhow::bail!("can't archive wal file {}, options too long", wal_name);
    }
    let mut options = Vec::with_capacity(base_options.len() + 1);
    options.extend_from_slice(base_options);
    options.push(wal_name.to_string());

    info!(wal_name, "Executing {}", BARMAN_CLOUD_WAL_ARCHIVE);

    runner
        .run_streaming(BARMAN_CLOUD_WAL_ARCHIVE, &options, env, cancel)
        .await
        .with_context(|| format!("unexpected failure invoking {}", BARMAN_CLOUD_WAL_ARCHIVE))?;

    // The upload already succeeded; the advisory must not undo that.
    if let Err(err) = fadvise::dont_need(&resolve_wal_path(pg_data_directory, wal_name)) {
        warn!(wal_name, error = %err, "Failed to advise the page cache about an archived WAL");
    }

    // The first successful archival proves the bucket is usable, so the
    // precheck never has to run again.
    remove_empty_archive_flag(pg_data_directory)?;

    Ok(())
}

/// The requested WAL usually arrives as `pg_wal/<name>`, relative to
/// PGDATA; prefetched entries are already absolute.
fn resolve_wal_path(pg_data_directory: &Path, wal_name: &str) -> PathBuf {
    let path = Path::new(wal_name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        pg_data_directory.join(path)
    }
}

fn remove_empty_archive_flag(pg_data_directory: &Path) -> Result<()> {
    let flag = pg_data_directory.join(CHECK_EMPTY_WAL_ARCHIVE_FILE);
    match std::fs::remove_file(&flag) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("while removing {}", flag.display())),
    }
}
