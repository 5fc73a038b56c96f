// walbackuptool/src/spool/mod.rs
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::SpoolError;

/// A filesystem-backed set of WAL names, used as a deduplication buffer
/// between PostgreSQL's per-segment callbacks and the parallel
/// uploader/downloader.
///
/// The spool directory is owned exclusively by this sidecar. Entries are
/// keyed by the WAL file name: an empty flag file marks a segment as
/// already archived, while a full file is a prefetched segment waiting to
/// be adopted by PostgreSQL. The spool is a cache and is not expected to
/// survive pod restarts.
#[derive(Debug, Clone)]
pub struct WalSpool {
    spool_directory: PathBuf,
}

impl WalSpool {
    /// Creates a new spool rooted at `spool_directory`, creating the
    /// directory if needed.
    pub fn new(spool_directory: &Path) -> Result<WalSpool, SpoolError> {
        fs::create_dir_all(spool_directory)?;
        Ok(WalSpool {
            spool_directory: spool_directory.to_path_buf(),
        })
    }

    /// Returns the path a spool entry for `wal_name` would have. Pure,
    /// no filesystem access.
    ///
    /// Only the base name of `wal_name` is used, so passing
    /// `pg_wal/000000010000000000000001` and the bare segment name are
    /// equivalent.
    pub fn file_name(&self, wal_name: &str) -> PathBuf {
        self.spool_directory.join(base_name(wal_name))
    }

    /// Reports whether a file named `wal_name` is in the spool.
    pub fn contains(&self, wal_name: &str) -> Result<bool, SpoolError> {
        match fs::metadata(self.file_name(wal_name)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(SpoolError::Io(err)),
        }
    }

    /// Creates an empty entry for `wal_name` if absent. Touching an
    /// existing entry is a no-op, so the spool never holds a WAL name
    /// more than once.
    pub fn touch(&self, wal_name: &str) -> Result<(), SpoolError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.file_name(wal_name))?;
        Ok(())
    }

    /// Removes the entry for `wal_name`.
    ///
    /// Absence is reported as [`SpoolError::NotFound`], distinct from a
    /// real I/O failure.
    pub fn remove(&self, wal_name: &str) -> Result<(), SpoolError> {
        match fs::remove_file(self.file_name(wal_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SpoolError::NotFound(base_name(wal_name).to_string()))
            }
            Err(err) => Err(SpoolError::Io(err)),
        }
    }

    /// Atomically moves the entry for `wal_name` to `destination`.
    ///
    /// This relies on `rename(2)`, so the spool and the destination must
    /// live on the same filesystem; a cross-device move is detected and
    /// reported as [`SpoolError::CrossDevice`] instead of silently
    /// degrading to a copy. Either the destination holds the complete
    /// file and the spool entry is gone, or nothing changed.
    pub fn move_out(&self, wal_name: &str, destination: &Path) -> Result<(), SpoolError> {
        match fs::rename(self.file_name(wal_name), destination) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(SpoolError::NotFound(base_name(wal_name).to_string()))
            }
            Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
                Err(SpoolError::CrossDevice(destination.display().to_string()))
            }
            Err(err) => Err(SpoolError::Io(err)),
        }
    }
}

fn base_name(wal_name: &str) -> &str {
    wal_name.rsplit('/').next().unwrap_or(wal_name)
}
