use thiserror::Error;

/// Errors raised by the WAL spool.
///
/// A missing spool entry is reported separately from a real filesystem
/// failure so that callers can treat "not in the spool" as a cache miss
/// instead of an error condition.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("WAL file {0} is not in the spool")]
    NotFound(String),

    #[error("spool and destination {0} are on different filesystems, cannot rename atomically")]
    CrossDevice(String),

    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while running an external command.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with code {code}")]
    ExitCode { command: String, code: i32 },

    #[error("{command} was terminated by a signal")]
    Terminated { command: String },

    #[error("{command} was cancelled")]
    Cancelled { command: String },

    #[error("I/O error while streaming output of {command}: {source}")]
    Stream {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    /// Returns the numeric exit code, if the process ran and exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunError::ExitCode { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when the failure was caused by the caller cancelling the run.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled { .. })
    }
}

/// Typed outcomes of `barman-cloud-wal-restore`, mapped from its exit code.
#[derive(Debug, Error)]
pub enum WalRestoreError {
    /// Exit code 1: the bucket or the WAL file does not exist. During
    /// speculative prefetch this is an expected end-of-archive signal,
    /// not a failure.
    #[error("object storage or WAL file not found: {0}")]
    WalNotFound(String),

    /// Exit code 2: transient network failure, PostgreSQL will retry.
    #[error("connectivity failure while executing barman-cloud-wal-restore")]
    Connectivity,

    /// Exit code 3: the WAL name was rejected by the restore binary.
    #[error("invalid name for a WAL file: {0}")]
    InvalidWalName(String),

    /// Exit code 4: generic barman failure.
    #[error("generic error encountered while executing barman-cloud-wal-restore")]
    Generic,

    /// Any other non-zero exit code.
    #[error("unrecognized exit code {0} from barman-cloud-wal-restore")]
    Unrecognized(i32),

    /// The process could not be run at all, or was cancelled.
    #[error(transparent)]
    Run(#[from] RunError),
}

impl WalRestoreError {
    /// True when the error means the WAL is simply absent from the
    /// archive. Callers use this to tell an exhausted archive apart
    /// from a real failure.
    pub fn is_wal_not_found(&self) -> bool {
        matches!(self, WalRestoreError::WalNotFound(_))
    }

    /// True for transient network failures worth retrying.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, WalRestoreError::Connectivity)
    }

    pub fn is_invalid_wal_name(&self) -> bool {
        matches!(self, WalRestoreError::InvalidWalName(_))
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, WalRestoreError::Generic)
    }

    pub fn is_unrecognized(&self) -> bool {
        matches!(self, WalRestoreError::Unrecognized(_))
    }
}
