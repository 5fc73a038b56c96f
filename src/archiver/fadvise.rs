//! Page cache advisory for archived WAL segments.
//!
//! The sidecar runs in a separate container from PostgreSQL, so the WAL
//! pages it reads while uploading would otherwise linger in its page
//! cache: memory pressure on large machines is rarely enough to evict
//! them. After a successful upload the segment is advised away.

use std::path::Path;

use anyhow::{Context, Result};

/// Tells the OS the file content is no longer needed by this process.
#[cfg(target_os = "linux")]
pub(super) fn dont_need(file_name: &Path) -> Result<()> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let file = File::open(file_name)
        .with_context(|| format!("error opening file {} for fadvise", file_name.display()))?;

    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        anyhow::bail!(
            "error issuing fadvise on file {}: {}",
            file_name.display(),
            std::io::Error::from_raw_os_error(rc)
        );
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(super) fn dont_need(_file_name: &Path) -> Result<()> {
    Ok(())
}
