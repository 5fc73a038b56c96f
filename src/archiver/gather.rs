use std::fs;

use tracing::error;

use super::WalArchiver;

impl WalArchiver {
    /// Reads `pg_wal/archive_status` for the list of WAL files that can
    /// be archived in parallel.
    ///
    /// `requested_wal_file` is the file whose archiving PostgreSQL asked
    /// for; it is always the first entry of the returned list. Every
    /// other `.ready` segment is returned as an absolute
    /// `<pg_wal>/<name>` path, up to `parallel` entries in total.
    ///
    /// I/O problems while walking the status directory are logged and
    /// shrink the batch instead of failing it: the requested WAL alone
    /// is always a valid answer.
    pub fn gather_wal_files_to_archive(
        &self,
        requested_wal_file: &str,
        parallel: usize,
    ) -> Vec<String> {
        let pg_wal_directory = self.pg_data_directory.join("pg_wal");
        let archive_status_path = pg_wal_directory.join("archive_status");

        let capacity = parallel.saturating_add(1).min(usize::MAX - 1);
        let mut wal_list = Vec::with_capacity(capacity);
        wal_list.push(requested_wal_file.to_string());

        let entries = match fs::read_dir(&archive_status_path) {
            Ok(entries) => entries,
            Err(err) => {
                error!(
                    path = %archive_status_path.display(),
                    error = %err,
                    "failed reading the archive status directory"
                );
                return wal_list;
            }
        };

        for entry in entries {
            if wal_list.len() >= parallel {
                break;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    error!(
                        path = %archive_status_path.display(),
                        error = %err,
                        "failed reading a directory entry"
                    );
                    continue;
                }
            };

            // Only immediate entries are considered; nothing below the
            // status directory is explored.
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }

            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(wal_file_name) = file_name.strip_suffix(".ready") else {
                continue;
            };

            // The requested WAL is already being archived; it must not
            // appear twice. The requested path is usually
            // `pg_wal/<name>`, hence the suffix comparison.
            if requested_wal_file.ends_with(wal_file_name) {
                continue;
            }

            wal_list.push(pg_wal_directory.join(wal_file_name).display().to_string());
        }

        wal_list
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::archiver::WalArchiver;
    use crate::runner::mock::MockRunner;

    fn wal_name(index: u32) -> String {
        format!("0000000100000000000000{:02X}", index)
    }

    fn prepare_pg_data(ready_segments: &[String]) -> TempDir {
        let pg_data = TempDir::new().unwrap();
        let status = pg_data.path().join("pg_wal").join("archive_status");
        std::fs::create_dir_all(&status).unwrap();
        for segment in ready_segments {
            std::fs::write(status.join(format!("{}.ready", segment)), b"").unwrap();
        }
        pg_data
    }

    fn archiver_for(pg_data: &Path) -> (TempDir, WalArchiver) {
        let spool_dir = TempDir::new().unwrap();
        let archiver = WalArchiver::new(
            Vec::new(),
            spool_dir.path(),
            pg_data,
            Arc::new(MockRunner::succeeding()),
        )
        .unwrap();
        (spool_dir, archiver)
    }

    #[test]
    fn caps_the_batch_at_the_parallelism() {
        let ready: Vec<String> = (1..=10).map(wal_name).collect();
        let pg_data = prepare_pg_data(&ready);
        let (_spool, archiver) = archiver_for(pg_data.path());

        let requested = format!("pg_wal/{}", wal_name(0));
        let gathered = archiver.gather_wal_files_to_archive(&requested, 4);

        assert_eq!(gathered.len(), 4);
        assert_eq!(gathered[0], requested);

        let pg_wal = pg_data.path().join("pg_wal");
        for wal in &gathered[1..] {
            assert!(wal.starts_with(pg_wal.to_str().unwrap()));
            assert!(!wal.ends_with(&wal_name(0)));
        }
    }

    #[test]
    fn skips_the_requested_wal_in_the_status_directory() {
        let ready = vec![wal_name(0), wal_name(1)];
        let pg_data = prepare_pg_data(&ready);
        let (_spool, archiver) = archiver_for(pg_data.path());

        let requested = format!("pg_wal/{}", wal_name(0));
        let gathered = archiver.gather_wal_files_to_archive(&requested, 8);

        assert_eq!(gathered.len(), 2);
        assert_eq!(gathered[0], requested);
        assert!(gathered[1].ends_with(&wal_name(1)));
    }

    #[test]
    fn ignores_subdirectories_and_unrelated_files() {
        let pg_data = prepare_pg_data(&[wal_name(1)]);
        let status = pg_data.path().join("pg_wal").join("archive_status");
        std::fs::create_dir(status.join("lost+found")).unwrap();
        std::fs::write(status.join(format!("{}.done", wal_name(2))), b"").unwrap();
        let (_spool, archiver) = archiver_for(pg_data.path());

        let requested = format!("pg_wal/{}", wal_name(0));
        let gathered = archiver.gather_wal_files_to_archive(&requested, 8);

        assert_eq!(gathered.len(), 2);
        assert!(gathered[1].ends_with(&wal_name(1)));
    }

    #[test]
    fn a_missing_status_directory_yields_only_the_requested_wal() {
        let pg_data = TempDir::new().unwrap();
        let (_spool, archiver) = archiver_for(pg_data.path());

        let requested = format!("pg_wal/{}", wal_name(0));
        let gathered = archiver.gather_wal_files_to_archive(&requested, 4);

        assert_eq!(gathered, vec![requested]);
    }
}
