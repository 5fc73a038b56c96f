// walbackuptool/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

// Structs for deserializing config.json

/// Credentials for an S3-compatible object store. All values are already
/// resolved: turning secret references into these plain strings is the
/// job of the operator, not of this sidecar.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Credentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub region: Option<String>,
    #[serde(default)]
    pub inherit_from_iam_role: bool,
}

/// Credentials for Azure Blob Storage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AzureCredentials {
    pub storage_account: Option<String>,
    pub storage_key: Option<String>,
    pub storage_sas_token: Option<String>,
    pub connection_string: Option<String>,
    #[serde(default)]
    pub inherit_from_azure_ad: bool,
    #[serde(default)]
    pub use_default_credentials: bool,
}

/// Credentials for Google Cloud Storage. `application_credentials` holds
/// the content of the service account key, not a path to it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GoogleCredentials {
    pub application_credentials: Option<String>,
    #[serde(default)]
    pub gke_environment: bool,
}

/// At most one of the cloud providers may be configured. An empty set is
/// legal: barman then relies on whatever ambient credentials the
/// container has.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BarmanCredentials {
    pub s3: Option<S3Credentials>,
    pub azure: Option<AzureCredentials>,
    pub google: Option<GoogleCredentials>,
}

impl BarmanCredentials {
    pub fn are_populated(&self) -> bool {
        self.s3.is_some() || self.azure.is_some() || self.google.is_some()
    }

    fn validate(&self) -> Result<()> {
        let configured = [
            self.s3.is_some(),
            self.azure.is_some(),
            self.google.is_some(),
        ]
        .iter()
        .filter(|c| **c)
        .count();

        if configured > 1 {
            anyhow::bail!(
                "only one of s3, azure and google credentials may be configured, found {}",
                configured
            );
        }
        Ok(())
    }
}

/// Options applied to WAL archiving and restoration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalBackupConfiguration {
    /// Compression algorithm passed to barman-cloud-wal-archive as a
    /// bare flag (e.g. `gzip` becomes `--gzip`).
    pub compression: Option<String>,
    /// Encryption algorithm, passed as `-e <value>`.
    pub encryption: Option<String>,
    #[serde(default)]
    pub archive_additional_command_args: Vec<String>,
    #[serde(default)]
    pub restore_additional_command_args: Vec<String>,
}

/// Options applied to base backups taken with barman-cloud-backup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataBackupConfiguration {
    pub compression: Option<String>,
    pub encryption: Option<String>,
    #[serde(default)]
    pub immediate_checkpoint: bool,
    pub jobs: Option<u32>,
    #[serde(default)]
    pub additional_command_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub cluster_name: Option<String>,
    pub destination_path: Option<String>,
    pub server_name: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_ca_path: Option<PathBuf>,
    pub spool_directory: Option<PathBuf>,
    pub pg_data_directory: Option<PathBuf>,
    pub parallel_wal_jobs: Option<usize>,
    pub backup_temp_dir: Option<PathBuf>,
    pub retention_policy: Option<String>,
    pub tags: Option<BTreeMap<String, String>>,
    pub history_tags: Option<BTreeMap<String, String>>,
    pub credentials: Option<BarmanCredentials>,
    pub wal: Option<WalBackupConfiguration>,
    pub data: Option<DataBackupConfiguration>,
}

// Application's internal configuration structs

/// Everything needed to address one object-store-backed backup
/// destination. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct BarmanObjectStoreConfiguration {
    pub destination_path: String,
    pub server_name: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_ca_path: Option<PathBuf>,
    pub credentials: BarmanCredentials,
    pub wal: WalBackupConfiguration,
    pub data: DataBackupConfiguration,
    pub tags: BTreeMap<String, String>,
    pub history_tags: BTreeMap<String, String>,
    pub retention_policy: Option<String>,
}

impl BarmanObjectStoreConfiguration {
    /// The server name under which WALs and backups are stored, falling
    /// back to the cluster name when not set explicitly.
    pub fn server_name_or<'a>(&'a self, cluster_name: &'a str) -> &'a str {
        match &self.server_name {
            Some(name) if !name.is_empty() => name,
            _ => cluster_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cluster_name: String,
    pub store: BarmanObjectStoreConfiguration,
    pub spool_directory: PathBuf,
    pub pg_data_directory: PathBuf,
    pub parallel_wal_jobs: usize,
    pub backup_temp_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

        AppConfig::from_raw(raw)
    }

    fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let cluster_name = raw
            .cluster_name
            .filter(|name| !name.is_empty())
            .context("cluster_name must be set in the configuration")?;

        let destination_path = raw
            .destination_path
            .filter(|path| !path.is_empty())
            .context("destination_path must be set in the configuration")?;
        Url::parse(&destination_path).with_context(|| {
            format!(
                "destination_path is not a valid object store URL: {}",
                destination_path
            )
        })?;

        let credentials = raw.credentials.unwrap_or_default();
        credentials.validate()?;

        let spool_directory = raw
            .spool_directory
            .context("spool_directory must be set in the configuration")?;

        // PGDATA is the conventional fallback: the sidecar shares the
        // data volume with PostgreSQL.
        let pg_data_directory = match raw.pg_data_directory {
            Some(dir) => dir,
            None => PathBuf::from(
                env::var("PGDATA")
                    .context("pg_data_directory is not configured and PGDATA is not set")?,
            ),
        };

        let parallel_wal_jobs = raw.parallel_wal_jobs.unwrap_or(1);
        if parallel_wal_jobs == 0 {
            anyhow::bail!("parallel_wal_jobs must be at least 1");
        }

        Ok(AppConfig {
            cluster_name,
            store: BarmanObjectStoreConfiguration {
                destination_path,
                server_name: raw.server_name,
                endpoint_url: raw.endpoint_url,
                endpoint_ca_path: raw.endpoint_ca_path,
                credentials,
                wal: raw.wal.unwrap_or_default(),
                data: raw.data.unwrap_or_default(),
                tags: raw.tags.unwrap_or_default(),
                history_tags: raw.history_tags.unwrap_or_default(),
                retention_policy: raw.retention_policy,
            },
            spool_directory,
            pg_data_directory,
            parallel_wal_jobs,
            backup_temp_dir: raw.backup_temp_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_raw() -> RawJsonConfig {
        serde_json::from_str(
            r#"{
                "cluster_name": "test-cluster",
                "destination_path": "s3://bucket-name/",
                "spool_directory": "/var/lib/wal-spool",
                "pg_data_directory": "/var/lib/postgresql/data"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn loads_a_minimal_configuration() {
        let config = AppConfig::from_raw(minimal_raw()).unwrap();

        assert_eq!(config.cluster_name, "test-cluster");
        assert_eq!(config.store.destination_path, "s3://bucket-name/");
        assert_eq!(config.parallel_wal_jobs, 1);
        assert!(!config.store.credentials.are_populated());
    }

    #[test]
    fn server_name_falls_back_to_the_cluster_name() {
        let mut config = AppConfig::from_raw(minimal_raw()).unwrap();
        assert_eq!(config.store.server_name_or("test-cluster"), "test-cluster");

        config.store.server_name = Some("pg-main".to_string());
        assert_eq!(config.store.server_name_or("test-cluster"), "pg-main");
    }

    #[test]
    fn rejects_an_invalid_destination() {
        let mut raw = minimal_raw();
        raw.destination_path = Some("not a url".to_string());
        assert!(AppConfig::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_more_than_one_credentials_provider() {
        let mut raw = minimal_raw();
        raw.credentials = Some(BarmanCredentials {
            s3: Some(S3Credentials::default()),
            azure: Some(AzureCredentials::default()),
            google: None,
        });
        assert!(AppConfig::from_raw(raw).is_err());
    }

    #[test]
    fn rejects_zero_parallel_jobs() {
        let mut raw = minimal_raw();
        raw.parallel_wal_jobs = Some(0);
        assert!(AppConfig::from_raw(raw).is_err());
    }
}
