// walbackuptool/src/credentials/mod.rs
//! Builds the process environment the `barman-cloud-*` binaries need.
//!
//! Configuration already holds resolved secret values; this module only
//! turns them into environment variables (and, for Google, into the
//! service account key file barman reads).

use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

use crate::config::{AppConfig, AzureCredentials, GoogleCredentials, S3Credentials};

/// Directory used for scratch data of the sidecar.
pub const SCRATCH_DATA_DIRECTORY: &str = "/controller";

/// Where the Google service account key is materialised for barman.
pub const GOOGLE_APPLICATION_CREDENTIALS_PATH: &str = "/controller/.application_credentials.json";

/// Environment for WAL archiving and base backups.
pub fn environment_for_backup(config: &AppConfig) -> Result<Vec<(String, String)>> {
    let mut environment = cloud_credentials_environment(config)?;
    if let Some(temp_dir) = &config.backup_temp_dir {
        environment.push(("TMPDIR".to_string(), temp_dir.display().to_string()));
    }
    Ok(environment)
}

/// Environment for WAL restoration.
pub fn environment_for_restore(config: &AppConfig) -> Result<Vec<(String, String)>> {
    cloud_credentials_environment(config)
}

fn cloud_credentials_environment(config: &AppConfig) -> Result<Vec<(String, String)>> {
    // Children inherit the sidecar's environment (PATH above all) with
    // the cloud credentials layered on top.
    let mut environment: Vec<(String, String)> = env::vars().collect();

    let credentials = &config.store.credentials;
    if let Some(ca_path) = &config.store.endpoint_ca_path {
        if credentials.s3.is_some() {
            environment.push(("AWS_CA_BUNDLE".to_string(), ca_path.display().to_string()));
        } else if credentials.azure.is_some() {
            environment.push((
                "REQUESTS_CA_BUNDLE".to_string(),
                ca_path.display().to_string(),
            ));
        }
    }

    if let Some(s3) = &credentials.s3 {
        append_aws_environment(&mut environment, s3)?;
    } else if let Some(azure) = &credentials.azure {
        append_azure_environment(&mut environment, azure);
    } else if let Some(google) = &credentials.google {
        append_google_environment(&mut environment, google)?;
    }

    Ok(environment)
}

fn append_aws_environment(
    environment: &mut Vec<(String, String)>,
    s3: &S3Credentials,
) -> Result<()> {
    if s3.inherit_from_iam_role {
        return Ok(());
    }

    let access_key_id = s3
        .access_key_id
        .as_ref()
        .context("missing S3 access key ID")?;
    let secret_access_key = s3
        .secret_access_key
        .as_ref()
        .context("missing S3 secret access key")?;

    if let Some(region) = &s3.region {
        environment.push(("AWS_DEFAULT_REGION".to_string(), region.clone()));
    }
    if let Some(session_token) = &s3.session_token {
        environment.push(("AWS_SESSION_TOKEN".to_string(), session_token.clone()));
    }
    environment.push(("AWS_ACCESS_KEY_ID".to_string(), access_key_id.clone()));
    environment.push(("AWS_SECRET_ACCESS_KEY".to_string(), secret_access_key.clone()));
    Ok(())
}

fn append_azure_environment(environment: &mut Vec<(String, String)>, azure: &AzureCredentials) {
    if azure.inherit_from_azure_ad {
        return;
    }

    if let Some(storage_account) = &azure.storage_account {
        environment.push(("AZURE_STORAGE_ACCOUNT".to_string(), storage_account.clone()));
    }
    if let Some(storage_key) = &azure.storage_key {
        environment.push(("AZURE_STORAGE_KEY".to_string(), storage_key.clone()));
    }
    if let Some(sas_token) = &azure.storage_sas_token {
        environment.push(("AZURE_STORAGE_SAS_TOKEN".to_string(), sas_token.clone()));
    }
    if let Some(connection_string) = &azure.connection_string {
        environment.push((
            "AZURE_STORAGE_CONNECTION_STRING".to_string(),
            connection_string.clone(),
        ));
    }
}

fn append_google_environment(
    environment: &mut Vec<(String, String)>,
    google: &GoogleCredentials,
) -> Result<()> {
    let Some(key_content) = &google.application_credentials else {
        if google.gke_environment {
            // Workload identity: barman authenticates through the GKE
            // metadata server, no key file involved.
            remove_google_credentials_file(Path::new(GOOGLE_APPLICATION_CREDENTIALS_PATH))?;
            return Ok(());
        }
        anyhow::bail!("missing Google application credentials");
    };

    write_google_credentials_file(Path::new(GOOGLE_APPLICATION_CREDENTIALS_PATH), key_content)?;
    environment.push((
        "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
        GOOGLE_APPLICATION_CREDENTIALS_PATH.to_string(),
    ));
    Ok(())
}

/// Atomically writes the service account key with mode 0600: the file is
/// staged in the same directory and renamed over the destination.
fn write_google_credentials_file(path: &Path, content: &str) -> Result<()> {
    let directory = path
        .parent()
        .context("Google credentials path has no parent directory")?;

    let mut staged = NamedTempFile::new_in(directory)
        .with_context(|| format!("Failed to stage credentials file in {}", directory.display()))?;
    staged
        .write_all(content.as_bytes())
        .context("Failed to write the Google credentials file")?;
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .context("Failed to restrict the Google credentials file permissions")?;
    staged
        .persist(path)
        .with_context(|| format!("Failed to persist credentials file at {}", path.display()))?;
    Ok(())
}

fn remove_google_credentials_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("Failed to remove {}", path.display()))
        }
    }
}
