// walbackuptool/src/command/mod.rs
//! Assembly of the argument lists for the `barman-cloud-*` binaries.
//!
//! Everything in this module is a pure function from configuration to an
//! ordered argv: no environment, no filesystem. Credential
//! materialisation happens separately, in `credentials`.

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::config::{BarmanCredentials, BarmanObjectStoreConfiguration};

/// Conventional names of the invoked binaries.
pub const BARMAN_CLOUD_WAL_ARCHIVE: &str = "barman-cloud-wal-archive";
pub const BARMAN_CLOUD_WAL_RESTORE: &str = "barman-cloud-wal-restore";
pub const BARMAN_CLOUD_CHECK_WAL_ARCHIVE: &str = "barman-cloud-check-wal-archive";
pub const BARMAN_CLOUD_BACKUP: &str = "barman-cloud-backup";
pub const BARMAN_CLOUD_BACKUP_LIST: &str = "barman-cloud-backup-list";
pub const BARMAN_CLOUD_BACKUP_DELETE: &str = "barman-cloud-backup-delete";
pub const BARMAN_CLOUD_BACKUP_KEEP: &str = "barman-cloud-backup-keep";
pub const BARMAN_CLOUD_BACKUP_SHOW: &str = "barman-cloud-backup-show";

/// Options for `barman-cloud-wal-archive`, without the trailing WAL name
/// (the archiver appends one per invocation).
pub fn cloud_wal_archive_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(compression) = &configuration.wal.compression {
        options.push(format!("--{}", compression));
    }
    if let Some(encryption) = &configuration.wal.encryption {
        options.push("-e".to_string());
        options.push(encryption.clone());
    }
    options = append_additional_command_args(
        &configuration.wal.archive_additional_command_args,
        options,
    );

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    options.extend(map_to_barman_tags_format("--tags", &configuration.tags));
    options.extend(map_to_barman_tags_format(
        "--history-tags",
        &configuration.history_tags,
    ));

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options
}

/// Options for `barman-cloud-wal-restore`, without the trailing WAL name
/// and destination path.
///
/// The user-supplied restore args come last, after the positional
/// arguments, matching where barman expects them.
pub fn cloud_wal_restore_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());

    append_additional_command_args(
        &configuration.wal.restore_additional_command_args,
        options,
    )
}

/// Options for `barman-cloud-check-wal-archive`, used before the first
/// archival to verify the bucket holds no WALs of another server.
pub fn cloud_check_wal_archive_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options
}

/// Options for `barman-cloud-backup`.
pub fn cloud_backup_options(
    configuration: &BarmanObjectStoreConfiguration,
    backup_name: &str,
    cluster_name: &str,
) -> Vec<String> {
    let mut options = vec!["--user".to_string(), "postgres".to_string()];

    if !backup_name.is_empty() {
        options.push("--name".to_string());
        options.push(backup_name.to_string());
    }

    if let Some(compression) = &configuration.data.compression {
        options.push(format!("--{}", compression));
    }
    if let Some(encryption) = &configuration.data.encryption {
        options.push("--encryption".to_string());
        options.push(encryption.clone());
    }
    if configuration.data.immediate_checkpoint {
        options.push("--immediate-checkpoint".to_string());
    }
    if let Some(jobs) = configuration.data.jobs {
        options.push("--jobs".to_string());
        options.push(jobs.to_string());
    }
    options = append_additional_command_args(&configuration.data.additional_command_args, options);

    options.extend(map_to_barman_tags_format("--tags", &configuration.tags));

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options
}

/// Options for deleting a single backup by ID with
/// `barman-cloud-backup-delete`.
pub fn cloud_backup_delete_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
    backup_id: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push("--backup-id".to_string());
    options.push(backup_id.to_string());
    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options
}

/// Options for applying a retention policy with
/// `barman-cloud-backup-delete`. The policy string is passed through
/// opaquely.
pub fn cloud_backup_delete_by_policy_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
    retention_policy: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push("--retention-policy".to_string());
    options.push(retention_policy.to_string());
    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options
}

/// Options for pinning a backup past the retention policy with
/// `barman-cloud-backup-keep`. `keep_target` is barman's recovery
/// target for the kept backup (e.g. `full`).
pub fn cloud_backup_keep_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
    backup_name: &str,
    keep_target: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push("--target".to_string());
    options.push(keep_target.to_string());
    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options.push(backup_name.to_string());
    options
}

/// Options for releasing a keep flag set earlier, so the backup becomes
/// eligible for retention again.
pub fn cloud_backup_release_options(
    configuration: &BarmanObjectStoreConfiguration,
    cluster_name: &str,
    backup_name: &str,
) -> Vec<String> {
    let mut options = Vec::new();

    if let Some(endpoint_url) = &configuration.endpoint_url {
        options.push("--endpoint-url".to_string());
        options.push(endpoint_url.clone());
    }

    append_cloud_provider_options(&mut options, &configuration.credentials);

    options.push("--release".to_string());
    options.push(configuration.destination_path.clone());
    options.push(configuration.server_name_or(cluster_name).to_string());
    options.push(backup_name.to_string());
    options
}

/// Appends the `--cloud-provider` fragment matching the configured
/// credentials. With no credentials configured nothing is added and
/// barman falls back on its own provider detection.
fn append_cloud_provider_options(options: &mut Vec<String>, credentials: &BarmanCredentials) {
    if credentials.s3.is_some() {
        options.push("--cloud-provider".to_string());
        options.push("aws-s3".to_string());
    } else if let Some(azure) = &credentials.azure {
        options.push("--cloud-provider".to_string());
        options.push("azure-blob-storage".to_string());

        if azure.use_default_credentials {
            options.push("--credential".to_string());
            options.push("default".to_string());
        } else if azure.inherit_from_azure_ad {
            options.push("--credential".to_string());
            options.push("managed-identity".to_string());
        }
    } else if credentials.google.is_some() {
        options.push("--cloud-provider".to_string());
        options.push("google-cloud-storage".to_string());
    }
}

/// Merges user-supplied extra args into the built-in options.
///
/// The policy is strictly "no overwrite": a user token whose flag key
/// (the part before `=`) is already present, either bare or as
/// `key=value`, is dropped. Accepted tokens keep their input order.
pub fn append_additional_command_args(
    additional_command_args: &[String],
    mut options: Vec<String>,
) -> Vec<String> {
    if additional_command_args.is_empty() {
        return options;
    }

    let mut existing: HashSet<String> = options
        .iter()
        .map(|option| option_key(option).to_string())
        .collect();

    for arg in additional_command_args {
        let key = option_key(arg);
        if existing.contains(key) {
            continue;
        }
        existing.insert(key.to_string());
        options.push(arg.clone());
    }

    options
}

fn option_key(arg: &str) -> &str {
    arg.split('=').next().unwrap_or(arg)
}

/// Renders a tag map as barman expects it: `--tags k1,v1 k2,v2`.
/// BTreeMap iteration keeps the rendering stable across runs.
fn map_to_barman_tags_format(flag: &str, tags: &BTreeMap<String, String>) -> Vec<String> {
    if tags.is_empty() {
        return Vec::new();
    }

    let mut options = Vec::with_capacity(tags.len() + 1);
    options.push(flag.to_string());
    for (key, value) in tags {
        options.push(format!("{},{}", key, value));
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AzureCredentials, DataBackupConfiguration, GoogleCredentials, S3Credentials,
        WalBackupConfiguration,
    };

    fn storage_conf() -> BarmanObjectStoreConfiguration {
        BarmanObjectStoreConfiguration {
            destination_path: "s3://bucket-name/".to_string(),
            server_name: None,
            endpoint_url: None,
            endpoint_ca_path: None,
            credentials: BarmanCredentials::default(),
            wal: WalBackupConfiguration::default(),
            data: DataBackupConfiguration::default(),
            tags: BTreeMap::new(),
            history_tags: BTreeMap::new(),
            retention_policy: None,
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn appends_additional_command_args() {
        let options = args(&["--option1", "--option2"]);
        let additional = args(&["--option3", "--option4"]);

        let updated = append_additional_command_args(&additional, options);
        assert_eq!(
            updated,
            args(&["--option1", "--option2", "--option3", "--option4"])
        );
    }

    #[test]
    fn adds_key_value_pairs_correctly() {
        let options = args(&["--option1", "--option2"]);
        let additional = args(&["--option3", "--option4=value", "--option5=value2"]);

        let updated = append_additional_command_args(&additional, options);
        assert_eq!(
            updated,
            args(&[
                "--option1",
                "--option2",
                "--option3",
                "--option4=value",
                "--option5=value2",
            ])
        );
    }

    #[test]
    fn does_not_duplicate_existing_values() {
        let options = args(&["--option1", "--option2"]);
        let additional = args(&["--option2", "--option1"]);

        let updated = append_additional_command_args(&additional, options);
        assert_eq!(updated, args(&["--option1", "--option2"]));
    }

    #[test]
    fn does_not_overwrite_existing_key_value_pairs() {
        let options = args(&["--option1=abc", "--option2"]);
        let additional = args(&["--option2", "--option1=def"]);

        let updated = append_additional_command_args(&additional, options);
        assert_eq!(updated, args(&["--option1=abc", "--option2"]));
    }

    #[test]
    fn builds_wal_archive_options_with_compression_and_extra_args() {
        let mut conf = storage_conf();
        conf.wal = WalBackupConfiguration {
            compression: Some("gzip".to_string()),
            encryption: Some("aes256".to_string()),
            archive_additional_command_args: args(&[
                "--min-chunk-size=5MB",
                "--read-timeout=60",
                "-vv",
            ]),
            restore_additional_command_args: Vec::new(),
        };

        let options = cloud_wal_archive_options(&conf, "test-cluster");
        assert_eq!(
            options.join(" "),
            "--gzip -e aes256 --min-chunk-size=5MB --read-timeout=60 -vv s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn builds_wal_restore_options_without_the_wal_stanza() {
        let conf = storage_conf();
        let options = cloud_wal_restore_options(&conf, "test-cluster");
        assert_eq!(options.join(" "), "s3://bucket-name/ test-cluster");
    }

    #[test]
    fn restore_extra_args_come_after_the_positional_arguments() {
        let mut conf = storage_conf();
        conf.wal.restore_additional_command_args = args(&["--read-timeout=60", "-vv"]);

        let options = cloud_wal_restore_options(&conf, "test-cluster");
        assert_eq!(
            options.join(" "),
            "s3://bucket-name/ test-cluster --read-timeout=60 -vv"
        );
    }

    #[test]
    fn s3_credentials_emit_the_aws_provider() {
        let mut conf = storage_conf();
        conf.credentials.s3 = Some(S3Credentials::default());

        let options = cloud_wal_restore_options(&conf, "test-cluster");
        assert_eq!(
            options.join(" "),
            "--cloud-provider aws-s3 s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn azure_default_credentials_win_over_managed_identity() {
        let mut conf = storage_conf();
        conf.credentials.azure = Some(AzureCredentials {
            use_default_credentials: true,
            inherit_from_azure_ad: true,
            ..AzureCredentials::default()
        });

        let options = cloud_wal_archive_options(&conf, "test-cluster");
        let rendered = options.join(" ");
        assert!(rendered.contains("--cloud-provider azure-blob-storage --credential default"));
    }

    #[test]
    fn azure_ad_inheritance_emits_managed_identity() {
        let mut conf = storage_conf();
        conf.credentials.azure = Some(AzureCredentials {
            inherit_from_azure_ad: true,
            ..AzureCredentials::default()
        });

        let options = cloud_wal_archive_options(&conf, "test-cluster");
        let rendered = options.join(" ");
        assert!(
            rendered.contains("--cloud-provider azure-blob-storage --credential managed-identity")
        );
    }

    #[test]
    fn explicit_azure_keys_emit_no_credential_flag() {
        let mut conf = storage_conf();
        conf.credentials.azure = Some(AzureCredentials {
            storage_account: Some("account".to_string()),
            storage_key: Some("key".to_string()),
            ..AzureCredentials::default()
        });

        let options = cloud_wal_archive_options(&conf, "test-cluster");
        assert!(options.contains(&"azure-blob-storage".to_string()));
        assert!(!options.contains(&"--credential".to_string()));
    }

    #[test]
    fn google_credentials_emit_the_gcs_provider() {
        let mut conf = storage_conf();
        conf.credentials.google = Some(GoogleCredentials::default());

        let options = cloud_check_wal_archive_options(&conf, "test-cluster");
        assert_eq!(
            options.join(" "),
            "--cloud-provider google-cloud-storage s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn tags_and_endpoint_are_placed_before_the_provider() {
        let mut conf = storage_conf();
        conf.endpoint_url = Some("https://minio.local:9000".to_string());
        conf.credentials.s3 = Some(S3Credentials::default());
        conf.tags
            .insert("environment".to_string(), "production".to_string());
        conf.history_tags
            .insert("retention".to_string(), "keep".to_string());

        let options = cloud_wal_archive_options(&conf, "test-cluster");
        assert_eq!(
            options.join(" "),
            "--endpoint-url https://minio.local:9000 --tags environment,production \
             --history-tags retention,keep --cloud-provider aws-s3 s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn builds_backup_options() {
        let mut conf = storage_conf();
        conf.data = DataBackupConfiguration {
            compression: Some("snappy".to_string()),
            encryption: Some("aes256".to_string()),
            immediate_checkpoint: true,
            jobs: Some(4),
            additional_command_args: Vec::new(),
        };

        let options = cloud_backup_options(&conf, "backup-20260802", "test-cluster");
        assert_eq!(
            options.join(" "),
            "--user postgres --name backup-20260802 --snappy --encryption aes256 \
             --immediate-checkpoint --jobs 4 s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn builds_backup_delete_options() {
        let conf = storage_conf();

        let options = cloud_backup_delete_options(&conf, "test-cluster", "20260801T000000");
        assert_eq!(
            options.join(" "),
            "--backup-id 20260801T000000 s3://bucket-name/ test-cluster"
        );

        let options = cloud_backup_delete_by_policy_options(&conf, "test-cluster", "RECOVERY WINDOW OF 7 DAYS");
        assert_eq!(
            options.join(" "),
            "--retention-policy RECOVERY WINDOW OF 7 DAYS s3://bucket-name/ test-cluster"
        );
    }

    #[test]
    fn builds_backup_keep_and_release_options() {
        let mut conf = storage_conf();
        conf.credentials.s3 = Some(S3Credentials::default());

        let options = cloud_backup_keep_options(&conf, "test-cluster", "20260801T000000", "full");
        assert_eq!(
            options.join(" "),
            "--cloud-provider aws-s3 --target full s3://bucket-name/ test-cluster 20260801T000000"
        );

        let options = cloud_backup_release_options(&conf, "test-cluster", "20260801T000000");
        assert_eq!(
            options.join(" "),
            "--cloud-provider aws-s3 --release s3://bucket-name/ test-cluster 20260801T000000"
        );
    }
}
