// walbackuptool/src/catalog/mod.rs
//! In-memory model of the remote backup list and the point-in-time
//! recovery selection algorithm.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

/// Layout used by barman-cloud-backup-list for its legacy time fields,
/// e.g. `Tue Oct 22 08:00:00 2024`.
const BARMAN_TIME_LAYOUT: &str = "%a %b %e %H:%M:%S %Y";

/// One base backup as reported by barman.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BarmanBackup {
    /// Only populated when the backup was taken with barman 3.3.0+.
    #[serde(default)]
    pub backup_name: Option<String>,

    #[serde(default, rename = "backup_label")]
    pub label: Option<String>,

    #[serde(default, rename = "begin_time")]
    begin_time_string: String,

    #[serde(default, rename = "end_time")]
    end_time_string: String,

    #[serde(default, rename = "begin_time_iso")]
    begin_time_iso_string: String,

    #[serde(default, rename = "end_time_iso")]
    end_time_iso_string: String,

    /// Parsed begin time; `None` for backups that never started
    /// properly.
    #[serde(skip)]
    pub begin_time: Option<DateTime<Utc>>,

    /// Parsed end time; `None` for failed or in-progress backups.
    #[serde(skip)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub begin_wal: String,

    #[serde(default)]
    pub end_wal: String,

    #[serde(default, rename = "begin_xlog")]
    pub begin_lsn: String,

    #[serde(default, rename = "end_xlog")]
    pub end_lsn: String,

    #[serde(default, rename = "systemid")]
    pub system_id: String,

    #[serde(default, rename = "backup_id")]
    pub id: String,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub timeline: i32,
}

impl BarmanBackup {
    /// A backup is usable for recovery only when both its begin and end
    /// times are known.
    pub fn is_done(&self) -> bool {
        self.begin_time.is_some() && self.end_time.is_some()
    }

    fn deserialize_backup_time_strings(&mut self) -> Result<()> {
        self.begin_time =
            try_parse_iso_or_ctime_time(&self.begin_time_iso_string, &self.begin_time_string)
                .with_context(|| format!("while parsing begin time of backup {}", self.id))?;
        self.end_time =
            try_parse_iso_or_ctime_time(&self.end_time_iso_string, &self.end_time_string)
                .with_context(|| format!("while parsing end time of backup {}", self.id))?;
        Ok(())
    }
}

fn try_parse_iso_or_ctime_time(
    iso_value: &str,
    ctime_or_iso_value: &str,
) -> Result<Option<DateTime<Utc>>> {
    if !iso_value.is_empty() {
        let parsed = DateTime::parse_from_rfc3339(iso_value)
            .with_context(|| format!("invalid ISO time: {}", iso_value))?;
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    if !ctime_or_iso_value.is_empty() {
        // Barman 3.12.0 incorrectly puts an ISO-formatted time in the
        // ctime-formatted field, so a layout failure retries as ISO.
        if let Ok(parsed) = NaiveDateTime::parse_from_str(ctime_or_iso_value, BARMAN_TIME_LAYOUT) {
            return Ok(Some(parsed.and_utc()));
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(ctime_or_iso_value) {
            return Ok(Some(parsed.with_timezone(&Utc)));
        }
        anyhow::bail!("invalid backup time: {}", ctime_or_iso_value);
    }

    Ok(None)
}

/// Recovery target parameters used to pick a base backup.
///
/// A `target_tli` of `""` or `"latest"` means "any timeline"; every
/// other value must match the backup timeline verbatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryTarget {
    pub backup_id: Option<String>,
    pub target_time: Option<String>,
    pub target_lsn: Option<String>,
    pub target_tli: Option<String>,
}

/// The list of backups belonging to one server, kept sorted by end time
/// ascending.
///
/// Every query re-sorts defensively before scanning, so callers never
/// need to guarantee order; taking `&mut self` also serialises
/// concurrent sorts of the same instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[serde(rename = "backups_list")]
    pub list: Vec<BarmanBackup>,
}

impl Catalog {
    /// Creates a sorted catalog from a list of backups of the same
    /// server.
    pub fn new(list: Vec<BarmanBackup>) -> Catalog {
        let mut catalog = Catalog { list };
        catalog.sort();
        catalog
    }

    /// Parses the output of `barman-cloud-backup-list`.
    pub fn new_from_barman_cloud_backup_list(raw_json: &str) -> Result<Catalog> {
        let mut catalog: Catalog = serde_json::from_str(raw_json)
            .context("Failed to parse the barman-cloud-backup-list output")?;

        for backup in &mut catalog.list {
            backup.deserialize_backup_time_strings()?;
        }

        catalog.sort();
        Ok(catalog)
    }

    fn sort(&mut self) {
        // Stable: equal end times keep their relative order, failed
        // backups (no end time) sort first.
        self.list.sort_by(|a, b| a.end_time.cmp(&b.end_time));
    }

    /// The latest successful backup, if any.
    pub fn latest_backup(&mut self) -> Option<&BarmanBackup> {
        self.sort();
        self.list.iter().rev().find(|backup| backup.is_done())
    }

    /// End time of the last successful backup.
    pub fn last_successful_backup_time(&mut self) -> Option<DateTime<Utc>> {
        self.latest_backup().and_then(|backup| backup.end_time)
    }

    /// End time of the earliest successful backup: nothing before this
    /// point can be recovered.
    pub fn first_recoverability_point(&mut self) -> Option<DateTime<Utc>> {
        self.sort();
        self.list
            .iter()
            .find(|backup| backup.is_done())
            .and_then(|backup| backup.end_time)
    }

    /// IDs of every backup in the catalog, failed ones included.
    pub fn backup_ids(&self) -> Vec<String> {
        self.list.iter().map(|backup| backup.id.clone()).collect()
    }

    /// Finds the backup a PITR request should start from.
    ///
    /// A `backup_id` target always wins and must exist. Otherwise the
    /// newest successful backup compatible with the target time, LSN and
    /// timeline is chosen; `Ok(None)` means no backup qualifies.
    pub fn find_backup_info(&mut self, target: &RecoveryTarget) -> Result<Option<&BarmanBackup>> {
        if let Some(backup_id) = target.backup_id.as_deref().filter(|id| !id.is_empty()) {
            return self.find_backup_from_id(backup_id).map(Some);
        }

        let target_tli = target.target_tli.clone().unwrap_or_default();
        self.sort();

        if let Some(target_time) = target.target_time.as_deref().filter(|t| !t.is_empty()) {
            return self.find_closest_backup_from_target_time(target_time, &target_tli);
        }

        if let Some(target_lsn) = target.target_lsn.as_deref().filter(|l| !l.is_empty()) {
            return self.find_closest_backup_from_target_lsn(target_lsn, &target_tli);
        }

        Ok(self.find_latest_backup_from_timeline(&target_tli))
    }

    fn find_backup_from_id(&self, backup_id: &str) -> Result<&BarmanBackup> {
        self.list
            .iter()
            .filter(|backup| backup.is_done())
            .find(|backup| backup.id == backup_id)
            .with_context(|| format!("no backup found with ID {}", backup_id))
    }

    fn find_closest_backup_from_target_time(
        &self,
        target_time: &str,
        target_tli: &str,
    ) -> Result<Option<&BarmanBackup>> {
        let target_time = parse_target_time(target_time)
            .with_context(|| format!("while parsing recovery target time: {}", target_time))?;

        Ok(self.list.iter().rev().find(|backup| {
            backup.is_done()
                && timeline_matches(target_tli, backup.timeline)
                && backup
                    .end_time
                    .map(|end_time| end_time <= target_time)
                    .unwrap_or(false)
        }))
    }

    fn find_closest_backup_from_target_lsn(
        &self,
        target_lsn: &str,
        target_tli: &str,
    ) -> Result<Option<&BarmanBackup>> {
        let target_lsn = parse_lsn(target_lsn)
            .with_context(|| format!("while parsing recovery target LSN: {}", target_lsn))?;

        Ok(self.list.iter().rev().find(|backup| {
            backup.is_done()
                && timeline_matches(target_tli, backup.timeline)
                && parse_lsn(&backup.end_lsn)
                    .map(|end_lsn| end_lsn < target_lsn)
                    .unwrap_or(false)
        }))
    }

    fn find_latest_backup_from_timeline(&self, target_tli: &str) -> Option<&BarmanBackup> {
        self.list
            .iter()
            .rev()
            .find(|backup| backup.is_done() && timeline_matches(target_tli, backup.timeline))
    }
}

/// A timeline target of `""` or `"latest"` matches everything; any other
/// value must equal the backup timeline rendered as an integer. Note
/// that `"current"` is deliberately not a wildcard.
fn timeline_matches(target_tli: &str, timeline: i32) -> bool {
    target_tli.is_empty() || target_tli == "latest" || target_tli == timeline.to_string()
}

/// Parses a PostgreSQL LSN of the form `X/X` into its 64-bit value.
pub fn parse_lsn(value: &str) -> Result<u64> {
    let (high, low) = value
        .split_once('/')
        .with_context(|| format!("invalid LSN: {}", value))?;
    let high =
        u64::from_str_radix(high, 16).with_context(|| format!("invalid LSN: {}", value))?;
    let low = u64::from_str_radix(low, 16).with_context(|| format!("invalid LSN: {}", value))?;
    if high > u32::MAX as u64 || low > u32::MAX as u64 {
        anyhow::bail!("invalid LSN: {}", value);
    }
    Ok((high << 32) | low)
}

/// Parses a recovery target time, accepting RFC 3339 and the PostgreSQL
/// timestamp format, with or without time zone.
fn parse_target_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(parsed.and_utc());
    }
    anyhow::bail!("invalid recovery target time: {}", value)
}

#[derive(Debug, Deserialize)]
struct BarmanBackupShow {
    #[serde(default)]
    cloud: BarmanBackup,
}

/// Parses the output of `barman-cloud-backup-show`.
pub fn new_backup_from_barman_cloud_backup_show(raw_json: &str) -> Result<BarmanBackup> {
    let mut show: BarmanBackupShow = serde_json::from_str(raw_json)
        .context("Failed to parse the barman-cloud-backup-show output")?;
    show.cloud.deserialize_backup_time_strings()?;
    Ok(show.cloud)
}
