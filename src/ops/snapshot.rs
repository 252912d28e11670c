//! Scheduled snapshots
//!
//! Scheduled snapshots are named by their RFC 3339 timestamp. Only names that
//! parse as timestamps take part in scheduling and pruning, so manually named
//! snapshots are never touched.

use crate::common::{parse_duration, Result};
use crate::coordinator::metadata::VolumeConfig;
use crate::storage::VolumeBackend;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub taken: Option<String>,
    pub pruned: Vec<String>,
}

pub fn snapshot_name(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_snapshot_time(name: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(name)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Take a snapshot if the newest scheduled one is older than the configured
/// frequency, then prune the oldest beyond `keep`.
pub async fn run_schedule(
    backend: &dyn VolumeBackend,
    config: &VolumeConfig,
    now: DateTime<Utc>,
) -> Result<SnapshotReport> {
    let options = &config.options.snapshots;
    let mut report = SnapshotReport::default();
    if !options.enabled {
        return Ok(report);
    }

    let frequency = parse_duration(&options.frequency)?;
    let spec = config.spec()?;

    let mut scheduled: Vec<(DateTime<Utc>, String)> = backend
        .list_snapshots(&spec)
        .await?
        .into_iter()
        .filter_map(|name| parse_snapshot_time(&name).map(|t| (t, name)))
        .collect();
    scheduled.sort();

    let due = match scheduled.last() {
        None => true,
        Some((newest, _)) => now
            .signed_duration_since(*newest)
            .to_std()
            .map_or(false, |age| age >= frequency),
    };

    if due {
        let name = snapshot_name(now);
        backend.create_snapshot(&spec, &name).await?;
        info!(volume = %config.name(), snapshot = %name, "Took scheduled snapshot");
        scheduled.push((now, name.clone()));
        report.taken = Some(name);
    }

    let excess = scheduled.len().saturating_sub(options.keep);
    for (_, name) in scheduled.into_iter().take(excess) {
        backend.remove_snapshot(&spec, &name).await?;
        info!(volume = %config.name(), snapshot = %name, "Pruned snapshot");
        report.pruned.push(name);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_name_roundtrips() {
        let at = Utc.with_ymd_and_hms(2016, 1, 12, 10, 5, 0).unwrap();
        assert_eq!(snapshot_name(at), "2016-01-12T10:05:00Z");
        assert_eq!(parse_snapshot_time("2016-01-12T10:05:00Z"), Some(at));
        assert_eq!(parse_snapshot_time("nightly-backup"), None);
    }
}
