//! Reconciler passes over drifted state.

mod common;

use blocklease::coordinator::metadata::{VolumeConfig, VolumeState};
use blocklease::coordinator::{RequestCreate, TenantConfig, UseConfig, UseReason};
use blocklease::ops::{run_schedule, Reconciler};
use blocklease::storage::VolumeBackend;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use common::Harness;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn reconciler(h: &Harness, host: &str, grace: Duration) -> Reconciler {
    Reconciler::new(
        h.state.metadata.clone(),
        h.state.locks.clone(),
        h.driver(host),
        host,
        grace,
    )
}

async fn pending(h: &Harness, volume: &str, opts: &[(&str, &str)]) -> VolumeConfig {
    let req = RequestCreate {
        tenant: "tenant1".into(),
        volume: volume.into(),
        opts: opts
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    };
    let (config, created) = h
        .state
        .metadata
        .create_volume(&req, &TenantConfig::default())
        .await
        .unwrap();
    assert!(created);
    config
}

async fn ready(h: &Harness, volume: &str, opts: &[(&str, &str)]) -> VolumeConfig {
    let mut config = pending(h, volume, opts).await;
    h.ceph.add_image(&config.options.pool, &config.internal_name().unwrap());
    config.state = VolumeState::Ready;
    h.state.metadata.publish_volume(&config).await.unwrap();
    config
}

#[tokio::test]
async fn test_orphaned_mount_is_cleaned_up() {
    let h = Harness::new().await;
    let config = ready(&h, "foo", &[]).await;
    let driver = h.driver("host1");
    let record = driver.mount(&config.spec().unwrap(), "ext4").await.unwrap();
    assert!(record.path.exists());

    let report = reconciler(&h, "host1", Duration::from_secs(60)).run_once().await;
    assert_eq!(report.orphans_cleaned, 1);
    assert_eq!(report.errors, 0);
    assert!(h.ceph.mapped_images().is_empty());
    assert_eq!(h.mounts.mount_count(), 0);
    assert!(!record.path.exists());
    assert!(h.state.locks.get_use("tenant1", "foo").await.unwrap().is_none());
}

#[tokio::test]
async fn test_leased_mount_is_left_alone() {
    let h = Harness::new().await;
    let config = ready(&h, "foo", &[]).await;
    h.driver("host1")
        .mount(&config.spec().unwrap(), "ext4")
        .await
        .unwrap();
    let lease = UseConfig::for_volume(&config, "host1", UseReason::Mount);
    h.state.locks.publish_use(&lease).await.unwrap();

    let report = reconciler(&h, "host1", Duration::from_secs(60)).run_once().await;
    assert_eq!(report.orphans_cleaned, 0);
    assert_eq!(h.ceph.mapped_images(), vec!["tenant1.foo".to_string()]);
    assert_eq!(h.mounts.mount_count(), 1);
    assert_eq!(h.state.locks.get_use("tenant1", "foo").await.unwrap(), Some(lease));
}

#[tokio::test]
async fn test_unmapped_volumes_need_no_cleanup() {
    let h = Harness::new().await;
    ready(&h, "foo", &[]).await;
    ready(&h, "bar", &[]).await;

    let report = reconciler(&h, "host1", Duration::from_secs(60)).run_once().await;
    assert_eq!(report.tenants, 1);
    assert_eq!(report.volumes, 2);
    assert_eq!(report.orphans_cleaned, 0);
    assert_eq!(h.ceph.count("rbd unmap"), 0);
}

#[tokio::test]
async fn test_pending_records_swept_after_grace() {
    let h = Harness::new().await;
    pending(&h, "fresh", &[]).await;

    let report = reconciler(&h, "host1", Duration::from_secs(3600)).run_once().await;
    assert_eq!(report.pending_removed, 0);
    assert!(h.state.metadata.get_volume("tenant1", "fresh").await.is_ok());

    let report = reconciler(&h, "host1", Duration::ZERO).run_once().await;
    assert_eq!(report.pending_removed, 1);
    let err = h.state.metadata.get_volume("tenant1", "fresh").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_pending_with_lease_or_image_is_kept() {
    let h = Harness::new().await;
    let busy = pending(&h, "busy", &[]).await;
    let lease = UseConfig::for_volume(&busy, "master", UseReason::Create);
    h.state.locks.publish_use(&lease).await.unwrap();

    let half = pending(&h, "half", &[]).await;
    h.ceph.add_image("rbd", &half.internal_name().unwrap());

    let report = reconciler(&h, "host1", Duration::ZERO).run_once().await;
    assert_eq!(report.pending_removed, 0);
    assert!(h.state.metadata.get_volume("tenant1", "busy").await.is_ok());
    assert!(h.state.metadata.get_volume("tenant1", "half").await.is_ok());
}

#[tokio::test]
async fn test_reconciler_takes_due_snapshots() {
    let h = Harness::new().await;
    ready(&h, "plain", &[]).await;
    ready(&h, "snapped", &[("snapshots", "true"), ("snapshots.frequency", "1h")]).await;

    let recon = reconciler(&h, "host1", Duration::from_secs(60));
    let report = recon.run_once().await;
    assert_eq!(report.snapshots_taken, 1);
    assert_eq!(h.ceph.snapshots("rbd", "tenant1.snapped").len(), 1);
    assert!(h.ceph.snapshots("rbd", "tenant1.plain").is_empty());

    // Not due again within the hour.
    let report = recon.run_once().await;
    assert_eq!(report.snapshots_taken, 0);
}

#[tokio::test]
async fn test_snapshot_schedule_prunes_oldest() {
    let h = Harness::new().await;
    let config = ready(
        &h,
        "foo",
        &[("snapshots", "true"), ("snapshots.frequency", "1h"), ("snapshots.keep", "3")],
    )
    .await;
    let driver: Arc<dyn VolumeBackend> = h.driver("host1");
    driver
        .create_snapshot(&config.spec().unwrap(), "before-upgrade")
        .await
        .unwrap();

    let start = Utc.with_ymd_and_hms(2016, 1, 12, 10, 0, 0).unwrap();
    let mut taken = Vec::new();
    for hour in 0..5 {
        let now = start + ChronoDuration::hours(hour);
        let report = run_schedule(driver.as_ref(), &config, now).await.unwrap();
        taken.push(report.taken.unwrap());

        // Half an hour later nothing is due.
        let later = now + ChronoDuration::minutes(30);
        let report = run_schedule(driver.as_ref(), &config, later).await.unwrap();
        assert!(report.taken.is_none());
        assert!(report.pruned.is_empty());
    }

    assert_eq!(taken[0], "2016-01-12T10:00:00Z");
    let remaining = h.ceph.snapshots("rbd", "tenant1.foo");
    assert_eq!(
        remaining,
        vec![
            "before-upgrade".to_string(),
            taken[2].clone(),
            taken[3].clone(),
            taken[4].clone(),
        ]
    );
}

#[tokio::test]
async fn test_untracked_devices_are_reported_not_touched() {
    let h = Harness::new().await;
    ready(&h, "foo", &[]).await;
    h.ceph.add_image("rbd", "tenant1.stray");
    h.ceph.map("rbd", "tenant1.stray");

    let report = reconciler(&h, "host1", Duration::from_secs(60)).run_once().await;
    assert_eq!(report.untracked_devices, 1);
    assert_eq!(report.orphans_cleaned, 0);
    assert_eq!(h.ceph.mapped_images(), vec!["tenant1.stray".to_string()]);
}
