//! Integration tests for the background expiry sweep.

mod common;

use chrono::{Duration, Utc};
use common::{Harness, RevokeAnswer};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use vpn_access::{
    Reconciler, ReconcilerSettings, SweepReport,
    db::EntitlementStore,
    entitlement::models::EXPIRATION_WARNING,
};

#[tokio::test]
async fn test_sweep_deactivates_even_when_revoke_fails() {
    let h = Harness::new().await;
    h.provisioner.answer_revoke(RevokeAnswer::Error);
    let config = h
        .config_expiring_at(Some(Utc::now() - Duration::hours(1)))
        .await;

    let report = h.reconciler.run_once().await;

    assert!(!h.reload(&config).await.is_active);
    assert_eq!(report.expired, 1);
    assert_eq!(report.deactivated, 1);
    assert_eq!(report.revoke_failures, 1);
    assert_eq!(report.errors, 0);
}

#[tokio::test]
async fn test_sweep_isolates_per_config_revoke_failures() {
    let h = Harness::new().await;
    let first = h
        .config_expiring_at(Some(Utc::now() - Duration::hours(2)))
        .await;
    let second = h
        .config_expiring_at(Some(Utc::now() - Duration::hours(1)))
        .await;
    h.provisioner.fail_revoke_of(&first.name);

    let report = h.reconciler.run_once().await;

    assert!(!h.reload(&first).await.is_active);
    assert!(!h.reload(&second).await.is_active);
    assert_eq!(report.deactivated, 2);
    assert_eq!(report.revoked, 1);
    assert_eq!(report.revoke_failures, 1);
    assert_eq!(h.provisioner.revoked(), vec![second.name.clone()]);
}

#[tokio::test]
async fn test_sweep_leaves_live_and_unbounded_configs_alone() {
    let h = Harness::new().await;
    let live = h
        .config_expiring_at(Some(Utc::now() + Duration::days(10)))
        .await;
    let unbounded = h.config_expiring_at(None).await;

    let report = h.reconciler.run_once().await;

    assert_eq!(report, SweepReport::default());
    assert!(h.reload(&live).await.is_active);
    assert!(h.reload(&unbounded).await.is_active);
    assert_eq!(h.provisioner.revoke_calls(), 0);
}

#[tokio::test]
async fn test_extended_config_is_not_swept() {
    let h = Harness::new().await;
    let config = h
        .config_expiring_at(Some(Utc::now() - Duration::hours(1)))
        .await;
    h.engine.extend_config(config.id, 30).await.unwrap();

    let report = h.reconciler.run_once().await;

    assert_eq!(report.expired, 0);
    assert!(h.reload(&config).await.is_active);
}

#[tokio::test]
async fn test_cycle_as_of_a_later_instant_expires_config() {
    let h = Harness::new().await;
    let config = h
        .config_expiring_at(Some(Utc::now() + Duration::days(3)))
        .await;

    let report = h
        .reconciler
        .run_cycle_at(Utc::now() + Duration::days(4))
        .await;

    assert_eq!(report.deactivated, 1);
    assert!(!h.reload(&config).await.is_active);
}

#[tokio::test]
async fn test_expiry_warning_sent_once_across_cycles() {
    let h = Harness::new().await;
    let config = h
        .config_expiring_at(Some(Utc::now() + Duration::hours(6)))
        .await;

    let first = h.reconciler.run_once().await;
    let second = h.reconciler.run_once().await;

    assert_eq!(first.notified, 1);
    assert_eq!(second.notified, 0);
    assert_eq!(h.store.notification_count(), 1);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].config_id, config.id);
    assert!(sent[0].message.contains(&config.name));

    let log = h
        .store
        .find_notification(config.id, EXPIRATION_WARNING)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.expires_at, config.expires_at);
}

#[tokio::test]
async fn test_failed_send_is_retried_next_cycle() {
    let h = Harness::new().await;
    h.config_expiring_at(Some(Utc::now() + Duration::hours(6)))
        .await;
    h.notifier.fail(true);

    let first = h.reconciler.run_once().await;
    assert_eq!(first.notification_failures, 1);
    assert_eq!(h.store.notification_count(), 0);

    h.notifier.fail(false);
    let second = h.reconciler.run_once().await;
    assert_eq!(second.notified, 1);
    assert_eq!(h.store.notification_count(), 1);
}

#[tokio::test]
async fn test_no_warning_outside_window() {
    let h = Harness::new().await;
    h.config_expiring_at(Some(Utc::now() + Duration::days(3)))
        .await;

    let report = h.reconciler.run_once().await;

    assert_eq!(report.notified, 0);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_oversized_warning_window_still_expires_configs() {
    let h = Harness::new().await;
    let expired = h
        .config_expiring_at(Some(Utc::now() - Duration::hours(1)))
        .await;
    h.config_expiring_at(Some(Utc::now() + Duration::hours(6)))
        .await;
    let reconciler = Reconciler::new(
        h.store.clone(),
        h.provisioner.clone(),
        h.notifier.clone(),
        ReconcilerSettings {
            warning_window: Duration::MAX,
            ..ReconcilerSettings::default()
        },
    );

    let report = reconciler.run_once().await;

    assert_eq!(report.deactivated, 1);
    assert!(!h.reload(&expired).await.is_active);
    assert_eq!(report.notified, 0);
    assert_eq!(report.errors, 1);
    assert!(h.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_run_sweeps_until_cancelled() {
    let h = Harness::new().await;
    let config = h
        .config_expiring_at(Some(Utc::now() - Duration::minutes(5)))
        .await;

    let reports: Arc<Mutex<Vec<SweepReport>>> = Arc::new(Mutex::new(Vec::new()));
    let cancel = CancellationToken::new();
    let handle = h.reconciler.clone().spawn(cancel.clone(), {
        let reports = reports.clone();
        move |report| reports.lock().unwrap().push(report.clone())
    });

    tokio::time::sleep(std::time::Duration::from_millis(70)).await;
    cancel.cancel();
    handle.await.unwrap();
    assert!(!h.reload(&config).await.is_active);

    let reports = reports.lock().unwrap();
    assert!(reports.len() >= 2, "only {} sweeps ran", reports.len());
    // The first sweep runs immediately and does the work
    assert_eq!(reports[0].deactivated, 1);
    assert!(reports[1..].iter().all(|r| r.deactivated == 0));
}
