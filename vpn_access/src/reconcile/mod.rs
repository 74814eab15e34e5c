//! Background reconciliation of expired configs.
//!
//! Each sweep deactivates every active config whose deadline has passed and
//! sends one expiry warning per config entering the warning window. Unlike
//! [`EntitlementManager::deactivate_config`], a sweep deactivates locally even
//! when remote revocation fails: an unattended cleanup must not stall on one
//! unreachable server.
//!
//! [`EntitlementManager::deactivate_config`]: crate::entitlement::EntitlementManager::deactivate_config

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::{EntitlementStore, StoreResult};
use crate::entitlement::models::{Config, EXPIRATION_WARNING, NewNotification};
use crate::notify::{Notification, Notifier};
use crate::provision::CredentialProvisioner;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Time between sweeps
    pub interval: Duration,
    /// Configs expiring within this window get a warning
    pub warning_window: ChronoDuration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            warning_window: ChronoDuration::hours(24),
        }
    }
}

/// Outcome counters of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Expired active configs found by the scan
    pub expired: usize,
    /// Remote removals confirmed
    pub revoked: usize,
    /// Remote removals failed or unconfirmed
    pub revoke_failures: usize,
    /// Configs marked inactive
    pub deactivated: usize,
    /// Configs changed by someone else before the lock was taken
    pub skipped: usize,
    /// Warnings sent and logged
    pub notified: usize,
    pub notification_failures: usize,
    /// Store failures, per config or per scan
    pub errors: usize,
}

enum ExpiryOutcome {
    Deactivated { revoked: bool },
    Skipped,
}

/// Periodic sweep over the entitlement store
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn EntitlementStore>,
    provisioner: Arc<dyn CredentialProvisioner>,
    notifier: Arc<dyn Notifier>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        provisioner: Arc<dyn CredentialProvisioner>,
        notifier: Arc<dyn Notifier>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            provisioner,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Run one sweep now
    pub async fn run_once(&self) -> SweepReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one sweep as of `now`.
    ///
    /// Never fails: every per-config error is logged and counted, and the
    /// sweep moves on to the next config.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        self.expire(now, &mut report).await;
        self.warn(now, &mut report).await;
        report
    }

    /// Sweep every `interval` until `cancel` fires.
    ///
    /// The first sweep runs immediately. A sweep in progress when `cancel`
    /// fires runs to completion. `on_sweep` sees each report.
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_sweep: F)
    where
        F: FnMut(&SweepReport) + Send,
    {
        log::info!(
            "Reconciler started (interval {:?}, warning window {}h)",
            self.settings.interval,
            self.settings.warning_window.num_hours()
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Reconciler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.run_once().await;
                    if report.expired > 0 || report.notified > 0 || report.errors > 0 {
                        log::info!("Sweep finished: {:?}", report);
                    } else {
                        log::debug!("Sweep finished: nothing to do");
                    }
                    on_sweep(&report);
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn<F>(self, cancel: CancellationToken, on_sweep: F) -> JoinHandle<()>
    where
        F: FnMut(&SweepReport) + Send + 'static,
    {
        tokio::spawn(async move { self.run(cancel, on_sweep).await })
    }

    async fn expire(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let expired = match self.store.list_expired_active(now).await {
            Ok(configs) => configs,
            Err(e) => {
                log::error!("Scanning for expired configs failed: {}", e);
                report.errors += 1;
                return;
            }
        };
        report.expired = expired.len();

        for config in expired {
            match self.expire_one(&config, now).await {
                Ok(ExpiryOutcome::Deactivated { revoked }) => {
                    report.deactivated += 1;
                    if revoked {
                        report.revoked += 1;
                    } else {
                        report.revoke_failures += 1;
                    }
                }
                Ok(ExpiryOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    log::error!("Expiring config {} failed: {}", config.id, e);
                    report.errors += 1;
                }
            }
        }
    }

    async fn expire_one(&self, config: &Config, now: DateTime<Utc>) -> StoreResult<ExpiryOutcome> {
        let Some(mut lock) = self.store.lock_config(config.id).await? else {
            return Ok(ExpiryOutcome::Skipped);
        };

        // Extended or deactivated since the scan
        let current = lock.config().clone();
        if !current.is_active || !current.is_expired_at(now) {
            return Ok(ExpiryOutcome::Skipped);
        }

        let revoked = match self.store.find_server(current.server_id).await? {
            Some(server) => match self.provisioner.revoke(&server, &current.name).await {
                Ok(true) => true,
                Ok(false) => {
                    log::warn!(
                        "Removal of expired credential '{}' not confirmed, deactivating anyway",
                        current.name
                    );
                    false
                }
                Err(e) => {
                    log::warn!(
                        "Removal of expired credential '{}' failed, deactivating anyway: {}",
                        current.name,
                        e
                    );
                    false
                }
            },
            None => {
                log::warn!(
                    "Server {} of expired config {} is missing, deactivating anyway",
                    current.server_id,
                    current.id
                );
                false
            }
        };

        lock.deactivate().await?;
        log::info!(
            "Expired config {} ('{}') deactivated, remote revoked: {}",
            current.id,
            current.name,
            revoked
        );
        Ok(ExpiryOutcome::Deactivated { revoked })
    }

    async fn warn(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let Some(until) = now.checked_add_signed(self.settings.warning_window) else {
            log::error!(
                "Warning window {} is out of range, skipping expiry warnings",
                self.settings.warning_window
            );
            report.errors += 1;
            return;
        };

        let expiring = match self.store.list_expiring_between(now, until).await {
            Ok(configs) => configs,
            Err(e) => {
                log::error!("Scanning for expiring configs failed: {}", e);
                report.errors += 1;
                return;
            }
        };

        for config in expiring {
            match self.warn_one(&config, now).await {
                Ok(Some(true)) => report.notified += 1,
                Ok(Some(false)) => report.notification_failures += 1,
                Ok(None) => {}
                Err(e) => {
                    log::error!("Expiry warning for config {} failed: {}", config.id, e);
                    report.errors += 1;
                }
            }
        }
    }

    /// Send-then-log. `None` when already warned, `Some(sent)` otherwise.
    async fn warn_one(&self, config: &Config, now: DateTime<Utc>) -> StoreResult<Option<bool>> {
        if self
            .store
            .find_notification(config.id, EXPIRATION_WARNING)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        if let Err(e) = self
            .notifier
            .notify(&Notification::expiration_warning(config))
            .await
        {
            log::warn!("Sending expiry warning for config {} failed: {}", config.id, e);
            return Ok(Some(false));
        }

        self.store
            .insert_notification(&NewNotification {
                config_id: config.id,
                user_id: config.user_id,
                notification_type: EXPIRATION_WARNING.to_string(),
                sent_at: now,
                expires_at: config.expires_at,
            })
            .await?;
        Ok(Some(true))
    }
}
