//! Shared fixtures: scripted collaborators and an engine over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vpn_access::{
    EntitlementManager, EntitlementSettings, Reconciler, ReconcilerSettings,
    db::{ConfigLock, EntitlementStore, MemoryEntitlementStore, StoreError, StoreResult},
    entitlement::models::{
        Config, ConfigId, NewConfig, NewNotification, NewPurchase, NewServer, NotificationLog,
        Protocol, ProtocolId, Purchase, PurchaseTerms, Server, ServerId, User, UserId,
    },
    notify::{Notification, Notifier, NotifyError},
    provision::{CredentialProvisioner, ProvisionError, ProvisionResult},
};

/// How the scripted provisioner answers a revoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeAnswer {
    Confirmed,
    NotConfirmed,
    Error,
}

/// Provisioner whose answers are set by the test
pub struct ScriptedProvisioner {
    fail_provision: AtomicBool,
    default_revoke: Mutex<RevokeAnswer>,
    failing_names: Mutex<HashSet<String>>,
    provisioned: Mutex<Vec<String>>,
    revoked: Mutex<Vec<String>>,
    revoke_delay: Mutex<Option<Duration>>,
    revoke_calls: AtomicUsize,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self {
            fail_provision: AtomicBool::new(false),
            default_revoke: Mutex::new(RevokeAnswer::Confirmed),
            failing_names: Mutex::new(HashSet::new()),
            provisioned: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
            revoke_delay: Mutex::new(None),
            revoke_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_provisioning(&self, fail: bool) {
        self.fail_provision.store(fail, Ordering::SeqCst);
    }

    pub fn answer_revoke(&self, answer: RevokeAnswer) {
        *self.default_revoke.lock().unwrap() = answer;
    }

    /// Revoke of this name fails whatever the default answer is
    pub fn fail_revoke_of(&self, name: &str) {
        self.failing_names.lock().unwrap().insert(name.to_string());
    }

    pub fn delay_revoke(&self, delay: Duration) {
        *self.revoke_delay.lock().unwrap() = Some(delay);
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().unwrap().clone()
    }

    /// Names whose removal was confirmed
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }

    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvisioner for ScriptedProvisioner {
    async fn provision(&self, server: &Server, name: &str) -> ProvisionResult<String> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(ProvisionError::CommandFailed {
                status: 255,
                output: "ssh: connect to host timed out".to_string(),
            });
        }
        self.provisioned.lock().unwrap().push(name.to_string());
        Ok(format!("client\nremote {} {}\n# {name}\n", server.host, server.port))
    }

    async fn revoke(&self, _server: &Server, name: &str) -> ProvisionResult<bool> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.revoke_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let answer = if self.failing_names.lock().unwrap().contains(name) {
            RevokeAnswer::Error
        } else {
            *self.default_revoke.lock().unwrap()
        };

        match answer {
            RevokeAnswer::Confirmed => {
                self.revoked.lock().unwrap().push(name.to_string());
                Ok(true)
            }
            RevokeAnswer::NotConfirmed => Ok(false),
            RevokeAnswer::Error => Err(ProvisionError::Timeout(Duration::from_secs(30))),
        }
    }
}

/// Notifier that records what it sends
pub struct RecordingNotifier {
    fail: AtomicBool,
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NotifyError::HttpStatus(503));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Store error returned while purchase writes are set to fail
fn unavailable() -> StoreError {
    StoreError::Timeout(Duration::from_secs(5))
}

/// In-memory store whose purchase-writing commits can be made to time out.
///
/// A failing commit writes nothing, like a rolled back transaction.
pub struct FaultyStore {
    inner: Arc<MemoryEntitlementStore>,
    fail_purchase_writes: Arc<AtomicBool>,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryEntitlementStore>) -> Self {
        Self {
            inner,
            fail_purchase_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_purchase_writes(&self, fail: bool) {
        self.fail_purchase_writes.store(fail, Ordering::SeqCst);
    }

    fn failing(&self) -> bool {
        self.fail_purchase_writes.load(Ordering::SeqCst)
    }
}

struct FaultyLock {
    inner: Box<dyn ConfigLock>,
    fail_purchase_writes: Arc<AtomicBool>,
}

#[async_trait]
impl ConfigLock for FaultyLock {
    fn config(&self) -> &Config {
        self.inner.config()
    }

    async fn set_expires_at(&mut self, expires_at: DateTime<Utc>) -> StoreResult<Config> {
        self.inner.set_expires_at(expires_at).await
    }

    async fn set_expires_at_with_purchase(
        &mut self,
        expires_at: DateTime<Utc>,
        terms: &PurchaseTerms,
    ) -> StoreResult<(Config, Purchase)> {
        if self.fail_purchase_writes.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.set_expires_at_with_purchase(expires_at, terms).await
    }

    async fn deactivate(&mut self) -> StoreResult<Config> {
        self.inner.deactivate().await
    }
}

#[async_trait]
impl EntitlementStore for FaultyStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }

    async fn insert_user(
        &self,
        external_id: i64,
        username: Option<&str>,
        display_name: &str,
    ) -> StoreResult<User> {
        self.inner.insert_user(external_id, username, display_name).await
    }

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        self.inner.find_user(user_id).await
    }

    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<User>> {
        self.inner.find_user_by_external_id(external_id).await
    }

    async fn activate_free_trial(
        &self,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        self.inner.activate_free_trial(user_id, expires_at).await
    }

    async fn insert_server(&self, server: &NewServer) -> StoreResult<Server> {
        self.inner.insert_server(server).await
    }

    async fn find_server(&self, server_id: ServerId) -> StoreResult<Option<Server>> {
        self.inner.find_server(server_id).await
    }

    async fn list_active_servers(&self) -> StoreResult<Vec<Server>> {
        self.inner.list_active_servers().await
    }

    async fn set_server_active(
        &self,
        server_id: ServerId,
        is_active: bool,
    ) -> StoreResult<Option<Server>> {
        self.inner.set_server_active(server_id, is_active).await
    }

    async fn insert_protocol(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Protocol> {
        self.inner.insert_protocol(name, description).await
    }

    async fn find_protocol(&self, protocol_id: ProtocolId) -> StoreResult<Option<Protocol>> {
        self.inner.find_protocol(protocol_id).await
    }

    async fn list_active_protocols(&self) -> StoreResult<Vec<Protocol>> {
        self.inner.list_active_protocols().await
    }

    async fn insert_config(&self, config: &NewConfig) -> StoreResult<Config> {
        self.inner.insert_config(config).await
    }

    async fn insert_config_with_purchase(
        &self,
        config: &NewConfig,
        terms: &PurchaseTerms,
        claim_free_trial: bool,
    ) -> StoreResult<Option<(Config, Purchase)>> {
        if self.failing() {
            return Err(unavailable());
        }
        self.inner
            .insert_config_with_purchase(config, terms, claim_free_trial)
            .await
    }

    async fn find_config(&self, config_id: ConfigId) -> StoreResult<Option<Config>> {
        self.inner.find_config(config_id).await
    }

    async fn list_user_configs(&self, user_id: UserId) -> StoreResult<Vec<Config>> {
        self.inner.list_user_configs(user_id).await
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<Config>> {
        self.inner.list_expired_active(now).await
    }

    async fn list_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Config>> {
        self.inner.list_expiring_between(from, to).await
    }

    async fn lock_config(&self, config_id: ConfigId) -> StoreResult<Option<Box<dyn ConfigLock>>> {
        let lock = self.inner.lock_config(config_id).await?;
        Ok(lock.map(|inner| {
            Box::new(FaultyLock {
                inner,
                fail_purchase_writes: self.fail_purchase_writes.clone(),
            }) as Box<dyn ConfigLock>
        }))
    }

    async fn insert_purchase(&self, purchase: &NewPurchase) -> StoreResult<Purchase> {
        if self.failing() {
            return Err(unavailable());
        }
        self.inner.insert_purchase(purchase).await
    }

    async fn list_user_purchases(&self, user_id: UserId) -> StoreResult<Vec<Purchase>> {
        self.inner.list_user_purchases(user_id).await
    }

    async fn list_config_purchases(&self, config_id: ConfigId) -> StoreResult<Vec<Purchase>> {
        self.inner.list_config_purchases(config_id).await
    }

    async fn find_notification(
        &self,
        config_id: ConfigId,
        notification_type: &str,
    ) -> StoreResult<Option<NotificationLog>> {
        self.inner
            .find_notification(config_id, notification_type)
            .await
    }

    async fn insert_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        self.inner.insert_notification(notification).await
    }
}

/// Engine, reconciler and seeded catalog over one in-memory store
pub struct Harness {
    pub store: Arc<MemoryEntitlementStore>,
    pub provisioner: Arc<ScriptedProvisioner>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: EntitlementManager,
    pub reconciler: Reconciler,
    pub user: User,
    pub server: Server,
    pub protocol: Protocol,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryEntitlementStore::new());
        let provisioner = Arc::new(ScriptedProvisioner::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let engine = EntitlementManager::new(
            store.clone(),
            provisioner.clone(),
            EntitlementSettings::default(),
        );
        let reconciler = Reconciler::new(
            store.clone(),
            provisioner.clone(),
            notifier.clone(),
            ReconcilerSettings {
                interval: Duration::from_millis(20),
                ..ReconcilerSettings::default()
            },
        );

        let (user, _) = engine
            .register_user(1001, Some("alice"), "Alice")
            .await
            .unwrap();
        let server = engine
            .create_server(NewServer {
                name: "nl-1".to_string(),
                host: "10.1.0.1".to_string(),
                port: 22,
                country: Some("NL".to_string()),
            })
            .await
            .unwrap();
        let protocol = engine
            .create_protocol("openvpn", Some("OpenVPN over UDP"))
            .await
            .unwrap();

        Self {
            store,
            provisioner,
            notifier,
            engine,
            reconciler,
            user,
            server,
            protocol,
        }
    }

    /// Active config for the seeded user with the given deadline
    pub async fn config_expiring_at(&self, expires_at: Option<DateTime<Utc>>) -> Config {
        let mut config = self
            .engine
            .create_config(self.user.id, self.server.id, self.protocol.id, Some(30))
            .await
            .unwrap();
        config.expires_at = expires_at;
        self.store.put_config(config.clone());
        config
    }

    pub async fn reload(&self, config: &Config) -> Config {
        self.store.find_config(config.id).await.unwrap().unwrap()
    }

    /// Engine over a [`FaultyStore`] wrapping this harness's store
    pub fn faulty_engine(&self) -> (Arc<FaultyStore>, EntitlementManager) {
        let store = Arc::new(FaultyStore::new(self.store.clone()));
        let engine = EntitlementManager::new(
            store.clone(),
            self.provisioner.clone(),
            EntitlementSettings::default(),
        );
        (store, engine)
    }
}
