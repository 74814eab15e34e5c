//! In-memory implementation of the entitlement store.
//!
//! Mirrors the constraints of the SQL schema (unique names, one notification
//! per config and type, conditional trial activation, per-row config locks) so
//! the engine behaves the same against it. Used for tests and local runs
//! without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

use super::{
    errors::{StoreError, StoreResult},
    repository::{ConfigLock, EntitlementStore},
    timeouts::DEFAULT_LOCK_TIMEOUT,
};
use crate::entitlement::models::{
    Config, ConfigId, NewConfig, NewNotification, NewPurchase, NewServer, NotificationLog,
    Protocol, ProtocolId, Purchase, PurchaseTerms, Server, ServerId, User, UserId,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: HashMap<UserId, User>,
    servers: HashMap<ServerId, Server>,
    protocols: HashMap<ProtocolId, Protocol>,
    configs: HashMap<ConfigId, Config>,
    purchases: Vec<Purchase>,
    notifications: Vec<NotificationLog>,
    row_locks: HashMap<ConfigId, Arc<tokio::sync::Mutex<()>>>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_config_name(&self, name: &str) -> StoreResult<()> {
        if self.configs.values().any(|c| c.name == name) {
            return Err(StoreError::UniqueViolation("configs_name_key".to_string()));
        }
        Ok(())
    }

    fn push_config(&mut self, config: &NewConfig) -> Config {
        let row = Config {
            id: self.next_id(),
            user_id: config.user_id,
            server_id: config.server_id,
            protocol_id: config.protocol_id,
            name: config.name.clone(),
            credential_content: config.credential_content.clone(),
            created_at: config.created_at,
            expires_at: config.expires_at,
            is_active: true,
        };
        self.configs.insert(row.id, row.clone());
        row
    }

    fn push_purchase(&mut self, purchase: &NewPurchase) -> Purchase {
        let row = Purchase {
            id: self.next_id(),
            user_id: purchase.user_id,
            config_id: purchase.config_id,
            amount: purchase.amount,
            duration_days: purchase.duration_days,
            purchase_type: purchase.purchase_type,
            created_at: purchase.created_at,
        };
        self.purchases.push(row.clone());
        row
    }

    /// Conditional trial activation; `false` if used or the user is missing
    fn claim_free_trial(&mut self, user_id: UserId, expires_at: DateTime<Utc>) -> bool {
        match self.users.get_mut(&user_id) {
            Some(user) if !user.free_trial_used => {
                user.free_trial_used = true;
                user.free_trial_expires_at = Some(expires_at);
                true
            }
            _ => false,
        }
    }
}

/// In-memory entitlement store
#[derive(Clone, Default)]
pub struct MemoryEntitlementStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of config rows, active or not
    pub fn config_count(&self) -> usize {
        self.tables().configs.len()
    }

    /// Number of notification log rows
    pub fn notification_count(&self) -> usize {
        self.tables().notifications.len()
    }

    /// Overwrite a config row as-is, bypassing engine rules.
    ///
    /// Lets callers simulate the passage of time (e.g. a deadline in the past).
    pub fn put_config(&self, config: Config) {
        let mut tables = self.tables();
        tables.next_id = tables.next_id.max(config.id);
        tables.configs.insert(config.id, config);
    }

    /// Overwrite a user row as-is, bypassing engine rules.
    pub fn put_user(&self, user: User) {
        let mut tables = self.tables();
        tables.next_id = tables.next_id.max(user.id);
        tables.users.insert(user.id, user);
    }
}

fn sorted<T: Clone>(rows: impl Iterator<Item = T>, key: impl Fn(&T) -> i64) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|row| key(row));
    rows
}

/// Row lock holding a per-config async mutex
struct MemoryConfigLock {
    tables: Arc<Mutex<Tables>>,
    config: Config,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryConfigLock {
    /// Apply `change` to the row, then `then` to the tables, under one table
    /// lock, and release the row lock
    fn commit_with<T>(
        &mut self,
        change: impl FnOnce(&mut Config),
        then: impl FnOnce(&mut Tables, &Config) -> T,
    ) -> StoreResult<(Config, T)> {
        let guard = self.guard.take().ok_or(StoreError::LockReleased)?;

        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let row = tables
            .configs
            .get_mut(&self.config.id)
            .ok_or_else(|| StoreError::Corrupt(format!("config {} vanished", self.config.id)))?;
        change(row);
        let config = row.clone();
        let extra = then(&mut *tables, &config);
        drop(tables);

        drop(guard);
        self.config = config.clone();
        Ok((config, extra))
    }

    fn commit(&mut self, change: impl FnOnce(&mut Config)) -> StoreResult<Config> {
        self.commit_with(change, |_, _| ()).map(|(config, ())| config)
    }
}

#[async_trait]
impl ConfigLock for MemoryConfigLock {
    fn config(&self) -> &Config {
        &self.config
    }

    async fn set_expires_at(&mut self, expires_at: DateTime<Utc>) -> StoreResult<Config> {
        self.commit(|config| config.expires_at = Some(expires_at))
    }

    async fn set_expires_at_with_purchase(
        &mut self,
        expires_at: DateTime<Utc>,
        terms: &PurchaseTerms,
    ) -> StoreResult<(Config, Purchase)> {
        self.commit_with(
            |config| config.expires_at = Some(expires_at),
            |tables, config| tables.push_purchase(&terms.for_config(config)),
        )
    }

    async fn deactivate(&mut self) -> StoreResult<Config> {
        self.commit(|config| config.is_active = false)
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert_user(
        &self,
        external_id: i64,
        username: Option<&str>,
        display_name: &str,
    ) -> StoreResult<User> {
        let mut tables = self.tables();
        if tables.users.values().any(|u| u.external_id == external_id) {
            return Err(StoreError::UniqueViolation("users_external_id_key".to_string()));
        }

        let user = User {
            id: tables.next_id(),
            external_id,
            username: username.map(str::to_string),
            display_name: display_name.to_string(),
            free_trial_used: false,
            free_trial_expires_at: None,
            created_at: Utc::now(),
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.tables().users.get(&user_id).cloned())
    }

    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<User>> {
        Ok(self
            .tables()
            .users
            .values()
            .find(|u| u.external_id == external_id)
            .cloned())
    }

    async fn activate_free_trial(
        &self,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        let mut tables = self.tables();
        if !tables.claim_free_trial(user_id, expires_at) {
            return Ok(None);
        }
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn insert_server(&self, server: &NewServer) -> StoreResult<Server> {
        let mut tables = self.tables();
        if tables.servers.values().any(|s| s.name == server.name) {
            return Err(StoreError::UniqueViolation("servers_name_key".to_string()));
        }

        let row = Server {
            id: tables.next_id(),
            name: server.name.clone(),
            host: server.host.clone(),
            port: server.port,
            country: server.country.clone(),
            is_active: true,
        };
        tables.servers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_server(&self, server_id: ServerId) -> StoreResult<Option<Server>> {
        Ok(self.tables().servers.get(&server_id).cloned())
    }

    async fn list_active_servers(&self) -> StoreResult<Vec<Server>> {
        let tables = self.tables();
        Ok(sorted(
            tables.servers.values().filter(|s| s.is_active).cloned(),
            |s| s.id,
        ))
    }

    async fn set_server_active(
        &self,
        server_id: ServerId,
        is_active: bool,
    ) -> StoreResult<Option<Server>> {
        let mut tables = self.tables();
        Ok(tables.servers.get_mut(&server_id).map(|server| {
            server.is_active = is_active;
            server.clone()
        }))
    }

    async fn insert_protocol(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Protocol> {
        let mut tables = self.tables();
        if tables.protocols.values().any(|p| p.name == name) {
            return Err(StoreError::UniqueViolation("protocols_name_key".to_string()));
        }

        let row = Protocol {
            id: tables.next_id(),
            name: name.to_string(),
            description: description.map(str::to_string),
            is_active: true,
        };
        tables.protocols.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_protocol(&self, protocol_id: ProtocolId) -> StoreResult<Option<Protocol>> {
        Ok(self.tables().protocols.get(&protocol_id).cloned())
    }

    async fn list_active_protocols(&self) -> StoreResult<Vec<Protocol>> {
        let tables = self.tables();
        Ok(sorted(
            tables.protocols.values().filter(|p| p.is_active).cloned(),
            |p| p.id,
        ))
    }

    async fn insert_config(&self, config: &NewConfig) -> StoreResult<Config> {
        let mut tables = self.tables();
        tables.check_config_name(&config.name)?;
        Ok(tables.push_config(config))
    }

    async fn insert_config_with_purchase(
        &self,
        config: &NewConfig,
        terms: &PurchaseTerms,
        claim_free_trial: bool,
    ) -> StoreResult<Option<(Config, Purchase)>> {
        let mut tables = self.tables();
        tables.check_config_name(&config.name)?;

        // Nothing below fails once the trial is claimed
        if claim_free_trial {
            let trial_ends = config.expires_at.unwrap_or(config.created_at);
            if !tables.claim_free_trial(config.user_id, trial_ends) {
                return Ok(None);
            }
        }

        let created = tables.push_config(config);
        let purchase = tables.push_purchase(&terms.for_config(&created));
        Ok(Some((created, purchase)))
    }

    async fn find_config(&self, config_id: ConfigId) -> StoreResult<Option<Config>> {
        Ok(self.tables().configs.get(&config_id).cloned())
    }

    async fn list_user_configs(&self, user_id: UserId) -> StoreResult<Vec<Config>> {
        let tables = self.tables();
        Ok(sorted(
            tables
                .configs
                .values()
                .filter(|c| c.user_id == user_id)
                .cloned(),
            |c| c.id,
        ))
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<Config>> {
        let tables = self.tables();
        Ok(sorted(
            tables
                .configs
                .values()
                .filter(|c| c.is_active && c.is_expired_at(now))
                .cloned(),
            |c| c.id,
        ))
    }

    async fn list_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Config>> {
        let tables = self.tables();
        Ok(sorted(
            tables
                .configs
                .values()
                .filter(|c| {
                    c.is_active && c.expires_at.is_some_and(|at| at >= from && at <= to)
                })
                .cloned(),
            |c| c.id,
        ))
    }

    async fn lock_config(&self, config_id: ConfigId) -> StoreResult<Option<Box<dyn ConfigLock>>> {
        let row_lock = {
            let mut tables = self.tables();
            if !tables.configs.contains_key(&config_id) {
                return Ok(None);
            }
            tables.row_locks.entry(config_id).or_default().clone()
        };

        let guard = tokio::time::timeout(DEFAULT_LOCK_TIMEOUT, row_lock.lock_owned())
            .await
            .map_err(|_| StoreError::Timeout(DEFAULT_LOCK_TIMEOUT))?;

        // Read after acquiring so the holder sees the last committed state
        let Some(config) = self.tables().configs.get(&config_id).cloned() else {
            return Ok(None);
        };

        Ok(Some(Box::new(MemoryConfigLock {
            tables: self.tables.clone(),
            config,
            guard: Some(guard),
        })))
    }

    async fn insert_purchase(&self, purchase: &NewPurchase) -> StoreResult<Purchase> {
        Ok(self.tables().push_purchase(purchase))
    }

    async fn list_user_purchases(&self, user_id: UserId) -> StoreResult<Vec<Purchase>> {
        Ok(self
            .tables()
            .purchases
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_config_purchases(&self, config_id: ConfigId) -> StoreResult<Vec<Purchase>> {
        Ok(self
            .tables()
            .purchases
            .iter()
            .filter(|p| p.config_id == config_id)
            .cloned()
            .collect())
    }

    async fn find_notification(
        &self,
        config_id: ConfigId,
        notification_type: &str,
    ) -> StoreResult<Option<NotificationLog>> {
        Ok(self
            .tables()
            .notifications
            .iter()
            .find(|n| n.config_id == config_id && n.notification_type == notification_type)
            .cloned())
    }

    async fn insert_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        let mut tables = self.tables();
        let exists = tables.notifications.iter().any(|n| {
            n.config_id == notification.config_id
                && n.notification_type == notification.notification_type
        });
        if exists {
            return Ok(false);
        }

        let row = NotificationLog {
            id: tables.next_id(),
            config_id: notification.config_id,
            user_id: notification.user_id,
            notification_type: notification.notification_type.clone(),
            sent_at: notification.sent_at,
            expires_at: notification.expires_at,
        };
        tables.notifications.push(row);
        Ok(true)
    }
}
