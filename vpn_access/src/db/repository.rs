//! Store trait definitions for testability and dependency injection.
//!
//! The lifecycle engine and the reconciliation loop only ever talk to an
//! [`EntitlementStore`]. The store is the single source of truth: nothing is
//! cached in process between calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::errors::StoreResult;
use crate::entitlement::models::{
    Config, ConfigId, NewConfig, NewNotification, NewPurchase, NewServer, NotificationLog,
    Protocol, ProtocolId, Purchase, PurchaseTerms, Server, ServerId, User, UserId,
};

/// Exclusive hold on one config row.
///
/// While a lock is alive no other extend or deactivate can run for the same
/// config. Each mutating method commits and releases the lock; dropping the
/// lock without calling one releases it with no change.
#[async_trait]
pub trait ConfigLock: Send {
    /// Config as read under the lock
    fn config(&self) -> &Config;

    /// Move the deadline and commit
    async fn set_expires_at(&mut self, expires_at: DateTime<Utc>) -> StoreResult<Config>;

    /// Move the deadline and append the purchase that paid for it in one
    /// commit. On error neither is written.
    async fn set_expires_at_with_purchase(
        &mut self,
        expires_at: DateTime<Utc>,
        terms: &PurchaseTerms,
    ) -> StoreResult<(Config, Purchase)>;

    /// Mark the config inactive and commit
    async fn deactivate(&mut self) -> StoreResult<Config>;
}

/// Trait for entitlement persistence
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Check that the backing store answers
    async fn health_check(&self) -> StoreResult<()>;

    // Users

    /// Create a user; fails with a unique violation if `external_id` exists
    async fn insert_user(
        &self,
        external_id: i64,
        username: Option<&str>,
        display_name: &str,
    ) -> StoreResult<User>;

    /// Find user by ID
    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>>;

    /// Find user by external identity
    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<User>>;

    /// Mark the free trial used if it was not yet.
    ///
    /// Returns `None` when the trial was already used (or the user is missing);
    /// the check and the write are a single atomic step.
    async fn activate_free_trial(
        &self,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<User>>;

    // Servers and protocols

    async fn insert_server(&self, server: &NewServer) -> StoreResult<Server>;

    async fn find_server(&self, server_id: ServerId) -> StoreResult<Option<Server>>;

    async fn list_active_servers(&self) -> StoreResult<Vec<Server>>;

    /// Enable or disable a server; returns `None` if it does not exist
    async fn set_server_active(
        &self,
        server_id: ServerId,
        is_active: bool,
    ) -> StoreResult<Option<Server>>;

    async fn insert_protocol(&self, name: &str, description: Option<&str>)
    -> StoreResult<Protocol>;

    async fn find_protocol(&self, protocol_id: ProtocolId) -> StoreResult<Option<Protocol>>;

    async fn list_active_protocols(&self) -> StoreResult<Vec<Protocol>>;

    // Configs

    /// Persist a provisioned config as active
    async fn insert_config(&self, config: &NewConfig) -> StoreResult<Config>;

    /// Persist a bought config together with its purchase.
    ///
    /// With `claim_free_trial` the owner's trial is marked used in the same
    /// step, ending at the config's deadline. Returns `None` and writes
    /// nothing when the trial was already used. On error nothing is written.
    async fn insert_config_with_purchase(
        &self,
        config: &NewConfig,
        terms: &PurchaseTerms,
        claim_free_trial: bool,
    ) -> StoreResult<Option<(Config, Purchase)>>;

    async fn find_config(&self, config_id: ConfigId) -> StoreResult<Option<Config>>;

    /// All configs of a user, oldest first
    async fn list_user_configs(&self, user_id: UserId) -> StoreResult<Vec<Config>>;

    /// Active configs whose deadline is strictly before `now`
    async fn list_expired_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<Config>>;

    /// Active configs with `from <= expires_at <= to`
    async fn list_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Config>>;

    /// Take the row lock for a config; `None` if it does not exist
    async fn lock_config(&self, config_id: ConfigId) -> StoreResult<Option<Box<dyn ConfigLock>>>;

    // Purchases

    async fn insert_purchase(&self, purchase: &NewPurchase) -> StoreResult<Purchase>;

    async fn list_user_purchases(&self, user_id: UserId) -> StoreResult<Vec<Purchase>>;

    async fn list_config_purchases(&self, config_id: ConfigId) -> StoreResult<Vec<Purchase>>;

    // Notification log

    async fn find_notification(
        &self,
        config_id: ConfigId,
        notification_type: &str,
    ) -> StoreResult<Option<NotificationLog>>;

    /// Record a sent notification.
    ///
    /// Returns `false` if a row for the same (config, type) already existed.
    async fn insert_notification(&self, notification: &NewNotification) -> StoreResult<bool>;
}
