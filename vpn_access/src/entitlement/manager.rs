//! Entitlement lifecycle engine.
//!
//! Creates configs backed by a provisioned credential, extends and renews
//! them, deactivates them (fail-closed) and hands out the one-time free trial.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::{
    errors::{EntitlementError, EntitlementResult},
    models::{
        BuyRequest, Config, ConfigId, ConfigScope, ConfigSummary, FreeTrialStatus, NewConfig,
        NewPurchase, NewServer, Protocol, ProtocolId, Purchase, PurchaseTerms, PurchaseType,
        RenewRequest, Server, ServerId, User, UserId,
    },
};
use crate::db::{EntitlementStore, StoreError};
use crate::provision::{CredentialProvisioner, ProvisionError};

/// Longest duration accepted for a single grant or extension (100 years)
pub const MAX_DURATION_DAYS: i64 = 36_500;

/// Engine settings
#[derive(Debug, Clone)]
pub struct EntitlementSettings {
    /// Length of the free trial, also the duration of a trial-paid config
    pub free_trial_days: i64,
}

impl Default for EntitlementSettings {
    fn default() -> Self {
        Self { free_trial_days: 7 }
    }
}

/// Result of a buy or renew: the config as committed and its audit record
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConfigPurchase {
    pub config: Config,
    pub purchase: Purchase,
}

/// Logical credential name for a new config: `user-{id}-{unix_nanos}`
pub fn generate_config_name(user_id: UserId, now: DateTime<Utc>) -> String {
    let stamp = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros());
    format!("user-{user_id}-{stamp}")
}

fn validate_days(days: i64) -> EntitlementResult<Duration> {
    if days <= 0 || days > MAX_DURATION_DAYS {
        return Err(EntitlementError::Validation(format!(
            "duration must be between 1 and {MAX_DURATION_DAYS} days, got {days}"
        )));
    }
    Duration::try_days(days)
        .ok_or_else(|| EntitlementError::Validation(format!("duration out of range: {days}")))
}

fn validate_amount(amount: i64) -> EntitlementResult<()> {
    if amount < 0 {
        return Err(EntitlementError::Validation(format!(
            "amount must not be negative, got {amount}"
        )));
    }
    Ok(())
}

/// `base + days`, rejecting overflow instead of panicking
fn deadline_after(base: DateTime<Utc>, days: i64) -> EntitlementResult<DateTime<Utc>> {
    base.checked_add_signed(validate_days(days)?)
        .ok_or_else(|| EntitlementError::Validation(format!("deadline out of range: {days} days")))
}

/// New deadline for extending `config` by `days`
///
/// Counts from the current deadline, or from now for an unbounded config.
fn extended_deadline(config: &Config, days: i64) -> EntitlementResult<DateTime<Utc>> {
    if !config.is_active {
        return Err(EntitlementError::ConfigInactive(config.id));
    }
    deadline_after(config.expires_at.unwrap_or_else(Utc::now), days)
}

/// Map a unique violation on `name` to a domain conflict
fn duplicate_or_store(err: StoreError, name: &str) -> EntitlementError {
    match err {
        StoreError::UniqueViolation(_) => EntitlementError::DuplicateName(name.to_string()),
        other => EntitlementError::Store(other),
    }
}

/// Entitlement lifecycle engine
#[derive(Clone)]
pub struct EntitlementManager {
    store: Arc<dyn EntitlementStore>,
    provisioner: Arc<dyn CredentialProvisioner>,
    settings: EntitlementSettings,
}

impl EntitlementManager {
    /// Create a new engine over a store and a provisioner
    pub fn new(
        store: Arc<dyn EntitlementStore>,
        provisioner: Arc<dyn CredentialProvisioner>,
        settings: EntitlementSettings,
    ) -> Self {
        Self {
            store,
            provisioner,
            settings,
        }
    }

    pub fn settings(&self) -> &EntitlementSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn EntitlementStore> {
        &self.store
    }

    // === Users ===

    /// Get or create the user for an external identity
    ///
    /// # Returns
    ///
    /// * `(User, bool)` - The user and whether it was created by this call
    pub async fn register_user(
        &self,
        external_id: i64,
        username: Option<&str>,
        display_name: &str,
    ) -> EntitlementResult<(User, bool)> {
        if let Some(user) = self.store.find_user_by_external_id(external_id).await? {
            return Ok((user, false));
        }

        match self
            .store
            .insert_user(external_id, username, display_name)
            .await
        {
            Ok(user) => {
                log::info!("Registered user {} (external id {})", user.id, external_id);
                Ok((user, true))
            }
            // Lost a race with a concurrent registration
            Err(StoreError::UniqueViolation(_)) => {
                let user = self
                    .store
                    .find_user_by_external_id(external_id)
                    .await?
                    .ok_or_else(|| {
                        EntitlementError::Store(StoreError::Corrupt(format!(
                            "user with external id {external_id} vanished"
                        )))
                    })?;
                Ok((user, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, user_id: UserId) -> EntitlementResult<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or(EntitlementError::UserNotFound(user_id))
    }

    pub async fn find_user_by_external_id(&self, external_id: i64) -> EntitlementResult<Option<User>> {
        Ok(self.store.find_user_by_external_id(external_id).await?)
    }

    // === Catalog ===

    /// Register a provisioning server
    ///
    /// # Errors
    ///
    /// * `EntitlementError::Validation` - Empty name/host or port 0
    /// * `EntitlementError::DuplicateName` - A server with this name exists
    pub async fn create_server(&self, server: NewServer) -> EntitlementResult<Server> {
        if server.name.trim().is_empty() || server.host.trim().is_empty() {
            return Err(EntitlementError::Validation(
                "server name and host are required".to_string(),
            ));
        }
        if server.port == 0 {
            return Err(EntitlementError::Validation(
                "server port must not be 0".to_string(),
            ));
        }

        let created = self
            .store
            .insert_server(&server)
            .await
            .map_err(|e| duplicate_or_store(e, &server.name))?;
        log::info!("Created server {} ({})", created.id, created.name);
        Ok(created)
    }

    /// Enable or disable a server for new configs
    pub async fn set_server_active(
        &self,
        server_id: ServerId,
        is_active: bool,
    ) -> EntitlementResult<Server> {
        self.store
            .set_server_active(server_id, is_active)
            .await?
            .ok_or(EntitlementError::ServerNotFound(server_id))
    }

    /// Register a credential scheme
    pub async fn create_protocol(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> EntitlementResult<Protocol> {
        if name.trim().is_empty() {
            return Err(EntitlementError::Validation(
                "protocol name is required".to_string(),
            ));
        }

        let created = self
            .store
            .insert_protocol(name, description)
            .await
            .map_err(|e| duplicate_or_store(e, name))?;
        log::info!("Created protocol {} ({})", created.id, created.name);
        Ok(created)
    }

    pub async fn list_active_servers(&self) -> EntitlementResult<Vec<Server>> {
        Ok(self.store.list_active_servers().await?)
    }

    pub async fn list_active_protocols(&self) -> EntitlementResult<Vec<Protocol>> {
        Ok(self.store.list_active_protocols().await?)
    }

    async fn active_server(&self, server_id: ServerId) -> EntitlementResult<Server> {
        let server = self
            .store
            .find_server(server_id)
            .await?
            .ok_or(EntitlementError::ServerNotFound(server_id))?;
        if !server.is_active {
            return Err(EntitlementError::InactiveServer(server_id));
        }
        Ok(server)
    }

    async fn active_protocol(&self, protocol_id: ProtocolId) -> EntitlementResult<Protocol> {
        let protocol = self
            .store
            .find_protocol(protocol_id)
            .await?
            .ok_or(EntitlementError::ProtocolNotFound(protocol_id))?;
        if !protocol.is_active {
            return Err(EntitlementError::InactiveProtocol(protocol_id));
        }
        Ok(protocol)
    }

    // === Free trial ===

    /// Grant the one-time free trial
    ///
    /// The check and the write are one atomic store operation, so concurrent
    /// calls for the same user succeed exactly once.
    ///
    /// # Errors
    ///
    /// * `EntitlementError::UserNotFound` - User does not exist
    /// * `EntitlementError::TrialAlreadyUsed` - Trial was activated before
    pub async fn activate_free_trial(
        &self,
        user_id: UserId,
        trial_days: i64,
    ) -> EntitlementResult<User> {
        let expires_at = deadline_after(Utc::now(), trial_days)?;
        self.get_user(user_id).await?;

        let user = self
            .store
            .activate_free_trial(user_id, expires_at)
            .await?
            .ok_or(EntitlementError::TrialAlreadyUsed(user_id))?;

        log::info!(
            "Free trial activated for user {} until {}",
            user_id,
            expires_at
        );
        Ok(user)
    }

    pub async fn free_trial_status(&self, user_id: UserId) -> EntitlementResult<FreeTrialStatus> {
        let user = self.get_user(user_id).await?;
        Ok(FreeTrialStatus::of(&user, Utc::now()))
    }

    // === Configs ===

    /// Provision a credential and persist the config that owns it
    ///
    /// Nothing is written unless provisioning succeeds. If the write fails
    /// after a successful provision, the orphaned credential is revoked on a
    /// best-effort basis before the error is returned.
    ///
    /// # Arguments
    ///
    /// * `duration_days` - Lifetime of the grant; `None` never expires
    ///
    /// # Errors
    ///
    /// * `EntitlementError::{User,Server,Protocol}NotFound` - Missing reference
    /// * `EntitlementError::InactiveServer` / `InactiveProtocol` - Disabled reference
    /// * `EntitlementError::Provision` - Remote credential could not be created
    /// * `EntitlementError::DuplicateName` - Generated name already taken
    pub async fn create_config(
        &self,
        user_id: UserId,
        server_id: ServerId,
        protocol_id: ProtocolId,
        duration_days: Option<i64>,
    ) -> EntitlementResult<Config> {
        let (server, new_config) = self
            .provision_config(user_id, server_id, protocol_id, duration_days)
            .await?;

        match self.store.insert_config(&new_config).await {
            Ok(config) => {
                log::info!(
                    "Created config {} ('{}') for user {} expiring {:?}",
                    config.id,
                    config.name,
                    user_id,
                    config.expires_at
                );
                Ok(config)
            }
            Err(e) => Err(self.abandon_credential(&server, &new_config.name, e).await),
        }
    }

    /// Check the references of a new config and create its remote credential
    async fn provision_config(
        &self,
        user_id: UserId,
        server_id: ServerId,
        protocol_id: ProtocolId,
        duration_days: Option<i64>,
    ) -> EntitlementResult<(Server, NewConfig)> {
        let now = Utc::now();
        let expires_at = duration_days
            .map(|days| deadline_after(now, days))
            .transpose()?;

        self.get_user(user_id).await?;
        let server = self.active_server(server_id).await?;
        self.active_protocol(protocol_id).await?;

        let name = generate_config_name(user_id, now);
        let credential_content = self
            .provisioner
            .provision(&server, &name)
            .await
            .map_err(|e| {
                log::warn!("Provisioning '{}' on server {} failed: {}", name, server.name, e);
                EntitlementError::Provision(e)
            })?;

        let new_config = NewConfig {
            user_id,
            server_id,
            protocol_id,
            name,
            credential_content,
            created_at: now,
            expires_at,
        };
        Ok((server, new_config))
    }

    /// Revoke a credential whose config could not be persisted
    async fn abandon_credential(
        &self,
        server: &Server,
        name: &str,
        err: StoreError,
    ) -> EntitlementError {
        log::error!("Persisting config '{}' failed, revoking credential: {}", name, err);
        self.revoke_orphan(server, name).await;
        duplicate_or_store(err, name)
    }

    /// Remove a credential nothing references anymore; failures are only logged
    async fn revoke_orphan(&self, server: &Server, name: &str) {
        match self.provisioner.revoke(server, name).await {
            Ok(true) => log::info!("Revoked orphaned credential '{}'", name),
            Ok(false) => log::warn!("Orphaned credential '{}' removal not confirmed", name),
            Err(e) => log::warn!("Orphaned credential '{}' removal failed: {}", name, e),
        }
    }

    pub async fn get_config(&self, config_id: ConfigId) -> EntitlementResult<Config> {
        self.store
            .find_config(config_id)
            .await?
            .ok_or(EntitlementError::ConfigNotFound(config_id))
    }

    /// Push a config's deadline back by `additional_days`
    ///
    /// The extension is added to the current deadline, not to now, so no
    /// remaining time is lost. An unbounded config gets `now + additional_days`.
    /// Never re-provisions.
    ///
    /// # Errors
    ///
    /// * `EntitlementError::ConfigNotFound` - Config does not exist
    /// * `EntitlementError::ConfigInactive` - Config was deactivated
    /// * `EntitlementError::Validation` - Non-positive or oversized extension
    pub async fn extend_config(
        &self,
        config_id: ConfigId,
        additional_days: i64,
    ) -> EntitlementResult<Config> {
        validate_days(additional_days)?;

        let mut lock = self
            .store
            .lock_config(config_id)
            .await?
            .ok_or(EntitlementError::ConfigNotFound(config_id))?;

        let expires_at = extended_deadline(lock.config(), additional_days)?;
        let config = lock.set_expires_at(expires_at).await?;

        log::info!(
            "Extended config {} by {} days to {}",
            config_id,
            additional_days,
            expires_at
        );
        Ok(config)
    }

    /// Revoke the remote credential, then mark the config inactive
    ///
    /// Fail-closed: the config stays active unless the provisioner confirms
    /// removal. An already inactive config is returned unchanged without a
    /// remote call.
    ///
    /// # Errors
    ///
    /// * `EntitlementError::ConfigNotFound` - Config does not exist
    /// * `EntitlementError::Revocation` - Removal failed or was not confirmed
    pub async fn deactivate_config(&self, config_id: ConfigId) -> EntitlementResult<Config> {
        let mut lock = self
            .store
            .lock_config(config_id)
            .await?
            .ok_or(EntitlementError::ConfigNotFound(config_id))?;

        let config = lock.config().clone();
        if !config.is_active {
            return Ok(config);
        }

        let server = self
            .store
            .find_server(config.server_id)
            .await?
            .ok_or(EntitlementError::ServerNotFound(config.server_id))?;

        let source = match self.provisioner.revoke(&server, &config.name).await {
            Ok(true) => {
                let config = lock.deactivate().await?;
                log::info!("Deactivated config {} ('{}')", config.id, config.name);
                return Ok(config);
            }
            Ok(false) => ProvisionError::NotConfirmed(config.name.clone()),
            Err(e) => e,
        };

        log::warn!(
            "Config {} left active, revocation of '{}' failed: {}",
            config_id,
            config.name,
            source
        );
        Err(EntitlementError::Revocation {
            name: config.name,
            source,
        })
    }

    /// List a user's configs joined with their server and protocol names
    ///
    /// `Active` returns configs that are active and not past their deadline,
    /// including credential content. `All` returns every config without it.
    pub async fn list_user_configs(
        &self,
        user_id: UserId,
        scope: ConfigScope,
    ) -> EntitlementResult<Vec<ConfigSummary>> {
        self.get_user(user_id).await?;
        let now = Utc::now();

        let configs = self.store.list_user_configs(user_id).await?;
        let mut servers: HashMap<ServerId, Server> = HashMap::new();
        let mut protocols: HashMap<ProtocolId, Protocol> = HashMap::new();
        let mut summaries = Vec::new();

        for config in configs {
            if scope == ConfigScope::Active && !config.is_usable_at(now) {
                continue;
            }

            if !servers.contains_key(&config.server_id) {
                let server = self
                    .store
                    .find_server(config.server_id)
                    .await?
                    .ok_or(EntitlementError::ServerNotFound(config.server_id))?;
                servers.insert(server.id, server);
            }
            if !protocols.contains_key(&config.protocol_id) {
                let protocol = self
                    .store
                    .find_protocol(config.protocol_id)
                    .await?
                    .ok_or(EntitlementError::ProtocolNotFound(config.protocol_id))?;
                protocols.insert(protocol.id, protocol);
            }

            let server = &servers[&config.server_id];
            let protocol = &protocols[&config.protocol_id];
            summaries.push(ConfigSummary {
                id: config.id,
                name: config.name,
                created_at: config.created_at,
                expires_at: config.expires_at,
                is_active: config.is_active,
                protocol: protocol.name.clone(),
                server_name: server.name.clone(),
                server_country: server.country.clone(),
                credential_content: (scope == ConfigScope::Active)
                    .then_some(config.credential_content),
            });
        }

        Ok(summaries)
    }

    /// Active configs with a deadline between now and `now + window`
    pub async fn configs_expiring_within(&self, window: Duration) -> EntitlementResult<Vec<Config>> {
        let now = Utc::now();
        let until = now.checked_add_signed(window).ok_or_else(|| {
            EntitlementError::Validation(format!("window out of range: {window}"))
        })?;
        Ok(self.store.list_expiring_between(now, until).await?)
    }

    // === Purchases ===

    /// Append a purchase audit record for a config change made elsewhere
    ///
    /// Buy and renew write their own record in the same commit as the change.
    pub async fn record_purchase(
        &self,
        user_id: UserId,
        config_id: ConfigId,
        amount: i64,
        duration_days: i64,
        purchase_type: PurchaseType,
    ) -> EntitlementResult<Purchase> {
        validate_amount(amount)?;
        validate_days(duration_days)?;

        let purchase = self
            .store
            .insert_purchase(&NewPurchase {
                user_id,
                config_id,
                amount,
                duration_days,
                purchase_type,
                created_at: Utc::now(),
            })
            .await?;

        log::info!(
            "Recorded {} purchase {} for config {} ({} for {} days)",
            purchase_type,
            purchase.id,
            config_id,
            amount,
            duration_days
        );
        Ok(purchase)
    }

    /// Buy a new config, optionally paid for with the free trial
    ///
    /// With `use_free_trial` the amount is pinned to 0 and the duration to the
    /// configured trial length, whatever the request says. The config, its
    /// purchase and the trial claim are committed together: a failed buy
    /// leaves no config, no purchase, an unspent trial and a revoked
    /// credential.
    ///
    /// # Errors
    ///
    /// * `EntitlementError::TrialAlreadyUsed` - Trial requested but not available
    /// * Everything [`create_config`](Self::create_config) returns
    pub async fn buy_config(&self, request: BuyRequest) -> EntitlementResult<ConfigPurchase> {
        let (amount, duration_days) = if request.use_free_trial {
            let user = self.get_user(request.user_id).await?;
            if user.free_trial_used {
                return Err(EntitlementError::TrialAlreadyUsed(request.user_id));
            }
            (0, self.settings.free_trial_days)
        } else {
            (request.amount, request.duration_days)
        };
        validate_amount(amount)?;
        validate_days(duration_days)?;

        let (server, new_config) = self
            .provision_config(
                request.user_id,
                request.server_id,
                request.protocol_id,
                Some(duration_days),
            )
            .await?;

        let terms = PurchaseTerms {
            amount,
            duration_days,
            purchase_type: PurchaseType::New,
            created_at: new_config.created_at,
        };
        let (config, purchase) = match self
            .store
            .insert_config_with_purchase(&new_config, &terms, request.use_free_trial)
            .await
        {
            Ok(Some(bought)) => bought,
            Ok(None) => {
                // A concurrent call consumed the trial in the meantime
                self.revoke_orphan(&server, &new_config.name).await;
                return Err(EntitlementError::TrialAlreadyUsed(request.user_id));
            }
            Err(e) => return Err(self.abandon_credential(&server, &new_config.name, e).await),
        };

        log::info!(
            "User {} bought config {} ('{}') for {} days, purchase {}",
            request.user_id,
            config.id,
            config.name,
            duration_days,
            purchase.id
        );
        Ok(ConfigPurchase { config, purchase })
    }

    /// Renew an existing config for its owner
    ///
    /// The extension and its purchase record commit together under the
    /// config's row lock.
    ///
    /// # Errors
    ///
    /// * `EntitlementError::ConfigNotFound` - Missing, or owned by another user
    /// * Everything [`extend_config`](Self::extend_config) returns
    pub async fn renew_config(&self, request: RenewRequest) -> EntitlementResult<ConfigPurchase> {
        validate_amount(request.amount)?;
        validate_days(request.duration_days)?;

        let mut lock = self
            .store
            .lock_config(request.config_id)
            .await?
            .ok_or(EntitlementError::ConfigNotFound(request.config_id))?;
        if lock.config().user_id != request.user_id {
            return Err(EntitlementError::ConfigNotFound(request.config_id));
        }

        let expires_at = extended_deadline(lock.config(), request.duration_days)?;
        let terms = PurchaseTerms {
            amount: request.amount,
            duration_days: request.duration_days,
            purchase_type: PurchaseType::Renewal,
            created_at: Utc::now(),
        };
        let (config, purchase) = lock.set_expires_at_with_purchase(expires_at, &terms).await?;

        log::info!(
            "Renewed config {} by {} days to {}, purchase {}",
            config.id,
            request.duration_days,
            expires_at,
            purchase.id
        );
        Ok(ConfigPurchase { config, purchase })
    }

    pub async fn list_user_purchases(&self, user_id: UserId) -> EntitlementResult<Vec<Purchase>> {
        self.get_user(user_id).await?;
        Ok(self.store.list_user_purchases(user_id).await?)
    }

    pub async fn list_config_purchases(
        &self,
        config_id: ConfigId,
    ) -> EntitlementResult<Vec<Purchase>> {
        self.get_config(config_id).await?;
        Ok(self.store.list_config_purchases(config_id).await?)
    }
}
