//! Entitlement data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User ID type
pub type UserId = i64;

/// Server ID type
pub type ServerId = i64;

/// Protocol ID type
pub type ProtocolId = i64;

/// Config ID type
pub type ConfigId = i64;

/// Notification type recorded when a config is about to expire
pub const EXPIRATION_WARNING: &str = "expiration_warning";

/// User model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Identity in the messaging channel the user signed up from
    pub external_id: i64,
    pub username: Option<String>,
    pub display_name: String,
    pub free_trial_used: bool,
    pub free_trial_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Provisioning endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub country: Option<String>,
    pub is_active: bool,
}

/// Credential scheme (e.g. "openvpn")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub id: ProtocolId,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
}

/// A time-bounded entitlement tied to one provisioned credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub id: ConfigId,
    pub user_id: UserId,
    pub server_id: ServerId,
    pub protocol_id: ProtocolId,
    /// Logical credential name, unique across the provisioning namespace
    pub name: String,
    pub credential_content: String,
    pub created_at: DateTime<Utc>,
    /// `None` means the entitlement never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Config {
    /// Whether the deadline has passed at `now`. Unbounded configs never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    /// Whether the config currently grants access.
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Fields for inserting a freshly provisioned config
#[derive(Debug, Clone)]
pub struct NewConfig {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub protocol_id: ProtocolId,
    pub name: String,
    pub credential_content: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Fields for registering a server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub country: Option<String>,
}

/// Purchase type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseType {
    New,
    Renewal,
    Migration,
}

impl std::fmt::Display for PurchaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PurchaseType::New => write!(f, "new"),
            PurchaseType::Renewal => write!(f, "renewal"),
            PurchaseType::Migration => write!(f, "migration"),
        }
    }
}

impl std::str::FromStr for PurchaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(PurchaseType::New),
            "renewal" => Ok(PurchaseType::Renewal),
            "migration" => Ok(PurchaseType::Migration),
            other => Err(format!("unknown purchase type '{other}'")),
        }
    }
}

/// Immutable purchase audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: i64,
    pub user_id: UserId,
    pub config_id: ConfigId,
    /// Amount in minor currency units
    pub amount: i64,
    pub duration_days: i64,
    pub purchase_type: PurchaseType,
    pub created_at: DateTime<Utc>,
}

/// Fields for appending a purchase
#[derive(Debug, Clone)]
pub struct NewPurchase {
    pub user_id: UserId,
    pub config_id: ConfigId,
    pub amount: i64,
    pub duration_days: i64,
    pub purchase_type: PurchaseType,
    pub created_at: DateTime<Utc>,
}

/// What a purchase paid for, written in the same commit as the config change
#[derive(Debug, Clone)]
pub struct PurchaseTerms {
    pub amount: i64,
    pub duration_days: i64,
    pub purchase_type: PurchaseType,
    pub created_at: DateTime<Utc>,
}

impl PurchaseTerms {
    /// Purchase row for `config`, charged to its owner
    pub fn for_config(&self, config: &Config) -> NewPurchase {
        NewPurchase {
            user_id: config.user_id,
            config_id: config.id,
            amount: self.amount,
            duration_days: self.duration_days,
            purchase_type: self.purchase_type,
            created_at: self.created_at,
        }
    }
}

/// Idempotency marker for a sent notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: i64,
    pub config_id: ConfigId,
    pub user_id: UserId,
    pub notification_type: String,
    pub sent_at: DateTime<Utc>,
    /// Deadline of the config at the time the notification was sent
    pub expires_at: Option<DateTime<Utc>>,
}

/// Fields for recording a sent notification
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub config_id: ConfigId,
    pub user_id: UserId,
    pub notification_type: String,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Which configs to list for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigScope {
    /// Active and not past the deadline
    #[default]
    Active,
    All,
}

/// Config joined with the names a client needs to display it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub id: ConfigId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub protocol: String,
    pub server_name: String,
    pub server_country: Option<String>,
    /// Only populated for active listings
    pub credential_content: Option<String>,
}

/// Free trial status of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeTrialStatus {
    pub available: bool,
    pub used: bool,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl FreeTrialStatus {
    /// Derive the status from a user record at `now`.
    pub fn of(user: &User, now: DateTime<Utc>) -> Self {
        if !user.free_trial_used {
            return Self {
                available: true,
                used: false,
                active: false,
                expires_at: None,
            };
        }

        Self {
            available: false,
            used: true,
            active: user.free_trial_expires_at.is_some_and(|at| at > now),
            expires_at: user.free_trial_expires_at,
        }
    }
}

/// Buy request (new config, optionally paid for by the free trial)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyRequest {
    pub user_id: UserId,
    pub server_id: ServerId,
    pub protocol_id: ProtocolId,
    /// Ignored for trial purchases
    #[serde(default)]
    pub amount: i64,
    /// Ignored for trial purchases
    #[serde(default)]
    pub duration_days: i64,
    #[serde(default)]
    pub use_free_trial: bool,
}

/// Renewal request for an existing config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewRequest {
    pub config_id: ConfigId,
    pub user_id: UserId,
    pub amount: i64,
    pub duration_days: i64,
}
