//! Entitlement lifecycle: data model, errors and the engine.

pub mod errors;
pub mod manager;
pub mod models;

pub use errors::{EntitlementError, EntitlementResult, ErrorKind};
pub use manager::{ConfigPurchase, EntitlementManager, EntitlementSettings};
pub use models::{
    BuyRequest, Config, ConfigId, ConfigScope, ConfigSummary, FreeTrialStatus, NewServer,
    Protocol, ProtocolId, Purchase, PurchaseType, RenewRequest, Server, ServerId, User, UserId,
};
