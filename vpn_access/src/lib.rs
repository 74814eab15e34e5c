//! # VPN Access
//!
//! Lifecycle engine for time-bounded VPN access grants ("configs").
//!
//! A config entitles a user to one credential provisioned on a remote server.
//! The engine creates configs only after the credential exists, extends them
//! relative to their current deadline, hands out a one-time free trial, and
//! revokes credentials before marking configs inactive. A background sweep
//! reclaims configs whose deadline has passed.
//!
//! ## Core Modules
//!
//! - [`entitlement`]: Data model, errors and the [`EntitlementManager`]
//! - [`reconcile`]: Periodic expiry sweep ([`Reconciler`])
//! - [`db`]: Store trait with PostgreSQL and in-memory implementations
//! - [`provision`]: Remote credential provisioning over SSH
//! - [`notify`]: Outbound user notifications
//!
//! ## Failure policy
//!
//! Interactive deactivation is fail-closed: a config stays active unless the
//! provisioner confirms removal. The sweep is fail-open: expired configs are
//! deactivated even when removal fails, and the failure is logged.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use vpn_access::{
//!     EntitlementManager, EntitlementSettings,
//!     db::MemoryEntitlementStore,
//!     provision::{SshProvisioner, SshProvisionerConfig},
//! };
//!
//! let engine = EntitlementManager::new(
//!     Arc::new(MemoryEntitlementStore::new()),
//!     Arc::new(SshProvisioner::new(SshProvisionerConfig::default())),
//!     EntitlementSettings::default(),
//! );
//! assert_eq!(engine.settings().free_trial_days, 7);
//! ```

/// Persistence: store trait, PostgreSQL pool and in-memory store.
pub mod db;

/// Entitlement data model and lifecycle engine.
pub mod entitlement;
pub use entitlement::{
    ConfigPurchase, EntitlementError, EntitlementManager, EntitlementResult, EntitlementSettings,
    ErrorKind,
};

/// Outbound notifications.
pub mod notify;

/// Remote credential provisioning.
pub mod provision;

/// Background expiry sweep.
pub mod reconcile;
pub use reconcile::{Reconciler, ReconcilerSettings, SweepReport};
