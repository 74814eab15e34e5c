//! HTTP facade and reconciliation daemon for VPN access entitlements.
//!
//! The binary wires [`vpn_access`] to Postgres, the SSH provisioner and a
//! notifier, serves the [`api`] router and runs the expiry sweep in the
//! background until shutdown.

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;
