//! Database module providing PostgreSQL connection pooling and the
//! entitlement store implementations.
//!
//! The engine only sees the [`EntitlementStore`] trait. [`PgEntitlementStore`]
//! is the production backend; [`MemoryEntitlementStore`] keeps the same
//! constraints in process memory for tests and local runs.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

pub mod config;
pub mod errors;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod timeouts;

pub use config::DatabaseConfig;
pub use errors::{StoreError, StoreResult};
pub use memory::MemoryEntitlementStore;
pub use postgres::PgEntitlementStore;
pub use repository::{ConfigLock, EntitlementStore};

/// Idempotent schema script (`CREATE TABLE IF NOT EXISTS ...`)
const SCHEMA: &str = include_str!("schema.sql");

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vpn_access::db::{Database, DatabaseConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), sqlx::Error> {
    ///     let config = DatabaseConfig::from_env();
    ///     let db = Database::new(&config).await?;
    ///     db.apply_schema().await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Build the entitlement store backed by this pool
    pub fn entitlement_store(&self) -> PgEntitlementStore {
        PgEntitlementStore::new(self.pool.clone())
    }

    /// Create missing tables and indexes
    pub async fn apply_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if the database connection is healthy
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the database connection pool
    pub async fn close(self) {
        self.pool.close().await;
    }
}
