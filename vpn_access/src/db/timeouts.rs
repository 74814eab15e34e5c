//! Database query timeout helpers
//!
//! Every store query goes through one of these wrappers so a stuck connection
//! surfaces as [`StoreError::Timeout`] instead of hanging a request handler or
//! the reconciliation loop.

use std::time::Duration;
use tokio::time::timeout;

use super::errors::{StoreError, StoreResult};

/// Default timeout for database queries (5 seconds)
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for acquiring a row lock (10 seconds)
///
/// Lock holders may be waiting on a remote revoke, so this is longer than a
/// plain query.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for scans over many rows (30 seconds)
pub const LONG_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute a query with timeout
///
/// # Example
///
/// ```no_run
/// use vpn_access::db::timeouts::{with_timeout, DEFAULT_QUERY_TIMEOUT};
/// # use sqlx::PgPool;
/// # async fn example(pool: &PgPool) -> Result<(), Box<dyn std::error::Error>> {
///
/// let row = with_timeout(
///     DEFAULT_QUERY_TIMEOUT,
///     sqlx::query("SELECT * FROM users WHERE id = $1")
///         .bind(1_i64)
///         .fetch_one(pool)
/// ).await?;
///
/// # Ok(())
/// # }
/// ```
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> StoreResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(StoreError::from(e)),
        Err(_) => Err(StoreError::Timeout(duration)),
    }
}

/// Execute a query with default timeout (5 seconds)
pub async fn with_default_timeout<F, T>(future: F) -> StoreResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    with_timeout(DEFAULT_QUERY_TIMEOUT, future).await
}

/// Execute a long-running query with extended timeout (30 seconds)
pub async fn with_long_timeout<F, T>(future: F) -> StoreResult<T>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    with_timeout(LONG_OPERATION_TIMEOUT, future).await
}
