//! PostgreSQL implementation of the entitlement store.
#![allow(clippy::needless_raw_string_hashes)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction, postgres::PgRow};

use super::{
    errors::{StoreError, StoreResult},
    repository::{ConfigLock, EntitlementStore},
    timeouts::{DEFAULT_LOCK_TIMEOUT, with_default_timeout, with_long_timeout, with_timeout},
};
use crate::entitlement::models::{
    Config, ConfigId, NewConfig, NewNotification, NewPurchase, NewServer, NotificationLog,
    Protocol, ProtocolId, Purchase, PurchaseTerms, Server, ServerId, User, UserId,
};

const USER_COLUMNS: &str =
    "id, external_id, username, display_name, free_trial_used, free_trial_expires_at, created_at";
const SERVER_COLUMNS: &str = "id, name, host, port, country, is_active";
const PROTOCOL_COLUMNS: &str = "id, name, description, is_active";
const CONFIG_COLUMNS: &str = "id, user_id, server_id, protocol_id, name, credential_content, \
                              created_at, expires_at, is_active";
const PURCHASE_COLUMNS: &str =
    "id, user_id, config_id, amount, duration_days, purchase_type, created_at";

/// Default PostgreSQL implementation of [`EntitlementStore`]
#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn utc(value: NaiveDateTime) -> DateTime<Utc> {
    value.and_utc()
}

fn user_from_row(row: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        free_trial_used: row.try_get("free_trial_used")?,
        free_trial_expires_at: row
            .try_get::<Option<NaiveDateTime>, _>("free_trial_expires_at")?
            .map(utc),
        created_at: utc(row.try_get("created_at")?),
    })
}

fn server_from_row(row: &PgRow) -> StoreResult<Server> {
    let port: i32 = row.try_get("port")?;
    Ok(Server {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        host: row.try_get("host")?,
        port: u16::try_from(port)
            .map_err(|_| StoreError::Corrupt(format!("server port {port} out of range")))?,
        country: row.try_get("country")?,
        is_active: row.try_get("is_active")?,
    })
}

fn protocol_from_row(row: &PgRow) -> StoreResult<Protocol> {
    Ok(Protocol {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        is_active: row.try_get("is_active")?,
    })
}

fn config_from_row(row: &PgRow) -> StoreResult<Config> {
    Ok(Config {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        server_id: row.try_get("server_id")?,
        protocol_id: row.try_get("protocol_id")?,
        name: row.try_get("name")?,
        credential_content: row.try_get("credential_content")?,
        created_at: utc(row.try_get("created_at")?),
        expires_at: row
            .try_get::<Option<NaiveDateTime>, _>("expires_at")?
            .map(utc),
        is_active: row.try_get("is_active")?,
    })
}

fn purchase_from_row(row: &PgRow) -> StoreResult<Purchase> {
    let purchase_type: String = row.try_get("purchase_type")?;
    Ok(Purchase {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        config_id: row.try_get("config_id")?,
        amount: row.try_get("amount")?,
        duration_days: row.try_get("duration_days")?,
        purchase_type: purchase_type.parse().map_err(StoreError::Corrupt)?,
        created_at: utc(row.try_get("created_at")?),
    })
}

fn notification_from_row(row: &PgRow) -> StoreResult<NotificationLog> {
    Ok(NotificationLog {
        id: row.try_get("id")?,
        config_id: row.try_get("config_id")?,
        user_id: row.try_get("user_id")?,
        notification_type: row.try_get("notification_type")?,
        sent_at: utc(row.try_get("sent_at")?),
        expires_at: row
            .try_get::<Option<NaiveDateTime>, _>("expires_at")?
            .map(utc),
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(map).collect()
}

async fn insert_config_row<'e>(
    executor: impl PgExecutor<'e>,
    config: &NewConfig,
) -> StoreResult<Config> {
    let sql = format!(
        r#"
        INSERT INTO configs (user_id, server_id, protocol_id, name, credential_content,
                             created_at, expires_at, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)
        RETURNING {CONFIG_COLUMNS}
        "#
    );
    let row = with_default_timeout(
        sqlx::query(&sql)
            .bind(config.user_id)
            .bind(config.server_id)
            .bind(config.protocol_id)
            .bind(&config.name)
            .bind(&config.credential_content)
            .bind(config.created_at.naive_utc())
            .bind(config.expires_at.map(|at| at.naive_utc()))
            .fetch_one(executor),
    )
    .await?;

    config_from_row(&row)
}

async fn insert_purchase_row<'e>(
    executor: impl PgExecutor<'e>,
    purchase: &NewPurchase,
) -> StoreResult<Purchase> {
    let sql = format!(
        r#"
        INSERT INTO purchases (user_id, config_id, amount, duration_days, purchase_type, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {PURCHASE_COLUMNS}
        "#
    );
    let row = with_default_timeout(
        sqlx::query(&sql)
            .bind(purchase.user_id)
            .bind(purchase.config_id)
            .bind(purchase.amount)
            .bind(purchase.duration_days)
            .bind(purchase.purchase_type.to_string())
            .bind(purchase.created_at.naive_utc())
            .fetch_one(executor),
    )
    .await?;

    purchase_from_row(&row)
}

/// Row lock backed by an open transaction holding `SELECT ... FOR UPDATE`
struct PgConfigLock {
    tx: Option<Transaction<'static, Postgres>>,
    config: Config,
}

impl PgConfigLock {
    /// Run `sql` against the locked row, optionally append a purchase for
    /// the updated config, then commit. Any error drops the transaction,
    /// which rolls both back.
    async fn update_and_commit(
        &mut self,
        sql: &str,
        expires_at: Option<NaiveDateTime>,
        terms: Option<&PurchaseTerms>,
    ) -> StoreResult<(Config, Option<Purchase>)> {
        let mut tx = self.tx.take().ok_or(StoreError::LockReleased)?;

        let mut query = sqlx::query(sql).bind(self.config.id);
        if let Some(expires_at) = expires_at {
            query = query.bind(expires_at);
        }
        let row = with_default_timeout(query.fetch_one(&mut *tx)).await?;
        let config = config_from_row(&row)?;

        let purchase = match terms {
            Some(terms) => Some(insert_purchase_row(&mut *tx, &terms.for_config(&config)).await?),
            None => None,
        };

        with_default_timeout(tx.commit()).await?;

        self.config = config.clone();
        Ok((config, purchase))
    }
}

#[async_trait]
impl ConfigLock for PgConfigLock {
    fn config(&self) -> &Config {
        &self.config
    }

    async fn set_expires_at(&mut self, expires_at: DateTime<Utc>) -> StoreResult<Config> {
        let sql = format!(
            "UPDATE configs SET expires_at = $2 WHERE id = $1 RETURNING {CONFIG_COLUMNS}"
        );
        let (config, _) = self
            .update_and_commit(&sql, Some(expires_at.naive_utc()), None)
            .await?;
        Ok(config)
    }

    async fn set_expires_at_with_purchase(
        &mut self,
        expires_at: DateTime<Utc>,
        terms: &PurchaseTerms,
    ) -> StoreResult<(Config, Purchase)> {
        let sql = format!(
            "UPDATE configs SET expires_at = $2 WHERE id = $1 RETURNING {CONFIG_COLUMNS}"
        );
        match self
            .update_and_commit(&sql, Some(expires_at.naive_utc()), Some(terms))
            .await?
        {
            (config, Some(purchase)) => Ok((config, purchase)),
            (config, None) => Err(StoreError::Corrupt(format!(
                "purchase for config {} not returned",
                config.id
            ))),
        }
    }

    async fn deactivate(&mut self) -> StoreResult<Config> {
        let sql =
            format!("UPDATE configs SET is_active = FALSE WHERE id = $1 RETURNING {CONFIG_COLUMNS}");
        let (config, _) = self.update_and_commit(&sql, None, None).await?;
        Ok(config)
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn health_check(&self) -> StoreResult<()> {
        with_default_timeout(sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }

    async fn insert_user(
        &self,
        external_id: i64,
        username: Option<&str>,
        display_name: &str,
    ) -> StoreResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (external_id, username, display_name, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(external_id)
                .bind(username)
                .bind(display_name)
                .bind(Utc::now().naive_utc())
                .fetch_one(&self.pool),
        )
        .await?;

        user_from_row(&row)
    }

    async fn find_user(&self, user_id: UserId) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row =
            with_default_timeout(sqlx::query(&sql).bind(user_id).fetch_optional(&self.pool))
                .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_external_id(&self, external_id: i64) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = $1");
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(external_id)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn activate_free_trial(
        &self,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<User>> {
        // Conditional update: concurrent activations race on the row lock
        // taken by UPDATE and only the first sees free_trial_used = FALSE.
        let sql = format!(
            r#"
            UPDATE users
            SET free_trial_used = TRUE, free_trial_expires_at = $2
            WHERE id = $1 AND free_trial_used = FALSE
            RETURNING {USER_COLUMNS}
            "#
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(user_id)
                .bind(expires_at.naive_utc())
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn insert_server(&self, server: &NewServer) -> StoreResult<Server> {
        let sql = format!(
            r#"
            INSERT INTO servers (name, host, port, country)
            VALUES ($1, $2, $3, $4)
            RETURNING {SERVER_COLUMNS}
            "#
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(&server.name)
                .bind(&server.host)
                .bind(i32::from(server.port))
                .bind(&server.country)
                .fetch_one(&self.pool),
        )
        .await?;

        server_from_row(&row)
    }

    async fn find_server(&self, server_id: ServerId) -> StoreResult<Option<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = $1");
        let row =
            with_default_timeout(sqlx::query(&sql).bind(server_id).fetch_optional(&self.pool))
                .await?;

        row.as_ref().map(server_from_row).transpose()
    }

    async fn list_active_servers(&self) -> StoreResult<Vec<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE is_active ORDER BY id");
        let rows = with_default_timeout(sqlx::query(&sql).fetch_all(&self.pool)).await?;
        collect(rows, server_from_row)
    }

    async fn set_server_active(
        &self,
        server_id: ServerId,
        is_active: bool,
    ) -> StoreResult<Option<Server>> {
        let sql = format!(
            "UPDATE servers SET is_active = $2 WHERE id = $1 RETURNING {SERVER_COLUMNS}"
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(server_id)
                .bind(is_active)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(server_from_row).transpose()
    }

    async fn insert_protocol(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Protocol> {
        let sql = format!(
            "INSERT INTO protocols (name, description) VALUES ($1, $2) RETURNING {PROTOCOL_COLUMNS}"
        );
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(name)
                .bind(description)
                .fetch_one(&self.pool),
        )
        .await?;

        protocol_from_row(&row)
    }

    async fn find_protocol(&self, protocol_id: ProtocolId) -> StoreResult<Option<Protocol>> {
        let sql = format!("SELECT {PROTOCOL_COLUMNS} FROM protocols WHERE id = $1");
        let row = with_default_timeout(
            sqlx::query(&sql)
                .bind(protocol_id)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(protocol_from_row).transpose()
    }

    async fn list_active_protocols(&self) -> StoreResult<Vec<Protocol>> {
        let sql = format!("SELECT {PROTOCOL_COLUMNS} FROM protocols WHERE is_active ORDER BY id");
        let rows = with_default_timeout(sqlx::query(&sql).fetch_all(&self.pool)).await?;
        collect(rows, protocol_from_row)
    }

    async fn insert_config(&self, config: &NewConfig) -> StoreResult<Config> {
        insert_config_row(&self.pool, config).await
    }

    async fn insert_config_with_purchase(
        &self,
        config: &NewConfig,
        terms: &PurchaseTerms,
        claim_free_trial: bool,
    ) -> StoreResult<Option<(Config, Purchase)>> {
        let mut tx = with_default_timeout(self.pool.begin()).await?;

        if claim_free_trial {
            let trial_ends = config.expires_at.unwrap_or(config.created_at);
            let claimed = with_default_timeout(
                sqlx::query(
                    r#"
                    UPDATE users
                    SET free_trial_used = TRUE, free_trial_expires_at = $2
                    WHERE id = $1 AND free_trial_used = FALSE
                    "#,
                )
                .bind(config.user_id)
                .bind(trial_ends.naive_utc())
                .execute(&mut *tx),
            )
            .await?;

            // Dropping the transaction rolls it back
            if claimed.rows_affected() == 0 {
                return Ok(None);
            }
        }

        let created = insert_config_row(&mut *tx, config).await?;
        let purchase = insert_purchase_row(&mut *tx, &terms.for_config(&created)).await?;
        with_default_timeout(tx.commit()).await?;

        Ok(Some((created, purchase)))
    }

    async fn find_config(&self, config_id: ConfigId) -> StoreResult<Option<Config>> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM configs WHERE id = $1");
        let row =
            with_default_timeout(sqlx::query(&sql).bind(config_id).fetch_optional(&self.pool))
                .await?;

        row.as_ref().map(config_from_row).transpose()
    }

    async fn list_user_configs(&self, user_id: UserId) -> StoreResult<Vec<Config>> {
        let sql = format!("SELECT {CONFIG_COLUMNS} FROM configs WHERE user_id = $1 ORDER BY id");
        let rows =
            with_default_timeout(sqlx::query(&sql).bind(user_id).fetch_all(&self.pool)).await?;
        collect(rows, config_from_row)
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<Config>> {
        let sql = format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM configs
            WHERE is_active AND expires_at IS NOT NULL AND expires_at < $1
            ORDER BY expires_at
            "#
        );
        let rows = with_long_timeout(
            sqlx::query(&sql)
                .bind(now.naive_utc())
                .fetch_all(&self.pool),
        )
        .await?;
        collect(rows, config_from_row)
    }

    async fn list_expiring_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Config>> {
        let sql = format!(
            r#"
            SELECT {CONFIG_COLUMNS} FROM configs
            WHERE is_active AND expires_at >= $1 AND expires_at <= $2
            ORDER BY expires_at
            "#
        );
        let rows = with_long_timeout(
            sqlx::query(&sql)
                .bind(from.naive_utc())
                .bind(to.naive_utc())
                .fetch_all(&self.pool),
        )
        .await?;
        collect(rows, config_from_row)
    }

    async fn lock_config(&self, config_id: ConfigId) -> StoreResult<Option<Box<dyn ConfigLock>>> {
        let mut tx = with_default_timeout(self.pool.begin()).await?;

        let sql = format!("SELECT {CONFIG_COLUMNS} FROM configs WHERE id = $1 FOR UPDATE");
        let row = with_timeout(
            DEFAULT_LOCK_TIMEOUT,
            sqlx::query(&sql).bind(config_id).fetch_optional(&mut *tx),
        )
        .await?;

        match row {
            // Dropping the transaction rolls it back
            None => Ok(None),
            Some(row) => Ok(Some(Box::new(PgConfigLock {
                config: config_from_row(&row)?,
                tx: Some(tx),
            }))),
        }
    }

    async fn insert_purchase(&self, purchase: &NewPurchase) -> StoreResult<Purchase> {
        insert_purchase_row(&self.pool, purchase).await
    }

    async fn list_user_purchases(&self, user_id: UserId) -> StoreResult<Vec<Purchase>> {
        let sql = format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE user_id = $1 ORDER BY created_at, id"
        );
        let rows =
            with_default_timeout(sqlx::query(&sql).bind(user_id).fetch_all(&self.pool)).await?;
        collect(rows, purchase_from_row)
    }

    async fn list_config_purchases(&self, config_id: ConfigId) -> StoreResult<Vec<Purchase>> {
        let sql = format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE config_id = $1 ORDER BY created_at, id"
        );
        let rows =
            with_default_timeout(sqlx::query(&sql).bind(config_id).fetch_all(&self.pool)).await?;
        collect(rows, purchase_from_row)
    }

    async fn find_notification(
        &self,
        config_id: ConfigId,
        notification_type: &str,
    ) -> StoreResult<Option<NotificationLog>> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                SELECT id, config_id, user_id, notification_type, sent_at, expires_at
                FROM notification_logs
                WHERE config_id = $1 AND notification_type = $2
                "#,
            )
            .bind(config_id)
            .bind(notification_type)
            .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(notification_from_row).transpose()
    }

    async fn insert_notification(&self, notification: &NewNotification) -> StoreResult<bool> {
        let row = with_default_timeout(
            sqlx::query(
                r#"
                INSERT INTO notification_logs (config_id, user_id, notification_type, sent_at, expires_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (config_id, notification_type) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(notification.config_id)
            .bind(notification.user_id)
            .bind(&notification.notification_type)
            .bind(notification.sent_at.naive_utc())
            .bind(notification.expires_at.map(|at| at.naive_utc()))
            .fetch_optional(&self.pool),
        )
        .await?;

        Ok(row.is_some())
    }
}
