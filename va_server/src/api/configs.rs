//! Config purchase, renewal and revocation handlers.
//!
//! # Examples
//!
//! Buy a config with the free trial:
//! ```bash
//! curl -X POST http://localhost:8080/api/v1/configs \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": 1, "server_id": 2, "protocol_id": 1, "use_free_trial": true}'
//! ```
//!
//! Renew it for 30 days:
//! ```bash
//! curl -X POST http://localhost:8080/api/v1/configs/7/renew \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": 1, "amount": 500, "duration_days": 30}'
//! ```

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use vpn_access::{
    ConfigPurchase,
    entitlement::models::{BuyRequest, Config, ConfigId, Purchase, RenewRequest, UserId},
    notify::Notification,
};

use super::{AppState, error::ApiError, request_id::RequestId};
use crate::metrics;

/// Widest window accepted by the expiring listing (30 days)
const MAX_EXPIRING_HOURS: i64 = 24 * 30;

#[derive(Debug, Deserialize)]
pub struct RenewBody {
    pub user_id: UserId,
    pub amount: i64,
    pub duration_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExpiringQuery {
    #[serde(default = "default_expiring_hours")]
    pub hours: i64,
}

fn default_expiring_hours() -> i64 {
    24
}

/// Buy a new config.
///
/// Provisions the credential on the chosen server, stores the config and
/// records a `new` purchase. The credential file is then pushed to the user
/// through the notifier; a failed push does not fail the purchase since the
/// content is part of the response and of the active config listing.
///
/// # Errors
///
/// - `400 Bad Request`: Invalid amount or duration, disabled server or protocol
/// - `404 Not Found`: Unknown user, server or protocol
/// - `409 Conflict`: Free trial requested but already used
/// - `502 Bad Gateway`: Provisioning on the server failed
pub async fn buy_config(
    State(state): State<AppState>,
    request_id: RequestId,
    Json(request): Json<BuyRequest>,
) -> Result<(StatusCode, Json<ConfigPurchase>), ApiError> {
    let trial = request.use_free_trial;
    let bought = state.engine.buy_config(request).await?;
    metrics::configs_provisioned_total(trial);

    let delivery = Notification::credential_delivery(&bought.config);
    if let Err(e) = state.notifier.notify(&delivery).await {
        tracing::warn!(
            request_id = request_id.as_str(),
            config_id = bought.config.id,
            error = %e,
            "Credential delivery failed"
        );
    }

    Ok((StatusCode::CREATED, Json(bought)))
}

pub async fn get_config(
    State(state): State<AppState>,
    Path(config_id): Path<ConfigId>,
) -> Result<Json<Config>, ApiError> {
    Ok(Json(state.engine.get_config(config_id).await?))
}

/// Renew a config for its owner and record a `renewal` purchase.
///
/// # Errors
///
/// - `400 Bad Request`: Invalid amount or duration, config deactivated
/// - `404 Not Found`: Unknown config or not owned by `user_id`
pub async fn renew_config(
    State(state): State<AppState>,
    Path(config_id): Path<ConfigId>,
    Json(body): Json<RenewBody>,
) -> Result<Json<ConfigPurchase>, ApiError> {
    let renewed = state
        .engine
        .renew_config(RenewRequest {
            config_id,
            user_id: body.user_id,
            amount: body.amount,
            duration_days: body.duration_days,
        })
        .await?;
    Ok(Json(renewed))
}

/// Revoke the credential and deactivate the config.
///
/// The config stays active unless the server confirms the removal.
///
/// # Errors
///
/// - `404 Not Found`: Unknown config
/// - `502 Bad Gateway`: Removal failed or was not confirmed
pub async fn deactivate_config(
    State(state): State<AppState>,
    Path(config_id): Path<ConfigId>,
) -> Result<Json<Config>, ApiError> {
    let config = state.engine.deactivate_config(config_id).await?;
    metrics::configs_revoked_total();
    Ok(Json(config))
}

pub async fn list_purchases(
    State(state): State<AppState>,
    Path(config_id): Path<ConfigId>,
) -> Result<Json<Vec<Purchase>>, ApiError> {
    Ok(Json(state.engine.list_config_purchases(config_id).await?))
}

/// Active configs expiring within `?hours=` (default 24).
pub async fn list_expiring(
    State(state): State<AppState>,
    Query(query): Query<ExpiringQuery>,
) -> Result<Json<Vec<Config>>, ApiError> {
    if query.hours <= 0 || query.hours > MAX_EXPIRING_HOURS {
        return Err(ApiError::bad_request(format!(
            "hours must be between 1 and {MAX_EXPIRING_HOURS}"
        )));
    }

    let configs = state
        .engine
        .configs_expiring_within(chrono::Duration::hours(query.hours))
        .await?;
    Ok(Json(configs))
}
