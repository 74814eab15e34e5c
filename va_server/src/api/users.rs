//! User, free trial and per-user listing handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use vpn_access::entitlement::models::{
    ConfigScope, ConfigSummary, FreeTrialStatus, Purchase, User, UserId,
};

use super::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub external_id: i64,
    pub username: Option<String>,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterUserResponse {
    pub user: User,
    pub created: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigListQuery {
    #[serde(default)]
    pub scope: ConfigScope,
}

/// Register the user behind an external identity.
///
/// Idempotent: an already known identity returns `200 OK` with the stored
/// user, a new one `201 Created`.
///
/// ```json
/// { "external_id": 5123, "username": "alice", "display_name": "Alice" }
/// ```
pub async fn register_user(
    State(state): State<AppState>,
    Json(request): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<RegisterUserResponse>), ApiError> {
    if request.display_name.trim().is_empty() {
        return Err(ApiError::bad_request("display_name is required"));
    }

    let (user, created) = state
        .engine
        .register_user(
            request.external_id,
            request.username.as_deref(),
            &request.display_name,
        )
        .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RegisterUserResponse { user, created })))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(state.engine.get_user(user_id).await?))
}

/// Look a user up by the external identity it registered with.
pub async fn get_user_by_external_id(
    State(state): State<AppState>,
    Path(external_id): Path<i64>,
) -> Result<Json<User>, ApiError> {
    state
        .engine
        .find_user_by_external_id(external_id)
        .await?
        .map(Json)
        .ok_or(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("No user with external id {external_id}"),
        })
}

pub async fn trial_status(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<FreeTrialStatus>, ApiError> {
    Ok(Json(state.engine.free_trial_status(user_id).await?))
}

/// Activate the free trial without buying a config.
///
/// # Errors
///
/// - `404 Not Found`: Unknown user
/// - `409 Conflict`: Trial already used
pub async fn activate_trial(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<FreeTrialStatus>, ApiError> {
    let trial_days = state.engine.settings().free_trial_days;
    let user = state.engine.activate_free_trial(user_id, trial_days).await?;
    Ok(Json(FreeTrialStatus::of(&user, chrono::Utc::now())))
}

/// List a user's configs.
///
/// `?scope=active` (default) includes credential content; `?scope=all`
/// also returns expired and deactivated configs, without it.
pub async fn list_configs(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Query(query): Query<ConfigListQuery>,
) -> Result<Json<Vec<ConfigSummary>>, ApiError> {
    Ok(Json(
        state.engine.list_user_configs(user_id, query.scope).await?,
    ))
}

pub async fn list_purchases(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<Purchase>>, ApiError> {
    Ok(Json(state.engine.list_user_purchases(user_id).await?))
}
