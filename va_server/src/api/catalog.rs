//! Server and protocol catalog handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use vpn_access::entitlement::models::{NewServer, Protocol, Server, ServerId};

use super::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct CreateProtocolRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerRequest {
    pub is_active: bool,
}

/// Servers open for new configs
pub async fn list_servers(State(state): State<AppState>) -> Result<Json<Vec<Server>>, ApiError> {
    Ok(Json(state.engine.list_active_servers().await?))
}

/// Register a provisioning server.
///
/// ```json
/// { "name": "de-1", "host": "203.0.113.10", "port": 22, "country": "DE" }
/// ```
pub async fn create_server(
    State(state): State<AppState>,
    Json(request): Json<NewServer>,
) -> Result<(StatusCode, Json<Server>), ApiError> {
    let server = state.engine.create_server(request).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

/// Enable or disable a server. Existing configs on it are not touched.
pub async fn update_server(
    State(state): State<AppState>,
    Path(server_id): Path<ServerId>,
    Json(request): Json<UpdateServerRequest>,
) -> Result<Json<Server>, ApiError> {
    Ok(Json(
        state
            .engine
            .set_server_active(server_id, request.is_active)
            .await?,
    ))
}

pub async fn list_protocols(
    State(state): State<AppState>,
) -> Result<Json<Vec<Protocol>>, ApiError> {
    Ok(Json(state.engine.list_active_protocols().await?))
}

pub async fn create_protocol(
    State(state): State<AppState>,
    Json(request): Json<CreateProtocolRequest>,
) -> Result<(StatusCode, Json<Protocol>), ApiError> {
    let protocol = state
        .engine
        .create_protocol(&request.name, request.description.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(protocol)))
}
