//! HTTP API for the entitlement engine.
//!
//! The API is consumed by trusted front ends (a chat bot, an admin panel) on
//! a private network. It carries no authentication of its own.
//!
//! # Modules
//!
//! - [`users`]: Registration, free trial, per-user listings
//! - [`configs`]: Buy, renew, revoke and inspect configs
//! - [`catalog`]: Servers and protocols
//! - [`request_id`]: Correlation IDs, request logging and HTTP metrics
//!
//! # CORS
//!
//! CORS is configured permissively. Restrict origins when the API is
//! reachable from browsers.

pub mod catalog;
pub mod configs;
pub mod error;
pub mod request_id;
pub mod users;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, patch, post},
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use vpn_access::{EntitlementManager, notify::Notifier};

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EntitlementManager>,
    /// Delivers credential files after a purchase
    pub notifier: Arc<dyn Notifier>,
}

/// Create the complete API router with all endpoints and middleware.
///
/// # Endpoint Summary
///
/// ```text
/// GET    /health                               - Health check
/// POST   /api/v1/users                         - Register user
/// GET    /api/v1/users/{id}                    - Get user
/// GET    /api/v1/users/external/{external_id}  - Find user by external identity
/// GET    /api/v1/users/{id}/trial              - Free trial status
/// POST   /api/v1/users/{id}/trial              - Activate free trial
/// GET    /api/v1/users/{id}/configs?scope=     - List configs (active|all)
/// GET    /api/v1/users/{id}/purchases          - Purchase history
/// GET    /api/v1/servers                       - List active servers
/// POST   /api/v1/servers                       - Register server
/// PATCH  /api/v1/servers/{id}                  - Enable/disable server
/// GET    /api/v1/protocols                     - List active protocols
/// POST   /api/v1/protocols                     - Register protocol
/// POST   /api/v1/configs                       - Buy config
/// GET    /api/v1/configs/expiring?hours=       - Configs expiring soon
/// GET    /api/v1/configs/{id}                  - Get config
/// DELETE /api/v1/configs/{id}                  - Revoke and deactivate
/// POST   /api/v1/configs/{id}/renew            - Renew config
/// GET    /api/v1/configs/{id}/purchases        - Purchase history of a config
/// ```
///
/// # Example
///
/// ```rust,no_run
/// # use va_server::api::{create_router, AppState};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// # let state: AppState = unimplemented!();
/// let app = create_router(state);
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
/// axum::serve(listener, app).await?;
/// # Ok(())
/// # }
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", create_v1_router())
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn create_v1_router() -> Router<AppState> {
    Router::new()
        // Users
        .route("/users", post(users::register_user))
        .route("/users/{user_id}", get(users::get_user))
        .route(
            "/users/external/{external_id}",
            get(users::get_user_by_external_id),
        )
        .route(
            "/users/{user_id}/trial",
            get(users::trial_status).post(users::activate_trial),
        )
        .route("/users/{user_id}/configs", get(users::list_configs))
        .route("/users/{user_id}/purchases", get(users::list_purchases))
        // Catalog
        .route(
            "/servers",
            get(catalog::list_servers).post(catalog::create_server),
        )
        .route("/servers/{server_id}", patch(catalog::update_server))
        .route(
            "/protocols",
            get(catalog::list_protocols).post(catalog::create_protocol),
        )
        // Configs
        .route("/configs", post(configs::buy_config))
        .route("/configs/expiring", get(configs::list_expiring))
        .route(
            "/configs/{config_id}",
            get(configs::get_config).delete(configs::deactivate_config),
        )
        .route("/configs/{config_id}/renew", post(configs::renew_config))
        .route("/configs/{config_id}/purchases", get(configs::list_purchases))
}

/// Health check endpoint for monitoring and load balancers.
///
/// Returns `200 OK` when the store answers, `503 Service Unavailable`
/// otherwise.
///
/// ```bash
/// curl http://localhost:8080/health
/// # {"status":"healthy","version":"1.0.0","database":true,"timestamp":"2026-10-16T10:30:00+00:00"}
/// ```
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_healthy = match state.engine.store().health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            false
        }
    };

    let status_code = if db_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = json!({
        "status": if db_healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "database": db_healthy,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (status_code, Json(response))
}
