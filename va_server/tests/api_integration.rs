//! Integration tests for the HTTP API over the in-memory store.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt; // For `oneshot` method
use va_server::api::{AppState, create_router, request_id::REQUEST_ID_HEADER};
use vpn_access::{
    EntitlementManager, EntitlementSettings,
    db::MemoryEntitlementStore,
    entitlement::models::Server,
    notify::{Notification, Notifier, NotifyError},
    provision::{CredentialProvisioner, ProvisionError, ProvisionResult},
};

/// Provisioner that succeeds unless told otherwise
#[derive(Default)]
struct FakeProvisioner {
    refuse_revoke: AtomicBool,
}

#[async_trait]
impl CredentialProvisioner for FakeProvisioner {
    async fn provision(&self, server: &Server, name: &str) -> ProvisionResult<String> {
        Ok(format!("client\nremote {} 1194\n# {name}\n", server.host))
    }

    async fn revoke(&self, _server: &Server, name: &str) -> ProvisionResult<bool> {
        if self.refuse_revoke.load(Ordering::SeqCst) {
            return Err(ProvisionError::NotConfirmed(name.to_string()));
        }
        Ok(true)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct TestApp {
    router: axum::Router,
    provisioner: Arc<FakeProvisioner>,
    notifier: Arc<RecordingNotifier>,
}

impl TestApp {
    fn new() -> Self {
        let store = Arc::new(MemoryEntitlementStore::new());
        let provisioner = Arc::new(FakeProvisioner::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Arc::new(EntitlementManager::new(
            store,
            provisioner.clone(),
            EntitlementSettings { free_trial_days: 3 },
        ));
        let router = create_router(AppState {
            engine,
            notifier: notifier.clone(),
        });
        Self {
            router,
            provisioner,
            notifier,
        }
    }

    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    /// Registered user id, active server id, active protocol id
    async fn seed(&self) -> (i64, i64, i64) {
        let (_, user) = self
            .send(
                "POST",
                "/api/v1/users",
                Some(json!({"external_id": 777, "username": "bob", "display_name": "Bob"})),
            )
            .await;
        let (_, server) = self
            .send(
                "POST",
                "/api/v1/servers",
                Some(json!({"name": "de-1", "host": "203.0.113.10", "port": 22, "country": "DE"})),
            )
            .await;
        let (_, protocol) = self
            .send(
                "POST",
                "/api/v1/protocols",
                Some(json!({"name": "openvpn", "description": null})),
            )
            .await;
        (
            user["user"]["id"].as_i64().unwrap(),
            server["id"].as_i64().unwrap(),
            protocol["id"].as_i64().unwrap(),
        )
    }
}

#[tokio::test]
async fn test_health_check_reports_store() {
    let app = TestApp::new();

    let (status, body) = app.send("GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], true);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/health")
        .header(REQUEST_ID_HEADER, "chat-update-991")
        .body(Body::empty())
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(
        response.headers().get(REQUEST_ID_HEADER).unwrap(),
        "chat-update-991"
    );
}

#[tokio::test]
async fn test_register_user_is_idempotent() {
    let app = TestApp::new();
    let body = json!({"external_id": 42, "username": null, "display_name": "Carol"});

    let (first, created) = app.send("POST", "/api/v1/users", Some(body.clone())).await;
    let (second, existing) = app.send("POST", "/api/v1/users", Some(body)).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(created["created"], true);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(existing["created"], false);
    assert_eq!(existing["user"]["id"], created["user"]["id"]);

    let (status, user) = app.send("GET", "/api/v1/users/external/42", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["display_name"], "Carol");
}

#[tokio::test]
async fn test_unknown_user_is_404() {
    let app = TestApp::new();

    let (status, body) = app.send("GET", "/api/v1/users/9999", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("9999"));
}

#[tokio::test]
async fn test_trial_purchase_then_second_trial_conflicts() {
    let app = TestApp::new();
    let (user_id, server_id, protocol_id) = app.seed().await;
    let buy = json!({
        "user_id": user_id,
        "server_id": server_id,
        "protocol_id": protocol_id,
        "use_free_trial": true
    });

    let (status, bought) = app.send("POST", "/api/v1/configs", Some(buy.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(bought["purchase"]["amount"], 0);
    assert_eq!(bought["purchase"]["duration_days"], 3);
    assert_eq!(bought["purchase"]["purchase_type"], "new");
    assert_eq!(bought["config"]["is_active"], true);

    let sent = app.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let attachment = sent[0].attachment.as_ref().unwrap();
    assert!(attachment.file_name.ends_with(".ovpn"));

    let (status, trial) = app
        .send("GET", &format!("/api/v1/users/{user_id}/trial"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trial["used"], true);
    assert_eq!(trial["available"], false);

    let (status, _) = app.send("POST", "/api/v1/configs", Some(buy)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_paid_purchase_requires_positive_duration() {
    let app = TestApp::new();
    let (user_id, server_id, protocol_id) = app.seed().await;

    let (status, _) = app
        .send(
            "POST",
            "/api/v1/configs",
            Some(json!({
                "user_id": user_id,
                "server_id": server_id,
                "protocol_id": protocol_id,
                "amount": 500
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_renew_extends_and_records_purchase() {
    let app = TestApp::new();
    let (user_id, server_id, protocol_id) = app.seed().await;
    let (_, bought) = app
        .send(
            "POST",
            "/api/v1/configs",
            Some(json!({
                "user_id": user_id,
                "server_id": server_id,
                "protocol_id": protocol_id,
                "amount": 500,
                "duration_days": 30
            })),
        )
        .await;
    let config_id = bought["config"]["id"].as_i64().unwrap();

    let (status, renewed) = app
        .send(
            "POST",
            &format!("/api/v1/configs/{config_id}/renew"),
            Some(json!({"user_id": user_id, "amount": 400, "duration_days": 15})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renewed["purchase"]["purchase_type"], "renewal");
    assert_ne!(renewed["config"]["expires_at"], bought["config"]["expires_at"]);

    let (_, purchases) = app
        .send("GET", &format!("/api/v1/configs/{config_id}/purchases"), None)
        .await;
    assert_eq!(purchases.as_array().unwrap().len(), 2);

    // Someone else's config looks missing
    let (status, _) = app
        .send(
            "POST",
            &format!("/api/v1/configs/{config_id}/renew"),
            Some(json!({"user_id": user_id + 100, "amount": 400, "duration_days": 15})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_deactivate_stays_active_when_revoke_fails() {
    let app = TestApp::new();
    let (user_id, server_id, protocol_id) = app.seed().await;
    let (_, bought) = app
        .send(
            "POST",
            "/api/v1/configs",
            Some(json!({
                "user_id": user_id,
                "server_id": server_id,
                "protocol_id": protocol_id,
                "amount": 500,
                "duration_days": 30
            })),
        )
        .await;
    let config_id = bought["config"]["id"].as_i64().unwrap();
    let uri = format!("/api/v1/configs/{config_id}");

    app.provisioner.refuse_revoke.store(true, Ordering::SeqCst);
    let (status, body) = app.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body["error"].as_str().unwrap().contains("203.0.113.10"));

    let (_, config) = app.send("GET", &uri, None).await;
    assert_eq!(config["is_active"], true);

    app.provisioner.refuse_revoke.store(false, Ordering::SeqCst);
    let (status, config) = app.send("DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["is_active"], false);
}

#[tokio::test]
async fn test_config_listing_scopes() {
    let app = TestApp::new();
    let (user_id, server_id, protocol_id) = app.seed().await;
    let mut ids = Vec::new();
    for _ in 0..2 {
        let (_, bought) = app
            .send(
                "POST",
                "/api/v1/configs",
                Some(json!({
                    "user_id": user_id,
                    "server_id": server_id,
                    "protocol_id": protocol_id,
                    "amount": 100,
                    "duration_days": 10
                })),
            )
            .await;
        ids.push(bought["config"]["id"].as_i64().unwrap());
    }
    app.send("DELETE", &format!("/api/v1/configs/{}", ids[0]), None)
        .await;

    let (_, active) = app
        .send("GET", &format!("/api/v1/users/{user_id}/configs"), None)
        .await;
    let active = active.as_array().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["server_name"], "de-1");
    assert!(active[0]["credential_content"].is_string());

    let (_, all) = app
        .send("GET", &format!("/api/v1/users/{user_id}/configs?scope=all"), None)
        .await;
    let all = all.as_array().unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|c| c["credential_content"].is_null()));
}

#[tokio::test]
async fn test_disabled_server_leaves_catalog() {
    let app = TestApp::new();
    let (_, server_id, _) = app.seed().await;

    let (status, server) = app
        .send(
            "PATCH",
            &format!("/api/v1/servers/{server_id}"),
            Some(json!({"is_active": false})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server["is_active"], false);

    let (_, servers) = app.send("GET", "/api/v1/servers", None).await;
    assert!(servers.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_expiring_listing_validates_window() {
    let app = TestApp::new();

    let (status, _) = app
        .send("GET", "/api/v1/configs/expiring?hours=0", None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.send("GET", "/api/v1/configs/expiring", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}
