//! Outbound user notifications.
//!
//! The reconciler hands a rendered [`Notification`] to a [`Notifier`] and only
//! records it as sent when `notify` returns `Ok`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::entitlement::models::{Config, ConfigId, UserId};

/// HTTP request timeout for a single webhook call
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The HTTP request failed (network, DNS, timeout)
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

/// File sent along with a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// A message for one user about one config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: UserId,
    pub config_id: ConfigId,
    pub message: String,
    pub attachment: Option<Attachment>,
}

impl Notification {
    /// Warning that `config` expires soon
    pub fn expiration_warning(config: &Config) -> Self {
        Self {
            user_id: config.user_id,
            config_id: config.id,
            message: render_expiration_warning(&config.name, config.expires_at),
            attachment: None,
        }
    }

    /// Credential file for a freshly bought config
    pub fn credential_delivery(config: &Config) -> Self {
        Self {
            user_id: config.user_id,
            config_id: config.id,
            message: format!("Your VPN config '{}' is ready.", config.name),
            attachment: Some(Attachment {
                file_name: format!("{}.ovpn", config.name),
                content: config.credential_content.as_bytes().to_vec(),
            }),
        }
    }
}

/// Render the expiry warning text.
pub fn render_expiration_warning(name: &str, expires_at: Option<DateTime<Utc>>) -> String {
    match expires_at {
        Some(at) => format!(
            "Your VPN config '{name}' expires on {} UTC. Renew it to keep your access.",
            at.format("%Y-%m-%d %H:%M")
        ),
        None => format!("Your VPN config '{name}' is about to expire. Renew it to keep your access."),
    }
}

/// Delivers notifications to users
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        log::info!(
            "Notification for user {} (config {}): {}",
            notification.user_id,
            notification.config_id,
            notification.message
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    user_id: UserId,
    config_id: ConfigId,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment_name: Option<&'a str>,
    /// Credential files are text; other bytes are replaced
    #[serde(skip_serializing_if = "Option::is_none")]
    attachment: Option<String>,
}

impl<'a> From<&'a Notification> for WebhookPayload<'a> {
    fn from(notification: &'a Notification) -> Self {
        let attachment = notification.attachment.as_ref();
        Self {
            user_id: notification.user_id,
            config_id: notification.config_id,
            message: &notification.message,
            attachment_name: attachment.map(|a| a.file_name.as_str()),
            attachment: attachment.map(|a| String::from_utf8_lossy(&a.content).into_owned()),
        }
    }
}

/// Notifier that POSTs each notification as JSON to a fixed URL.
///
/// The receiving side (e.g. a chat bot) forwards it to the user. No retries:
/// a failed send is picked up again by the next sweep.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let payload = WebhookPayload::from(notification);
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expiration_warning_mentions_name_and_deadline() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let text = render_expiration_warning("user-1-5", Some(at));
        assert!(text.contains("user-1-5"));
        assert!(text.contains("2026-03-01 12:30"));
    }

    #[test]
    fn test_webhook_error_display_http_status() {
        assert_eq!(
            NotifyError::HttpStatus(502).to_string(),
            "Webhook returned HTTP 502"
        );
    }

    #[test]
    fn test_webhook_payload_carries_credential_as_text() {
        let notification = Notification {
            user_id: 4,
            config_id: 9,
            message: "ready".to_string(),
            attachment: Some(Attachment {
                file_name: "user-4-1.ovpn".to_string(),
                content: b"client\nremote 10.0.0.1 1194\n\xff".to_vec(),
            }),
        };

        let json = serde_json::to_value(WebhookPayload::from(&notification)).unwrap();
        assert_eq!(json["user_id"], 4);
        assert_eq!(json["config_id"], 9);
        assert_eq!(json["message"], "ready");
        assert_eq!(json["attachment_name"], "user-4-1.ovpn");
        let text = json["attachment"].as_str().unwrap();
        assert!(text.starts_with("client\nremote 10.0.0.1 1194\n"));
        assert!(text.ends_with('\u{FFFD}'));
    }

    #[test]
    fn test_webhook_payload_omits_missing_attachment() {
        let config = Config {
            id: 3,
            user_id: 2,
            server_id: 1,
            protocol_id: 1,
            name: "user-2-1".to_string(),
            credential_content: "client".to_string(),
            created_at: Utc::now(),
            expires_at: Some(Utc::now()),
            is_active: true,
        };

        let json = serde_json::to_value(WebhookPayload::from(&Notification::expiration_warning(
            &config,
        )))
        .unwrap();
        assert_eq!(json["config_id"], 3);
        assert!(json.get("attachment").is_none());
        assert!(json.get("attachment_name").is_none());
    }

    #[test]
    fn test_webhook_notifier_builds() {
        assert!(WebhookNotifier::new("http://localhost:9/hook").is_ok());
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let notification = Notification {
            user_id: 1,
            config_id: 2,
            message: "hello".to_string(),
            attachment: None,
        };
        assert!(LogNotifier.notify(&notification).await.is_ok());
    }
}
