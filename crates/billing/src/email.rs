//! Billing email delivery through the Resend API

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notification, NotificationKind};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Delivers outbox notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether deliveries should be attempted at all
    fn is_enabled(&self) -> bool {
        true
    }

    async fn deliver(&self, notification: &Notification) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: String,
    pub from: String,
    pub api_url: String,
}

impl EmailConfig {
    /// `None` when `RESEND_API_KEY` is unset, which disables delivery
    pub fn from_env() -> Option<Self> {
        let resend_api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())?;
        Some(Self {
            resend_api_key,
            from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "Studio <billing@localhost>".to_string()),
            api_url: RESEND_API_URL.to_string(),
        })
    }
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    http: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: Option<EmailConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        let config = EmailConfig::from_env();
        if config.is_none() {
            tracing::warn!("RESEND_API_KEY not set, billing emails will stay queued");
        }
        Self::new(config)
    }

    async fn send_once(&self, config: &EmailConfig, body: &ResendEmail<'_>) -> BillingResult<()> {
        let response = self
            .http
            .post(&config.api_url)
            .bearer_auth(&config.resend_api_key)
            .timeout(Duration::from_secs(10))
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::Notification(format!(
                "Resend returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }
}

fn render(notification: &Notification) -> (String, String) {
    match notification.kind {
        NotificationKind::Welcome => {
            let name = notification
                .context
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("there");
            (
                "Payment received, welcome aboard".to_string(),
                format!(
                    "<p>Hi {},</p><p>Thanks for your payment. Your access is ready and \
                     we will be in touch about next steps shortly.</p>",
                    html_escape(name)
                ),
            )
        }
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl Notifier for BillingEmailService {
    fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn deliver(&self, notification: &Notification) -> BillingResult<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| BillingError::Config("email delivery not configured".to_string()))?;

        let (subject, html) = render(notification);
        let body = ResendEmail {
            from: &config.from,
            to: [&notification.recipient],
            subject,
            html,
        };

        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        Retry::spawn(strategy, || self.send_once(config, &body)).await?;

        tracing::info!(
            notification_id = %notification.id,
            kind = notification.kind.as_str(),
            "Billing email sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationStatus;

    fn welcome(name: &str) -> Notification {
        Notification {
            id: uuid::Uuid::new_v4(),
            kind: NotificationKind::Welcome,
            recipient: "a@x.com".into(),
            context: serde_json::json!({ "name": name }),
            status: NotificationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: time::OffsetDateTime::now_utc(),
            sent_at: None,
        }
    }

    #[test]
    fn test_welcome_escapes_name() {
        let (_, html) = render(&welcome("<b>Ann</b>"));
        assert!(html.contains("&lt;b&gt;Ann&lt;/b&gt;"));
    }

    #[tokio::test]
    async fn test_disabled_service_refuses_delivery() {
        let service = BillingEmailService::new(None);
        assert!(!service.is_enabled());
        assert!(service.deliver(&welcome("Ann")).await.is_err());
    }

    #[tokio::test]
    async fn test_delivers_through_resend() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/emails")
            .match_header("authorization", "Bearer re_test")
            .with_status(200)
            .with_body(r#"{"id":"email_1"}"#)
            .create_async()
            .await;

        let service = BillingEmailService::new(Some(EmailConfig {
            resend_api_key: "re_test".into(),
            from: "billing@studio.test".into(),
            api_url: format!("{}/emails", server.url()),
        }));

        service.deliver(&welcome("Ann")).await.unwrap();
        mock.assert_async().await;
    }
}
