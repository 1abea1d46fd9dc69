use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use latency_monitor::{AlertLevel, AlertSink};

/// Webhook notifier for alerts and lifecycle events. With no URL configured
/// every send is a debug-logged no-op.
pub struct WebhookNotifier {
    client: Client,
    webhook_url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }

    pub async fn send_message(&self, content: &str) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("alert webhook not configured, skipping notification");
            return;
        };
        let payload = json!({
            "content": content,
            "username": "signal-pipeline",
        });
        if let Err(e) = self.client.post(url).json(&payload).send().await {
            tracing::warn!(error = %e, "alert webhook delivery failed");
        }
    }
}

#[async_trait]
impl AlertSink for WebhookNotifier {
    async fn send(&self, level: AlertLevel, message: &str) {
        match level {
            AlertLevel::Warning => tracing::warn!(alert = true, "{message}"),
            AlertLevel::Critical => tracing::error!(alert = true, "{message}"),
        }
        let prefix = match level {
            AlertLevel::Warning => "**Warning**",
            AlertLevel::Critical => "**CRITICAL**",
        };
        self.send_message(&format!("{prefix} {message}")).await;
    }
}
