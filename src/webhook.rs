//! Fire-and-forget webhook notifications for message activity.

use crate::config::BotConfig;
use crate::error::Result;
use crate::policy;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

/// Event payloads posted to the webhook URL.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WebhookEvent {
    MessageReceived {
        message_id: String,
        conversation_id: String,
        body: String,
        received_at: DateTime<Utc>,
    },
    ReplySent {
        message_id: String,
        conversation_id: String,
        reply_id: String,
        sent_at: DateTime<Utc>,
    },
}

impl WebhookEvent {
    /// Event type matched against `webhook.events`.
    pub fn event_type(&self) -> &'static str {
        match self {
            WebhookEvent::MessageReceived { .. } | WebhookEvent::ReplySent { .. } => "message",
        }
    }
}

pub struct WebhookNotifier {
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { http_client })
    }

    /// Post `event` in the background if the current config wants it. Each
    /// post carries a fresh `x-deferbot-delivery` id. Delivery failures are
    /// logged and otherwise ignored.
    pub fn notify(&self, config: &BotConfig, event: WebhookEvent) -> Option<JoinHandle<()>> {
        if !policy::webhook_wanted(config, event.event_type()) {
            return None;
        }
        let url = config.webhook.url.clone()?;
        let timeout = std::time::Duration::from_secs(config.webhook.timeout_secs);
        let client = self.http_client.clone();
        let delivery_id = uuid::Uuid::new_v4().to_string();

        Some(tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(timeout)
                .header("x-deferbot-delivery", &delivery_id)
                .json(&event)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => tracing::debug!(event = event.event_type(), %delivery_id, "webhook delivered"),
                Err(error) => tracing::warn!(%error, %url, %delivery_id, "webhook delivery failed"),
            }
        }))
    }
}
