//! Ingestion: turns transport message events into ledger rows.
//!
//! A message the owner sends as a reply to a pending contact message marks
//! that message answered, which is what stops the deferred reply.

use crate::config::RuntimeConfig;
use crate::contacts::ContactBook;
use crate::error::Result;
use crate::ledger::{MessageLedger, NewMessage};
use crate::webhook::{WebhookEvent, WebhookNotifier};
use crate::{Clock, InboundEnvelope, policy};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use std::sync::Arc;

/// Ledger body of a captionless media message.
pub const MEDIA_PLACEHOLDER: &str = "[media]";

/// Why a message was not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    StatusBroadcast,
    EmptyBody,
    GroupChatDisabled,
    OutsideBusinessHours,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ignored(IgnoreReason),
    Recorded {
        /// Pending message this one answered, if the owner replied to one.
        answered: Option<String>,
    },
}

pub struct Ingestor {
    ledger: Arc<MessageLedger>,
    contacts: Arc<ContactBook>,
    webhooks: Arc<WebhookNotifier>,
    runtime: Arc<RuntimeConfig>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(
        ledger: Arc<MessageLedger>,
        contacts: Arc<ContactBook>,
        webhooks: Arc<WebhookNotifier>,
        runtime: Arc<RuntimeConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            contacts,
            webhooks,
            runtime,
            clock,
        }
    }

    /// Gate, record and link one message event.
    pub async fn ingest(&self, envelope: &InboundEnvelope) -> Result<IngestOutcome> {
        if policy::is_status_broadcast(&envelope.conversation_id) {
            return Ok(IngestOutcome::Ignored(IgnoreReason::StatusBroadcast));
        }
        let config = self.runtime.snapshot();
        let body = match envelope.body.as_deref().filter(|body| !body.trim().is_empty()) {
            Some(body) => body,
            None if envelope.has_media && policy::media_handling_enabled(&config) => {
                MEDIA_PLACEHOLDER
            }
            None => return Ok(IngestOutcome::Ignored(IgnoreReason::EmptyBody)),
        };

        let now = self.clock.now();
        let from_owner = envelope.direction.is_outbound();
        let owner_reply_to = envelope
            .quoted_message_id
            .as_deref()
            .filter(|_| from_owner);

        // Owner replies are always recorded so they can close pending messages.
        if owner_reply_to.is_none() {
            if policy::is_group_conversation(&envelope.conversation_id)
                && !policy::group_chat_allowed(&config)
            {
                return Ok(IngestOutcome::Ignored(IgnoreReason::GroupChatDisabled));
            }
            if !from_owner && !policy::within_business_hours(&config, now) {
                return Ok(IngestOutcome::Ignored(IgnoreReason::OutsideBusinessHours));
            }
        }

        if !from_owner {
            if policy::contact_profiles_enabled(&config)
                && let Err(error) = self
                    .contacts
                    .observe(
                        &envelope.conversation_id,
                        envelope.sender_display_name.as_deref(),
                        body,
                        now,
                        &config.contact_defaults,
                    )
                    .await
            {
                tracing::warn!(conversation_id = %envelope.conversation_id, %error, "failed to update contact profile");
            }

            self.webhooks.notify(
                &config,
                WebhookEvent::MessageReceived {
                    message_id: envelope.id.clone(),
                    conversation_id: envelope.conversation_id.clone(),
                    body: body.to_string(),
                    received_at: now,
                },
            );
        }

        self.ledger
            .record(&NewMessage {
                id: envelope.id.clone(),
                conversation_id: envelope.conversation_id.clone(),
                direction: envelope.direction,
                body: body.to_string(),
                received_at: now,
            })
            .await?;

        tracing::debug!(
            message_id = %envelope.id,
            conversation_id = %envelope.conversation_id,
            direction = %envelope.direction,
            "message recorded"
        );

        let mut answered = None;
        if let Some(quoted_id) = owner_reply_to {
            if self
                .ledger
                .mark_responded(quoted_id, &envelope.id, now)
                .await?
            {
                tracing::info!(
                    message_id = %quoted_id,
                    reply_id = %envelope.id,
                    conversation_id = %envelope.conversation_id,
                    "owner replied, deferred reply cancelled"
                );
                answered = Some(quoted_id.to_string());
            } else {
                tracing::debug!(message_id = %quoted_id, "quoted message already answered or unknown");
            }
        }

        Ok(IngestOutcome::Recorded { answered })
    }

    /// Ingest a batch in order. Failures are logged per message.
    pub async fn ingest_batch(&self, batch: &[InboundEnvelope]) {
        for envelope in batch {
            if let Err(error) = self.ingest(envelope).await {
                tracing::error!(
                    message_id = %envelope.id,
                    conversation_id = %envelope.conversation_id,
                    %error,
                    "failed to ingest message"
                );
            }
        }
    }

    /// Consume batches from the connection supervisor until the channel closes.
    pub fn spawn_loop(self: Arc<Self>, mut batches: mpsc::Receiver<Vec<InboundEnvelope>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = batches.recv().await {
                self.ingest_batch(&batch).await;
            }
            tracing::debug!("ingestion loop stopped");
        })
    }
}
