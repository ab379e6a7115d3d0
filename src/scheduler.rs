//! Deferral sweep: answers inbound messages nobody replied to within the
//! configured delay.
//!
//! One sweep runs at a time. Each candidate is rechecked against the ledger
//! and the live session right before the expensive or irreversible steps, so
//! a human reply or a dropped connection stops the bot mid-sweep.

use crate::config::{BotConfig, RuntimeConfig};
use crate::connection::{ConnectionSession, SessionSlot};
use crate::contacts::{ContactBook, ContactProfile};
use crate::error::{Result, SendError};
use crate::generator::{Generator, generate_or_fallback};
use crate::ledger::{Message, MessageLedger, RETRY_EXHAUSTED_SENTINEL, SESSION_CORRUPTED_SENTINEL};
use crate::webhook::{WebhookEvent, WebhookNotifier};
use crate::{Clock, policy, prompt};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Why a sweep did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepSkip {
    AutoResponderDisabled,
    OutsideBusinessHours,
    NotConnected,
    LedgerUnavailable,
}

/// Tally of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub skipped: Option<SweepSkip>,
    pub candidates: usize,
    pub sent: usize,
    pub already_responded: usize,
    /// Replies sent earlier whose ledger write only now succeeded.
    pub recorded: usize,
    pub group_skipped: usize,
    /// Sends refused for session corruption; marked with a sentinel.
    pub suppressed: usize,
    /// Transient send failures left for the next sweep.
    pub failed: usize,
    /// Messages given up on after too many transient failures.
    pub abandoned: usize,
    pub errors: usize,
    /// The session stopped being open part-way through.
    pub aborted: bool,
}

impl SweepReport {
    fn skipped(reason: SweepSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    fn record(&mut self, outcome: CandidateOutcome) {
        match outcome {
            CandidateOutcome::AlreadyResponded => self.already_responded += 1,
            CandidateOutcome::Recorded => self.recorded += 1,
            CandidateOutcome::GroupGated => self.group_skipped += 1,
            CandidateOutcome::Sent | CandidateOutcome::RaceLost => self.sent += 1,
            CandidateOutcome::Suppressed => self.suppressed += 1,
            CandidateOutcome::Failed => self.failed += 1,
            CandidateOutcome::Abandoned => self.abandoned += 1,
            CandidateOutcome::Aborted => self.aborted = true,
        }
    }

    fn log(&self) {
        if self.sent + self.recorded + self.failed + self.suppressed + self.abandoned + self.errors
            > 0
            || self.aborted
        {
            tracing::info!(
                candidates = self.candidates,
                sent = self.sent,
                recorded = self.recorded,
                failed = self.failed,
                suppressed = self.suppressed,
                abandoned = self.abandoned,
                errors = self.errors,
                aborted = self.aborted,
                "deferral sweep finished"
            );
        } else {
            tracing::debug!(skipped = ?self.skipped, candidates = self.candidates, "deferral sweep idle");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    AlreadyResponded,
    GroupGated,
    Sent,
    /// Sent, but someone else marked the message first.
    RaceLost,
    /// Delivered in an earlier sweep; only the ledger write was retried.
    Recorded,
    Suppressed,
    Failed,
    Abandoned,
    Aborted,
}

impl CandidateOutcome {
    fn attempted_send(self) -> bool {
        matches!(
            self,
            CandidateOutcome::Sent
                | CandidateOutcome::RaceLost
                | CandidateOutcome::Suppressed
                | CandidateOutcome::Failed
                | CandidateOutcome::Abandoned
        )
    }
}

/// Everything a sweep reads or writes.
pub struct SchedulerDeps {
    pub ledger: Arc<MessageLedger>,
    pub generator: Arc<dyn Generator>,
    pub contacts: Arc<ContactBook>,
    pub webhooks: Arc<WebhookNotifier>,
    pub runtime: Arc<RuntimeConfig>,
    pub slot: Arc<SessionSlot>,
    pub clock: Arc<dyn Clock>,
}

pub struct DeferralScheduler {
    deps: SchedulerDeps,
    /// Transient failures per message id since the last success.
    send_attempts: Mutex<HashMap<String, u32>>,
    /// Replies delivered but not yet recorded, by message id.
    unrecorded: Mutex<HashMap<String, String>>,
    sweep_lock: Mutex<()>,
}

impl DeferralScheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self {
            deps,
            send_attempts: Mutex::new(HashMap::new()),
            unrecorded: Mutex::new(HashMap::new()),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Run one sweep over overdue messages.
    pub async fn sweep(&self) -> SweepReport {
        let _guard = self.sweep_lock.lock().await;
        let config = self.deps.runtime.snapshot();

        if !policy::auto_responder_enabled(&config) {
            return SweepReport::skipped(SweepSkip::AutoResponderDisabled);
        }
        if !policy::within_business_hours(&config, self.deps.clock.now()) {
            return SweepReport::skipped(SweepSkip::OutsideBusinessHours);
        }
        let Some(session) = self.deps.slot.live() else {
            return SweepReport::skipped(SweepSkip::NotConnected);
        };

        let recorded = self.flush_unrecorded().await;

        let candidates = match self.deps.ledger.find_unanswered(config.response_delay()).await {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::error!(%error, "failed to query unanswered messages");
                return SweepReport::skipped(SweepSkip::LedgerUnavailable);
            }
        };

        // Retry counts only matter while a message is still waiting.
        let waiting: HashSet<&str> = candidates.iter().map(|message| message.id.as_str()).collect();
        self.send_attempts
            .lock()
            .await
            .retain(|id, _| waiting.contains(id.as_str()));

        let mut report = SweepReport {
            candidates: candidates.len(),
            recorded,
            ..Default::default()
        };

        for (index, message) in candidates.iter().enumerate() {
            let outcome = match self.process_candidate(&session, message).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::error!(
                        message_id = %message.id,
                        conversation_id = %message.conversation_id,
                        %error,
                        "deferred reply failed"
                    );
                    report.errors += 1;
                    continue;
                }
            };

            report.record(outcome);
            if outcome == CandidateOutcome::Aborted {
                tracing::info!(
                    generation = session.generation(),
                    remaining = candidates.len() - index,
                    "session no longer open, stopping sweep"
                );
                break;
            }

            if outcome.attempted_send() && index + 1 < candidates.len() {
                tokio::time::sleep(config.pacing()).await;
            }
        }

        report
    }

    async fn process_candidate(
        &self,
        session: &ConnectionSession,
        message: &Message,
    ) -> Result<CandidateOutcome> {
        let unrecorded = self.unrecorded.lock().await.get(&message.id).cloned();
        if let Some(reply_id) = unrecorded {
            return self.record_delivered(message, &reply_id).await;
        }

        if self.deps.ledger.is_responded(&message.id).await? {
            self.send_attempts.lock().await.remove(&message.id);
            return Ok(CandidateOutcome::AlreadyResponded);
        }
        if !session.is_open() {
            return Ok(CandidateOutcome::Aborted);
        }

        // Settings may have been reloaded since the sweep started.
        let config = self.deps.runtime.snapshot();
        if policy::is_group_conversation(&message.conversation_id)
            && !policy::group_chat_allowed(&config)
        {
            return Ok(CandidateOutcome::GroupGated);
        }

        let reply = self.compose_reply(&config, message).await;

        if !session.is_open() {
            return Ok(CandidateOutcome::Aborted);
        }

        match session.send(&message.conversation_id, &reply).await {
            Ok(reply_id) => {
                self.send_attempts.lock().await.remove(&message.id);
                let now = self.deps.clock.now();
                let marked = match self.deps.ledger.mark_responded(&message.id, &reply_id, now).await {
                    Ok(marked) => marked,
                    Err(error) => {
                        // Delivered: later sweeps retry the write, never the send.
                        self.unrecorded
                            .lock()
                            .await
                            .insert(message.id.clone(), reply_id);
                        return Err(error.into());
                    }
                };
                if marked {
                    tracing::info!(
                        message_id = %message.id,
                        conversation_id = %message.conversation_id,
                        %reply_id,
                        "deferred reply sent"
                    );
                    self.deps.webhooks.notify(
                        &config,
                        WebhookEvent::ReplySent {
                            message_id: message.id.clone(),
                            conversation_id: message.conversation_id.clone(),
                            reply_id,
                            sent_at: now,
                        },
                    );
                    Ok(CandidateOutcome::Sent)
                } else {
                    tracing::warn!(
                        message_id = %message.id,
                        conversation_id = %message.conversation_id,
                        "message was answered while the deferred reply was in flight"
                    );
                    Ok(CandidateOutcome::RaceLost)
                }
            }
            Err(SendError::SessionCorruption { message: reason }) => {
                session.flag_credentials_suspect();
                self.send_attempts.lock().await.remove(&message.id);
                self.deps
                    .ledger
                    .mark_responded(&message.id, SESSION_CORRUPTED_SENTINEL, self.deps.clock.now())
                    .await?;
                tracing::warn!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    %reason,
                    "session corrupted, deferred reply dropped"
                );
                Ok(CandidateOutcome::Suppressed)
            }
            Err(SendError::Transient { message: reason }) => {
                let mut attempts = self.send_attempts.lock().await;
                let count = attempts.entry(message.id.clone()).or_insert(0);
                *count += 1;
                let count = *count;

                if let Some(ceiling) = config.send_attempt_ceiling()
                    && count >= ceiling
                {
                    attempts.remove(&message.id);
                    drop(attempts);
                    self.deps
                        .ledger
                        .mark_responded(&message.id, RETRY_EXHAUSTED_SENTINEL, self.deps.clock.now())
                        .await?;
                    tracing::error!(
                        message_id = %message.id,
                        conversation_id = %message.conversation_id,
                        attempts = count,
                        %reason,
                        "giving up on deferred reply"
                    );
                    return Ok(CandidateOutcome::Abandoned);
                }

                tracing::warn!(
                    message_id = %message.id,
                    conversation_id = %message.conversation_id,
                    attempts = count,
                    %reason,
                    "deferred reply not sent, will retry"
                );
                Ok(CandidateOutcome::Failed)
            }
        }
    }

    /// Retry the ledger writes of every delivered but unrecorded reply.
    /// Entries whose write fails again stay for the next sweep.
    async fn flush_unrecorded(&self) -> usize {
        let pending: Vec<(String, String)> = self
            .unrecorded
            .lock()
            .await
            .iter()
            .map(|(id, reply_id)| (id.clone(), reply_id.clone()))
            .collect();

        let mut recorded = 0;
        for (id, reply_id) in pending {
            match self
                .deps
                .ledger
                .mark_responded(&id, &reply_id, self.deps.clock.now())
                .await
            {
                Ok(_) => {
                    self.unrecorded.lock().await.remove(&id);
                    recorded += 1;
                }
                Err(error) => {
                    tracing::warn!(message_id = %id, %reply_id, %error, "still unable to record delivered reply");
                }
            }
        }
        recorded
    }

    /// Retry the ledger write for a reply that already went out.
    async fn record_delivered(&self, message: &Message, reply_id: &str) -> Result<CandidateOutcome> {
        let marked = self
            .deps
            .ledger
            .mark_responded(&message.id, reply_id, self.deps.clock.now())
            .await?;
        self.unrecorded.lock().await.remove(&message.id);
        tracing::info!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            %reply_id,
            marked,
            "recorded earlier deferred reply"
        );
        Ok(CandidateOutcome::Recorded)
    }

    #[cfg(test)]
    pub(crate) async fn tracked_retries(&self) -> usize {
        self.send_attempts.lock().await.len()
    }

    /// Prompt plus generation. Never fails: any problem yields the fallback reply.
    async fn compose_reply(&self, config: &BotConfig, message: &Message) -> String {
        let profile = if policy::contact_profiles_enabled(config) {
            match self
                .deps
                .contacts
                .profile(&message.conversation_id, &config.contact_defaults)
                .await
            {
                Ok(profile) => profile,
                Err(error) => {
                    tracing::warn!(conversation_id = %message.conversation_id, %error, "contact profile unavailable");
                    ContactProfile::from_defaults(&message.conversation_id, &config.contact_defaults)
                }
            }
        } else {
            ContactProfile::from_defaults(&message.conversation_id, &config.contact_defaults)
        };

        match prompt::build_prompt(config, &profile, &message.body) {
            Ok(prompt) => {
                generate_or_fallback(self.deps.generator.as_ref(), &prompt, &config.fallback_reply)
                    .await
            }
            Err(error) => {
                tracing::warn!(message_id = %message.id, %error, "prompt rendering failed, using fallback reply");
                config.fallback_reply.clone()
            }
        }
    }

    /// Start the periodic trigger. The first sweep happens one period from now.
    pub fn start_timer(self: &Arc<Self>) -> SweepTimer {
        let scheduler = self.clone();
        let period = self.deps.runtime.snapshot().sweep_interval();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
                scheduler.sweep().await.log();
            }

            tracing::debug!("sweep timer stopped");
        });

        tracing::debug!(period_secs = period.as_secs(), "sweep timer started");
        SweepTimer { stop_tx, handle }
    }
}

/// Handle to a running sweep trigger.
pub struct SweepTimer {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweepTimer {
    /// Stop triggering new sweeps. A sweep already running finishes on its
    /// own and bails out at its next liveness check.
    pub fn stop(self) -> JoinHandle<()> {
        self.stop_tx.send_replace(true);
        self.handle
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
