//! Connection supervisor: connect, lend the session while open, classify the
//! close, repair if needed, reconnect after a fixed delay.

use super::repair::{CorruptionSignatures, CredentialStore, repair_session};
use super::{ConnectionSession, DisconnectClass, SessionSlot, classify_disconnect};
use crate::error::Result;
use crate::scheduler::{DeferralScheduler, SweepTimer};
use crate::transport::{EventStream, TransportDyn};
use crate::{ConnectionState, DisconnectCause, InboundEnvelope, TransportEvent};

use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where the supervisor is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Connecting,
    Open,
    Reconnecting,
    /// Logged out. No further attempts.
    Terminal,
    /// Shut down on request.
    Stopped,
}

/// Why [`ConnectionManager::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleExit {
    LoggedOut(DisconnectCause),
    Shutdown,
}

/// How one session ended.
enum SessionEnd {
    Closed(Option<DisconnectCause>),
    Shutdown,
}

pub struct ConnectionManager {
    transport: Arc<dyn TransportDyn>,
    credentials: Arc<dyn CredentialStore>,
    auth_dir: PathBuf,
    reconnect_delay: Duration,
    slot: Arc<SessionSlot>,
    scheduler: Arc<DeferralScheduler>,
    inbound_tx: mpsc::Sender<Vec<InboundEnvelope>>,
    signatures: CorruptionSignatures,
    phase: watch::Sender<LifecyclePhase>,
    sweep_timer: Option<SweepTimer>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn TransportDyn>,
        credentials: Arc<dyn CredentialStore>,
        auth_dir: PathBuf,
        reconnect_delay: Duration,
        slot: Arc<SessionSlot>,
        scheduler: Arc<DeferralScheduler>,
        inbound_tx: mpsc::Sender<Vec<InboundEnvelope>>,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            credentials,
            auth_dir,
            reconnect_delay,
            slot,
            scheduler,
            inbound_tx,
            signatures: CorruptionSignatures::builtin()?,
            phase: watch::Sender::new(LifecyclePhase::Connecting),
            sweep_timer: None,
            generation: 0,
        })
    }

    /// Observe phase changes.
    pub fn phase(&self) -> watch::Receiver<LifecyclePhase> {
        self.phase.subscribe()
    }

    /// Supervise connections until logout or shutdown. Attempts are strictly
    /// sequential: a new one starts only after the previous session closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> LifecycleExit {
        let exit = loop {
            if *shutdown.borrow() {
                break LifecycleExit::Shutdown;
            }

            self.set_phase(LifecyclePhase::Connecting);
            let connect = self.transport.connect(&self.auth_dir);
            let connected = tokio::select! {
                result = connect => result,
                _ = shutdown.changed() => break LifecycleExit::Shutdown,
            };

            let connected = match connected {
                Ok(connected) => connected,
                Err(error) => {
                    tracing::warn!(transport = self.transport.name(), %error, "connect failed");
                    if !self.wait_before_reconnect(&mut shutdown).await {
                        break LifecycleExit::Shutdown;
                    }
                    continue;
                }
            };

            self.generation += 1;
            let session = Arc::new(ConnectionSession::new(self.generation, connected.session));
            self.slot.publish(session.clone());
            tracing::info!(generation = self.generation, "session created, waiting for open");

            let end = self
                .drive_session(&session, connected.events, &mut shutdown)
                .await;

            session.mark_closed();
            self.slot.revoke(session.generation());
            self.stop_sweep_timer();

            let cause = match end {
                SessionEnd::Shutdown => break LifecycleExit::Shutdown,
                SessionEnd::Closed(cause) => cause,
            };

            match classify_disconnect(
                cause.as_ref(),
                session.credentials_suspect(),
                &self.signatures,
            ) {
                DisconnectClass::LoggedOut => {
                    let cause = cause.unwrap_or_default();
                    tracing::error!(%cause, "logged out, re-pairing required, not reconnecting");
                    self.set_phase(LifecyclePhase::Terminal);
                    return LifecycleExit::LoggedOut(cause);
                }
                DisconnectClass::Corrupted => {
                    tracing::warn!(
                        generation = session.generation(),
                        cause = cause.as_ref().map(ToString::to_string).unwrap_or_default(),
                        "session corrupted, repairing credentials"
                    );
                    if let Err(error) = repair_session(self.credentials.as_ref()).await {
                        tracing::error!(%error, "session repair failed, reconnecting anyway");
                    }
                }
                DisconnectClass::Recoverable => {
                    tracing::info!(
                        generation = session.generation(),
                        cause = cause.as_ref().map(ToString::to_string).unwrap_or_default(),
                        "connection closed, reconnecting"
                    );
                }
            }

            if !self.wait_before_reconnect(&mut shutdown).await {
                break LifecycleExit::Shutdown;
            }
        };

        self.stop_sweep_timer();
        self.set_phase(LifecyclePhase::Stopped);
        exit
    }

    /// Pump one session's events until it closes.
    async fn drive_session(
        &mut self,
        session: &Arc<ConnectionSession>,
        mut events: EventStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                event = events.next() => event,
                _ = shutdown.changed() => return SessionEnd::Shutdown,
            };

            match event {
                Some(TransportEvent::Messages(batch)) => {
                    if self.inbound_tx.send(batch).await.is_err() {
                        tracing::warn!("ingestion loop is gone, dropping message batch");
                    }
                }
                Some(TransportEvent::Connection { state, cause }) => match state {
                    ConnectionState::Connecting => {
                        if session.mark_connecting() {
                            tracing::info!(
                                generation = session.generation(),
                                "connection lost, transport re-handshaking"
                            );
                            self.stop_sweep_timer();
                            self.set_phase(LifecyclePhase::Connecting);
                        } else {
                            tracing::debug!(generation = session.generation(), "transport connecting");
                        }
                    }
                    ConnectionState::Open => {
                        if session.mark_open() {
                            tracing::info!(generation = session.generation(), "connection open");
                            self.set_phase(LifecyclePhase::Open);
                            self.start_sweep_timer();
                        }
                    }
                    ConnectionState::Closed => return SessionEnd::Closed(cause),
                },
                None => {
                    return SessionEnd::Closed(Some(DisconnectCause::new(
                        None,
                        "transport event stream ended",
                    )));
                }
            }
        }
    }

    fn start_sweep_timer(&mut self) {
        self.stop_sweep_timer();
        self.sweep_timer = Some(self.scheduler.start_timer());
    }

    fn stop_sweep_timer(&mut self) {
        if let Some(timer) = self.sweep_timer.take() {
            drop(timer.stop());
        }
    }

    /// Sleep the reconnect delay. Returns false if shutdown was requested.
    async fn wait_before_reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.set_phase(LifecyclePhase::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        self.phase.send_replace(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Direction;
    use crate::testing::{
        FakeSession, FakeTransport, Harness, MemoryCredentialStore, ScriptedGenerator, closed,
        envelope, opened,
    };

    const AUTH_FILES: &[&str] = &[
        "creds.json",
        "session-1.json",
        "pre-key-1.json",
        "app-state-sync-key-1.json",
        "sender-key-1.json",
    ];

    fn manager(
        harness: &Harness,
        transport: Arc<FakeTransport>,
        credentials: Arc<MemoryCredentialStore>,
    ) -> (ConnectionManager, mpsc::Receiver<Vec<InboundEnvelope>>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let manager = ConnectionManager::new(
            transport,
            credentials,
            PathBuf::from("auth"),
            Duration::from_millis(1),
            harness.slot.clone(),
            harness.scheduler.clone(),
            inbound_tx,
        )
        .unwrap();
        (manager, inbound_rx)
    }

    #[tokio::test]
    async fn corruption_is_repaired_once_then_logout_is_terminal() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        transport.script(
            Arc::new(FakeSession::new()),
            vec![opened(), closed(Some(500), "Bad MAC")],
        );
        transport.script(
            Arc::new(FakeSession::new()),
            vec![opened(), closed(Some(401), "Connection Failure")],
        );
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, _inbound) = manager(&harness, transport.clone(), credentials.clone());
        let phase = manager.phase();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let exit = manager.run(shutdown_rx).await;

        assert!(matches!(exit, LifecycleExit::LoggedOut(ref cause) if cause.status_code == Some(401)));
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(credentials.snapshot_count(), 1);
        assert_eq!(credentials.snapshots()[0].len(), AUTH_FILES.len());
        assert_eq!(
            credentials.files(),
            vec!["creds.json".to_string(), "sender-key-1.json".to_string()]
        );
        assert_eq!(*phase.borrow(), LifecyclePhase::Terminal);
        assert!(harness.slot.live().is_none());
    }

    #[tokio::test]
    async fn ordinary_disconnects_reconnect_without_repair() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        transport.script(
            Arc::new(FakeSession::new()),
            vec![opened(), closed(Some(408), "Timed Out")],
        );
        transport.script(Arc::new(FakeSession::new()), vec![opened()]);
        transport.script(
            Arc::new(FakeSession::new()),
            vec![closed(Some(401), "logged out")],
        );
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, _inbound) = manager(&harness, transport.clone(), credentials.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let exit = manager.run(shutdown_rx).await;

        assert!(matches!(exit, LifecycleExit::LoggedOut(_)));
        // Second script ends its stream without a close event: still a reconnect.
        assert_eq!(transport.connect_count(), 3);
        assert_eq!(credentials.snapshot_count(), 0);
        assert_eq!(credentials.files().len(), AUTH_FILES.len());
    }

    #[tokio::test]
    async fn corrupted_send_flag_triggers_repair_on_close() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        let (events_tx, events) = FakeTransport::channel_events();
        transport.script_stream(Arc::new(FakeSession::new()), events);
        transport.script(
            Arc::new(FakeSession::new()),
            vec![closed(Some(401), "logged out")],
        );
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, _inbound) = manager(&harness, transport.clone(), credentials.clone());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = harness.slot.clone();

        let run = tokio::spawn(manager.run(shutdown_rx));

        events_tx.send(opened()).await.unwrap();
        let session = loop {
            if let Some(session) = slot.live() {
                break session;
            }
            tokio::task::yield_now().await;
        };
        session.flag_credentials_suspect();
        events_tx.send(closed(Some(500), "Stream Errored")).await.unwrap();

        let exit = run.await.unwrap();
        assert!(matches!(exit, LifecycleExit::LoggedOut(_)));
        assert_eq!(credentials.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn failed_connects_are_retried() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        transport.script_failure("network unreachable");
        transport.script(
            Arc::new(FakeSession::new()),
            vec![closed(Some(401), "logged out")],
        );
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, _inbound) = manager(&harness, transport.clone(), credentials);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let exit = manager.run(shutdown_rx).await;
        assert!(matches!(exit, LifecycleExit::LoggedOut(_)));
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn message_batches_are_forwarded_and_session_is_lent_while_open() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        let (events_tx, events) = FakeTransport::channel_events();
        transport.script_stream(Arc::new(FakeSession::new()), events);
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, mut inbound) = manager(&harness, transport, credentials);
        let phase = manager.phase();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = harness.slot.clone();

        let run = tokio::spawn(manager.run(shutdown_rx));

        events_tx.send(opened()).await.unwrap();
        events_tx
            .send(TransportEvent::Messages(vec![envelope(
                "m1",
                "a@s.whatsapp.net",
                Direction::Inbound,
                Some("Hi"),
            )]))
            .await
            .unwrap();

        let batch = inbound.recv().await.unwrap();
        assert_eq!(batch[0].id, "m1");
        assert!(slot.live().is_some());
        assert_eq!(*phase.borrow(), LifecyclePhase::Open);

        shutdown_tx.send(true).unwrap();
        assert_eq!(run.await.unwrap(), LifecycleExit::Shutdown);
        assert!(slot.live().is_none());
        assert_eq!(*phase.borrow(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn connecting_after_open_suspends_the_session_until_reopened() {
        let harness = Harness::new(ScriptedGenerator::replying("x")).await;
        let transport = Arc::new(FakeTransport::new());
        let (events_tx, events) = FakeTransport::channel_events();
        transport.script_stream(Arc::new(FakeSession::new()), events);
        let credentials = Arc::new(MemoryCredentialStore::with_files(AUTH_FILES));
        let (manager, mut inbound) = manager(&harness, transport, credentials);
        let phase = manager.phase();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let slot = harness.slot.clone();
        let batch = |id: &str| {
            TransportEvent::Messages(vec![envelope(id, "a@s.whatsapp.net", Direction::Inbound, Some("Hi"))])
        };

        let run = tokio::spawn(manager.run(shutdown_rx));

        events_tx.send(opened()).await.unwrap();
        events_tx.send(batch("m1")).await.unwrap();
        inbound.recv().await.unwrap();
        let session = slot.live().unwrap();

        events_tx
            .send(TransportEvent::Connection {
                state: ConnectionState::Connecting,
                cause: None,
            })
            .await
            .unwrap();
        events_tx.send(batch("m2")).await.unwrap();
        inbound.recv().await.unwrap();
        assert!(slot.live().is_none());
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(*phase.borrow(), LifecyclePhase::Connecting);

        events_tx.send(opened()).await.unwrap();
        events_tx.send(batch("m3")).await.unwrap();
        inbound.recv().await.unwrap();
        assert_eq!(slot.live().map(|s| s.generation()), Some(session.generation()));
        assert_eq!(*phase.borrow(), LifecyclePhase::Open);

        shutdown_tx.send(true).unwrap();
        assert_eq!(run.await.unwrap(), LifecycleExit::Shutdown);
    }
}
