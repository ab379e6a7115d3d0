//! Test doubles: a settable clock, scripted transport and generator, and an
//! in-memory credential store.

use crate::config::{BotConfig, RuntimeConfig};
use crate::connection::repair::purge_wanted;
use crate::connection::{ConnectionSession, CredentialCategory, CredentialStore, SessionSlot};
use crate::contacts::ContactBook;
use crate::error::{ConnectionError, GenerationError, Result, SendError};
use crate::generator::Generator;
use crate::ingestion::Ingestor;
use crate::ledger::{MessageLedger, NewMessage};
use crate::scheduler::{DeferralScheduler, SchedulerDeps};
use crate::transport::{Connected, EventStream, Session, Transport};
use crate::webhook::WebhookNotifier;
use crate::{
    Clock, ConnectionState, Direction, DisconnectCause, InboundEnvelope, TransportEvent,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use chrono::{DateTime, TimeZone as _, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Clock pinned to a Monday 10:00 UTC plus a settable offset.
pub(crate) struct ManualClock {
    base: DateTime<Utc>,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn at_millis(offset_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            base: Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
            offset_ms: AtomicI64::new(offset_ms),
        })
    }

    pub fn set_millis(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::SeqCst);
    }

    /// Absolute time at `offset_ms` past the base.
    pub fn offset_millis(&self, offset_ms: i64) -> DateTime<Utc> {
        self.base + chrono::Duration::milliseconds(offset_ms)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.offset_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

pub(crate) async fn memory_ledger(clock: Arc<ManualClock>) -> MessageLedger {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite should connect");
    let ledger = MessageLedger::new(pool, clock);
    ledger.initialize().await.expect("ledger schema should be created");
    ledger
}

pub(crate) fn envelope(
    id: &str,
    conversation_id: &str,
    direction: Direction,
    body: Option<&str>,
) -> InboundEnvelope {
    InboundEnvelope {
        id: id.into(),
        conversation_id: conversation_id.into(),
        direction,
        body: body.map(str::to_string),
        has_media: false,
        sender_display_name: None,
        quoted_message_id: None,
    }
}

pub(crate) fn opened() -> TransportEvent {
    TransportEvent::Connection {
        state: ConnectionState::Open,
        cause: None,
    }
}

pub(crate) fn closed(status_code: Option<u16>, message: &str) -> TransportEvent {
    TransportEvent::Connection {
        state: ConnectionState::Closed,
        cause: Some(DisconnectCause::new(status_code, message)),
    }
}

/// Session that records successful sends and replays queued results.
pub(crate) struct FakeSession {
    sent: Mutex<Vec<(String, String)>>,
    results: Mutex<VecDeque<std::result::Result<String, SendError>>>,
}

impl FakeSession {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue the result of a future send. Unqueued sends succeed.
    pub fn push_result(&self, result: std::result::Result<String, SendError>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl Session for FakeSession {
    async fn send(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> std::result::Result<String, SendError> {
        let queued = self.results.lock().unwrap().pop_front();
        if let Some(Err(error)) = queued {
            return Err(error);
        }

        let mut sent = self.sent.lock().unwrap();
        sent.push((conversation_id.to_string(), text.to_string()));
        Ok(match queued {
            Some(Ok(id)) => id,
            _ => format!("sent-{}", sent.len()),
        })
    }
}

enum Script {
    Session(Arc<FakeSession>, EventStream),
    Failure(String),
}

/// Transport that hands out pre-scripted sessions in order, then hangs.
pub(crate) struct FakeTransport {
    scripts: Mutex<VecDeque<Script>>,
    connects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, session: Arc<FakeSession>, events: Vec<TransportEvent>) {
        self.script_stream(session, Box::pin(futures::stream::iter(events)));
    }

    pub fn script_stream(&self, session: Arc<FakeSession>, events: EventStream) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Session(session, events));
    }

    pub fn script_failure(&self, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Failure(message.to_string()));
    }

    pub fn channel_events() -> (mpsc::Sender<TransportEvent>, EventStream) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Box::pin(ReceiverStream::new(rx)))
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn connect(&self, _auth_dir: &Path) -> Result<Connected> {
        let script = self.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            return futures::future::pending().await;
        };
        self.connects.fetch_add(1, Ordering::SeqCst);

        match script {
            Script::Session(session, events) => Ok(Connected { session, events }),
            Script::Failure(message) => Err(ConnectionError::Connect(message).into()),
        }
    }
}

type Hook = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Generator returning a fixed reply (or failing), counting calls.
pub(crate) struct ScriptedGenerator {
    reply: Option<String>,
    calls: AtomicUsize,
    hook: Mutex<Option<Hook>>,
}

impl ScriptedGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Run `hook` during every generation.
    pub fn on_generate(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.on_generate_async(move || {
            hook();
            async {}
        });
    }

    /// Run and await `hook` during every generation.
    pub fn on_generate_async<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let boxed: Hook = Box::new(move || -> BoxFuture<'static, ()> { Box::pin(hook()) });
        *self.hook.lock().unwrap() = Some(boxed);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _prompt: &str) -> std::result::Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self.hook.lock().unwrap().as_ref().map(|hook| hook());
        if let Some(pending) = pending {
            pending.await;
        }
        self.reply
            .clone()
            .ok_or_else(|| GenerationError::Request("scripted failure".into()))
    }
}

/// Credential store over a set of file names.
pub(crate) struct MemoryCredentialStore {
    files: Mutex<BTreeSet<String>>,
    snapshots: Mutex<Vec<Vec<String>>>,
    fail_snapshots: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn with_files(files: &[&str]) -> Self {
        Self {
            files: Mutex::new(files.iter().map(|name| name.to_string()).collect()),
            snapshots: Mutex::new(Vec::new()),
            fail_snapshots: AtomicBool::new(false),
        }
    }

    pub fn fail_snapshots(&self) {
        self.fail_snapshots.store(true, Ordering::SeqCst);
    }

    pub fn files(&self) -> Vec<String> {
        self.files.lock().unwrap().iter().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<Vec<String>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn snapshot(&self) -> Result<String> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(ConnectionError::Credentials("disk full".into()).into());
        }
        let files = self.files();
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.push(files);
        Ok(format!("snapshot-{}", snapshots.len()))
    }

    async fn purge_categories(&self, categories: &[CredentialCategory]) -> Result<Vec<String>> {
        let mut files = self.files.lock().unwrap();
        let removed: Vec<String> = files
            .iter()
            .filter(|name| purge_wanted(name, categories))
            .cloned()
            .collect();
        for name in &removed {
            files.remove(name);
        }
        Ok(removed)
    }
}

/// A scheduler wired to in-memory collaborators, with one published but
/// not yet open session.
pub(crate) struct Harness {
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<MessageLedger>,
    pub runtime: Arc<RuntimeConfig>,
    pub contacts: Arc<ContactBook>,
    pub webhooks: Arc<WebhookNotifier>,
    pub slot: Arc<SessionSlot>,
    pub generator: Arc<ScriptedGenerator>,
    pub fake_session: Arc<FakeSession>,
    pub session: Arc<ConnectionSession>,
    pub scheduler: Arc<DeferralScheduler>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub async fn new(generator: ScriptedGenerator) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::at_millis(0);
        let ledger = Arc::new(memory_ledger(clock.clone()).await);
        let runtime = Arc::new(RuntimeConfig::new(BotConfig {
            pacing_ms: 0,
            ..BotConfig::default()
        }));
        let contacts = Arc::new(ContactBook::new(dir.path().join("contacts.json")));
        let webhooks = Arc::new(WebhookNotifier::new().unwrap());
        let slot = Arc::new(SessionSlot::new());
        let generator = Arc::new(generator);
        let fake_session = Arc::new(FakeSession::new());
        let session = Arc::new(ConnectionSession::new(1, fake_session.clone()));
        slot.publish(session.clone());

        let scheduler = Arc::new(DeferralScheduler::new(SchedulerDeps {
            ledger: ledger.clone(),
            generator: generator.clone(),
            contacts: contacts.clone(),
            webhooks: webhooks.clone(),
            runtime: runtime.clone(),
            slot: slot.clone(),
            clock: clock.clone(),
        }));

        Self {
            clock,
            ledger,
            runtime,
            contacts,
            webhooks,
            slot,
            generator,
            fake_session,
            session,
            scheduler,
            _dir: dir,
        }
    }

    pub fn open_session(&self) {
        self.session.mark_open();
    }

    /// Record an inbound message received `at_ms` past the clock base.
    pub async fn inbound(&self, id: &str, conversation_id: &str, body: &str, at_ms: i64) {
        self.record(NewMessage {
            id: id.into(),
            conversation_id: conversation_id.into(),
            direction: Direction::Inbound,
            body: body.into(),
            received_at: self.clock.offset_millis(at_ms),
        })
        .await;
    }

    pub async fn record(&self, message: NewMessage) {
        self.ledger.record(&message).await.unwrap();
    }

    pub fn update_config(&self, update: impl FnOnce(&mut BotConfig)) {
        let mut config = (*self.runtime.snapshot()).clone();
        update(&mut config);
        self.runtime.replace(config);
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.ledger.clone(),
            self.contacts.clone(),
            self.webhooks.clone(),
            self.runtime.clone(),
            self.clock.clone(),
        )
    }
}
