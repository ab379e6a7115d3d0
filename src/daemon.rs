//! Process wiring: tracing setup and the [`Daemon`] that owns the ledger,
//! scheduler, ingestion loop and connection supervisor.

use crate::config::{Config, RuntimeConfig};
use crate::connection::{ConnectionManager, FsCredentialStore, LifecycleExit, SessionSlot};
use crate::contacts::ContactBook;
use crate::error::Result;
use crate::generator::{GeminiGenerator, Generator};
use crate::ingestion::Ingestor;
use crate::ledger::MessageLedger;
use crate::scheduler::{DeferralScheduler, SchedulerDeps};
use crate::transport::TransportDyn;
use crate::webhook::WebhookNotifier;
use crate::{Clock, SystemClock};

use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const MAX_MESSAGE_CHARS: usize = 280;

/// Fields that carry message bodies or prompts and stay out of the logs.
const REDACTED_FIELDS: &[&str] = &["prompt", "reply"];

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

/// Render one event field, or `None` when the field is redacted.
fn format_field(name: &str, value: &dyn std::fmt::Debug) -> Option<String> {
    if REDACTED_FIELDS.contains(&name) {
        return None;
    }
    let formatted = format!("{value:?}");
    if name != "message" {
        return Some(format!("{name}={formatted}"));
    }
    match truncate_for_log(&formatted, MAX_MESSAGE_CHARS) {
        (head, true) => Some(format!("{name}={head}...")),
        (_, false) => Some(format!("{name}={formatted}")),
    }
}

/// Initialize tracing for background mode: daily-rolled file in `log_dir`.
/// Logs are flushed until the returned guard is dropped.
pub fn init_background_tracing(log_dir: &Path, debug: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        log_dir,
        "deferbot.log",
    ));

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .fmt_fields(format::debug_fn(write_field))
                .compact(),
        )
        .init();
    guard
}

/// Initialize tracing for foreground (terminal) mode.
pub fn init_foreground_tracing(debug: bool) {
    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(
            tracing_subscriber::fmt::layer()
                .fmt_fields(format::debug_fn(write_field))
                .compact(),
        )
        .init();
}

fn write_field(
    writer: &mut format::Writer<'_>,
    field: &tracing::field::Field,
    value: &dyn std::fmt::Debug,
) -> std::fmt::Result {
    match format_field(field.name(), value) {
        Some(rendered) => write!(writer, "{rendered}"),
        None => Ok(()),
    }
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

/// Everything the bot runs, wired together and ready for [`Daemon::run`].
pub struct Daemon {
    config: Config,
    runtime: Arc<RuntimeConfig>,
    ledger: Arc<MessageLedger>,
    ingestor: Arc<Ingestor>,
    manager: ConnectionManager,
    inbound_rx: mpsc::Receiver<Vec<crate::InboundEnvelope>>,
}

impl Daemon {
    /// Open storage and build every component. `generator` overrides the
    /// configured Gemini client.
    pub async fn new(
        config: Config,
        transport: Arc<dyn TransportDyn>,
        generator: Option<Arc<dyn Generator>>,
    ) -> Result<Self> {
        config.ensure_dirs()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let ledger = Arc::new(MessageLedger::open(&config.database_path, clock.clone()).await?);

        let runtime = Arc::new(RuntimeConfig::new(config.bot.clone()));
        let contacts = Arc::new(ContactBook::new(config.contacts_path.clone()));
        let webhooks = Arc::new(WebhookNotifier::new()?);
        let generator: Arc<dyn Generator> = match generator {
            Some(generator) => generator,
            None => Arc::new(GeminiGenerator::new(&config.generator)?),
        };
        let slot = Arc::new(SessionSlot::new());

        let scheduler = Arc::new(DeferralScheduler::new(SchedulerDeps {
            ledger: ledger.clone(),
            generator,
            contacts: contacts.clone(),
            webhooks: webhooks.clone(),
            runtime: runtime.clone(),
            slot: slot.clone(),
            clock: clock.clone(),
        }));

        let ingestor = Arc::new(Ingestor::new(
            ledger.clone(),
            contacts,
            webhooks,
            runtime.clone(),
            clock,
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let credentials = Arc::new(FsCredentialStore::new(
            config.auth_dir.clone(),
            config.backup_dir.clone(),
        ));
        let manager = ConnectionManager::new(
            transport,
            credentials,
            config.auth_dir.clone(),
            Duration::from_millis(config.connection.reconnect_delay_ms),
            slot,
            scheduler,
            inbound_tx,
        )?;

        Ok(Self {
            config,
            runtime,
            ledger,
            ingestor,
            manager,
            inbound_rx,
        })
    }

    /// Supervise the connection until logout or shutdown, then drain the
    /// ingestion loop and close the ledger.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<LifecycleExit> {
        let Self {
            config,
            runtime,
            ledger,
            ingestor,
            manager,
            inbound_rx,
        } = self;

        let _watcher = match &config.source_path {
            Some(path) => match crate::config::spawn_watcher(path.clone(), runtime) {
                Ok(watcher) => Some(watcher),
                Err(error) => {
                    tracing::warn!(%error, "config hot reload disabled");
                    None
                }
            },
            None => None,
        };

        let ingestion = ingestor.spawn_loop(inbound_rx);
        tracing::info!(bot = %config.bot.name, "deferbot started");

        let exit = manager.run(shutdown).await;

        // Dropping the manager closed the batch channel; the loop drains and ends.
        if let Err(error) = ingestion.await {
            tracing::error!(%error, "ingestion loop panicked");
        }
        ledger.close().await;

        match &exit {
            LifecycleExit::LoggedOut(cause) => {
                tracing::error!(%cause, "stopped: account logged out, pair the device again");
            }
            LifecycleExit::Shutdown => tracing::info!("deferbot stopped"),
        }
        Ok(exit)
    }
}
