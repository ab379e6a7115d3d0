//! deferbot operator CLI.

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use std::sync::Arc;

#[derive(Parser)]
#[command(name = "deferbot")]
#[command(about = "Deferred auto-replies with self-repairing chat sessions")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Write logs to a daily file under the log directory instead of stderr
    #[arg(long)]
    log_to_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List unanswered inbound messages older than the response delay
    Pending,
    /// Show one stored message with the latest turns of its conversation
    Show {
        /// Message id
        id: String,

        /// How many conversation turns to print
        #[arg(short, long, default_value_t = 10)]
        turns: i64,
    },
    /// Back up the credential files, then purge damaged session material
    Repair,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => deferbot::config::Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => deferbot::config::Config::load().context("failed to load configuration")?,
    };

    let _log_guard = if cli.log_to_file {
        config.ensure_dirs()?;
        Some(deferbot::daemon::init_background_tracing(&config.log_dir, cli.debug))
    } else {
        deferbot::daemon::init_foreground_tracing(cli.debug);
        None
    };
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match cli.command {
        Command::Pending => list_pending(&config).await,
        Command::Show { id, turns } => show(&config, &id, turns).await,
        Command::Repair => repair(&config).await,
    }
}

async fn open_ledger(
    config: &deferbot::config::Config,
) -> anyhow::Result<deferbot::ledger::MessageLedger> {
    deferbot::ledger::MessageLedger::open(&config.database_path, Arc::new(deferbot::SystemClock))
        .await
        .with_context(|| format!("failed to open {}", config.database_path.display()))
}

async fn list_pending(config: &deferbot::config::Config) -> anyhow::Result<()> {
    let ledger = open_ledger(config).await?;

    let pending = ledger.find_unanswered(config.bot.response_delay()).await?;
    if pending.is_empty() {
        println!("no unanswered messages older than {}ms", config.bot.response_delay_ms);
    }
    for message in &pending {
        println!(
            "{}  {}  {}  {}",
            message.received_at.to_rfc3339(),
            message.conversation_id,
            message.id,
            message.body.replace('\n', " ")
        );
    }

    ledger.close().await;
    Ok(())
}

async fn show(config: &deferbot::config::Config, id: &str, turns: i64) -> anyhow::Result<()> {
    let ledger = open_ledger(config).await?;

    let Some(message) = ledger.get(id).await? else {
        ledger.close().await;
        anyhow::bail!("no stored message with id {id}");
    };
    println!("conversation: {}", message.conversation_id);
    match (&message.response_id, message.response_at) {
        (Some(response_id), Some(at)) => println!("answered: {response_id} at {}", at.to_rfc3339()),
        _ => println!("answered: no"),
    }

    let mut history = ledger
        .conversation_history(&message.conversation_id, turns)
        .await?;
    history.reverse();
    for turn in &history {
        let marker = if turn.id == message.id { ">" } else { " " };
        println!(
            "{marker} {}  {}  {}",
            turn.received_at.to_rfc3339(),
            turn.direction,
            turn.body.replace('\n', " ")
        );
    }

    ledger.close().await;
    Ok(())
}

async fn repair(config: &deferbot::config::Config) -> anyhow::Result<()> {
    let store = deferbot::connection::FsCredentialStore::new(
        config.auth_dir.clone(),
        config.backup_dir.clone(),
    );
    let report = deferbot::connection::repair::repair_session(&store).await?;

    match &report.backup {
        Some(backup) => println!("backup: {}", config.backup_dir.join(backup).display()),
        None => println!("backup: failed, see log"),
    }
    println!("purged {} credential files", report.purged.len());
    for name in &report.purged {
        println!("  {name}");
    }
    Ok(())
}
