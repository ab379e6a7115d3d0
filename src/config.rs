//! Configuration loading and validation.
//!
//! Static settings (paths, generator endpoint, reconnect delay) are read once.
//! Behavioral settings live in [`BotConfig`] and are served through
//! [`RuntimeConfig`], which can be swapped while the bot runs.

use crate::error::{ConfigError, Result};

use anyhow::Context as _;
use arc_swap::ArcSwap;
use chrono::{NaiveTime, Weekday};
use notify::{RecursiveMode, Watcher as _};
use serde::Deserialize;

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "BOT_CONFIG_PATH";

/// Full deferbot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path.
    pub data_dir: PathBuf,

    /// SQLite file backing the message ledger.
    pub database_path: PathBuf,

    /// Directory holding the transport's credential files.
    pub auth_dir: PathBuf,

    /// Where session repair stores credential snapshots.
    pub backup_dir: PathBuf,

    /// JSON file of contact profiles.
    pub contacts_path: PathBuf,

    /// Log directory for background mode.
    pub log_dir: PathBuf,

    /// The file this config was read from, if any. Watched for hot reload.
    pub source_path: Option<PathBuf>,

    pub generator: GeneratorConfig,

    pub connection: ConnectionConfig,

    pub bot: BotConfig,
}

/// Reply generator endpoint settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".into(),
            model: "gemini-1.5-flash".into(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

/// Connection supervisor settings.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Fixed delay before every reconnect attempt.
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3_000,
        }
    }
}

/// Hot-reloadable bot behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub name: String,

    /// How long a contact message waits for a human reply before the bot answers.
    pub response_delay_ms: u64,

    /// Period of the deferral sweep.
    pub sweep_interval_secs: u64,

    /// Pause between two sends within one sweep.
    pub pacing_ms: u64,

    /// Transient send failures tolerated per message before giving up.
    /// `0` retries forever.
    pub max_send_attempts: u32,

    /// Sent when the generator fails or returns nothing usable.
    pub fallback_reply: String,

    pub features: FeatureFlags,

    pub business_hours: BusinessHours,

    pub webhook: WebhookConfig,

    pub prompt: PromptConfig,

    pub contact_defaults: ContactDefaults,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "Assistant".into(),
            response_delay_ms: 300_000,
            sweep_interval_secs: 30,
            pacing_ms: 1_000,
            max_send_attempts: 5,
            fallback_reply: "Sorry, I can't answer properly right now. I'll get back to you soon."
                .into(),
            features: FeatureFlags::default(),
            business_hours: BusinessHours::default(),
            webhook: WebhookConfig::default(),
            prompt: PromptConfig::default(),
            contact_defaults: ContactDefaults::default(),
        }
    }
}

impl BotConfig {
    pub fn response_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.response_delay_ms)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn pacing(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.pacing_ms)
    }

    /// `None` when transient failures are retried forever.
    pub fn send_attempt_ceiling(&self) -> Option<u32> {
        (self.max_send_attempts > 0).then_some(self.max_send_attempts)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (weekday, hours) in self.business_hours.days.iter() {
            hours.parse().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "business hours for {weekday} must be HH:MM with start before end, got {}-{}",
                    hours.start, hours.end
                ))
            })?;
        }

        if let Some(timezone) = &self.business_hours.timezone
            && timezone.parse::<chrono_tz::Tz>().is_err()
        {
            return Err(ConfigError::Invalid(format!(
                "unknown business hours timezone: {timezone}"
            )));
        }

        if self.webhook.enabled && self.webhook.url.is_none() {
            return Err(ConfigError::MissingKey("bot.webhook.url".into()));
        }

        Ok(())
    }
}

/// Feature switches. Everything except the auto-responder is opt-in.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub auto_responder: bool,
    pub business_hours: bool,
    pub group_chat: bool,
    pub webhooks: bool,
    pub contact_profiles: bool,
    /// Record media messages without a caption so they get a deferred reply.
    pub media_handling: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            auto_responder: true,
            business_hours: false,
            group_chat: false,
            webhooks: false,
            contact_profiles: false,
            media_handling: false,
        }
    }
}

/// Weekly opening hours.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusinessHours {
    pub enabled: bool,

    /// IANA timezone name. Host local time when unset.
    pub timezone: Option<String>,

    pub days: WeeklyHours,
}

/// Opening hours per weekday. A missing day is closed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WeeklyHours {
    pub monday: Option<DayHours>,
    pub tuesday: Option<DayHours>,
    pub wednesday: Option<DayHours>,
    pub thursday: Option<DayHours>,
    pub friday: Option<DayHours>,
    pub saturday: Option<DayHours>,
    pub sunday: Option<DayHours>,
}

impl WeeklyHours {
    pub fn for_weekday(&self, weekday: Weekday) -> Option<&DayHours> {
        match weekday {
            Weekday::Mon => self.monday.as_ref(),
            Weekday::Tue => self.tuesday.as_ref(),
            Weekday::Wed => self.wednesday.as_ref(),
            Weekday::Thu => self.thursday.as_ref(),
            Weekday::Fri => self.friday.as_ref(),
            Weekday::Sat => self.saturday.as_ref(),
            Weekday::Sun => self.sunday.as_ref(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = (Weekday, &DayHours)> {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter_map(|weekday| self.for_weekday(weekday).map(|hours| (weekday, hours)))
    }
}

/// One day's opening window, `"HH:MM"` strings, end exclusive.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DayHours {
    pub start: String,
    pub end: String,
}

impl DayHours {
    /// Parsed `(start, end)`, or `None` if malformed or empty.
    pub fn parse(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(&self.start, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(&self.end, "%H:%M").ok()?;
        (start < end).then_some((start, end))
    }
}

/// Outbound event notifications.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    /// Event types to deliver, e.g. `"message"`.
    pub events: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            events: Vec::new(),
            timeout_secs: 10,
        }
    }
}

/// Building blocks of the generator prompt.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system: String,
    pub friendly_style: String,
    pub formal_style: String,
    pub availability: String,
    pub objective: String,
    /// Relations that get the friendly style.
    pub friendly_relations: Vec<String>,
    /// Full minijinja template replacing the built-in one.
    pub template: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: "You are the personal assistant answering messages while the account owner is away."
                .into(),
            friendly_style: "Warm and casual, short sentences, first names.".into(),
            formal_style: "Polite and professional, no slang.".into(),
            availability: "The owner is currently unavailable and will read messages later.".into(),
            objective: "Acknowledge the message, answer simple questions, and offer to pass on anything important."
                .into(),
            friendly_relations: vec![
                "friend".into(),
                "family".into(),
                "partner".into(),
            ],
            template: None,
        }
    }
}

/// Profile values for contacts the bot has never seen.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContactDefaults {
    pub relation: String,
    pub lang: String,
    pub tone: String,
}

impl Default for ContactDefaults {
    fn default() -> Self {
        Self {
            relation: "unknown".into(),
            lang: "en".into(),
            tone: "neutral".into(),
        }
    }
}

/// On-disk TOML layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    data_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    auth_dir: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    contacts_path: Option<PathBuf>,
    generator: GeneratorConfig,
    connection: ConnectionConfig,
    bot: BotConfig,
}

impl Config {
    /// Load configuration from `BOT_CONFIG_PATH` (or `./deferbot.toml`) and
    /// the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("deferbot.toml"));
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific TOML file plus the environment.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let (toml_config, source_path) = match std::fs::read_to_string(path) {
            Ok(content) => {
                let parsed: TomlConfig = toml::from_str(&content).map_err(|error| {
                    ConfigError::Invalid(format!("{}: {error}", path.display()))
                })?;
                (parsed, Some(path.to_path_buf()))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                (TomlConfig::default(), None)
            }
            Err(error) => {
                return Err(ConfigError::Load {
                    path: path.display().to_string(),
                    source: Arc::new(error),
                }
                .into());
            }
        };

        Self::from_toml(toml_config, source_path, &env)
    }

    fn from_toml(
        toml_config: TomlConfig,
        source_path: Option<PathBuf>,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let data_dir = env("DEFERBOT_DATA_DIR")
            .map(PathBuf::from)
            .or(toml_config.data_dir)
            .unwrap_or_else(Self::default_data_dir);

        let database_path = env("DB_PATH")
            .map(PathBuf::from)
            .or(toml_config.database_path)
            .unwrap_or_else(|| data_dir.join("messages.db"));

        let mut generator = toml_config.generator;
        if let Some(key) = env("GEMINI_API_KEY") {
            generator.api_key = Some(key);
        }

        let mut bot = toml_config.bot;
        if let Some(name) = env("BOT_NAME") {
            bot.name = name;
        }
        if let Some(delay) = env("BOT_RESPONSE_DELAY") {
            bot.response_delay_ms = delay.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "BOT_RESPONSE_DELAY must be milliseconds, got {delay:?}"
                ))
            })?;
        }
        bot.validate()?;

        Ok(Self {
            auth_dir: toml_config
                .auth_dir
                .unwrap_or_else(|| data_dir.join("auth")),
            backup_dir: toml_config
                .backup_dir
                .unwrap_or_else(|| data_dir.join("auth-backups")),
            contacts_path: toml_config
                .contacts_path
                .unwrap_or_else(|| data_dir.join("contacts.json")),
            log_dir: data_dir.join("logs"),
            database_path,
            data_dir,
            source_path,
            generator,
            connection: toml_config.connection,
            bot,
        })
    }

    /// Default data directory: `<platform data dir>/deferbot`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("deferbot"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Create the directories the bot writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.auth_dir, &self.backup_dir, &self.log_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        if let Some(parent) = self.database_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }
        Ok(())
    }
}

/// Live view of [`BotConfig`]. Readers take a snapshot per decision.
pub struct RuntimeConfig {
    bot: ArcSwap<BotConfig>,
}

impl RuntimeConfig {
    pub fn new(bot: BotConfig) -> Self {
        Self {
            bot: ArcSwap::from_pointee(bot),
        }
    }

    pub fn snapshot(&self) -> Arc<BotConfig> {
        self.bot.load_full()
    }

    pub fn replace(&self, bot: BotConfig) {
        self.bot.store(Arc::new(bot));
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("bot", &self.bot.load())
            .finish()
    }
}

/// Watch the config file and swap in the new [`BotConfig`] whenever it
/// changes. Keep the returned watcher alive for as long as reloads should
/// happen. A file that fails to parse leaves the current snapshot in place.
pub fn spawn_watcher(
    path: PathBuf,
    runtime: Arc<RuntimeConfig>,
) -> Result<notify::RecommendedWatcher> {
    let watch_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path.file_name().map(|name| name.to_os_string());

    let watched_path = path.clone();
    let mut watcher = notify::recommended_watcher(
        move |event: notify::Result<notify::Event>| {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!(%error, "config watcher error");
                    return;
                }
            };
            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|changed| changed.file_name().map(|name| name.to_os_string()) == file_name);
            if !touches_config {
                return;
            }

            match Config::load_from_path(&watched_path) {
                Ok(config) => {
                    runtime.replace(config.bot);
                    tracing::info!(path = %watched_path.display(), "config reloaded");
                }
                Err(error) => {
                    tracing::warn!(%error, path = %watched_path.display(), "config reload rejected, keeping previous settings");
                }
            }
        },
    )
    .context("failed to create config watcher")?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", watch_dir.display()))?;

    Ok(watcher)
}
