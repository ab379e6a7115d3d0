//! Contact profiles stored as a JSON file, served through a short-lived
//! read-through cache.

use crate::config::ContactDefaults;
use crate::error::Result;

use anyhow::{Context as _, anyhow};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Key of the profile used for contacts without an entry of their own.
pub const DEFAULT_PROFILE_KEY: &str = "default";

const HISTORY_LIMIT: usize = 10;
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

type ProfileMap = HashMap<String, ContactProfile>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactProfile {
    pub name: String,
    pub phone: String,
    pub relation: String,
    pub lang: String,
    pub tone: String,
    /// Most recent messages first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub body: String,
    pub at: DateTime<Utc>,
}

impl ContactProfile {
    /// Profile built from configured defaults, named after the phone number.
    pub fn from_defaults(conversation_id: &str, defaults: &ContactDefaults) -> Self {
        let phone = phone_of(conversation_id).to_string();
        Self {
            name: phone.clone(),
            phone,
            relation: defaults.relation.clone(),
            lang: defaults.lang.clone(),
            tone: defaults.tone.clone(),
            history: Vec::new(),
            first_seen: None,
            last_seen: None,
        }
    }

    fn remember(&mut self, body: &str, at: DateTime<Utc>) {
        self.history.insert(
            0,
            HistoryEntry {
                body: body.to_string(),
                at,
            },
        );
        self.history.truncate(HISTORY_LIMIT);
        self.last_seen = Some(at);
    }
}

/// The part of a conversation id before the `@`.
pub fn phone_of(conversation_id: &str) -> &str {
    conversation_id
        .split_once('@')
        .map(|(phone, _domain)| phone)
        .unwrap_or(conversation_id)
}

pub struct ContactBook {
    path: PathBuf,
    cache: Cache<(), Arc<ProfileMap>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ContactBook {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: Cache::builder()
                .max_capacity(1)
                .time_to_live(CACHE_TTL)
                .build(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Profile for a conversation: its own entry, else the `default` entry,
    /// else one built from `defaults`.
    pub async fn profile(
        &self,
        conversation_id: &str,
        defaults: &ContactDefaults,
    ) -> Result<ContactProfile> {
        let profiles = self.profiles().await?;
        Ok(profiles
            .get(conversation_id)
            .or_else(|| profiles.get(DEFAULT_PROFILE_KEY))
            .cloned()
            .unwrap_or_else(|| ContactProfile::from_defaults(conversation_id, defaults)))
    }

    /// Record that a contact wrote to us: creates the profile on first
    /// contact, otherwise prepends the message to its history.
    pub async fn observe(
        &self,
        conversation_id: &str,
        display_name: Option<&str>,
        body: &str,
        at: DateTime<Utc>,
        defaults: &ContactDefaults,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        // Re-read under the lock so concurrent writers never drop each other's updates.
        let mut profiles = read_profiles(&self.path).await?;
        match profiles.get_mut(conversation_id) {
            Some(profile) => profile.remember(body, at),
            None => {
                let mut profile = ContactProfile::from_defaults(conversation_id, defaults);
                if let Some(name) = display_name.filter(|name| !name.trim().is_empty()) {
                    profile.name = name.trim().to_string();
                }
                profile.first_seen = Some(at);
                profile.remember(body, at);
                tracing::info!(conversation_id, name = %profile.name, "new contact profile");
                profiles.insert(conversation_id.to_string(), profile);
            }
        }

        write_profiles(&self.path, &profiles).await?;
        self.cache.insert((), Arc::new(profiles)).await;
        Ok(())
    }

    async fn profiles(&self) -> Result<Arc<ProfileMap>> {
        let path = self.path.clone();
        self.cache
            .try_get_with((), async move { read_profiles(&path).await.map(Arc::new) })
            .await
            .map_err(|error| anyhow!("failed to load contact profiles: {error}").into())
    }
}

async fn read_profiles(path: &std::path::Path) -> Result<ProfileMap> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(ProfileMap::new()),
        Ok(content) => Ok(serde_json::from_str(&content)
            .with_context(|| format!("invalid contact file {}", path.display()))?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(ProfileMap::new()),
        Err(error) => Err(error.into()),
    }
}

async fn write_profiles(path: &std::path::Path, profiles: &ProfileMap) -> Result<()> {
    let content =
        serde_json::to_string_pretty(profiles).context("failed to serialize contact profiles")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, content)
        .await
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
