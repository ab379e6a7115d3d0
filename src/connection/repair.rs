//! Session repair: snapshot the credential files, then purge the damaged
//! categories while keeping the device identity.

use crate::error::{ConnectionError, Result};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use regex::RegexSet;

use std::path::PathBuf;

/// Credential file categories, keyed on file-name prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialCategory {
    /// Device identity (`creds.json`). Never purged.
    Identity,
    Session,
    AppState,
    PreKey,
    SenderKey,
}

impl CredentialCategory {
    pub fn classify(file_name: &str) -> Option<Self> {
        if file_name == "creds.json" {
            Some(CredentialCategory::Identity)
        } else if file_name.starts_with("session-") {
            Some(CredentialCategory::Session)
        } else if file_name.starts_with("app-state-sync-") {
            Some(CredentialCategory::AppState)
        } else if file_name.starts_with("pre-key-") {
            Some(CredentialCategory::PreKey)
        } else if file_name.starts_with("sender-key") {
            Some(CredentialCategory::SenderKey)
        } else {
            None
        }
    }
}

/// Categories removed by a repair.
pub const REPAIR_CATEGORIES: [CredentialCategory; 3] = [
    CredentialCategory::Session,
    CredentialCategory::AppState,
    CredentialCategory::PreKey,
];

/// Whether `file_name` falls in one of `categories`. Identity and
/// unclassified files never do.
pub(crate) fn purge_wanted(file_name: &str, categories: &[CredentialCategory]) -> bool {
    match CredentialCategory::classify(file_name) {
        Some(CredentialCategory::Identity) | None => false,
        Some(category) => categories.contains(&category),
    }
}

/// Capability the supervisor needs from credential storage.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Copy every credential file aside. Returns an id for the backup.
    async fn snapshot(&self) -> Result<String>;

    /// Delete files in the given categories. Identity files are always
    /// kept. Returns the names of removed files.
    async fn purge_categories(&self, categories: &[CredentialCategory]) -> Result<Vec<String>>;
}

/// Credential files in a flat directory, backups in a sibling directory.
pub struct FsCredentialStore {
    auth_dir: PathBuf,
    backup_dir: PathBuf,
}

impl FsCredentialStore {
    pub fn new(auth_dir: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            auth_dir,
            backup_dir,
        }
    }

    async fn credential_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.auth_dir)
            .await
            .with_context(|| format!("failed to read {}", self.auth_dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push((name.to_string(), entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl CredentialStore for FsCredentialStore {
    async fn snapshot(&self) -> Result<String> {
        let backup_id = format!("auth-backup-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let target = self.backup_dir.join(&backup_id);
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("failed to create {}", target.display()))?;

        let files = self.credential_files().await?;
        for (name, path) in &files {
            tokio::fs::copy(path, target.join(name))
                .await
                .with_context(|| format!("failed to back up {name}"))?;
        }

        tracing::info!(backup = %target.display(), files = files.len(), "credential snapshot written");
        Ok(backup_id)
    }

    async fn purge_categories(&self, categories: &[CredentialCategory]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for (name, path) in self.credential_files().await? {
            if !purge_wanted(&name, categories) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed.push(name),
                Err(error) => {
                    tracing::warn!(%error, file = %name, "failed to remove credential file");
                }
            }
        }
        Ok(removed)
    }
}

/// Disconnect messages that mean the session material is damaged.
pub struct CorruptionSignatures {
    set: RegexSet,
}

const SIGNATURE_PATTERNS: &[&str] = &[
    r"bad mac",
    r"(failed|unable) to decrypt",
    r"no session record",
    r"no matching sessions",
    r"invalid prekey id",
    r"key used already or never filled",
    r"invalid patch mac",
    r"app state sync",
    r"unexpected end of (session|credential)",
];

impl CorruptionSignatures {
    pub fn builtin() -> Result<Self> {
        let set = RegexSet::new(SIGNATURE_PATTERNS.iter().map(|pattern| format!("(?i){pattern}")))
            .map_err(|error| ConnectionError::Repair(format!("invalid corruption signature: {error}")))?;
        Ok(Self { set })
    }

    pub fn matches(&self, message: &str) -> bool {
        self.set.is_match(message)
    }
}

/// What a repair did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Backup id, or `None` if the snapshot failed.
    pub backup: Option<String>,
    pub purged: Vec<String>,
}

/// Back up then purge. A failed backup is logged and does not stop the
/// purge; a failed purge is returned.
pub async fn repair_session(store: &dyn CredentialStore) -> Result<RepairReport> {
    let backup = match store.snapshot().await {
        Ok(backup) => Some(backup),
        Err(error) => {
            tracing::warn!(%error, "credential snapshot failed, purging without a backup");
            None
        }
    };

    let purged = store.purge_categories(&REPAIR_CATEGORIES).await?;
    tracing::warn!(
        backup = backup.as_deref().unwrap_or("none"),
        purged = purged.len(),
        "session repaired, device identity kept"
    );

    Ok(RepairReport { backup, purged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCredentialStore;

    const FILES: &[&str] = &[
        "creds.json",
        "session-123.0.json",
        "pre-key-1.json",
        "pre-key-2.json",
        "app-state-sync-key-AAAA.json",
        "app-state-sync-version-regular.json",
        "sender-key-group@g.us--1.json",
        "notes.txt",
    ];

    #[test]
    fn classifies_credential_files() {
        assert_eq!(
            CredentialCategory::classify("creds.json"),
            Some(CredentialCategory::Identity)
        );
        assert_eq!(
            CredentialCategory::classify("session-9.json"),
            Some(CredentialCategory::Session)
        );
        assert_eq!(
            CredentialCategory::classify("app-state-sync-version-critical_block.json"),
            Some(CredentialCategory::AppState)
        );
        assert_eq!(
            CredentialCategory::classify("sender-key-memory-x.json"),
            Some(CredentialCategory::SenderKey)
        );
        assert_eq!(CredentialCategory::classify("notes.txt"), None);
    }

    #[test]
    fn signatures_are_case_insensitive() {
        let signatures = CorruptionSignatures::builtin().unwrap();
        assert!(signatures.matches("Bad MAC Error"));
        assert!(signatures.matches("SessionError: No session record"));
        assert!(signatures.matches("failed to decrypt message with any known session"));
        assert!(!signatures.matches("Connection Closed"));
        assert!(!signatures.matches("Stream Errored (restart required)"));
    }

    #[tokio::test]
    async fn filesystem_repair_backs_up_everything_and_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let auth_dir = dir.path().join("auth");
        let backup_dir = dir.path().join("backups");
        std::fs::create_dir_all(&auth_dir).unwrap();
        for name in FILES {
            std::fs::write(auth_dir.join(name), name.as_bytes()).unwrap();
        }

        let store = FsCredentialStore::new(auth_dir.clone(), backup_dir.clone());
        let report = repair_session(&store).await.unwrap();

        let backup_id = report.backup.unwrap();
        let backed_up = std::fs::read_dir(backup_dir.join(&backup_id)).unwrap().count();
        assert_eq!(backed_up, FILES.len());

        let mut remaining: Vec<String> = std::fs::read_dir(&auth_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "creds.json".to_string(),
                "notes.txt".to_string(),
                "sender-key-group@g.us--1.json".to_string(),
            ]
        );
        assert_eq!(report.purged.len(), 5);
    }

    #[tokio::test]
    async fn identity_survives_even_when_requested() {
        let store = MemoryCredentialStore::with_files(FILES);
        let removed = store
            .purge_categories(&[CredentialCategory::Identity, CredentialCategory::PreKey])
            .await
            .unwrap();

        assert_eq!(removed.len(), 2);
        assert!(store.files().contains(&"creds.json".to_string()));
    }

    #[tokio::test]
    async fn failed_snapshot_still_purges() {
        let store = MemoryCredentialStore::with_files(FILES);
        store.fail_snapshots();

        let report = repair_session(&store).await.unwrap();
        assert!(report.backup.is_none());
        assert_eq!(report.purged.len(), 5);
    }
}
