use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::envelope::RefreshParts;
use crate::error::StoreError;

/// One identity's credentials as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub access: String,
    /// Packed refresh envelope, see [`RefreshParts`]
    pub refresh: String,
    /// Expiry in epoch milliseconds
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl StoredCredential {
    pub fn refresh_parts(&self) -> RefreshParts {
        RefreshParts::parse(&self.refresh)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }

    pub fn is_expired(&self) -> bool {
        self.needs_refresh(Duration::ZERO)
    }

    /// True once `now >= expires_at - buffer`
    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        let buffer_ms = i64::try_from(buffer.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis() >= self.expires_at.saturating_sub(buffer_ms)
    }
}

/// Durable credential storage keyed by identity.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, identity: &str) -> Result<Option<StoredCredential>, StoreError>;

    async fn set(&self, identity: &str, credential: StoredCredential) -> Result<(), StoreError>;

    async fn remove(&self, identity: &str) -> Result<(), StoreError>;

    async fn identities(&self) -> Result<Vec<String>, StoreError>;
}

/// JSON file store. The file is the source of truth: every mutation re-reads
/// it under the write lock, applies one change, and swaps it in through a
/// temp file and a rename, so identities written by another process survive.
/// Reads are served from an in-memory mirror refreshed on each write and on
/// a miss.
pub struct FileTokenStore {
    path: PathBuf,
    entries: DashMap<String, StoredCredential>,
    write_lock: tokio::sync::Mutex<()>,
}

type Snapshot = BTreeMap<String, StoredCredential>;

fn parse_snapshot(raw: &str) -> Result<Snapshot, StoreError> {
    if raw.trim().is_empty() {
        return Ok(Snapshot::new());
    }
    Ok(serde_json::from_str(raw)?)
}

impl FileTokenStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = DashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for (identity, credential) in parse_snapshot(&raw)? {
                entries.insert(identity, credential);
            }
        }
        debug!(path = %path.display(), identities = entries.len(), "opened credential store");
        Ok(Self {
            path,
            entries,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => parse_snapshot(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn mirror(&self, snapshot: &Snapshot) {
        self.entries.retain(|identity, _| snapshot.contains_key(identity));
        for (identity, credential) in snapshot {
            self.entries.insert(identity.clone(), credential.clone());
        }
    }

    /// Apply `change` to the current file contents and write the result back.
    /// Returns false, without writing, when `change` reports nothing changed.
    async fn update<F>(&self, change: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut Snapshot) -> bool,
    {
        let _guard = self.write_lock.lock().await;
        let mut snapshot = self.load().await?;
        if !change(&mut snapshot) {
            self.mirror(&snapshot);
            return Ok(false);
        }
        let json = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.mirror(&snapshot);
        Ok(true)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[async_trait]
impl CredentialStore for FileTokenStore {
    async fn get(&self, identity: &str) -> Result<Option<StoredCredential>, StoreError> {
        if let Some(entry) = self.entries.get(identity) {
            return Ok(Some(entry.value().clone()));
        }
        // another process may have logged this identity in since we last looked
        let snapshot = self.load().await?;
        let found = snapshot.get(identity).cloned();
        if let Some(credential) = &found {
            self.entries.insert(identity.to_string(), credential.clone());
        }
        Ok(found)
    }

    async fn set(&self, identity: &str, credential: StoredCredential) -> Result<(), StoreError> {
        self.update(|snapshot| {
            snapshot.insert(identity.to_string(), credential);
            true
        })
        .await?;
        Ok(())
    }

    async fn remove(&self, identity: &str) -> Result<(), StoreError> {
        self.entries.remove(identity);
        self.update(|snapshot| snapshot.remove(identity).is_some()).await?;
        Ok(())
    }

    async fn identities(&self) -> Result<Vec<String>, StoreError> {
        let snapshot = self.load().await?;
        Ok(snapshot.into_keys().collect())
    }
}

/// Process-local store for embedding and tests
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: DashMap<String, StoredCredential>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryTokenStore {
    async fn get(&self, identity: &str) -> Result<Option<StoredCredential>, StoreError> {
        Ok(self.entries.get(identity).map(|entry| entry.value().clone()))
    }

    async fn set(&self, identity: &str, credential: StoredCredential) -> Result<(), StoreError> {
        self.entries.insert(identity.to_string(), credential);
        Ok(())
    }

    async fn remove(&self, identity: &str) -> Result<(), StoreError> {
        self.entries.remove(identity);
        Ok(())
    }

    async fn identities(&self) -> Result<Vec<String>, StoreError> {
        let mut identities: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        identities.sort();
        Ok(identities)
    }
}
