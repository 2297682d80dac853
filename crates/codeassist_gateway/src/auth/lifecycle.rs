use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::envelope::RefreshParts;
use super::oauth::OAuthClient;
use super::token_store::{CredentialStore, StoredCredential};
use crate::error::AuthError;
use crate::project::ProjectResolver;
use crate::telemetry::token_preview;

/// A usable credential for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh: RefreshParts,
    /// Epoch milliseconds
    pub expires_at: i64,
    pub email: Option<String>,
}

impl CredentialRecord {
    pub fn from_stored(stored: &StoredCredential) -> Self {
        Self {
            access_token: stored.access.clone(),
            refresh: stored.refresh_parts(),
            expires_at: stored.expires_at,
            email: stored.email.clone(),
        }
    }

    pub fn to_stored(&self) -> StoredCredential {
        StoredCredential {
            access: self.access_token.clone(),
            refresh: self.refresh.format(),
            expires_at: self.expires_at,
            email: self.email.clone(),
        }
    }

    pub fn needs_refresh(&self, buffer: Duration) -> bool {
        let buffer_ms = i64::try_from(buffer.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis() >= self.expires_at.saturating_sub(buffer_ms)
    }
}

/// Keeps access tokens fresh with at most one refresh in flight per identity.
///
/// Records are cached in memory after the first load; the store stays the
/// source of truth across restarts.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    oauth: Arc<OAuthClient>,
    refresh_buffer: Duration,
    cache: DashMap<String, CredentialRecord>,
    slots: DashMap<String, Arc<Mutex<()>>>,
    projects: Option<Arc<ProjectResolver>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, oauth: Arc<OAuthClient>, refresh_buffer: Duration) -> Self {
        Self {
            store,
            oauth,
            refresh_buffer,
            cache: DashMap::new(),
            slots: DashMap::new(),
            projects: None,
        }
    }

    /// Drop discovered projects for an access token whenever it is replaced
    pub fn with_project_cache(mut self, projects: Arc<ProjectResolver>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn oauth(&self) -> &Arc<OAuthClient> {
        &self.oauth
    }

    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    fn slot(&self, identity: &str) -> Arc<Mutex<()>> {
        self.slots
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cached(&self, identity: &str) -> Option<CredentialRecord> {
        self.cache.get(identity).map(|entry| entry.value().clone())
    }

    async fn load(&self, identity: &str) -> Result<CredentialRecord, AuthError> {
        if let Some(record) = self.cached(identity) {
            return Ok(record);
        }
        let stored = self
            .store
            .get(identity)
            .await?
            .ok_or_else(|| AuthError::NoCredential(identity.to_string()))?;
        let record = CredentialRecord::from_stored(&stored);
        self.cache.insert(identity.to_string(), record.clone());
        Ok(record)
    }

    /// A record that stays valid for at least the refresh buffer
    pub async fn ensure_fresh(&self, identity: &str) -> Result<CredentialRecord, AuthError> {
        if let Some(record) = self.cached(identity) {
            if !record.needs_refresh(self.refresh_buffer) {
                return Ok(record);
            }
        }

        let slot = self.slot(identity);
        let _guard = slot.lock().await;

        // whoever held the slot before us may already have refreshed
        let record = self.load(identity).await?;
        if !record.needs_refresh(self.refresh_buffer) {
            return Ok(record);
        }
        debug!(identity, "access token inside refresh window");
        self.refresh_locked(identity, record).await
    }

    /// Refresh after the provider rejected `stale_access`. Coalesces with any
    /// refresh that already replaced it.
    pub async fn force_refresh(&self, identity: &str, stale_access: &str) -> Result<CredentialRecord, AuthError> {
        let slot = self.slot(identity);
        let _guard = slot.lock().await;

        let record = self.load(identity).await?;
        if record.access_token != stale_access {
            debug!(identity, "access token already replaced by a concurrent refresh");
            return Ok(record);
        }
        self.refresh_locked(identity, record).await
    }

    async fn refresh_locked(&self, identity: &str, current: CredentialRecord) -> Result<CredentialRecord, AuthError> {
        let grant = self.oauth.refresh(&current.refresh.refresh_token).await?;

        let mut refresh = current.refresh.clone();
        if let Some(rotated) = grant.refresh_token {
            refresh.refresh_token = rotated;
        }
        let record = CredentialRecord {
            access_token: grant.access_token,
            refresh,
            expires_at: grant.expires_at,
            email: current.email.clone(),
        };

        self.store.set(identity, record.to_stored()).await?;
        self.cache.insert(identity.to_string(), record.clone());
        if let Some(projects) = &self.projects {
            projects.invalidate(&current.access_token);
        }
        info!(
            identity,
            access = %token_preview(&record.access_token),
            "refreshed access token"
        );
        Ok(record)
    }

    /// Persist the outcome of an interactive login
    pub async fn store_authorized(&self, identity: &str, record: CredentialRecord) -> Result<(), AuthError> {
        let slot = self.slot(identity);
        let _guard = slot.lock().await;
        self.store.set(identity, record.to_stored()).await?;
        self.cache.insert(identity.to_string(), record);
        Ok(())
    }

    /// Stored identities with their credentials, for status listings
    pub async fn list(&self) -> Result<Vec<(String, StoredCredential)>, AuthError> {
        let mut listed = Vec::new();
        for identity in self.store.identities().await? {
            if let Some(stored) = self.store.get(&identity).await? {
                listed.push((identity, stored));
            }
        }
        Ok(listed)
    }
}
