//! Cloud project discovery for Code Assist calls.

use codeassist_wire::apis::codeassist::{
    ClientMetadata, LoadCodeAssistRequest, LoadCodeAssistResponse, OnboardOperation,
    OnboardUserRequest,
};
use codeassist_wire::{ApiDefinition, CodeAssistApi};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::auth::lifecycle::CredentialRecord;
use crate::config::{ClientHeaders, GatewayConfig, OnboardingPolicy};
use crate::telemetry::token_preview;

/// Resolves the project to bill a call to. Never fails: anything that goes
/// wrong yields the default project, which is not cached.
pub struct ProjectResolver {
    http_client: reqwest::Client,
    endpoints: Vec<String>,
    default_project: String,
    project_hint: Option<String>,
    onboarding: OnboardingPolicy,
    client: ClientHeaders,
    // keyed on access token
    cache: DashMap<String, String>,
}

impl ProjectResolver {
    pub fn new(config: &GatewayConfig, http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            endpoints: config.endpoint_chain(),
            default_project: config.default_project.clone(),
            project_hint: config.project_hint.clone(),
            onboarding: config.onboarding,
            client: config.client.clone(),
            cache: DashMap::new(),
        }
    }

    pub fn default_project(&self) -> &str {
        &self.default_project
    }

    /// Project for a call: the ids packed at login win over discovery
    pub async fn effective_project(&self, record: &CredentialRecord) -> String {
        match record.refresh.effective_project() {
            Some(project) => project.to_string(),
            None => self.resolve(&record.access_token).await,
        }
    }

    pub async fn resolve(&self, access_token: &str) -> String {
        if let Some(project) = self.cached(access_token) {
            return project;
        }
        match self.discover(access_token).await {
            Some(project) => {
                self.cache.insert(access_token.to_string(), project.clone());
                project
            }
            None => {
                warn!(
                    default = %self.default_project,
                    "project discovery returned nothing, using the default project"
                );
                self.default_project.clone()
            }
        }
    }

    pub fn cached(&self, access_token: &str) -> Option<String> {
        self.cache.get(access_token).map(|entry| entry.value().clone())
    }

    pub fn invalidate(&self, access_token: &str) {
        if self.cache.remove(access_token).is_some() {
            debug!(access = %token_preview(access_token), "dropped cached project");
        }
    }

    /// Walk the endpoint chain; the first 2xx answer decides the outcome
    pub async fn discover(&self, access_token: &str) -> Option<String> {
        for endpoint in &self.endpoints {
            let loaded = match self.load_code_assist(endpoint, access_token).await {
                Ok(loaded) => loaded,
                Err(reason) => {
                    debug!(endpoint = %endpoint, reason = %reason, "loadCodeAssist failed, trying next endpoint");
                    continue;
                }
            };

            if let Some(project) = loaded.cloudaicompanion_project.as_ref().and_then(|p| p.id()) {
                debug!(endpoint = %endpoint, project, "discovered project");
                return Some(project.to_string());
            }
            if !self.onboarding.enabled {
                return None;
            }
            return match loaded.onboarding_tier() {
                Some(tier) => self.onboard(endpoint, access_token, &tier.id).await,
                None => None,
            };
        }
        None
    }

    async fn load_code_assist(&self, endpoint: &str, access_token: &str) -> Result<LoadCodeAssistResponse, String> {
        let body = LoadCodeAssistRequest {
            cloudaicompanion_project: self.project_hint.clone(),
            metadata: ClientMetadata::default(),
        };
        let request = self
            .http_client
            .post(CodeAssistApi::LoadCodeAssist.url(endpoint))
            .bearer_auth(access_token)
            .json(&body);
        let response = self.client.apply(request).send().await.map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {}", status.as_u16()));
        }
        response
            .json::<LoadCodeAssistResponse>()
            .await
            .map_err(|e| format!("invalid {} response: {}", CodeAssistApi::LoadCodeAssist.endpoint(), e))
    }

    /// Poll `onboardUser` until the long-running operation reports a project
    async fn onboard(&self, endpoint: &str, access_token: &str, tier_id: &str) -> Option<String> {
        info!(endpoint = %endpoint, tier = tier_id, "no project yet, onboarding user");
        let body = OnboardUserRequest {
            tier_id: tier_id.to_string(),
            cloudaicompanion_project: self.project_hint.clone(),
            metadata: ClientMetadata::default(),
        };

        for attempt in 1..=self.onboarding.attempts {
            let request = self
                .http_client
                .post(CodeAssistApi::OnboardUser.url(endpoint))
                .bearer_auth(access_token)
                .json(&body);
            match self.client.apply(request).send().await {
                Ok(response) if response.status().is_success() => match response.json::<OnboardOperation>().await {
                    Ok(operation) => {
                        if let Some(project) = operation.project_id() {
                            info!(project, "onboarding finished");
                            return Some(project.to_string());
                        }
                    }
                    Err(e) => warn!(attempt, error = %e, "unreadable onboardUser response"),
                },
                Ok(response) => {
                    warn!(attempt, status = response.status().as_u16(), "onboardUser rejected");
                    return None;
                }
                Err(e) => warn!(attempt, error = %e, "onboardUser request failed"),
            }
            if attempt < self.onboarding.attempts {
                tokio::time::sleep(self.onboarding.delay).await;
            }
        }
        warn!(attempts = self.onboarding.attempts, "onboarding did not complete");
        None
    }
}
