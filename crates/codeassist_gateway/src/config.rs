//! Environment-driven configuration.
//!
//! Every knob has a default except the OAuth client, which must be supplied
//! through `CODEASSIST_OAUTH_CLIENT_ID` and `CODEASSIST_OAUTH_CLIENT_SECRET`.

use std::path::PathBuf;
use std::time::Duration;

use codeassist_wire::apis::codeassist::ClientMetadata;
use tracing::warn;

use crate::error::{ConfigError, StoreError};
use crate::transport::backoff::BackoffPolicy;

pub const DEFAULT_ENDPOINTS: [&str; 3] = [
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
    "https://autopush-cloudcode-pa.sandbox.googleapis.com",
    "https://cloudcode-pa.googleapis.com",
];

/// A call never tries more endpoints than this
pub const MAX_ENDPOINTS: usize = 3;

pub const DEFAULT_PROJECT_ID: &str = "rising-fact-p41fc";
pub const DEFAULT_CALLBACK_PORT: u16 = 51121;
pub const CALLBACK_PATH: &str = "/oauth-callback";

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";

const SCOPES: [&str; 5] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/cclog",
    "https://www.googleapis.com/auth/experimentsandconfigs",
];

/// Google OAuth client registration
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthConfig {
    pub fn google(client_id: impl Into<String>, client_secret: impl Into<String>, callback_port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            userinfo_url: GOOGLE_USERINFO_URL.to_string(),
            redirect_uri: format!("http://localhost:{}{}", callback_port, CALLBACK_PATH),
            scopes: SCOPES.iter().map(|scope| scope.to_string()).collect(),
        }
    }
}

/// Headers identifying the gateway to the provider
#[derive(Debug, Clone)]
pub struct ClientHeaders {
    pub user_agent: String,
    pub api_client: String,
    pub client_metadata: String,
}

impl Default for ClientHeaders {
    fn default() -> Self {
        let metadata = ClientMetadata::default();
        Self {
            user_agent: "antigravity".to_string(),
            api_client: "google-cloud-sdk vscode_cloudshelleditor/0.1".to_string(),
            client_metadata: format!(
                r#"{{"ideType":"{}","platform":"{}","pluginType":"{}"}}"#,
                metadata.ide_type, metadata.platform, metadata.plugin_type
            ),
        }
    }
}

impl ClientHeaders {
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header("X-Goog-Api-Client", &self.api_client)
            .header("Client-Metadata", &self.client_metadata)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OnboardingPolicy {
    pub enabled: bool,
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for OnboardingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 10,
            delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub oauth: OAuthConfig,
    /// Fallback chain, tried strictly in order. Only the first
    /// [`MAX_ENDPOINTS`] entries are used.
    pub endpoints: Vec<String>,
    pub callback_port: u16,
    pub token_store_path: PathBuf,
    pub default_project: String,
    /// Project sent to discovery as a hint
    pub project_hint: Option<String>,
    pub debug: bool,
    pub refresh_buffer: Duration,
    /// Whole-request limit on upstream calls. None by default: long streams
    /// are bounded by the caller's cancellation token instead.
    pub request_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
    pub onboarding: OnboardingPolicy,
    pub client: ClientHeaders,
}

impl GatewayConfig {
    /// Defaults around an explicit OAuth client; used by embedders and tests
    pub fn new(oauth: OAuthConfig, token_store_path: PathBuf) -> Self {
        Self {
            oauth,
            endpoints: DEFAULT_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
            callback_port: DEFAULT_CALLBACK_PORT,
            token_store_path,
            default_project: DEFAULT_PROJECT_ID.to_string(),
            project_hint: None,
            debug: false,
            refresh_buffer: Duration::from_secs(60),
            request_timeout: None,
            backoff: BackoffPolicy::default(),
            onboarding: OnboardingPolicy::default(),
            client: ClientHeaders::default(),
        }
    }

    /// The endpoints a call actually walks
    pub fn endpoint_chain(&self) -> Vec<String> {
        self.endpoints.iter().take(MAX_ENDPOINTS).cloned().collect()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &'static str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let client_id = var("CODEASSIST_OAUTH_CLIENT_ID").ok_or(ConfigError::MissingVar("CODEASSIST_OAUTH_CLIENT_ID"))?;
        let client_secret =
            var("CODEASSIST_OAUTH_CLIENT_SECRET").ok_or(ConfigError::MissingVar("CODEASSIST_OAUTH_CLIENT_SECRET"))?;

        let callback_port = match var("CODEASSIST_CALLBACK_PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| ConfigError::InvalidVar {
                name: "CODEASSIST_CALLBACK_PORT",
                value: value.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_CALLBACK_PORT,
        };

        let token_store_path = match var("CODEASSIST_TOKEN_STORE") {
            Some(path) => PathBuf::from(path),
            None => default_token_store_path().map_err(|e| ConfigError::InvalidVar {
                name: "CODEASSIST_TOKEN_STORE",
                value: String::new(),
                reason: e.to_string(),
            })?,
        };

        let mut config = Self::new(
            OAuthConfig::google(client_id, client_secret, callback_port),
            token_store_path,
        );
        config.callback_port = callback_port;

        if let Some(endpoints) = var("CODEASSIST_ENDPOINTS") {
            let mut parsed: Vec<String> = endpoints
                .split(',')
                .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
                .filter(|endpoint| !endpoint.is_empty())
                .collect();
            if parsed.is_empty() {
                return Err(ConfigError::InvalidVar {
                    name: "CODEASSIST_ENDPOINTS",
                    value: endpoints,
                    reason: "no endpoints listed".to_string(),
                });
            }
            if parsed.len() > MAX_ENDPOINTS {
                warn!(
                    listed = parsed.len(),
                    ignored = ?&parsed[MAX_ENDPOINTS..],
                    "CODEASSIST_ENDPOINTS lists more than {} endpoints; extra entries are ignored",
                    MAX_ENDPOINTS
                );
                parsed.truncate(MAX_ENDPOINTS);
            }
            config.endpoints = parsed;
        }
        if let Some(project) = var("CODEASSIST_DEFAULT_PROJECT") {
            config.default_project = project;
        }
        config.project_hint = var("GOOGLE_CLOUD_PROJECT");
        config.debug = var("CODEASSIST_GATEWAY_DEBUG")
            .map(|flag| matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Ok(config)
    }
}

/// `~/.codeassist/oauth_tokens.json`
pub fn default_token_store_path() -> Result<PathBuf, StoreError> {
    let home = dirs::home_dir().ok_or(StoreError::NoHomeDir)?;
    Ok(home.join(".codeassist").join("oauth_tokens.json"))
}
