use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::OAuthConfig;
use crate::error::{AuthError, ConfigError};
use crate::telemetry::token_preview;

/// PKCE verifier and its S256 challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

/// Random CSRF token for the `state` parameter
pub fn random_state() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes())
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

/// Result of a successful token endpoint call
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// Google only returns this on the authorization-code grant
    pub refresh_token: Option<String>,
    /// Epoch milliseconds
    pub expires_at: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Deserialize)]
struct UserInfo {
    email: Option<String>,
}

pub struct OAuthClient {
    config: OAuthConfig,
    http_client: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig, http_client: reqwest::Client) -> Self {
        Self { config, http_client }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub fn authorization_url(&self, pkce: &PkcePair, state: &str) -> Result<String, AuthError> {
        let mut url = url::Url::parse(&self.config.auth_url).map_err(|e| ConfigError::InvalidVar {
            name: "auth_url",
            value: self.config.auth_url.clone(),
            reason: e.to_string(),
        })?;

        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state)
            // offline + consent makes Google issue a refresh token every time
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");

        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenGrant, AuthError> {
        debug!(redirect_uri = %self.config.redirect_uri, "exchanging authorization code");
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        let grant = self.token_request(&form).await?;
        if grant.refresh_token.is_none() {
            return Err(AuthError::MissingRefreshToken);
        }
        Ok(grant)
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        debug!(refresh = %token_preview(refresh_token), "refreshing access token");
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        self.token_request(&form).await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let response = self
            .http_client
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;
        let expires_at = (Utc::now() + chrono::Duration::seconds(token.expires_in)).timestamp_millis();
        debug!(access = %token_preview(&token.access_token), expires_in = token.expires_in, "token endpoint issued access token");

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        })
    }

    /// E-mail of the signed-in account, for display only
    pub async fn user_info(&self, access_token: &str) -> Result<Option<String>, AuthError> {
        let response = self
            .http_client
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;
        Ok(info.email)
    }
}
