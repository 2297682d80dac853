use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::envelope::RefreshParts;
use super::lifecycle::{CredentialRecord, TokenManager};
use super::oauth::{random_state, PkcePair};
use crate::error::AuthError;
use crate::project::ProjectResolver;
use crate::server::callback::CallbackListener;

/// What an interactive login stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub identity: String,
    pub email: Option<String>,
    pub refresh: RefreshParts,
}

/// Interactive authorization-code login with PKCE and a local redirect.
pub struct LoginFlow {
    tokens: Arc<TokenManager>,
    projects: Arc<ProjectResolver>,
    callback_port: u16,
    project_hint: Option<String>,
}

impl LoginFlow {
    pub fn new(
        tokens: Arc<TokenManager>,
        projects: Arc<ProjectResolver>,
        callback_port: u16,
        project_hint: Option<String>,
    ) -> Self {
        Self {
            tokens,
            projects,
            callback_port,
            project_hint,
        }
    }

    /// Print the authorization URL, wait for the redirect and store the result
    pub async fn run(&self, identity: &str, timeout: Duration) -> Result<LoginOutcome, AuthError> {
        let listener = CallbackListener::bind(self.callback_port).await?;
        let pkce = PkcePair::generate();
        let state = random_state();
        let url = self.tokens.oauth().authorization_url(&pkce, &state)?;

        println!("Open this URL in a browser to sign in:");
        println!();
        println!("  {}", url);
        println!();
        println!("Waiting for the redirect on {} ...", listener.local_addr());

        let code = listener.wait(timeout).await?.into_code(&state)?;
        self.complete(identity, &code, &pkce.verifier).await
    }

    /// Exchange the code, discover the project and persist the credential
    pub async fn complete(&self, identity: &str, code: &str, verifier: &str) -> Result<LoginOutcome, AuthError> {
        let oauth = self.tokens.oauth();
        let grant = oauth.exchange_code(code, verifier).await?;
        let refresh_token = grant.refresh_token.ok_or(AuthError::MissingRefreshToken)?;

        let email = match oauth.user_info(&grant.access_token).await {
            Ok(email) => email,
            Err(e) => {
                warn!(error = %e, "could not fetch account e-mail");
                None
            }
        };

        let managed = self.projects.discover(&grant.access_token).await;
        if managed.is_none() {
            warn!(
                default = %self.projects.default_project(),
                "no project discovered at login; calls will resolve one on demand"
            );
        }
        let refresh = RefreshParts {
            refresh_token,
            project_id: self.project_hint.clone(),
            managed_project_id: managed,
        };

        let record = CredentialRecord {
            access_token: grant.access_token,
            refresh: refresh.clone(),
            expires_at: grant.expires_at,
            email: email.clone(),
        };
        self.tokens.store_authorized(identity, record).await?;
        info!(identity, email = email.as_deref().unwrap_or("unknown"), %refresh, "stored credential");

        Ok(LoginOutcome {
            identity: identity.to_string(),
            email,
            refresh,
        })
    }
}
