use axum::http::StatusCode;
use codeassist_wire::TranslationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("credential store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential store is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("could not determine a home directory for the credential store")]
    NoHomeDir,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("environment variable {name} has invalid value '{value}': {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no stored credential for identity '{0}'; run `codeassist-gateway login {0}`")]
    NoCredential(String),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("token endpoint response was invalid: {0}")]
    InvalidTokenResponse(String),

    #[error("authorization response did not include a refresh token")]
    MissingRefreshToken,

    #[error("HTTP request to the identity provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authorization was denied: {error} ({description})")]
    Denied { error: String, description: String },

    #[error("callback state did not match the authorization request")]
    StateMismatch,

    #[error("no OAuth callback arrived before the timeout")]
    CallbackTimeout,

    #[error("callback listener failed: {0}")]
    Callback(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Terminal outcome of one gateway call. Per-attempt failures that the
/// orchestrator recovers from locally never surface here.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("provider rejected credentials after a forced refresh ({endpoint})")]
    Unauthorized { endpoint: String },

    #[error("permission still denied on {endpoint} after {retries} retries: {body}")]
    PermissionPropagation {
        endpoint: String,
        retries: u32,
        body: String,
    },

    #[error("all {attempted} endpoints failed; last error: {last_error}")]
    AllEndpointsFailed { attempted: usize, last_error: String },

    #[error("upstream transport failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error("request was cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) | GatewayError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::PermissionPropagation { .. } => StatusCode::FORBIDDEN,
            GatewayError::AllEndpointsFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Translation(TranslationError::MalformedRequest(_)) => StatusCode::BAD_REQUEST,
            GatewayError::Transport(_) | GatewayError::Translation(_) => StatusCode::BAD_GATEWAY,
            // nginx's "client closed request"
            GatewayError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "auth_error",
            GatewayError::Unauthorized { .. } => "unauthorized",
            GatewayError::PermissionPropagation { .. } => "permission_propagation",
            GatewayError::AllEndpointsFailed { .. } => "all_endpoints_failed",
            GatewayError::Transport(_) => "transport_error",
            GatewayError::Translation(_) => "translation_error",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Config(_) => "config_error",
        }
    }
}
