//! Code Assist Gateway
//!
//! Exposes an OpenAI-compatible chat completions endpoint backed by the Cloud
//! Code Assist API.
//!
//! # Features
//! - Google OAuth with PKCE and a local redirect listener
//! - Persistent credentials with single-flight refresh
//! - Cloud project discovery and onboarding
//! - Endpoint fallback with permission-propagation backoff
//! - Continuation token tracking per conversation

pub mod auth;
pub mod config;
pub mod error;
pub mod project;
pub mod server;
pub mod signature;
pub mod telemetry;
pub mod transport;

pub use auth::{CredentialRecord, FileTokenStore, LoginFlow, OAuthClient, RefreshParts, TokenManager};
pub use config::GatewayConfig;
pub use error::{AuthError, ConfigError, GatewayError, StoreError};
pub use project::ProjectResolver;
pub use server::{start_server, AppState};
pub use signature::ContinuationStore;
pub use transport::{Gateway, GatewayRequest, GatewayResponse, RequestBody, ResponseBody};
