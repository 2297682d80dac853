//! Credentials: OAuth client, packed refresh envelope, persistent store,
//! refresh lifecycle and the interactive login.

pub mod envelope;
pub mod lifecycle;
pub mod login;
pub mod oauth;
pub mod token_store;

pub use envelope::RefreshParts;
pub use lifecycle::{CredentialRecord, TokenManager};
pub use login::{LoginFlow, LoginOutcome};
pub use oauth::{random_state, OAuthClient, PkcePair, TokenGrant};
pub use token_store::{CredentialStore, FileTokenStore, MemoryTokenStore, StoredCredential};
