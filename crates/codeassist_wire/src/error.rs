use thiserror::Error;

/// Failures while moving a payload between the two protocols.
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("malformed chat completions request: {0}")]
    MalformedRequest(#[source] serde_json::Error),

    #[error("malformed provider response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    #[error("unexpected provider payload: {0}")]
    UnexpectedShape(String),

    #[error("failed to encode translated payload: {0}")]
    Encode(#[source] serde_json::Error),
}
