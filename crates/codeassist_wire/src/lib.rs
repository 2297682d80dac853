//! codeassist_wire: wire types for the OpenAI chat completions and Cloud Code
//! Assist protocols, plus the translation between them.

pub mod apis;
pub mod error;
pub mod ids;
pub mod transforms;

pub use apis::{ApiDefinition, CodeAssistApi, OpenAIApi};
pub use error::TranslationError;
pub use transforms::{
    from_provider_response, supports_extended_reasoning, to_provider_request, RequestContext,
    ResponseContext, StreamTranslator, TranslatedResponse,
};

/// Continuation value the provider accepts when no real signature exists yet
pub const SKIP_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";
