//! Conversion between OpenAI chat completions and Code Assist generation
//! payloads. Everything here is pure apart from logging.

pub mod request;
pub mod response;
pub mod stream;
pub mod tools;

pub use request::{to_provider_request, RequestContext};
pub use response::{from_provider_response, ResponseContext, TranslatedResponse};
pub use stream::StreamTranslator;

/// Whether a model variant returns separable reasoning parts
pub fn supports_extended_reasoning(model: &str) -> bool {
    model.ends_with("-high") || model.contains("thinking")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasoning_variants_by_name() {
        assert!(supports_extended_reasoning("gemini-3-pro-high"));
        assert!(supports_extended_reasoning("claude-sonnet-4-5-thinking"));
        assert!(!supports_extended_reasoning("gemini-3-pro-low"));
        assert!(!supports_extended_reasoning("gemini-3-flash"));
    }
}
