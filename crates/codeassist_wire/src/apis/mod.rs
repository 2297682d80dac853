pub mod codeassist;
pub mod openai;
pub mod streaming_shapes;

pub use codeassist::CodeAssistApi;
pub use openai::OpenAIApi;

/// Common behaviour of every API surface the gateway speaks.
pub trait ApiDefinition: Sized {
    /// Path (relative to a base address) that serves this API
    fn endpoint(&self) -> &'static str;

    /// Resolve an API from its endpoint path
    fn from_endpoint(endpoint: &str) -> Option<Self>;

    fn supports_streaming(&self) -> bool;

    fn supports_tools(&self) -> bool;

    fn all_variants() -> Vec<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_resolve_back_to_variants() {
        for api in CodeAssistApi::all_variants() {
            assert_eq!(CodeAssistApi::from_endpoint(api.endpoint()), Some(api));
        }
        for api in OpenAIApi::all_variants() {
            assert_eq!(OpenAIApi::from_endpoint(api.endpoint()), Some(api));
        }
        assert_eq!(CodeAssistApi::from_endpoint("/v1/models"), None);
    }
}
