use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use super::ApiDefinition;
use crate::error::TranslationError;

// Provider-side surface: the Cloud Code Assist internal API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeAssistApi {
    GenerateContent,
    StreamGenerateContent,
    LoadCodeAssist,
    OnboardUser,
}

impl ApiDefinition for CodeAssistApi {
    fn endpoint(&self) -> &'static str {
        match self {
            CodeAssistApi::GenerateContent => "/v1internal:generateContent",
            CodeAssistApi::StreamGenerateContent => "/v1internal:streamGenerateContent",
            CodeAssistApi::LoadCodeAssist => "/v1internal:loadCodeAssist",
            CodeAssistApi::OnboardUser => "/v1internal:onboardUser",
        }
    }

    fn from_endpoint(endpoint: &str) -> Option<Self> {
        match endpoint {
            "/v1internal:generateContent" => Some(CodeAssistApi::GenerateContent),
            "/v1internal:streamGenerateContent" => Some(CodeAssistApi::StreamGenerateContent),
            "/v1internal:loadCodeAssist" => Some(CodeAssistApi::LoadCodeAssist),
            "/v1internal:onboardUser" => Some(CodeAssistApi::OnboardUser),
            _ => None,
        }
    }

    fn supports_streaming(&self) -> bool {
        matches!(self, CodeAssistApi::StreamGenerateContent)
    }

    fn supports_tools(&self) -> bool {
        matches!(
            self,
            CodeAssistApi::GenerateContent | CodeAssistApi::StreamGenerateContent
        )
    }

    fn all_variants() -> Vec<Self> {
        vec![
            CodeAssistApi::GenerateContent,
            CodeAssistApi::StreamGenerateContent,
            CodeAssistApi::LoadCodeAssist,
            CodeAssistApi::OnboardUser,
        ]
    }
}

impl CodeAssistApi {
    pub fn generation(streaming: bool) -> Self {
        if streaming {
            CodeAssistApi::StreamGenerateContent
        } else {
            CodeAssistApi::GenerateContent
        }
    }

    /// Full URL of this API on the given base address
    pub fn url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.supports_streaming() {
            format!("{}{}?alt=sse", base, self.endpoint())
        } else {
            format!("{}{}", base, self.endpoint())
        }
    }
}

// Generation request

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeAssistRequest {
    pub project: String,
    pub model: String,
    pub request: GenerateContentRequest,
    pub user_agent: String,
    pub request_id: String,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub system_instruction: Option<Content>,
    pub tools: Option<Vec<ProviderTool>>,
    pub tool_config: Option<ToolConfig>,
    pub generation_config: Option<GenerationConfig>,
    pub session_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    User,
    Model,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Content {
    pub role: Option<ContentRole>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: ContentRole, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role),
            parts,
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub text: Option<String>,
    pub thought: Option<bool>,
    pub thought_signature: Option<String>,
    pub function_call: Option<FunctionCallPart>,
    pub function_response: Option<FunctionResponsePart>,
    pub inline_data: Option<Blob>,
    pub file_data: Option<FileData>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    pub id: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionResponsePart {
    pub name: String,
    pub response: Value,
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: Option<String>,
    pub file_uri: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    pub mode: FunctionCallingMode,
    pub allowed_function_names: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionCallingMode {
    Auto,
    Any,
    None,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub candidate_count: Option<u32>,
    pub seed: Option<i64>,
    pub thinking_config: Option<ThinkingConfig>,
}

impl GenerationConfig {
    pub fn is_empty(&self) -> bool {
        self == &GenerationConfig::default()
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: Option<bool>,
    pub thinking_budget: Option<i32>,
}

// Generation response

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CodeAssistResponse {
    pub response: Option<GenerateContentResponse>,
    pub trace_id: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub usage_metadata: Option<UsageMetadata>,
    pub model_version: Option<String>,
    pub response_id: Option<String>,
}

impl GenerateContentResponse {
    /// Parse either the Code Assist envelope (`{"response": {...}}`) or a bare
    /// Gemini response object.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TranslationError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(TranslationError::MalformedResponse)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, TranslationError> {
        let inner = match value {
            Value::Object(mut map) => match map.remove("response") {
                Some(inner @ Value::Object(_)) => inner,
                Some(_) => {
                    return Err(TranslationError::UnexpectedShape(
                        "`response` is not an object".to_string(),
                    ))
                }
                None => Value::Object(map),
            },
            other => {
                return Err(TranslationError::UnexpectedShape(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        serde_json::from_value(inner).map_err(TranslationError::MalformedResponse)
    }

    /// First continuation signature carried by any part of any candidate
    pub fn first_thought_signature(&self) -> Option<&str> {
        self.candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .filter_map(|part| part.thought_signature.as_deref())
            .find(|signature| !signature.is_empty())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
    pub index: Option<u32>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
    pub thoughts_token_count: Option<u32>,
    pub cached_content_token_count: Option<u32>,
}

// Project discovery and onboarding

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata {
    pub ide_type: String,
    pub platform: String,
    pub plugin_type: String,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            ide_type: "IDE_UNSPECIFIED".to_string(),
            platform: "PLATFORM_UNSPECIFIED".to_string(),
            plugin_type: "GEMINI".to_string(),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistRequest {
    pub cloudaicompanion_project: Option<String>,
    pub metadata: ClientMetadata,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadCodeAssistResponse {
    pub cloudaicompanion_project: Option<ProjectRef>,
    pub current_tier: Option<Tier>,
    #[serde(default)]
    pub allowed_tiers: Vec<Tier>,
}

impl LoadCodeAssistResponse {
    /// Tier to onboard with when no project exists yet
    pub fn onboarding_tier(&self) -> Option<&Tier> {
        self.allowed_tiers
            .iter()
            .find(|tier| tier.is_default.unwrap_or(false))
            .or_else(|| self.allowed_tiers.first())
    }
}

/// A project identifier, encoded either as a bare string or as `{"id": ...}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ProjectRef {
    Id(String),
    Object { id: Option<String> },
}

impl ProjectRef {
    pub fn id(&self) -> Option<&str> {
        let id = match self {
            ProjectRef::Id(id) => Some(id.as_str()),
            ProjectRef::Object { id } => id.as_deref(),
        };
        id.map(str::trim).filter(|id| !id.is_empty())
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub id: String,
    pub is_default: Option<bool>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OnboardUserRequest {
    pub tier_id: String,
    pub cloudaicompanion_project: Option<String>,
    pub metadata: ClientMetadata,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OnboardOperation {
    pub name: Option<String>,
    pub done: Option<bool>,
    pub response: Option<OnboardResult>,
}

impl OnboardOperation {
    pub fn project_id(&self) -> Option<&str> {
        if !self.done.unwrap_or(false) {
            return None;
        }
        self.response
            .as_ref()
            .and_then(|result| result.cloudaicompanion_project.as_ref())
            .and_then(ProjectRef::id)
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct OnboardResult {
    pub cloudaicompanion_project: Option<ProjectRef>,
}
