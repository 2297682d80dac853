use std::collections::HashMap;

use log::warn;
use serde_json::{json, Map, Value};

use super::supports_extended_reasoning;
use super::tools::{to_provider_tools, to_tool_config};
use crate::apis::codeassist::{
    Blob, CodeAssistRequest, Content, ContentRole, FileData, FunctionCallPart,
    FunctionResponsePart, GenerateContentRequest, GenerationConfig, Part, ThinkingConfig,
};
use crate::apis::openai::{ChatCompletionsRequest, ContentPart, Message, MessageContent, Role, ToolCall};
use crate::SKIP_THOUGHT_SIGNATURE;

/// Per-call values the translation cannot derive from the client request.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub project: &'a str,
    pub session_id: &'a str,
    /// Last continuation token seen for this conversation
    pub continuation: Option<&'a str>,
    pub request_id: &'a str,
    pub user_agent: &'a str,
}

pub fn to_provider_request(request: &ChatCompletionsRequest, ctx: &RequestContext<'_>) -> CodeAssistRequest {
    let signature = ctx.continuation.unwrap_or(SKIP_THOUGHT_SIGNATURE);
    let contents = to_contents(&request.messages, signature);

    let generation_config = generation_config(request);
    let tool_config = request
        .tool_choice
        .as_ref()
        .and_then(to_tool_config);

    CodeAssistRequest {
        project: ctx.project.to_string(),
        model: request.model.clone(),
        request: GenerateContentRequest {
            contents,
            system_instruction: None,
            tools: request.tools.as_deref().and_then(to_provider_tools),
            tool_config,
            generation_config: (!generation_config.is_empty()).then_some(generation_config),
            session_id: Some(ctx.session_id.to_string()),
        },
        user_agent: ctx.user_agent.to_string(),
        request_id: ctx.request_id.to_string(),
    }
}

/// Map client turns to provider turns, keeping user/model alternation.
pub fn to_contents(messages: &[Message], signature: &str) -> Vec<Content> {
    let tool_names: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|message| message.tool_calls.iter().flatten())
        .map(|call| (call.id.as_str(), call.function.name.as_str()))
        .collect();

    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());
    for message in messages {
        let (role, parts) = match message.role {
            Role::System | Role::Developer | Role::User => (ContentRole::User, content_parts(message)),
            Role::Assistant => (ContentRole::Model, assistant_parts(message, signature)),
            Role::Tool => (ContentRole::User, vec![tool_result_part(message, &tool_names)]),
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(previous) if previous.role == Some(role) => previous.parts.extend(parts),
            _ => contents.push(Content::new(role, parts)),
        }
    }
    contents
}

fn content_parts(message: &Message) -> Vec<Part> {
    match &message.content {
        Some(MessageContent::Text(text)) if !text.is_empty() => vec![Part::text(text.clone())],
        Some(MessageContent::Parts(parts)) => parts.iter().map(content_part).collect(),
        _ => Vec::new(),
    }
}

fn content_part(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text { text } => Part::text(text.clone()),
        ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
            Some((mime_type, data)) => Part {
                inline_data: Some(Blob {
                    mime_type: mime_type.to_string(),
                    data: data.to_string(),
                }),
                ..Default::default()
            },
            None => Part {
                file_data: Some(FileData {
                    mime_type: None,
                    file_uri: image_url.url.clone(),
                }),
                ..Default::default()
            },
        },
        ContentPart::InputAudio { input_audio } => Part {
            inline_data: Some(Blob {
                mime_type: format!("audio/{}", input_audio.format),
                data: input_audio.data.clone(),
            }),
            ..Default::default()
        },
        ContentPart::Unsupported => Part::text(""),
    }
}

// data:<mime>;base64,<payload>
fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let mime_type = meta.strip_suffix(";base64")?;
    Some((mime_type, data))
}

fn assistant_parts(message: &Message, signature: &str) -> Vec<Part> {
    let mut parts = content_parts(message);
    for call in message.tool_calls.iter().flatten() {
        parts.push(Part {
            function_call: Some(FunctionCallPart {
                name: call.function.name.clone(),
                args: parse_arguments(call),
                id: Some(call.id.clone()),
            }),
            thought_signature: Some(signature.to_string()),
            ..Default::default()
        });
    }
    parts
}

fn parse_arguments(call: &ToolCall) -> Value {
    let raw = call.function.arguments.trim();
    if raw.is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(args @ Value::Object(_)) => args,
        Ok(_) => {
            warn!("arguments of tool call '{}' are not a JSON object, sending {{}}", call.id);
            Value::Object(Map::new())
        }
        Err(e) => {
            warn!("malformed arguments for tool call '{}': {}, sending {{}}", call.id, e);
            Value::Object(Map::new())
        }
    }
}

fn tool_result_part(message: &Message, tool_names: &HashMap<&str, &str>) -> Part {
    let name = message
        .tool_call_id
        .as_deref()
        .and_then(|id| tool_names.get(id).copied())
        .or(message.name.as_deref())
        .unwrap_or("unknown_function");

    let text = message.content_text();
    let response = match serde_json::from_str::<Value>(&text) {
        Ok(object @ Value::Object(_)) => object,
        _ => json!({ "result": text }),
    };

    Part {
        function_response: Some(FunctionResponsePart {
            name: name.to_string(),
            response,
            id: message.tool_call_id.clone(),
        }),
        ..Default::default()
    }
}

fn generation_config(request: &ChatCompletionsRequest) -> GenerationConfig {
    GenerationConfig {
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.output_token_limit(),
        stop_sequences: request.stop.as_ref().map(|stop| stop.to_vec()),
        candidate_count: request.n,
        seed: request.seed,
        thinking_config: supports_extended_reasoning(&request.model).then(|| ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: None,
        }),
    }
}
