use crate::apis::codeassist::{Candidate, FunctionCallPart, GenerateContentResponse, UsageMetadata};
use crate::apis::openai::{
    ChatCompletionsResponse, Choice, CompletionTokensDetails, FinishReason, FunctionCall,
    ResponseMessage, Role, ToolCall, Usage,
};
use crate::error::TranslationError;
use crate::ids;

use super::supports_extended_reasoning;

#[derive(Debug, Clone, Copy)]
pub struct ResponseContext<'a> {
    /// Model the client asked for; drives reasoning separation
    pub model: &'a str,
}

#[derive(Debug, Clone)]
pub struct TranslatedResponse {
    pub response: ChatCompletionsResponse,
    /// Continuation token to persist for the conversation, if any
    pub continuation: Option<String>,
}

pub fn from_provider_response(
    bytes: &[u8],
    ctx: &ResponseContext<'_>,
) -> Result<TranslatedResponse, TranslationError> {
    let provider = GenerateContentResponse::from_slice(bytes)?;
    let continuation = provider.first_thought_signature().map(str::to_string);
    let separate_reasoning = supports_extended_reasoning(ctx.model);

    let choices = provider
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| to_choice(position, candidate, separate_reasoning))
        .collect::<Result<Vec<_>, _>>()?;

    let response = ChatCompletionsResponse {
        id: provider
            .response_id
            .as_ref()
            .map(|id| format!("chatcmpl-{}", id))
            .unwrap_or_else(ids::completion_id),
        object: "chat.completion".to_string(),
        created: ids::unix_seconds(),
        model: ctx.model.to_string(),
        choices,
        usage: provider.usage_metadata.as_ref().map(to_usage),
    };

    Ok(TranslatedResponse {
        response,
        continuation,
    })
}

fn to_choice(position: usize, candidate: &Candidate, separate_reasoning: bool) -> Result<Choice, TranslationError> {
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in candidate.content.iter().flat_map(|content| content.parts.iter()) {
        if let Some(call) = &part.function_call {
            tool_calls.push(to_tool_call(call)?);
        }
        if let Some(text) = &part.text {
            if part.is_thought() && separate_reasoning {
                reasoning.push_str(text);
            } else {
                content.push_str(text);
            }
        }
    }

    let has_tool_calls = !tool_calls.is_empty();
    Ok(Choice {
        index: candidate.index.unwrap_or(position as u32),
        message: ResponseMessage {
            role: Role::Assistant,
            content: (!content.is_empty() || !has_tool_calls).then_some(content),
            reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: has_tool_calls.then_some(tool_calls),
        },
        finish_reason: map_finish_reason(candidate.finish_reason.as_deref(), has_tool_calls),
    })
}

pub(crate) fn to_tool_call(call: &FunctionCallPart) -> Result<ToolCall, TranslationError> {
    let arguments = if call.args.is_null() {
        "{}".to_string()
    } else {
        serde_json::to_string(&call.args).map_err(TranslationError::Encode)?
    };
    Ok(ToolCall {
        id: call
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(ids::tool_call_id),
        kind: "function".to_string(),
        function: FunctionCall {
            name: call.name.clone(),
            arguments,
        },
    })
}

pub fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> Option<FinishReason> {
    let reason = reason?;
    if has_tool_calls && matches!(reason, "STOP" | "FINISH_REASON_UNSPECIFIED") {
        return Some(FinishReason::ToolCalls);
    }
    Some(match reason {
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    })
}

pub fn to_usage(metadata: &UsageMetadata) -> Usage {
    let prompt_tokens = metadata.prompt_token_count.unwrap_or(0);
    let reasoning_tokens = metadata.thoughts_token_count.unwrap_or(0);
    let completion_tokens = metadata.candidates_token_count.unwrap_or(0) + reasoning_tokens;
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: metadata
            .total_token_count
            .unwrap_or(prompt_tokens + completion_tokens),
        completion_tokens_details: (reasoning_tokens > 0)
            .then_some(CompletionTokensDetails { reasoning_tokens }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn translate(body: serde_json::Value, model: &str) -> TranslatedResponse {
        let bytes = serde_json::to_vec(&body).unwrap();
        from_provider_response(&bytes, &ResponseContext { model }).unwrap()
    }

    fn thinking_body() -> serde_json::Value {
        json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"text": "let me think", "thought": true, "thoughtSignature": "sig-123"},
                        {"text": "the answer"}
                    ]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5, "thoughtsTokenCount": 3, "totalTokenCount": 18},
                "responseId": "resp-1"
            }
        })
    }

    #[test]
    fn extended_reasoning_models_split_thoughts() {
        let translated = translate(thinking_body(), "gemini-3-pro-high");
        let message = &translated.response.choices[0].message;

        assert_eq!(translated.continuation.as_deref(), Some("sig-123"));
        assert_eq!(message.content.as_deref(), Some("the answer"));
        assert_eq!(message.reasoning_content.as_deref(), Some("let me think"));
        assert_eq!(translated.response.id, "chatcmpl-resp-1");
        assert_eq!(translated.response.choices[0].finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn other_models_keep_thoughts_in_content() {
        let translated = translate(thinking_body(), "gemini-3-pro-low");
        let message = &translated.response.choices[0].message;

        assert_eq!(message.content.as_deref(), Some("let me thinkthe answer"));
        assert_eq!(message.reasoning_content, None);
    }

    #[test]
    fn usage_counts_thoughts_as_reasoning() {
        let usage = translate(thinking_body(), "m").response.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.total_tokens, 18);
        assert_eq!(usage.completion_tokens_details.unwrap().reasoning_tokens, 3);
    }

    #[test]
    fn function_calls_become_tool_calls() {
        let translated = translate(
            json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [
                        {"functionCall": {"name": "lookup", "args": {"q": "x"}, "id": "fc-1"}},
                        {"functionCall": {"name": "lookup", "args": {"q": "y"}}}
                    ]},
                    "finishReason": "STOP"
                }]
            }),
            "gemini-3-pro",
        );
        let choice = &translated.response.choices[0];
        let calls = choice.message.tool_calls.as_ref().unwrap();

        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(choice.message.content, None);
        assert_eq!(calls[0].id, "fc-1");
        assert!(calls[1].id.starts_with("call_"));
        assert_eq!(calls[0].function.arguments, r#"{"q":"x"}"#);
        assert_eq!(translated.continuation, None);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason(Some("MAX_TOKENS"), false), Some(FinishReason::Length));
        assert_eq!(map_finish_reason(Some("SAFETY"), false), Some(FinishReason::ContentFilter));
        assert_eq!(map_finish_reason(Some("RECITATION"), true), Some(FinishReason::ContentFilter));
        assert_eq!(map_finish_reason(Some("STOP"), true), Some(FinishReason::ToolCalls));
        assert_eq!(map_finish_reason(Some("OTHER"), false), Some(FinishReason::Stop));
        assert_eq!(map_finish_reason(None, true), None);
    }

    #[test]
    fn unparseable_body_is_an_error() {
        let result = from_provider_response(b"<html>oops</html>", &ResponseContext { model: "m" });
        assert!(matches!(result, Err(TranslationError::MalformedResponse(_))));
    }
}
