use bytes::Bytes;
use log::{debug, warn};

use super::response::{map_finish_reason, to_tool_call, to_usage};
use crate::apis::codeassist::GenerateContentResponse;
use crate::apis::openai::{
    ChatCompletionsStreamResponse, FunctionCallDelta, MessageDelta, Role, StreamChoice, ToolCallDelta,
};
use crate::apis::streaming_shapes::{scan_signature, SseEvent, SseLine, SseLineBuffer};
use crate::error::TranslationError;
use crate::ids;

/// Rewrites a provider SSE body into `chat.completion.chunk` events as bytes
/// arrive.
///
/// Every `data:` event is scanned once for a continuation token. Thought text
/// is emitted as ordinary content; reasoning is not separated when streaming.
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    id: String,
    created: u64,
    lines: SseLineBuffer,
    continuation: Option<String>,
    role_sent: bool,
    next_tool_index: u32,
    saw_tool_calls: bool,
    done_sent: bool,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: ids::completion_id(),
            created: ids::unix_seconds(),
            lines: SseLineBuffer::new(),
            continuation: None,
            role_sent: false,
            next_tool_index: 0,
            saw_tool_calls: false,
            done_sent: false,
        }
    }

    /// Latest continuation token observed on the stream so far
    pub fn continuation(&self) -> Option<&str> {
        self.continuation.as_deref()
    }

    /// Feed one upstream chunk; returns the bytes to forward to the client
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let lines = self.lines.push(chunk);
        lines.into_iter().filter_map(|line| self.process(line)).collect()
    }

    /// Flush any partial line and terminate the stream with `[DONE]` once
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            out.extend(self.process(line));
        }
        if !self.done_sent {
            self.done_sent = true;
            out.push(Bytes::from(SseEvent::done().to_bytes()));
        }
        out
    }

    fn process(&mut self, line: SseLine) -> Option<Bytes> {
        match line {
            SseLine::Text(line) => self.process_line(&line),
            SseLine::Raw(raw) => {
                warn!("passing through undecodable stream line");
                let mut forwarded = raw.to_vec();
                forwarded.push(b'\n');
                Some(Bytes::from(forwarded))
            }
        }
    }

    fn process_line(&mut self, line: &str) -> Option<Bytes> {
        if line.trim().is_empty() {
            return None;
        }
        let event = match line.parse::<SseEvent>() {
            Ok(event) => event,
            // comments, event names, retry hints
            Err(_) => return Some(Bytes::from(format!("{}\n", line))),
        };
        if event.is_done() {
            if self.done_sent {
                return None;
            }
            self.done_sent = true;
            return Some(Bytes::from(SseEvent::done().to_bytes()));
        }

        if let Some(signature) = scan_signature(&event.data) {
            debug!("stream carried a continuation token");
            self.continuation = Some(signature);
        }

        match self.translate_event(&event.data) {
            Ok(Some(chunk)) => Some(Bytes::from(chunk.to_bytes())),
            Ok(None) => None,
            Err(e) => {
                warn!("passing through untranslatable stream event: {}", e);
                Some(Bytes::from(event.to_bytes()))
            }
        }
    }

    fn translate_event(&mut self, data: &str) -> Result<Option<SseEvent>, TranslationError> {
        let provider = GenerateContentResponse::from_slice(data.as_bytes())?;
        if provider.candidates.is_empty() && provider.usage_metadata.is_none() {
            return Ok(None);
        }

        let mut choices = Vec::with_capacity(provider.candidates.len());
        for (position, candidate) in provider.candidates.iter().enumerate() {
            let mut content = String::new();
            let mut tool_calls = Vec::new();

            for part in candidate.content.iter().flat_map(|content| content.parts.iter()) {
                if let Some(text) = &part.text {
                    content.push_str(text);
                }
                if let Some(call) = &part.function_call {
                    let call = to_tool_call(call)?;
                    tool_calls.push(ToolCallDelta {
                        index: self.next_tool_index,
                        id: Some(call.id),
                        kind: Some(call.kind),
                        function: FunctionCallDelta {
                            name: Some(call.function.name),
                            arguments: Some(call.function.arguments),
                        },
                    });
                    self.next_tool_index += 1;
                }
            }
            self.saw_tool_calls |= !tool_calls.is_empty();

            let role = (!self.role_sent).then_some(Role::Assistant);
            self.role_sent = true;
            choices.push(StreamChoice {
                index: candidate.index.unwrap_or(position as u32),
                delta: MessageDelta {
                    role,
                    content: (!content.is_empty()).then_some(content),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: map_finish_reason(candidate.finish_reason.as_deref(), self.saw_tool_calls),
            });
        }

        let chunk = ChatCompletionsStreamResponse {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage: provider.usage_metadata.as_ref().map(to_usage),
        };
        let data = serde_json::to_string(&chunk).map_err(TranslationError::Encode)?;
        Ok(Some(SseEvent::data(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn events(output: &[Bytes]) -> Vec<String> {
        output
            .iter()
            .map(|bytes| String::from_utf8(bytes.to_vec()).unwrap())
            .collect()
    }

    fn payload(event: &str) -> Value {
        let data = event.trim().strip_prefix("data: ").unwrap();
        serde_json::from_str(data).unwrap()
    }

    fn sse(body: Value) -> String {
        format!("data: {}\r\n\r\n", body)
    }

    #[test]
    fn translates_text_chunks_split_mid_event() {
        let first = sse(json!({"response": {"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]}}));
        let (head, tail) = first.split_at(20);

        let mut translator = StreamTranslator::new("gemini-3-flash");
        assert!(translator.push(head.as_bytes()).is_empty());
        let out = events(&translator.push(tail.as_bytes()));

        assert_eq!(out.len(), 1);
        let chunk = payload(&out[0]);
        assert_eq!(chunk["object"], "chat.completion.chunk");
        assert_eq!(chunk["model"], "gemini-3-flash");
        assert_eq!(chunk["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hel");
    }

    #[test]
    fn thoughts_stream_as_content_and_signature_is_captured() {
        let body = sse(json!({"response": {"candidates": [{"content": {"role": "model", "parts": [
            {"text": "pondering", "thought": true, "thoughtSignature": "sig-123"}
        ]}}]}}));
        let mut translator = StreamTranslator::new("gemini-3-pro-high");
        let out = events(&translator.push(body.as_bytes()));

        assert_eq!(payload(&out[0])["choices"][0]["delta"]["content"], "pondering");
        assert!(payload(&out[0])["choices"][0]["delta"].get("reasoning_content").is_none());
        assert_eq!(translator.continuation(), Some("sig-123"));
    }

    #[test]
    fn tool_calls_get_increasing_indices_and_finish_as_tool_calls() {
        let first = sse(json!({"candidates": [{"content": {"role": "model", "parts": [
            {"functionCall": {"name": "lookup", "args": {"q": "a"}}}
        ]}}]}));
        let second = sse(json!({"candidates": [{"content": {"role": "model", "parts": [
            {"functionCall": {"name": "lookup", "args": {"q": "b"}}}
        ]}, "finishReason": "STOP"}]}));

        let mut translator = StreamTranslator::new("m");
        let mut out = events(&translator.push(first.as_bytes()));
        out.extend(events(&translator.push(second.as_bytes())));

        let a = payload(&out[0]);
        let b = payload(&out[1]);
        assert_eq!(a["choices"][0]["delta"]["tool_calls"][0]["index"], 0);
        assert_eq!(b["choices"][0]["delta"]["tool_calls"][0]["index"], 1);
        assert_eq!(b["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"], r#"{"q":"b"}"#);
        assert_eq!(b["choices"][0]["finish_reason"], "tool_calls");
        assert!(b["choices"][0]["delta"].get("role").is_none());
    }

    #[test]
    fn untranslatable_events_pass_through() {
        let mut translator = StreamTranslator::new("m");
        let out = events(&translator.push(b"data: not-json\n\n: keepalive\n"));
        assert_eq!(out, vec!["data: not-json\n\n".to_string(), ": keepalive\n".to_string()]);
    }

    #[test]
    fn undecodable_line_keeps_the_rest_of_the_chunk() {
        let valid = sse(json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "kept"}]}}]}));
        let mut chunk = valid.into_bytes();
        chunk.extend_from_slice(b"data: \xff\xfe\n\n");

        let mut translator = StreamTranslator::new("m");
        let out = translator.push(&chunk);

        assert_eq!(out.len(), 2);
        let first = String::from_utf8(out[0].to_vec()).unwrap();
        assert_eq!(payload(&first)["choices"][0]["delta"]["content"], "kept");
        assert_eq!(out[1].as_ref(), b"data: \xff\xfe\n");
    }

    #[test]
    fn done_is_emitted_exactly_once() {
        let mut translator = StreamTranslator::new("m");
        let mut out = events(&translator.push(b"data: [DONE]\n\n"));
        out.extend(events(&translator.finish()));
        assert_eq!(out, vec!["data: [DONE]\n\n".to_string()]);

        let mut fresh = StreamTranslator::new("m");
        assert_eq!(events(&fresh.finish()), vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn trailing_event_without_newline_is_flushed() {
        let body = format!("data: {}", json!({"candidates": [{"content": {"parts": [{"text": "tail"}]}, "finishReason": "MAX_TOKENS"}]}));
        let mut translator = StreamTranslator::new("m");
        assert!(translator.push(body.as_bytes()).is_empty());
        let out = events(&translator.finish());

        assert_eq!(out.len(), 2);
        assert_eq!(payload(&out[0])["choices"][0]["finish_reason"], "length");
        assert_eq!(out[1], "data: [DONE]\n\n");
    }
}
