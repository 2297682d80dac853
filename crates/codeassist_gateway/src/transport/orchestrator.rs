use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use codeassist_wire::apis::codeassist::GenerateContentResponse;
use codeassist_wire::apis::openai::ChatCompletionsRequest;
use codeassist_wire::{
    from_provider_response, ids, to_provider_request, CodeAssistApi, RequestContext,
    ResponseContext, TranslationError,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::stream::{relay, ByteStream, SignatureSink, StreamMode};
use crate::auth::lifecycle::{CredentialRecord, TokenManager};
use crate::auth::oauth::OAuthClient;
use crate::auth::token_store::FileTokenStore;
use crate::config::{ClientHeaders, GatewayConfig};
use crate::error::{AuthError, GatewayError};
use crate::project::ProjectResolver;
use crate::signature::ContinuationStore;
use crate::telemetry::token_preview;

const JSON: &str = "application/json";
const EVENT_STREAM: &str = "text/event-stream";

/// 403 bodies that mean "permission granted but not yet visible everywhere"
const PERMISSION_PROPAGATION_PATTERNS: [&str; 3] = [
    "cloudaicompanion.companions.generateChat",
    "Permission denied on resource project",
    "has not been used in project",
];

pub fn is_permission_propagation(body: &[u8]) -> bool {
    let body = String::from_utf8_lossy(body);
    PERMISSION_PROPAGATION_PATTERNS
        .iter()
        .any(|pattern| body.contains(pattern))
}

pub enum RequestBody {
    Chat(ChatCompletionsRequest),
    /// Provider-native request forwarded as-is apart from authentication
    Passthrough {
        path: String,
        content_type: Option<String>,
        bytes: Bytes,
    },
}

pub struct GatewayRequest {
    pub identity: String,
    pub conversation_id: Option<String>,
    pub body: RequestBody,
}

pub enum ResponseBody {
    Full(Bytes),
    Stream(ByteStream),
}

pub struct GatewayResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: ResponseBody,
    /// Endpoint that produced the response
    pub endpoint: String,
}

/// Fully prepared outbound call, reusable across endpoints
struct Outbound {
    path: String,
    content_type: String,
    body: Bytes,
    streaming: bool,
    translate_for: Option<String>,
}

enum Upstream {
    Live(reqwest::Response),
    Read {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
    },
}

enum ChainOutcome {
    Response { endpoint: String, upstream: Upstream },
    Unauthorized { endpoint: String },
}

pub struct Gateway {
    http_client: reqwest::Client,
    tokens: Arc<TokenManager>,
    projects: Arc<ProjectResolver>,
    signatures: Arc<ContinuationStore>,
    endpoints: Vec<String>,
    backoff: BackoffPolicy,
    client: ClientHeaders,
}

/// Only connecting is time-limited unless the config asks otherwise; a whole
/// request limit would also cut long streams short.
pub fn build_http_client(config: &GatewayConfig) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {}", e)))
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        http_client: reqwest::Client,
        tokens: Arc<TokenManager>,
        projects: Arc<ProjectResolver>,
        signatures: Arc<ContinuationStore>,
    ) -> Self {
        Self {
            http_client,
            tokens,
            projects,
            signatures,
            endpoints: config.endpoint_chain(),
            backoff: config.backoff.normalized(),
            client: config.client.clone(),
        }
    }

    /// Wire every component from configuration, using the file credential store
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let http_client = build_http_client(config)?;
        let store = FileTokenStore::open(&config.token_store_path).map_err(AuthError::from)?;
        let oauth = Arc::new(OAuthClient::new(config.oauth.clone(), http_client.clone()));
        let projects = Arc::new(ProjectResolver::new(config, http_client.clone()));
        let tokens = Arc::new(
            TokenManager::new(Arc::new(store), oauth, config.refresh_buffer)
                .with_project_cache(Arc::clone(&projects)),
        );
        Ok(Self::new(
            config,
            http_client,
            tokens,
            projects,
            Arc::new(ContinuationStore::new()),
        ))
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn projects(&self) -> &Arc<ProjectResolver> {
        &self.projects
    }

    pub fn signatures(&self) -> &Arc<ContinuationStore> {
        &self.signatures
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn send(&self, request: GatewayRequest, cancel: &CancellationToken) -> Result<GatewayResponse, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let conversation = request.conversation_id.as_deref();
        let conversation_key = self.signatures.conversation_key(conversation);
        let session_id = self.signatures.session_id(conversation);

        let mut record = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            record = self.tokens.ensure_fresh(&request.identity) => record?,
        };

        let mut reauthenticated = false;
        loop {
            let outbound = self
                .prepare(&request.body, &record, &session_id, &conversation_key, cancel)
                .await?;

            match self.walk_chain(&outbound, &record.access_token, cancel).await? {
                ChainOutcome::Response { endpoint, upstream } => {
                    return self.finish(upstream, &outbound, endpoint, conversation_key, cancel).await;
                }
                ChainOutcome::Unauthorized { endpoint } if reauthenticated => {
                    warn!(endpoint = %endpoint, "credentials rejected again after refresh");
                    return Err(GatewayError::Unauthorized { endpoint });
                }
                ChainOutcome::Unauthorized { endpoint } => {
                    info!(endpoint = %endpoint, identity = %request.identity, "401 from provider, forcing token refresh");
                    reauthenticated = true;
                    let stale = record.access_token.clone();
                    record = tokio::select! {
                        _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                        refreshed = self.tokens.force_refresh(&request.identity, &stale) => refreshed?,
                    };
                }
            }
        }
    }

    async fn prepare(
        &self,
        body: &RequestBody,
        record: &CredentialRecord,
        session_id: &str,
        conversation_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Outbound, GatewayError> {
        match body {
            RequestBody::Chat(chat) => {
                let project = tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    project = self.projects.effective_project(record) => project,
                };
                let continuation = self.signatures.get(conversation_key);
                let request_id = ids::request_id();
                let ctx = RequestContext {
                    project: &project,
                    session_id,
                    continuation: continuation.as_deref(),
                    request_id: &request_id,
                    user_agent: &self.client.user_agent,
                };
                let provider = to_provider_request(chat, &ctx);
                let streaming = chat.is_streaming();
                debug!(
                    model = %chat.model,
                    project = %project,
                    streaming,
                    has_continuation = continuation.is_some(),
                    contents = provider.request.contents.len(),
                    "translated chat request"
                );
                let bytes = serde_json::to_vec(&provider).map_err(TranslationError::Encode)?;
                Ok(Outbound {
                    path: CodeAssistApi::generation(streaming).url(""),
                    content_type: JSON.to_string(),
                    body: Bytes::from(bytes),
                    streaming,
                    translate_for: Some(chat.model.clone()),
                })
            }
            RequestBody::Passthrough {
                path,
                content_type,
                bytes,
            } => Ok(Outbound {
                streaming: path.contains("alt=sse") || path.contains("streamGenerateContent"),
                path: path.clone(),
                content_type: content_type.clone().unwrap_or_else(|| JSON.to_string()),
                body: bytes.clone(),
                translate_for: None,
            }),
        }
    }

    /// Try each endpoint strictly in order. Returns the first response that is
    /// not retryable, or a 401 for the caller to handle.
    async fn walk_chain(
        &self,
        outbound: &Outbound,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainOutcome, GatewayError> {
        let mut last_error = String::from("no endpoints configured");
        let mut attempted = 0;

        for endpoint in &self.endpoints {
            attempted += 1;
            let mut permission_retries = 0;

            loop {
                debug!(endpoint = %endpoint, access = %token_preview(access_token), "attempting provider call");
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    result = self.attempt(endpoint, outbound, access_token) => result,
                };
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "transport failure, trying next endpoint");
                        last_error = format!("{}: {}", endpoint, e);
                        break;
                    }
                };

                let status = response.status();
                if status == StatusCode::UNAUTHORIZED {
                    return Ok(ChainOutcome::Unauthorized {
                        endpoint: endpoint.clone(),
                    });
                }
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(endpoint = %endpoint, status = status.as_u16(), "retryable status, trying next endpoint");
                    last_error = format!("{}: HTTP {}", endpoint, status.as_u16());
                    break;
                }
                if status != StatusCode::FORBIDDEN {
                    return Ok(ChainOutcome::Response {
                        endpoint: endpoint.clone(),
                        upstream: Upstream::Live(response),
                    });
                }

                let content_type = content_type_of(&response);
                let body = read_body(response, cancel).await?;
                if !is_permission_propagation(&body) {
                    return Ok(ChainOutcome::Response {
                        endpoint: endpoint.clone(),
                        upstream: Upstream::Read {
                            status,
                            content_type,
                            body,
                        },
                    });
                }
                if permission_retries >= self.backoff.max_retries {
                    return Err(GatewayError::PermissionPropagation {
                        endpoint: endpoint.clone(),
                        retries: permission_retries,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                }
                let delay = self.backoff.delay_for_retry(permission_retries);
                permission_retries += 1;
                warn!(
                    endpoint = %endpoint,
                    retry = permission_retries,
                    max_retries = self.backoff.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "permission not yet propagated, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(GatewayError::AllEndpointsFailed {
            attempted,
            last_error,
        })
    }

    async fn attempt(&self, endpoint: &str, outbound: &Outbound, access_token: &str) -> Result<reqwest::Response, reqwest::Error> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), outbound.path);
        let mut request = self
            .http_client
            .post(url)
            .bearer_auth(access_token)
            .header(CONTENT_TYPE, &outbound.content_type)
            .body(outbound.body.clone());
        if outbound.streaming {
            request = request.header(ACCEPT, EVENT_STREAM);
        }
        self.client.apply(request).send().await
    }

    async fn finish(
        &self,
        upstream: Upstream,
        outbound: &Outbound,
        endpoint: String,
        conversation_key: String,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, GatewayError> {
        let response = match upstream {
            Upstream::Read {
                status,
                content_type,
                body,
            } => {
                return Ok(GatewayResponse {
                    status,
                    content_type,
                    body: ResponseBody::Full(body),
                    endpoint,
                })
            }
            Upstream::Live(response) => response,
        };

        let status = response.status();
        let content_type = content_type_of(&response);
        let is_event_stream = content_type
            .as_deref()
            .map(|ct| ct.starts_with(EVENT_STREAM))
            .unwrap_or(false);

        if status.is_success() && (outbound.streaming || is_event_stream) {
            let mode = match &outbound.translate_for {
                Some(model) => StreamMode::Translate { model: model.clone() },
                None => StreamMode::Passthrough,
            };
            let sink = SignatureSink {
                store: Arc::clone(&self.signatures),
                key: conversation_key,
            };
            return Ok(GatewayResponse {
                status,
                content_type: Some(EVENT_STREAM.to_string()),
                body: ResponseBody::Stream(relay(response, mode, sink, cancel.clone())),
                endpoint,
            });
        }

        let body = read_body(response, cancel).await?;
        if !status.is_success() {
            return Ok(GatewayResponse {
                status,
                content_type,
                body: ResponseBody::Full(body),
                endpoint,
            });
        }

        let Some(model) = &outbound.translate_for else {
            if let Ok(parsed) = GenerateContentResponse::from_slice(&body) {
                if let Some(signature) = parsed.first_thought_signature() {
                    self.signatures.record(&conversation_key, signature);
                }
            }
            return Ok(GatewayResponse {
                status,
                content_type,
                body: ResponseBody::Full(body),
                endpoint,
            });
        };

        match from_provider_response(&body, &ResponseContext { model }) {
            Ok(translated) => {
                if let Some(signature) = &translated.continuation {
                    self.signatures.record(&conversation_key, signature);
                }
                let json = serde_json::to_vec(&translated.response).map_err(TranslationError::Encode)?;
                Ok(GatewayResponse {
                    status,
                    content_type: Some(JSON.to_string()),
                    body: ResponseBody::Full(Bytes::from(json)),
                    endpoint,
                })
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "could not translate provider response, passing it through");
                Ok(GatewayResponse {
                    status,
                    content_type,
                    body: ResponseBody::Full(body),
                    endpoint,
                })
            }
        }
    }
}

fn content_type_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

async fn read_body(response: reqwest::Response, cancel: &CancellationToken) -> Result<Bytes, GatewayError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        body = response.bytes() => body.map_err(|e| GatewayError::Transport(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token_store::{CredentialStore, MemoryTokenStore, StoredCredential};
    use crate::config::{OAuthConfig, OnboardingPolicy};
    use chrono::Utc;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::{json, Value};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    const GENERATE: &str = "/v1internal:generateContent";

    fn generated(text: &str, signature: Option<&str>) -> String {
        let mut part = json!({ "text": text });
        if let Some(signature) = signature {
            part["thoughtSignature"] = json!(signature);
        }
        json!({
            "response": {
                "candidates": [{
                    "content": { "role": "model", "parts": [part] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5 }
            },
            "traceId": "trace-1"
        })
        .to_string()
    }

    fn chat(body: Value) -> RequestBody {
        RequestBody::Chat(serde_json::from_value(body).unwrap())
    }

    fn hello(stream: bool) -> RequestBody {
        chat(json!({
            "model": "gemini-2.5-pro",
            "stream": stream,
            "messages": [{ "role": "user", "content": "hello" }]
        }))
    }

    fn request(conversation: Option<&str>, body: RequestBody) -> GatewayRequest {
        GatewayRequest {
            identity: "default".to_string(),
            conversation_id: conversation.map(str::to_string),
            body,
        }
    }

    async fn gateway_with(endpoints: Vec<String>, token_server: &ServerGuard, backoff: BackoffPolicy) -> Gateway {
        let mut config = GatewayConfig::new(
            OAuthConfig::google("client-1", "secret-1", 51121),
            PathBuf::from("/tmp/unused.json"),
        );
        config.oauth.token_url = format!("{}/token", token_server.url());
        config.endpoints = endpoints;
        config.backoff = backoff;
        config.onboarding = OnboardingPolicy {
            enabled: false,
            ..OnboardingPolicy::default()
        };

        let store = Arc::new(MemoryTokenStore::new());
        store
            .set(
                "default",
                StoredCredential {
                    access: "ya29.old".to_string(),
                    refresh: "1//secret|proj-a".to_string(),
                    expires_at: (Utc::now() + chrono::Duration::hours(1)).timestamp_millis(),
                    email: Some("dev@example.com".to_string()),
                },
            )
            .await
            .unwrap();

        let http = reqwest::Client::new();
        let oauth = Arc::new(OAuthClient::new(config.oauth.clone(), http.clone()));
        let projects = Arc::new(ProjectResolver::new(&config, http.clone()));
        let tokens = Arc::new(TokenManager::new(store, oauth, config.refresh_buffer));
        Gateway::new(&config, http, tokens, projects, Arc::new(ContinuationStore::new()))
    }

    async fn gateway(endpoints: Vec<String>, token_server: &ServerGuard) -> Gateway {
        let backoff = BackoffPolicy {
            base: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_retries: 10,
        };
        gateway_with(endpoints, token_server, backoff).await
    }

    async fn body_of(response: GatewayResponse) -> String {
        let bytes: Vec<u8> = match response.body {
            ResponseBody::Full(bytes) => bytes.to_vec(),
            ResponseBody::Stream(stream) => {
                let chunks: Vec<_> = stream.collect().await;
                chunks.into_iter().flat_map(|chunk| chunk.unwrap().to_vec()).collect()
            }
        };
        String::from_utf8(bytes).unwrap()
    }

    fn failure(result: Result<GatewayResponse, GatewayError>) -> GatewayError {
        match result {
            Ok(response) => panic!("expected an error, got HTTP {}", response.status),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn walks_endpoints_in_order_until_one_answers() {
        let token = Server::new_async().await;
        let mut a = Server::new_async().await;
        let mut b = Server::new_async().await;
        let mut c = Server::new_async().await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut mocks = Vec::new();
        for (server, name, status) in [(&mut a, "a", 500), (&mut b, "b", 429), (&mut c, "c", 200)] {
            let order = Arc::clone(&order);
            let body = if status == 200 { generated("hi there", None) } else { String::new() };
            mocks.push(
                server
                    .mock("POST", GENERATE)
                    .with_status(status)
                    .with_body_from_request(move |_| {
                        order.lock().unwrap().push(name);
                        body.clone().into_bytes()
                    })
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let gateway = gateway(vec![a.url(), b.url(), c.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.endpoint, c.url());
        let body: Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert_eq!(body["choices"][0]["message"]["content"], "hi there");
        assert_eq!(body["usage"]["total_tokens"], 5);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        for mock in mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn provider_request_carries_project_session_and_client_headers() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE)
            .match_header("authorization", "Bearer ya29.old")
            .match_header("user-agent", "antigravity")
            .match_header("client-metadata", Matcher::Regex("GEMINI".to_string()))
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJsonString(r#"{"project":"proj-a","model":"gemini-2.5-pro"}"#.to_string()),
                Matcher::Regex(r#""requestId":"agent-"#.to_string()),
                Matcher::Regex(r#""sessionId":"[0-9a-f-]+-conv-1""#.to_string()),
            ]))
            .with_status(200)
            .with_body(generated("ok", None))
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        gateway
            .send(request(Some("conv-1"), hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt() {
        let token = Server::new_async().await;
        let mut a = Server::new_async().await;
        let mut b = Server::new_async().await;
        let _a = a.mock("POST", GENERATE).with_status(500).create_async().await;
        let _b = b.mock("POST", GENERATE).with_status(503).create_async().await;

        let gateway = gateway(vec![a.url(), b.url()], &token).await;
        let error = failure(gateway.send(request(None, hello(false)), &CancellationToken::new()).await);

        match error {
            GatewayError::AllEndpointsFailed { attempted, last_error } => {
                assert_eq!(attempted, 2);
                assert!(last_error.contains("503"), "{}", last_error);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn chain_stops_after_three_endpoints() {
        let token = Server::new_async().await;
        let mut servers = Vec::new();
        for _ in 0..5 {
            servers.push(Server::new_async().await);
        }
        let mut mocks = Vec::new();
        for (position, server) in servers.iter_mut().enumerate() {
            let mock = match position {
                0..=2 => server.mock("POST", GENERATE).with_status(500).expect(1),
                3 => server.mock("POST", GENERATE).with_status(500).expect(0),
                _ => server
                    .mock("POST", GENERATE)
                    .with_status(200)
                    .with_body(generated("too far", None))
                    .expect(0),
            };
            mocks.push(mock.create_async().await);
        }

        let endpoints = servers.iter().map(|server| server.url()).collect();
        let gateway = gateway(endpoints, &token).await;
        let error = failure(gateway.send(request(None, hello(false)), &CancellationToken::new()).await);

        match error {
            GatewayError::AllEndpointsFailed { attempted, last_error } => {
                assert_eq!(attempted, 3);
                assert!(last_error.starts_with(&servers[2].url()), "{}", last_error);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        for mock in &mocks {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_the_call_in_flight() {
        let token = Server::new_async().await;
        let mut next = Server::new_async().await;
        let untouched = next
            .mock("POST", GENERATE)
            .with_status(200)
            .with_body(generated("should not be reached", None))
            .expect(0)
            .create_async()
            .await;

        // accepts connections and never answers
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_url = format!("http://{}", silent.local_addr().unwrap());
        let connected = Arc::new(tokio::sync::Notify::new());
        let seen = Arc::clone(&connected);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = silent.accept().await {
                held.push(socket);
                seen.notify_one();
            }
        });

        let gateway = gateway(vec![silent_url, next.url()], &token).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            connected.notified().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let error = failure(gateway.send(request(None, hello(false)), &cancel).await);

        assert!(matches!(error, GatewayError::Cancelled), "{:?}", error);
        assert!(started.elapsed() < Duration::from_secs(5));
        untouched.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_through() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", GENERATE)
            .with_status(200)
            .with_body(generated("reachable", None))
            .expect(1)
            .create_async()
            .await;

        // nothing listens on port 1
        let gateway = gateway(vec!["http://127.0.0.1:1".to_string(), server.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.endpoint, server.url());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn second_unauthorized_is_terminal_after_two_attempts() {
        let mut token = Server::new_async().await;
        let refresh = token
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.fresh","expires_in":3599}"#)
            .expect(1)
            .create_async()
            .await;
        let mut first = Server::new_async().await;
        let mut second = Server::new_async().await;
        let rejected = first
            .mock("POST", GENERATE)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let untouched = second.mock("POST", GENERATE).expect(0).create_async().await;

        let gateway = gateway(vec![first.url(), second.url()], &token).await;
        let error = failure(gateway.send(request(None, hello(false)), &CancellationToken::new()).await);

        assert!(matches!(error, GatewayError::Unauthorized { .. }), "{:?}", error);
        assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
        rejected.assert_async().await;
        untouched.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn unauthorized_retries_once_with_refreshed_token() {
        let mut token = Server::new_async().await;
        let _refresh = token
            .mock("POST", "/token")
            .with_status(200)
            .with_body(r#"{"access_token":"ya29.fresh","expires_in":3599}"#)
            .expect(1)
            .create_async()
            .await;
        let mut server = Server::new_async().await;
        let stale = server
            .mock("POST", GENERATE)
            .match_header("authorization", "Bearer ya29.old")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("POST", GENERATE)
            .match_header("authorization", "Bearer ya29.fresh")
            .with_status(200)
            .with_body(generated("welcome back", None))
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        stale.assert_async().await;
        fresh.assert_async().await;
        let stored = gateway.tokens().store().get("default").await.unwrap().unwrap();
        assert_eq!(stored.access, "ya29.fresh");
    }

    #[tokio::test]
    async fn continuation_token_is_replayed_on_the_next_turn() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let turn = |messages: Value| {
            chat(json!({
                "model": "gemini-2.5-pro",
                "messages": messages
            }))
        };
        let history = json!([
            { "role": "user", "content": "weather?" },
            {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "lookup", "arguments": "{\"city\":\"Oslo\"}" }
                }]
            },
            { "role": "tool", "tool_call_id": "call_1", "content": "rain" }
        ]);

        let first = server
            .mock("POST", GENERATE)
            .match_body(Matcher::Regex(r#""thoughtSignature":"skip_thought_signature_validator""#.to_string()))
            .with_status(200)
            .with_body(generated("calling", Some("sig-123")))
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        gateway
            .send(request(Some("conv-1"), turn(history.clone())), &CancellationToken::new())
            .await
            .unwrap();
        first.assert_async().await;
        assert_eq!(gateway.signatures().get("conv-1").as_deref(), Some("sig-123"));

        let second = server
            .mock("POST", GENERATE)
            .match_body(Matcher::Regex(r#""thoughtSignature":"sig-123""#.to_string()))
            .with_status(200)
            .with_body(generated("done", None))
            .expect(1)
            .create_async()
            .await;
        gateway
            .send(request(Some("conv-1"), turn(history)), &CancellationToken::new())
            .await
            .unwrap();
        second.assert_async().await;
    }

    #[tokio::test]
    async fn permission_propagation_backs_off_then_gives_up() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let mut next = Server::new_async().await;
        let denied = server
            .mock("POST", GENERATE)
            .with_status(403)
            .with_body(r#"{"error":{"code":403,"message":"Permission 'cloudaicompanion.companions.generateChat' denied"}}"#)
            .expect(11)
            .create_async()
            .await;
        let untouched = next.mock("POST", GENERATE).expect(0).create_async().await;

        let gateway = gateway(vec![server.url(), next.url()], &token).await;
        let error = failure(gateway.send(request(None, hello(false)), &CancellationToken::new()).await);

        match &error {
            GatewayError::PermissionPropagation { retries, body, .. } => {
                assert_eq!(*retries, 10);
                assert!(body.contains("generateChat"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(error.status_code(), StatusCode::FORBIDDEN);
        denied.assert_async().await;
        untouched.assert_async().await;
    }

    #[tokio::test]
    async fn unrelated_forbidden_is_returned_unchanged() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let mut next = Server::new_async().await;
        let denied = server
            .mock("POST", GENERATE)
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error":{"message":"The caller does not have permission"}}"#)
            .expect(1)
            .create_async()
            .await;
        let untouched = next.mock("POST", GENERATE).expect(0).create_async().await;

        let gateway = gateway(vec![server.url(), next.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert!(body_of(response).await.contains("does not have permission"));
        denied.assert_async().await;
        untouched.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_passed_through() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let _bad = server
            .mock("POST", GENERATE)
            .with_status(400)
            .with_body(r#"{"error":{"message":"bad model"}}"#)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, r#"{"error":{"message":"bad model"}}"#);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let mock = server.mock("POST", GENERATE).expect(0).create_async().await;

        let gateway = gateway(vec![server.url()], &token).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = failure(gateway.send(request(None, hello(false)), &cancel).await);

        assert!(matches!(error, GatewayError::Cancelled));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let _denied = server
            .mock("POST", GENERATE)
            .with_status(403)
            .with_body("API has not been used in project proj-a before")
            .create_async()
            .await;
        let slow = BackoffPolicy {
            base: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        };

        let gateway = gateway_with(vec![server.url()], &token, slow).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let error = failure(gateway.send(request(None, hello(false)), &cancel).await);

        assert!(matches!(error, GatewayError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn streaming_is_translated_and_records_signature() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let events = [
            json!({ "response": { "candidates": [{ "content": { "role": "model", "parts": [{ "text": "Hel" }] } }] } }),
            json!({ "response": {
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "lo", "thoughtSignature": "sig-stream" }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5 }
            } }),
        ];
        let body: String = events.iter().map(|event| format!("data: {}\r\n\r\n", event)).collect();
        let mock = server
            .mock("POST", Matcher::Regex("^/v1internal:streamGenerateContent".to_string()))
            .match_query(Matcher::UrlEncoded("alt".to_string(), "sse".to_string()))
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        let response = gateway
            .send(request(Some("conv-s"), hello(true)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.content_type.as_deref(), Some("text/event-stream"));
        let streamed = body_of(response).await;
        mock.assert_async().await;

        let payloads: Vec<Value> = streamed
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .filter(|data| *data != "[DONE]")
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();
        let text: String = payloads
            .iter()
            .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hello");
        assert!(payloads.iter().all(|chunk| chunk["object"] == "chat.completion.chunk"));
        assert_eq!(streamed.matches("data: [DONE]").count(), 1);
        assert_eq!(gateway.signatures().get("conv-s").as_deref(), Some("sig-stream"));
    }

    #[tokio::test]
    async fn passthrough_forwards_bytes_and_watches_signatures() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let raw = generated("native", Some("sig-native"));
        let mock = server
            .mock("POST", GENERATE)
            .match_header("authorization", "Bearer ya29.old")
            .match_body(r#"{"model":"gemini-2.5-pro","request":{}}"#)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(raw.clone())
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        let body = RequestBody::Passthrough {
            path: GENERATE.to_string(),
            content_type: Some("application/json".to_string()),
            bytes: Bytes::from_static(br#"{"model":"gemini-2.5-pro","request":{}}"#),
        };
        let response = gateway
            .send(request(Some("conv-p"), body), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(body_of(response).await, raw);
        assert_eq!(gateway.signatures().get("conv-p").as_deref(), Some("sig-native"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn untranslatable_success_is_passed_through() {
        let token = Server::new_async().await;
        let mut server = Server::new_async().await;
        let _odd = server
            .mock("POST", GENERATE)
            .with_status(200)
            .with_body("[1, 2, 3]")
            .create_async()
            .await;

        let gateway = gateway(vec![server.url()], &token).await;
        let response = gateway
            .send(request(None, hello(false)), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(body_of(response).await, "[1, 2, 3]");
    }

    #[test]
    fn recognises_propagation_bodies() {
        assert!(is_permission_propagation(b"Permission denied on resource project x"));
        assert!(is_permission_propagation(b"Cloud AI API has not been used in project 123"));
        assert!(!is_permission_propagation(b"The caller does not have permission"));
    }
}
