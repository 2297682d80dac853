//! Gateway HTTP server
//!
//! Accepts OpenAI-style chat completions and provider-native
//! `/v1internal` calls, and hands both to the transport orchestrator.

pub mod callback;

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use codeassist_wire::apis::openai::ChatCompletionsRequest;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::transport::{Gateway, GatewayRequest, GatewayResponse, RequestBody, ResponseBody};

pub const CONVERSATION_HEADER: &str = "x-conversation-id";
pub const IDENTITY_HEADER: &str = "x-identity";
pub const ENDPOINT_HEADER: &str = "x-codeassist-endpoint";
pub const DEFAULT_IDENTITY: &str = "default";

const PASSTHROUGH_PREFIX: &str = "/v1internal";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
}

/// Token information for listing; never carries secrets
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    pub identity: String,
    pub email: Option<String>,
    pub expires_at: Option<String>,
    pub is_expired: bool,
    pub needs_refresh: bool,
    pub project: Option<String>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/auth/tokens", get(list_tokens))
        .route("/health", get(health))
        // `/v1internal:method` paths do not split into route segments
        .fallback(passthrough)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server and serve until the process stops
pub async fn start_server(host: &str, port: u16, gateway: Arc<Gateway>) -> std::io::Result<()> {
    let app = router(AppState { gateway });

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;

    info!("gateway listening on {}", addr);
    info!("  POST   /v1/chat/completions     - OpenAI-compatible chat completions");
    info!("  POST   /v1internal:*            - provider-native passthrough");
    info!("  GET    /auth/tokens             - stored identities");
    info!("  GET    /health                  - liveness");

    axum::serve(listener, app).await
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn identity_of(headers: &HeaderMap) -> String {
    header(headers, IDENTITY_HEADER).unwrap_or(DEFAULT_IDENTITY).to_string()
}

async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let chat = match ChatCompletionsRequest::try_from(body.as_ref()) {
        Ok(chat) => chat,
        Err(e) => return GatewayError::from(e).into_response(),
    };
    let request = GatewayRequest {
        identity: identity_of(&headers),
        conversation_id: header(&headers, CONVERSATION_HEADER).map(str::to_string),
        body: RequestBody::Chat(chat),
    };
    dispatch(&state, request).await
}

async fn passthrough(State(state): State<AppState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    if method != Method::POST || !uri.path().starts_with(PASSTHROUGH_PREFIX) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": format!("no route for {} {}", method, uri.path()), "type": "not_found" } })),
        )
            .into_response();
    }

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let request = GatewayRequest {
        identity: identity_of(&headers),
        conversation_id: header(&headers, CONVERSATION_HEADER).map(str::to_string),
        body: RequestBody::Passthrough {
            path,
            content_type: header(&headers, CONTENT_TYPE.as_str()).map(str::to_string),
            bytes: body,
        },
    };
    dispatch(&state, request).await
}

/// Run one gateway call. Dropping the handler future (client gone) cancels
/// the call; a returned stream keeps running until its reader goes away.
async fn dispatch(state: &AppState, request: GatewayRequest) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    match state.gateway.send(request, &cancel).await {
        Ok(response) => {
            if matches!(response.body, ResponseBody::Stream(_)) {
                guard.disarm();
            }
            into_http(response)
        }
        Err(e) => {
            debug!(kind = e.kind(), "gateway call failed: {}", e);
            e.into_response()
        }
    }
}

fn into_http(response: GatewayResponse) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(value) = response
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
    {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&response.endpoint) {
        headers.insert(ENDPOINT_HEADER, value);
    }
    let body = match response.body {
        ResponseBody::Full(bytes) => Body::from(bytes),
        ResponseBody::Stream(stream) => Body::from_stream(stream),
    };
    (response.status, headers, body).into_response()
}

async fn list_tokens(State(state): State<AppState>) -> Result<Json<Vec<TokenInfo>>, GatewayError> {
    let tokens = state.gateway.tokens();
    let buffer = tokens.refresh_buffer();
    let listed = tokens.list().await?;

    let infos = listed
        .into_iter()
        .map(|(identity, stored)| {
            let parts = stored.refresh_parts();
            TokenInfo {
                identity,
                email: stored.email.clone(),
                expires_at: stored.expires_at().map(|at| at.to_rfc3339()),
                is_expired: stored.is_expired(),
                needs_refresh: stored.needs_refresh(buffer),
                project: parts.effective_project().map(str::to_string),
            }
        })
        .collect();
    Ok(Json(infos))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
