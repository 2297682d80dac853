//! One-shot local listener for the OAuth redirect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CALLBACK_PATH;
use crate::error::AuthError;

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Query parameters of the OAuth redirect
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct OAuthCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl OAuthCallbackQuery {
    /// The authorization code, once the provider error and state are checked
    pub fn into_code(self, expected_state: &str) -> Result<String, AuthError> {
        if let Some(error) = self.error {
            return Err(AuthError::Denied {
                error,
                description: self.error_description.unwrap_or_default(),
            });
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(AuthError::StateMismatch);
        }
        self.code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| AuthError::Callback("redirect carried no authorization code".to_string()))
    }

    fn is_complete(&self) -> bool {
        self.code.is_some() || self.error.is_some()
    }
}

type Waiter = Arc<Mutex<Option<oneshot::Sender<OAuthCallbackQuery>>>>;

pub struct CallbackListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl CallbackListener {
    /// Bind `127.0.0.1:<port>`; port 0 picks a free one
    pub async fn bind(port: u16) -> Result<Self, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::Callback(format!("could not listen on port {}: {}", port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| AuthError::Callback(e.to_string()))?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the first redirect arrives or `timeout` passes. The port is
    /// released before this returns.
    pub async fn wait(self, timeout: Duration) -> Result<OAuthCallbackQuery, AuthError> {
        let Self { listener, addr } = self;
        let (tx, rx) = oneshot::channel();
        let waiter: Waiter = Arc::new(Mutex::new(Some(tx)));
        let app = Router::new()
            .route(CALLBACK_PATH, get(oauth_callback))
            .with_state(waiter);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        });
        debug!(addr = %addr, "waiting for OAuth callback");

        let outcome = tokio::time::timeout(timeout, rx).await;
        shutdown.cancel();
        // an idle browser connection must not hold the port hostage
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
            Ok(Ok(Err(e))) => warn!("callback listener stopped with an error: {}", e),
            Err(_) => {
                warn!("callback listener did not shut down in time, aborting it");
                server.abort();
                let _ = server.await;
            }
            _ => {}
        }

        match outcome {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(AuthError::Callback("callback listener closed early".to_string())),
            Err(_) => Err(AuthError::CallbackTimeout),
        }
    }
}

async fn oauth_callback(State(waiter): State<Waiter>, Query(params): Query<OAuthCallbackQuery>) -> Html<String> {
    // stray hits (favicon prefetch, reloads without parameters) are ignored
    if !params.is_complete() {
        return Html(failure_page("missing_code", "The redirect did not include an authorization code."));
    }

    let page = match &params.error {
        Some(error) => failure_page(
            error,
            params.error_description.as_deref().unwrap_or("Unknown error"),
        ),
        None => success_page(),
    };
    if let Some(tx) = waiter.lock().await.take() {
        let _ = tx.send(params);
    }
    Html(page)
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const STYLE: &str = r#"
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Oxygen, Ubuntu, Cantarell, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #f4f6fb;
        }
        .container {
            background: white;
            padding: 3rem;
            border-radius: 1rem;
            box-shadow: 0 12px 40px rgba(0,0,0,0.15);
            max-width: 500px;
            text-align: center;
        }
        h1 { margin-bottom: 1rem; }
        .ok { color: #2f855a; }
        .failed { color: #c53030; }
        .detail {
            background: #fff5f5;
            border: 1px solid #feb2b2;
            padding: 1rem;
            border-radius: 0.5rem;
        }
"#;

fn success_page() -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Signed in</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h1 class="ok">Signed in</h1>
        <p>The gateway received your authorization. You can close this window and return to the terminal.</p>
    </div>
</body>
</html>
"#
    )
}

fn failure_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Authorization failed</title>
    <style>{STYLE}</style>
</head>
<body>
    <div class="container">
        <h1 class="failed">Authorization failed</h1>
        <p><strong>Error:</strong> {error}</p>
        <div class="detail">{description}</div>
        <p>You can close this window and run the login again.</p>
    </div>
</body>
</html>
"#,
        error = escape(error),
        description = escape(description),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn first_callback_is_handed_to_the_waiter() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let addr = listener.local_addr();
        let waiting = tokio::spawn(listener.wait(Duration::from_secs(5)));

        let page = reqwest::get(format!("http://{}{}?code=4%2Fabc&state=s-1", addr, CALLBACK_PATH))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(page.contains("Signed in"));

        let params = waiting.await.unwrap().unwrap();
        assert_eq!(params.code.as_deref(), Some("4/abc"));
        assert_eq!(assert_ok!(params.into_code("s-1")), "4/abc");
    }

    #[tokio::test]
    async fn port_is_released_after_the_callback() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let addr = listener.local_addr();
        let waiting = tokio::spawn(listener.wait(Duration::from_secs(5)));

        reqwest::get(format!("http://{}{}?error=access_denied&state=s-1", addr, CALLBACK_PATH))
            .await
            .unwrap();
        let params = waiting.await.unwrap().unwrap();
        assert!(matches!(params.into_code("s-1"), Err(AuthError::Denied { error, .. }) if error == "access_denied"));

        assert_ok!(CallbackListener::bind(addr.port()).await);
    }

    #[tokio::test]
    async fn idle_connection_does_not_hold_the_port() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let addr = listener.local_addr();
        let waiting = tokio::spawn(listener.wait(Duration::from_millis(200)));

        // a browser preconnect that never sends a request
        let idle = tokio::net::TcpStream::connect(addr).await.unwrap();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(AuthError::CallbackTimeout)));

        assert_ok!(CallbackListener::bind(addr.port()).await);
        drop(idle);
    }

    #[tokio::test]
    async fn times_out_without_a_callback() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let result = listener.wait(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AuthError::CallbackTimeout)));
    }

    #[test]
    fn state_must_match() {
        let params = OAuthCallbackQuery {
            code: Some("code".to_string()),
            state: Some("forged".to_string()),
            ..Default::default()
        };
        assert!(matches!(params.into_code("expected"), Err(AuthError::StateMismatch)));
    }

    #[test]
    fn error_page_escapes_provider_text() {
        let page = failure_page("bad", "<script>alert(1)</script>");
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>alert"));
    }
}
