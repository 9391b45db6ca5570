//! Local OAuth redirect listener
//!
//! [`CallbackListener`] is an owned resource: `start` binds
//! `127.0.0.1:<port>`, `wait_for_code` yields the outcome of the first
//! redirect carrying the expected state, and `stop` shuts the server down.
//! Redirects with a missing or foreign state are answered and ignored.
//! Dropping the listener also stops it.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::oauth::CALLBACK_PATH;

const SUCCESS_HTML: &str = "<!doctype html><html><head><title>Gmail MCP</title></head>\
<body style=\"font-family: sans-serif;\"><h2>Authentication complete</h2>\
<p>You can close this window and return to the terminal.</p></body></html>";

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("failed to bind callback listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("authorization was denied: {0}")]
    Denied(String),
    #[error("callback state did not match the authorization request")]
    StateMismatch,
    #[error("callback is missing the authorization code")]
    MissingCode,
    #[error("timed out waiting for the OAuth redirect")]
    Timeout,
    #[error("callback listener stopped before a code arrived")]
    Closed,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

#[derive(Clone)]
pub struct CallbackState {
    expected_state: String,
    outcome: mpsc::Sender<Result<String, CallbackError>>,
}

/// Router serving the redirect route
pub fn router(state: CallbackState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(state)
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<String>) {
    if params.state.as_deref() != Some(state.expected_state.as_str()) {
        tracing::warn!("ignoring OAuth redirect with unexpected state");
        return failure_page(&CallbackError::StateMismatch);
    }
    let outcome = match (params.error, params.code) {
        (Some(error), _) => Err(CallbackError::Denied(error)),
        (None, Some(code)) if !code.is_empty() => Ok(code),
        _ => Err(CallbackError::MissingCode),
    };

    let response = match &outcome {
        Ok(_) => (StatusCode::OK, Html(SUCCESS_HTML.to_owned())),
        Err(e) => failure_page(e),
    };
    // Only the first matching redirect is consumed.
    if state.outcome.try_send(outcome).is_err() {
        tracing::debug!("ignoring repeated OAuth redirect");
    }
    response
}

/// Error page; the message echoes query text, so it is escaped
fn failure_page(err: &CallbackError) -> (StatusCode, Html<String>) {
    (
        StatusCode::BAD_REQUEST,
        Html(format!(
            "<p>{}. Please retry the auth command.</p>",
            ammonia::clean_text(&err.to_string())
        )),
    )
}

pub struct CallbackListener {
    addr: SocketAddr,
    outcome: mpsc::Receiver<Result<String, CallbackError>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind the listener and start serving in the background
    ///
    /// Port 0 binds an ephemeral port; see [`CallbackListener::redirect_uri`].
    pub async fn start(port: u16, expected_state: impl Into<String>) -> Result<Self, CallbackError> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(CallbackState {
            expected_state: expected_state.into(),
            outcome: tx,
        });

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "callback listener failed");
            }
        });
        tracing::info!(%addr, "OAuth callback listener started");

        Ok(Self {
            addr,
            outcome: rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), CALLBACK_PATH)
    }

    /// Wait for the first redirect and return its authorization code
    pub async fn wait_for_code(&mut self, timeout: Duration) -> Result<String, CallbackError> {
        match tokio::time::timeout(timeout, self.outcome.recv()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => Err(CallbackError::Closed),
            Err(_) => Err(CallbackError::Timeout),
        }
    }

    /// Shut the server down and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        tracing::info!(addr = %self.addr, "OAuth callback listener stopped");
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::{CallbackError, CallbackListener, CallbackState, router};

    async fn call_with_body(
        uri: &str,
    ) -> (StatusCode, String, Option<Result<String, CallbackError>>) {
        let (tx, mut rx) = mpsc::channel(1);
        let app = router(CallbackState {
            expected_state: "xyz".to_owned(),
            outcome: tx,
        });
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (
            status,
            String::from_utf8_lossy(&body).into_owned(),
            rx.try_recv().ok(),
        )
    }

    async fn call(uri: &str) -> (StatusCode, Option<Result<String, CallbackError>>) {
        let (status, _, outcome) = call_with_body(uri).await;
        (status, outcome)
    }

    #[tokio::test]
    async fn accepts_code_with_matching_state() {
        let (status, outcome) = call("/oauth2callback?code=4%2Fabc&state=xyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome.expect("outcome").expect("code"), "4/abc");
    }

    #[tokio::test]
    async fn rejects_state_mismatch_and_denial() {
        let (status, outcome) = call("/oauth2callback?code=abc&state=other").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(outcome.is_none(), "foreign state must not end the wait");

        let (_, outcome) = call("/oauth2callback?error=access_denied").await;
        assert!(outcome.is_none());

        let (status, outcome) = call("/oauth2callback?error=access_denied&state=xyz").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(outcome, Some(Err(CallbackError::Denied(e))) if e == "access_denied"));

        let (_, outcome) = call("/oauth2callback?state=xyz").await;
        assert!(matches!(outcome, Some(Err(CallbackError::MissingCode))));
    }

    #[tokio::test]
    async fn error_page_escapes_query_text() {
        let (status, body, outcome) = call_with_body(
            "/oauth2callback?error=%3Cscript%3Ealert(1)%3C%2Fscript%3E&state=xyz",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.contains("<script>"), "{body}");
        assert!(body.contains("&lt;script&gt;"), "{body}");
        assert!(
            matches!(outcome, Some(Err(CallbackError::Denied(e))) if e == "<script>alert(1)</script>")
        );
    }

    #[tokio::test]
    async fn other_paths_are_not_found() {
        let (status, outcome) = call("/elsewhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn listener_serves_redirect_then_stops() {
        let mut listener = CallbackListener::start(0, "s1").await.expect("start");
        let uri = format!("{}?code=c0de&state=s1", listener.redirect_uri());

        let status = reqwest::get(&uri).await.expect("redirect request").status();
        assert!(status.is_success());
        let code = listener
            .wait_for_code(Duration::from_secs(5))
            .await
            .expect("code");
        assert_eq!(code, "c0de");

        let addr = listener.redirect_uri();
        listener.stop().await;
        assert!(reqwest::get(&addr).await.is_err());
    }

    #[tokio::test]
    async fn stray_redirect_does_not_block_the_real_one() {
        let mut listener = CallbackListener::start(0, "s2").await.expect("start");
        let base = listener.redirect_uri();

        let stray = reqwest::get(format!("{base}?code=evil&state=wrong"))
            .await
            .expect("stray request");
        assert_eq!(stray.status().as_u16(), StatusCode::BAD_REQUEST.as_u16());
        let real = reqwest::get(format!("{base}?code=good&state=s2"))
            .await
            .expect("real request");
        assert!(real.status().is_success());

        let code = listener
            .wait_for_code(Duration::from_secs(5))
            .await
            .expect("code");
        assert_eq!(code, "good");
        listener.stop().await;
    }

    #[tokio::test]
    async fn wait_times_out_without_redirect() {
        let mut listener = CallbackListener::start(0, "s").await.expect("start");
        let err = listener
            .wait_for_code(Duration::from_millis(50))
            .await
            .expect_err("timeout");
        assert!(matches!(err, CallbackError::Timeout));
        listener.stop().await;
    }
}
