//! Local listener that captures the provider's redirect during `login`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{ControlError, Result};

pub const CALLBACK_PATH: &str = "/oidc/callback";

const NONCE_LENGTH: usize = 32;

/// How a login attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success { code: String, state: String },
    ProviderError { error: String, description: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Single-use result slot; the first redirect wins.
type Slot = Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>;

pub fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

pub struct CallbackServer {
    addr: SocketAddr,
    nonce: String,
    result_rx: oneshot::Receiver<CallbackOutcome>,
    shutdown: CancellationToken,
}

impl CallbackServer {
    /// Bind `addr` (port 0 picks a free port) and start serving the
    /// callback path.
    pub async fn start(addr: SocketAddr) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ControlError::Unavailable(format!("failed to bind {}: {}", addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ControlError::Internal(e.to_string()))?;

        let (result_tx, result_rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(result_tx)));
        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(slot);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await });
            if let Err(e) = serve.await {
                tracing::warn!(error = %e, "OIDC callback listener failed");
            }
        });

        tracing::debug!(addr = %addr, "OIDC callback listener started");
        Ok(Self {
            addr,
            nonce: random_nonce(),
            result_rx,
            shutdown,
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Wait for the redirect, at most `timeout`. The listener stops when
    /// this returns.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> CallbackOutcome {
        let outcome = tokio::select! {
            result = &mut self.result_rx => result.unwrap_or(CallbackOutcome::Cancelled),
            _ = tokio::time::sleep(timeout) => CallbackOutcome::TimedOut,
            _ = cancel.cancelled() => CallbackOutcome::Cancelled,
        };
        self.shutdown.cancel();
        outcome
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn handle_callback(
    State(slot): State<Slot>,
    Query(params): Query<CallbackParams>,
) -> Html<&'static str> {
    let outcome = match params {
        CallbackParams {
            error: Some(error),
            error_description,
            ..
        } => CallbackOutcome::ProviderError {
            error,
            description: error_description.unwrap_or_default(),
        },
        CallbackParams {
            code: Some(code),
            state: Some(state),
            ..
        } => CallbackOutcome::Success { code, state },
        _ => CallbackOutcome::ProviderError {
            error: "invalid_request".to_string(),
            description: "callback carried neither a code nor an error".to_string(),
        },
    };
    let failed = !matches!(outcome, CallbackOutcome::Success { .. });

    match slot.lock().take() {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => return Html("<h1>Login already completed</h1>"),
    }

    if failed {
        Html("<h1>Login failed</h1><p>Return to your terminal for details.</p>")
    } else {
        Html("<h1>Signed in</h1><p>You can close this window.</p>")
    }
}
