//! HTTP server wiring for the agent-facing API.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::handler::{self, AppState};
use crate::{AppError, Result};

/// Build the API router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler::health))
        .route("/heartbeat", post(handler::heartbeat))
        .route("/initializeAgents", post(handler::initialize_agents))
        .route("/stopAgents", post(handler::stop_agents))
        .route("/cleanup", post(handler::cleanup))
        .with_state(state)
}

/// Bind `bind_address:http_port` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if the server fails to bind or serve.
pub async fn serve(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", state.config.bind_address, state.config.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|err| AppError::Http(format!("failed to bind {addr}: {err}")))?;
    serve_with_listener(listener, state, ct).await
}

/// Serve on an already bound listener until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Http` if serving fails.
pub async fn serve_with_listener(
    listener: TcpListener,
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Http(format!("listener has no local address: {err}")))?;
    info!(%local, "orchestrator api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Http(format!("server error: {err}")))
}
