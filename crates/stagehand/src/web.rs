//! Local status endpoint: JSON only, no UI.

use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;

use crate::runtime::Runtime;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(runtime)
}

/// Serve the router until cancelled, with the 5 s header-read deadline so
/// a stalled client cannot hold a connection open on its request headers.
pub async fn serve(
    listener: tokio::net::TcpListener,
    router: Router,
    cancel: CancellationToken,
) {
    let mut builder = ConnectionBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    let builder = Arc::new(builder);

    loop {
        let (stream, _remote) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!("accept failed: {}", err);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let service = TowerToHyperService::new(router.clone());
        let builder = builder.clone();
        tokio::spawn(async move {
            if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!("connection closed with error: {}", err);
            }
        });
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn status(State(runtime): State<Arc<Runtime>>) -> impl IntoResponse {
    Json(runtime.status().await)
}
