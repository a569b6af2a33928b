//! REST + websocket surface.
//!
//! Thin handlers over the stores, the session manager, and the state loop
//! handles; every validation failure surfaces as `{"error": ...}` with a
//! 4xx status and nothing here is fatal to the process.

mod deployables;
mod events;
mod rules_api;
mod showlogic;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::hub::{self, Hub};
use crate::sessions::SessionManager;
use crate::state_loop::{LoopHandles, StateOverride};
use crate::store::{PackageStore, RegistryStore, RulesStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn RegistryStore>,
    pub packages: Arc<dyn PackageStore>,
    pub rules: Arc<dyn RulesStore>,
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionManager>,
    pub loop_handles: LoopHandles,
    pub engine_contract_versions: Arc<Vec<String>>,
    pub server_version: String,
}

pub fn router(state: AppState, assets_dir: Option<std::path::PathBuf>) -> Router {
    let api = Router::new()
        .route("/events", post(events::ingest))
        .route("/state", post(set_state))
        .route("/deployables", get(deployables::list))
        .route("/deployables/pending", get(deployables::pending))
        .route(
            "/deployables/{id}",
            axum::routing::patch(deployables::update),
        )
        .route("/deployables/{id}/assign", post(deployables::assign))
        .route("/deployables/{id}/identify", post(deployables::identify))
        .route("/deployables-with-logic", get(deployables::list_with_logic))
        .route("/show-logic/{logic_id}", put(showlogic::upsert))
        .route("/rules", get(rules_api::list).post(rules_api::create))
        .route(
            "/rules/{id}",
            get(rules_api::get_one)
                .put(rules_api::update)
                .delete(rules_api::delete),
        )
        .route("/signals", get(rules_api::list_signals))
        .route("/states", get(rules_api::list_states));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ws/state", get(state_ws))
        .route("/ws/deployable", get(deployable_ws))
        .nest("/api/v1", api);

    if let Some(dir) = assets_dir {
        router = router.nest_service("/assets", ServeDir::new(dir));
    }

    router.with_state(state)
}

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve the router until cancelled.
///
/// Connections go through the hyper builder directly so the 5 s
/// header-read deadline applies; a client that never finishes its request
/// headers is cut off instead of holding the connection open.
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
            // Upgrades kept: the state and deployable sockets arrive here.
            if let Err(err) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!("connection closed with error: {}", err);
            }
        });
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct StateOverrideRequest {
    #[serde(default)]
    state: String,
    #[serde(default)]
    variables: Option<Map<String, Value>>,
}

/// POST /api/v1/state: operator override, always rebroadcast on accept.
async fn set_state(
    State(app): State<AppState>,
    Json(req): Json<StateOverrideRequest>,
) -> Response {
    let accepted = app.loop_handles.try_override(StateOverride {
        state: (!req.state.is_empty()).then_some(req.state),
        variables: req.variables,
    });
    if accepted {
        (StatusCode::OK, Json(serde_json::json!({"status": "accepted"}))).into_response()
    } else {
        error_json(StatusCode::SERVICE_UNAVAILABLE, "override queue full")
    }
}

/// GET /ws/state: operator monitors and deployable state listeners.
async fn state_ws(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let deployable_id = params.get("deployable_id").cloned().unwrap_or_default();
    if !deployable_id.is_empty() {
        if let Ok(Some(record)) = app.registry.get_deployable(&deployable_id) {
            app.hub.set_active(
                &deployable_id,
                record.status == cueproto::DeployableStatus::Active,
            );
        }
    }
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| hub::serve_state_socket(hub, socket, deployable_id))
}

/// GET /ws/deployable: one session socket per deployable.
async fn deployable_ws(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let sessions = app.sessions.clone();
    ws.on_upgrade(move |socket| sessions.serve_socket(socket))
}

pub(crate) fn error_json(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

pub(crate) fn storage_error(err: crate::store::StoreError) -> Response {
    tracing::error!("storage error: {}", err);
    error_json(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
}
