//! Deployable registry endpoints and operator-initiated assignment.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cueproto::{
    DeployableContext, DeployableStatus, ExecutionProfile, ServerFrame, ShowLogicDefinition,
    ShowLogicPackage,
};
use serde::Deserialize;
use serde_json::json;

use super::{error_json, storage_error, AppState};

/// GET /api/v1/deployables: durable records merged with live session data.
pub async fn list(State(app): State<AppState>) -> Response {
    let records = match app.registry.list_deployables() {
        Ok(records) => records,
        Err(err) => return storage_error(err),
    };
    let sessions = app.sessions.snapshot();
    let enhanced: Vec<serde_json::Value> = records
        .into_iter()
        .map(|record| {
            let mut item = json!({
                "deployable_id": record.deployable_id,
                "assigned_logic_id": record.assigned_logic_id,
                "status": record.status,
                "last_seen": record.last_seen,
                "capabilities": record.capabilities,
                "agent_version": record.agent_version,
                "logic_version": record.logic_version,
                "name": record.name,
                "location": record.location,
                "connected": false,
            });
            if let Some(session) = sessions.iter().find(|s| s.device_id == record.deployable_id)
            {
                item["ip"] = json!(session.ip);
                item["hostname"] = json!(session.hostname);
                item["connected"] = json!(session.connected);
                // Session data can be fresher than the record.
                if !session.name.is_empty() {
                    item["name"] = json!(session.name);
                }
                if !session.location.is_empty() {
                    item["location"] = json!(session.location);
                }
            }
            item
        })
        .collect();
    (StatusCode::OK, Json(enhanced)).into_response()
}

/// GET /api/v1/deployables/pending: connected sessions with no assignment.
pub async fn pending(State(app): State<AppState>) -> Response {
    (StatusCode::OK, Json(app.sessions.pending())).into_response()
}

#[derive(Debug, Deserialize)]
pub struct UpdateDeployableRequest {
    #[serde(default)]
    pub assigned_logic_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
}

/// PATCH /api/v1/deployables/{id}
pub async fn update(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDeployableRequest>,
) -> Response {
    if id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "deployable id required");
    }
    let current = match app.registry.get_deployable(&id) {
        Ok(Some(record)) => record,
        Ok(None) => return error_json(StatusCode::NOT_FOUND, "deployable not found"),
        Err(err) => return storage_error(err),
    };

    if !req.assigned_logic_id.is_empty() {
        let changed = current.assigned_logic_id != req.assigned_logic_id;
        if let Err(err) = app.registry.update_assigned_logic(&id, &req.assigned_logic_id) {
            return storage_error(err);
        }
        if changed {
            // Distribution is now in flight: gate broadcasts until the
            // deployable re-registers and acks the new package.
            if let Err(err) = app.registry.update_status(&id, DeployableStatus::Registering) {
                return storage_error(err);
            }
            app.hub.set_active(&id, false);
            app.hub.notify_logic_update(&id);
            let _ = app.sessions.send_to(&id, ServerFrame::LogicUpdateAvailable);
        }
    }

    if !req.name.is_empty() || !req.location.is_empty() {
        if let Err(err) = app.registry.update_name_location(&id, &req.name, &req.location) {
            return storage_error(err);
        }
        app.sessions.update_name_location(&id, &req.name, &req.location);
    }

    (StatusCode::OK, Json(json!({"status": "updated"}))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub profile: ExecutionProfile,
    pub show_logic: ShowLogicDefinition,
}

/// POST /api/v1/deployables/{id}/assign
///
/// Validates the profile and logic, saves a fresh package, and pushes
/// `assign_role` onto the target's live session socket. The deployable's
/// ack (not this call) completes the lifecycle.
pub async fn assign(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> Response {
    if id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "deployable id required");
    }
    if req.profile.profile_id.is_empty() || req.profile.version == 0 {
        return error_json(StatusCode::BAD_REQUEST, "profile_id and version required");
    }
    if req.show_logic.logic_id.is_empty() || req.show_logic.states.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "show_logic required");
    }
    if let Err(err) = req.show_logic.validate(None) {
        return error_json(StatusCode::BAD_REQUEST, err.to_string());
    }
    let logic_id = req.show_logic.logic_id.clone();

    let contract = app
        .engine_contract_versions
        .first()
        .cloned()
        .unwrap_or_else(|| "1.0.0".to_string());
    let package = ShowLogicPackage::wrap(&req.show_logic, &contract);
    if let Err(err) = app.packages.save_package(&package) {
        return storage_error(err);
    }

    let frame = ServerFrame::AssignRole {
        logic_id: logic_id.clone(),
        server_id: app.server_version.clone(),
        profile: req.profile.clone(),
        show_logic: req.show_logic.clone(),
        name: (!req.name.is_empty()).then(|| req.name.clone()),
    };
    if let Err(err) = app.sessions.send_to(&id, frame) {
        return error_json(StatusCode::CONFLICT, err.to_string());
    }
    tracing::info!(device_id = %id, logic = %logic_id, package = %package.package_id,
        "registration: assign_role sent");

    if let Err(err) = app.rules.save_deployable_context(&DeployableContext {
        deployable_id: id.clone(),
        logic_id: logic_id.clone(),
        tags: req.tags.clone(),
    }) {
        tracing::warn!("context save failed: {}", err);
    }
    if !req.show_logic.signals.is_empty() {
        if let Err(err) = app
            .rules
            .save_signal_definitions(&logic_id, &req.show_logic.signals)
        {
            tracing::warn!("signal catalog save failed: {}", err);
        }
    }
    if let Err(err) = app.registry.update_assigned_logic(&id, &logic_id) {
        tracing::warn!("record assignment save failed: {}", err);
    }
    if let Err(err) = app.registry.update_status(&id, DeployableStatus::Registering) {
        tracing::warn!("record status save failed: {}", err);
    }
    app.sessions.note_assign_sent(&id, &logic_id, &req.name);

    (StatusCode::OK, Json(json!({"status": "sent"}))).into_response()
}

/// POST /api/v1/deployables/{id}/identify: ask a connected deployable to
/// make itself visible; it answers with `identify_ack` on its socket.
pub async fn identify(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    if id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "deployable id required");
    }
    match app.sessions.send_to(&id, ServerFrame::Identify) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "sent"}))).into_response(),
        Err(err) => error_json(StatusCode::CONFLICT, err.to_string()),
    }
}

/// GET /api/v1/deployables-with-logic: id/logic/tags triplets for the
/// rules editor.
pub async fn list_with_logic(State(app): State<AppState>) -> Response {
    let records = match app.registry.list_deployables() {
        Ok(records) => records,
        Err(err) => return storage_error(err),
    };
    let items: Vec<serde_json::Value> = records
        .into_iter()
        .map(|record| {
            let context = app
                .rules
                .deployable_context(&record.deployable_id)
                .ok()
                .flatten()
                .unwrap_or_else(|| DeployableContext {
                    deployable_id: record.deployable_id.clone(),
                    logic_id: record.assigned_logic_id.clone(),
                    tags: Vec::new(),
                });
            json!({
                "deployable_id": record.deployable_id,
                "logic_id": context.logic_id,
                "status": record.status,
                "tags": context.tags,
            })
        })
        .collect();
    (StatusCode::OK, Json(items)).into_response()
}
