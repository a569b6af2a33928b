//! Show-logic package upsert.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use cueproto::{showlogic, DeployableStatus, ServerFrame, ShowLogicPackage};
use serde::Deserialize;
use serde_json::Value;

use super::{error_json, storage_error, AppState};

#[derive(Debug, Deserialize)]
pub struct UpsertPackageRequest {
    #[serde(default)]
    pub package_id: String,
    #[serde(default)]
    pub logic_id: String,
    #[serde(default)]
    pub logic_version: u32,
    #[serde(default)]
    pub engine_contract_version: String,
    pub show_logic: Value,
    #[serde(default)]
    pub referenced_assets: Vec<String>,
}

/// PUT /api/v1/show-logic/{logic_id}
///
/// Appends a new package and flips every deployable assigned to this logic
/// id into REGISTERING; their sockets get a `logic_update_available` nudge
/// and broadcasts are gated until they ack the new package.
pub async fn upsert(
    State(app): State<AppState>,
    Path(logic_id): Path<String>,
    Json(req): Json<UpsertPackageRequest>,
) -> Response {
    if logic_id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "logic id required");
    }
    if !req.logic_id.is_empty() && req.logic_id != logic_id {
        return error_json(StatusCode::BAD_REQUEST, "logic id mismatch");
    }
    let definition = match serde_json::from_value::<cueproto::ShowLogicDefinition>(
        req.show_logic.clone(),
    ) {
        Ok(definition) => definition,
        Err(_) => return error_json(StatusCode::BAD_REQUEST, "invalid show logic payload"),
    };
    if let Err(err) = definition.validate(None) {
        return error_json(StatusCode::BAD_REQUEST, err.to_string());
    }

    let contract = if req.engine_contract_version.is_empty() {
        app.engine_contract_versions
            .first()
            .cloned()
            .unwrap_or_else(|| "1.0.0".to_string())
    } else {
        req.engine_contract_version.clone()
    };
    if !app.engine_contract_versions.contains(&contract) {
        return error_json(
            StatusCode::BAD_REQUEST,
            format!("unsupported engine contract version: {}", contract),
        );
    }

    let package = ShowLogicPackage {
        package_id: if req.package_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            req.package_id.clone()
        },
        logic_id: logic_id.clone(),
        logic_version: if req.logic_version == 0 {
            definition.version
        } else {
            req.logic_version
        },
        engine_contract_version: contract,
        checksum: showlogic::checksum_of(&req.show_logic),
        show_logic: req.show_logic,
        referenced_assets: if req.referenced_assets.is_empty() {
            definition.referenced_assets()
        } else {
            req.referenced_assets
        },
        created_at: Utc::now(),
    };
    if let Err(err) = app.packages.save_package(&package) {
        return storage_error(err);
    }

    if !definition.signals.is_empty() {
        if let Err(err) = app
            .rules
            .save_signal_definitions(&logic_id, &definition.signals)
        {
            tracing::warn!("signal catalog save failed: {}", err);
        }
    }

    // Downstream deployables re-register against the new package.
    if let Ok(deployables) = app.registry.list_deployables() {
        for record in deployables {
            if record.assigned_logic_id != logic_id {
                continue;
            }
            if let Err(err) = app
                .registry
                .update_status(&record.deployable_id, DeployableStatus::Registering)
            {
                tracing::warn!(device_id = %record.deployable_id,
                    "status flip failed: {}", err);
            }
            app.hub.set_active(&record.deployable_id, false);
            app.hub.notify_logic_update(&record.deployable_id);
            let _ = app
                .sessions
                .send_to(&record.deployable_id, ServerFrame::LogicUpdateAvailable);
        }
    }

    (StatusCode::OK, Json(package)).into_response()
}
