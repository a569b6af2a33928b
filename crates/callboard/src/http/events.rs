//! Signal ingestion: raw JSON in, typed `Event` onto the state loop.

use std::collections::HashMap;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use cueproto::{signal, Event, SignalDefinition, SignalValue};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{error_json, AppState};

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub deployable_id: String,
    /// Unix seconds; 0 means "stamp with server time".
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub signals: Map<String, Value>,
}

/// POST /api/v1/events
///
/// Looks up the sender's routing context and signal catalog, coerces each
/// named value, silently drops names outside the catalog, rejects the whole
/// request on a type mismatch, and enqueues without blocking.
pub async fn ingest(State(app): State<AppState>, Json(req): Json<IngestRequest>) -> Response {
    if req.deployable_id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "deployable_id required");
    }
    let context = match app.rules.deployable_context(&req.deployable_id) {
        Ok(Some(context)) => context,
        Ok(None) => {
            return error_json(StatusCode::BAD_REQUEST, "deployable context not found");
        }
        Err(err) => return super::storage_error(err),
    };

    let catalog = match signal_catalog(&app, &context.logic_id, &req.signals) {
        Ok(catalog) => catalog,
        Err(response) => return response,
    };
    if catalog.is_empty() {
        return error_json(
            StatusCode::BAD_REQUEST,
            "signal definitions not found for logic id",
        );
    }

    let mut event = Event {
        deployable_id: req.deployable_id,
        logic_id: context.logic_id,
        tags: context.tags,
        timestamp: event_timestamp(req.timestamp),
        signals: Default::default(),
    };
    for (name, raw) in &req.signals {
        let Some(definition) = catalog.get(name) else {
            continue; // undeclared signals are dropped, not fatal
        };
        match SignalValue::coerce(definition.signal_type, raw) {
            Ok(value) => {
                event.signals.insert(name.clone(), value);
            }
            Err(_) => {
                return error_json(
                    StatusCode::BAD_REQUEST,
                    format!("signal type mismatch for {}", name),
                );
            }
        }
    }

    match app.loop_handles.events.try_send(event) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "queued"})),
        )
            .into_response(),
        Err(_) => error_json(StatusCode::SERVICE_UNAVAILABLE, "event queue full"),
    }
}

fn event_timestamp(unix_seconds: i64) -> DateTime<Utc> {
    if unix_seconds == 0 {
        return Utc::now();
    }
    DateTime::from_timestamp(unix_seconds, 0).unwrap_or_else(Utc::now)
}

/// Catalog resolution order: stored catalog, then the latest package's
/// declared signals, then inference from the raw values themselves.
fn signal_catalog(
    app: &AppState,
    logic_id: &str,
    raw: &Map<String, Value>,
) -> Result<HashMap<String, SignalDefinition>, Response> {
    if let Some(definitions) = app
        .rules
        .signal_definitions(logic_id)
        .map_err(super::storage_error)?
    {
        if !definitions.is_empty() {
            return Ok(to_map(definitions));
        }
    }
    if !logic_id.is_empty() {
        if let Some(package) = app
            .packages
            .latest_for_logic(logic_id)
            .map_err(super::storage_error)?
        {
            if let Ok(definition) = package.definition() {
                if !definition.signals.is_empty() {
                    return Ok(to_map(definition.signals));
                }
            }
        }
    }
    Ok(infer_catalog(raw))
}

fn to_map(definitions: Vec<SignalDefinition>) -> HashMap<String, SignalDefinition> {
    definitions
        .into_iter()
        .filter(|d| !d.name.is_empty())
        .map(|d| (d.name.clone(), d))
        .collect()
}

fn infer_catalog(raw: &Map<String, Value>) -> HashMap<String, SignalDefinition> {
    raw.iter()
        .filter(|(name, _)| !name.is_empty())
        .filter_map(|(name, value)| {
            signal::infer_signal_type(value).map(|signal_type| {
                (
                    name.clone(),
                    SignalDefinition {
                        name: name.clone(),
                        signal_type,
                    },
                )
            })
        })
        .collect()
}
