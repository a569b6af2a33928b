//! Rules CRUD plus the signal/state catalogs the rule editor reads.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cueproto::{Rule, SignalDefinition, SignalType};
use serde_json::json;

use super::{error_json, storage_error, AppState};

/// GET /api/v1/rules
pub async fn list(State(app): State<AppState>) -> Response {
    match app.rules.list_rules() {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(err) => storage_error(err),
    }
}

/// GET /api/v1/rules/{id}
pub async fn get_one(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let rules = match app.rules.list_rules() {
        Ok(rules) => rules,
        Err(err) => return storage_error(err),
    };
    match rules.into_iter().find(|r| r.id == id) {
        Some(rule) => (StatusCode::OK, Json(rule)).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "rule not found"),
    }
}

fn validate_rule(rule: &Rule) -> Result<(), Response> {
    if rule.then.set_state.is_empty() {
        return Err(error_json(StatusCode::BAD_REQUEST, "target state required"));
    }
    if rule.when.all.is_empty() {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "at least one condition required",
        ));
    }
    Ok(())
}

/// POST /api/v1/rules
pub async fn create(State(app): State<AppState>, Json(rule): Json<Rule>) -> Response {
    if rule.id.is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "rule id required");
    }
    if let Err(response) = validate_rule(&rule) {
        return response;
    }
    let mut rules = match app.rules.list_rules() {
        Ok(rules) => rules,
        Err(err) => return storage_error(err),
    };
    if rules.iter().any(|r| r.id == rule.id) {
        return error_json(StatusCode::CONFLICT, "rule id already exists");
    }
    rules.push(rule.clone());
    match app.rules.save_rules(&rules) {
        Ok(()) => (StatusCode::CREATED, Json(rule)).into_response(),
        Err(err) => storage_error(err),
    }
}

/// PUT /api/v1/rules/{id}
pub async fn update(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(mut rule): Json<Rule>,
) -> Response {
    if !rule.id.is_empty() && rule.id != id {
        return error_json(StatusCode::BAD_REQUEST, "rule id mismatch");
    }
    rule.id = id.clone();
    if let Err(response) = validate_rule(&rule) {
        return response;
    }
    let mut rules = match app.rules.list_rules() {
        Ok(rules) => rules,
        Err(err) => return storage_error(err),
    };
    let Some(slot) = rules.iter_mut().find(|r| r.id == id) else {
        return error_json(StatusCode::NOT_FOUND, "rule not found");
    };
    *slot = rule.clone();
    match app.rules.save_rules(&rules) {
        Ok(()) => (StatusCode::OK, Json(rule)).into_response(),
        Err(err) => storage_error(err),
    }
}

/// DELETE /api/v1/rules/{id}
pub async fn delete(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let rules = match app.rules.list_rules() {
        Ok(rules) => rules,
        Err(err) => return storage_error(err),
    };
    let filtered: Vec<Rule> = rules.iter().filter(|r| r.id != id).cloned().collect();
    if filtered.len() == rules.len() {
        return error_json(StatusCode::NOT_FOUND, "rule not found");
    }
    match app.rules.save_rules(&filtered) {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "deleted"}))).into_response(),
        Err(err) => storage_error(err),
    }
}

/// GET /api/v1/signals: every known signal definition. Declared catalogs
/// from stored packages, plus names referenced by rules (defaulting to
/// string when nothing declared a type).
pub async fn list_signals(State(app): State<AppState>) -> Response {
    let mut signals: BTreeMap<String, SignalDefinition> = BTreeMap::new();

    if let Ok(packages) = app.packages.list_packages() {
        for package in packages {
            let Ok(definition) = package.definition() else {
                continue;
            };
            for signal in definition.signals {
                if !signal.name.is_empty() {
                    signals.insert(signal.name.clone(), signal);
                }
            }
        }
    }

    if let Ok(rules) = app.rules.list_rules() {
        for rule in rules {
            let conditions = if rule.when.all.is_empty() {
                rule.when.any
            } else {
                rule.when.all
            };
            for condition in conditions {
                if condition.signal.is_empty() || signals.contains_key(&condition.signal) {
                    continue;
                }
                signals.insert(
                    condition.signal.clone(),
                    SignalDefinition {
                        name: condition.signal,
                        signal_type: SignalType::String,
                    },
                );
            }
        }
    }

    let list: Vec<SignalDefinition> = signals.into_values().collect();
    (StatusCode::OK, Json(list)).into_response()
}

/// GET /api/v1/states: distinct state names across stored packages.
pub async fn list_states(State(app): State<AppState>) -> Response {
    let packages = match app.packages.list_packages() {
        Ok(packages) => packages,
        Err(err) => return storage_error(err),
    };
    let mut names: Vec<String> = packages
        .into_iter()
        .filter_map(|p| p.definition().ok())
        .flat_map(|d| d.states.into_iter().map(|s| s.name))
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    (StatusCode::OK, Json(names)).into_response()
}
