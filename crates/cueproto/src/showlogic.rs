//! Show-logic documents: the declarative state/action/timer/sensor script a
//! deployable interprets, and the versioned package envelope the server
//! distributes them in.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::signal::SignalDefinition;

/// One action slot in a show state: what to do, on which output, with what
/// parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A timer declared by a state; armed on enter, cancelled on exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerDeclaration {
    pub timer_id: String,
    pub delay_ms: i64,
}

/// Actions to run when a declared timer fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerHandler {
    pub timer_id: String,
    #[serde(default)]
    pub actions: Vec<ActionTemplate>,
}

/// Actions to run when a sensor event matches. Empty `sensor_id` or
/// `event_type` are wildcards; a `condition.eq` entry must equal the event
/// value exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorHandler {
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub condition: Map<String, Value>,
    #[serde(default)]
    pub actions: Vec<ActionTemplate>,
}

/// One named state of the show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowState {
    pub name: String,
    #[serde(default)]
    pub on_enter: Vec<ActionTemplate>,
    #[serde(default)]
    pub on_exit: Vec<ActionTemplate>,
    #[serde(default)]
    pub sensor_handlers: Vec<SensorHandler>,
    #[serde(default)]
    pub timer_handlers: Vec<TimerHandler>,
    #[serde(default)]
    pub timers: Vec<TimerDeclaration>,
}

impl ShowState {
    /// Every action the state can ever run, regardless of trigger.
    pub fn all_actions(&self) -> impl Iterator<Item = &ActionTemplate> {
        self.on_enter
            .iter()
            .chain(self.on_exit.iter())
            .chain(self.sensor_handlers.iter().flat_map(|h| h.actions.iter()))
            .chain(self.timer_handlers.iter().flat_map(|h| h.actions.iter()))
    }
}

/// The body of a show-logic package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShowLogicDefinition {
    pub logic_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub deployable_id: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalDefinition>,
    #[serde(default)]
    pub states: Vec<ShowState>,
}

/// Structural problems a document can carry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("show logic missing logic_id")]
    MissingLogicId,
    #[error("show state missing name")]
    MissingStateName,
    #[error("duplicate show state name: {0}")]
    DuplicateState(String),
    #[error("timer missing timer_id in state {0}")]
    MissingTimerId(String),
    #[error("timer handler references unknown timer: {0}")]
    UnknownTimer(String),
    #[error("action missing action name in state {0}")]
    MissingActionName(String),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
}

impl ShowLogicDefinition {
    /// Validate the document's structure.
    ///
    /// When `supported` is given, every action name must appear in it; the
    /// deployable passes its executor registry here before accepting an
    /// assignment.
    pub fn validate(&self, supported: Option<&HashSet<String>>) -> Result<(), ValidationError> {
        if self.logic_id.is_empty() {
            return Err(ValidationError::MissingLogicId);
        }
        let mut names = HashSet::new();
        for state in &self.states {
            if state.name.is_empty() {
                return Err(ValidationError::MissingStateName);
            }
            if !names.insert(state.name.clone()) {
                return Err(ValidationError::DuplicateState(state.name.clone()));
            }
            let mut timer_ids = HashSet::new();
            for timer in &state.timers {
                if timer.timer_id.is_empty() {
                    return Err(ValidationError::MissingTimerId(state.name.clone()));
                }
                timer_ids.insert(timer.timer_id.as_str());
            }
            for handler in &state.timer_handlers {
                if !timer_ids.contains(handler.timer_id.as_str()) {
                    return Err(ValidationError::UnknownTimer(handler.timer_id.clone()));
                }
            }
            for action in state.all_actions() {
                if action.action.is_empty() {
                    return Err(ValidationError::MissingActionName(state.name.clone()));
                }
                if let Some(supported) = supported {
                    if !supported.contains(&action.action) {
                        return Err(ValidationError::UnsupportedAction(action.action.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Distinct asset paths referenced by any action in the document.
    ///
    /// Both the `file` and `asset` param spellings count; the syncer
    /// reconciles this list against the local assets directory.
    pub fn referenced_assets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        for state in &self.states {
            for action in state.all_actions() {
                for key in ["file", "asset"] {
                    if let Some(path) = action.params.get(key).and_then(Value::as_str) {
                        if !path.is_empty() {
                            seen.insert(path.to_string());
                        }
                    }
                }
            }
        }
        let mut list: Vec<String> = seen.into_iter().collect();
        list.sort();
        list
    }
}

/// Compatibility and resource requirements a deployable must satisfy before
/// it accepts an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub profile_id: String,
    pub version: u32,
    #[serde(default)]
    pub requires: Map<String, Value>,
}

/// Immutable, versioned envelope the server's package store appends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowLogicPackage {
    pub package_id: String,
    pub logic_id: String,
    pub logic_version: u32,
    pub engine_contract_version: String,
    pub show_logic: Value,
    #[serde(default)]
    pub referenced_assets: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub checksum: String,
}

impl ShowLogicPackage {
    /// Build a package around a definition, stamping id, time, and checksum.
    pub fn wrap(definition: &ShowLogicDefinition, engine_contract_version: &str) -> Self {
        let body = serde_json::to_value(definition).unwrap_or(Value::Null);
        let checksum = checksum_of(&body);
        Self {
            package_id: uuid::Uuid::new_v4().to_string(),
            logic_id: definition.logic_id.clone(),
            logic_version: definition.version,
            engine_contract_version: engine_contract_version.to_string(),
            show_logic: body,
            referenced_assets: definition.referenced_assets(),
            created_at: Utc::now(),
            checksum,
        }
    }

    /// Decode the opaque body back into a definition.
    pub fn definition(&self) -> Result<ShowLogicDefinition, serde_json::Error> {
        serde_json::from_value(self.show_logic.clone())
    }
}

/// BLAKE3 of the canonical JSON body, truncated to 128 bits.
pub fn checksum_of(body: &Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    hex::encode(&blake3::hash(&bytes).as_bytes()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_def() -> ShowLogicDefinition {
        serde_json::from_value(json!({
            "logic_id": "lobby",
            "version": 1,
            "states": [
                {
                    "name": "idle",
                    "on_enter": [
                        {"action": "play_video", "target": "display-0",
                         "params": {"file": "idle.mp4", "loop": true}}
                    ],
                    "timers": [{"timer_id": "t1", "delay_ms": 5000}],
                    "timer_handlers": [{"timer_id": "t1", "actions": []}]
                },
                {"name": "playing"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_ok() {
        assert!(minimal_def().validate(None).is_ok());
    }

    #[test]
    fn test_validate_duplicate_state() {
        let mut def = minimal_def();
        def.states.push(def.states[0].clone());
        assert_eq!(
            def.validate(None),
            Err(ValidationError::DuplicateState("idle".to_string()))
        );
    }

    #[test]
    fn test_validate_unknown_timer() {
        let mut def = minimal_def();
        def.states[0].timer_handlers.push(TimerHandler {
            timer_id: "missing".to_string(),
            actions: Vec::new(),
        });
        assert_eq!(
            def.validate(None),
            Err(ValidationError::UnknownTimer("missing".to_string()))
        );
    }

    #[test]
    fn test_validate_unsupported_action() {
        let def = minimal_def();
        let supported: HashSet<String> = ["stop_video".to_string()].into();
        assert_eq!(
            def.validate(Some(&supported)),
            Err(ValidationError::UnsupportedAction("play_video".to_string()))
        );
    }

    #[test]
    fn test_referenced_assets_deduplicated() {
        let mut def = minimal_def();
        def.states[1].on_enter.push(ActionTemplate {
            action: "play_audio".to_string(),
            target: "audio-0".to_string(),
            params: serde_json::from_value(json!({"file": "idle.mp4"})).unwrap(),
        });
        assert_eq!(def.referenced_assets(), vec!["idle.mp4".to_string()]);
    }

    #[test]
    fn test_package_wrap_round_trip() {
        let def = minimal_def();
        let pkg = ShowLogicPackage::wrap(&def, "1.0.0");
        assert_eq!(pkg.logic_id, "lobby");
        assert_eq!(pkg.logic_version, 1);
        assert_eq!(pkg.referenced_assets, vec!["idle.mp4".to_string()]);
        assert_eq!(pkg.checksum.len(), 32);
        assert_eq!(pkg.definition().unwrap(), def);
    }

    #[test]
    fn test_definition_round_trip() {
        let def = minimal_def();
        let text = serde_json::to_string(&def).unwrap();
        let back: ShowLogicDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back, def);
    }
}
