//! The fleet-wide global state and the events that move a deployable's
//! local interpreter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The single authoritative fleet state owned by the callboard's state loop.
///
/// `version` is strictly monotonic; every consumer (server and deployables
/// alike) discards anything at or below the version it has already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalState {
    pub state: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

impl GlobalState {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            variables: Map::new(),
            timestamp: Utc::now(),
            version: 1,
        }
    }
}

/// The `{state, version, timestamp}` triplet a deployable consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStateUpdate {
    pub state: String,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl From<&GlobalState> for GlobalStateUpdate {
    fn from(state: &GlobalState) -> Self {
        Self {
            state: state.state.clone(),
            version: state.version,
            timestamp: state.timestamp,
        }
    }
}

/// A declared one-shot timer firing back into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub timer_id: String,
    pub timestamp: DateTime<Utc>,
}

/// An action published by the engine for the dispatcher to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAction {
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}
