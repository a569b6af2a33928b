//! Websocket frames, one internally-tagged enum per direction.
//!
//! Every frame carries a `type` field on the wire; unknown types are logged
//! and dropped by both ends rather than failing the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::CapabilityReport;
use crate::showlogic::{ExecutionProfile, ShowLogicDefinition};

/// Identity announcement a deployable sends on every (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub device_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pairing_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assigned_logic_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub assigned_profile_version: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub assigned_show_logic_version: u32,
    #[serde(default)]
    pub capabilities: CapabilityReport,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// A sensor reading or edge a deployable observed and forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default)]
    pub sensor_type: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Frames a deployable sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceFrame {
    Hello(Hello),
    AssignRoleAck {
        device_id: String,
        logic_id: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SensorEvent(SensorEvent),
    PlaybackError {
        device_id: String,
        action: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    IdentifyAck {
        device_id: String,
        supported: bool,
    },
}

/// Frames the server sends to a deployable (or operator monitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AssignRole {
        logic_id: String,
        server_id: String,
        profile: ExecutionProfile,
        show_logic: ShowLogicDefinition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    StateUpdate {
        state: String,
        version: u64,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variables: Option<Map<String, Value>>,
    },
    Identify,
    LogicUpdateAvailable,
}
