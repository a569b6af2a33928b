//! Durable deployable registry records and routing contexts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityReport;

/// Registry lifecycle of a deployable as the server tracks it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployableStatus {
    #[default]
    New,
    Assigned,
    Registering,
    Active,
    Offline,
    Error,
}

impl std::fmt::Display for DeployableStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeployableStatus::New => "NEW",
            DeployableStatus::Assigned => "ASSIGNED",
            DeployableStatus::Registering => "REGISTERING",
            DeployableStatus::Active => "ACTIVE",
            DeployableStatus::Offline => "OFFLINE",
            DeployableStatus::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Durable record for one deployable; created by its first hello, mutated by
/// the session manager and the assignment handlers only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployableRecord {
    pub deployable_id: String,
    #[serde(default)]
    pub assigned_logic_id: String,
    #[serde(default)]
    pub status: DeployableStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: CapabilityReport,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub logic_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
}

impl DeployableRecord {
    pub fn new(deployable_id: impl Into<String>) -> Self {
        Self {
            deployable_id: deployable_id.into(),
            assigned_logic_id: String::new(),
            status: DeployableStatus::New,
            last_seen: Utc::now(),
            capabilities: CapabilityReport::default(),
            agent_version: String::new(),
            logic_version: 0,
            name: String::new(),
            location: String::new(),
        }
    }
}

/// Routing context the rules engine filters on: which logic a deployable
/// runs, and its operator-assigned tags. `role` is the legacy spelling of
/// `logic_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployableContext {
    pub deployable_id: String,
    #[serde(default, alias = "role")]
    pub logic_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_spelling() {
        let text = serde_json::to_string(&DeployableStatus::Registering).unwrap();
        assert_eq!(text, "\"REGISTERING\"");
        let back: DeployableStatus = serde_json::from_str("\"OFFLINE\"").unwrap();
        assert_eq!(back, DeployableStatus::Offline);
    }

    #[test]
    fn test_record_round_trip() {
        let record = DeployableRecord::new("dep-1");
        let text = serde_json::to_string(&record).unwrap();
        let back: DeployableRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_context_accepts_legacy_role() {
        let ctx: DeployableContext = serde_json::from_str(
            r#"{"deployable_id":"d","role":"lobby","tags":["east"]}"#,
        )
        .unwrap();
        assert_eq!(ctx.logic_id, "lobby");
    }
}
