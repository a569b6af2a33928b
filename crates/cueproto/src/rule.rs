//! Operator-authored rules and the events they evaluate over.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::signal::SignalValue;

/// A condition-and-transition pair. The first matching rule (ascending id
/// order) wins an event; `timing.cooldown_ms` rate-limits refiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub enabled: bool,
    pub when: ConditionGroup,
    pub then: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
}

/// `all` is conjunction, `any` is disjunction; a non-empty `all` takes
/// precedence, and an empty group never matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSelector>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signal: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_is: Option<String>,
}

/// Restricts which deployables an event may come from. Empty lists are
/// wildcards. `roles` is the legacy spelling of `logic_ids`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSelector {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, alias = "roles", skip_serializing_if = "Vec::is_empty")]
    pub logic_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployable_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(default)]
    pub set_state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub cooldown_ms: i64,
}

/// A post-ingest event: typed signals plus the sender's routing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub deployable_id: String,
    #[serde(default)]
    pub logic_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub signals: BTreeMap<String, SignalValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_round_trip() {
        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "enabled": true,
            "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"},
            "timing": {"cooldown_ms": 1000}
        }))
        .unwrap();
        let text = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&text).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_source_selector_accepts_legacy_roles() {
        let sel: SourceSelector =
            serde_json::from_value(json!({"roles": ["lobby"]})).unwrap();
        assert_eq!(sel.logic_ids, vec!["lobby".to_string()]);
    }

    #[test]
    fn test_state_only_condition() {
        let cond: Condition = serde_json::from_value(json!({"state_is": "idle"})).unwrap();
        assert!(cond.signal.is_empty());
        assert_eq!(cond.state_is.as_deref(), Some("idle"));
    }
}
