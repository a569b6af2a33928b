//! The pure rules evaluator.
//!
//! `evaluate` never touches the store beyond the cooldown journal handed to
//! it, never stamps or versions the state, and is deterministic for a given
//! `(state, event, rules, cooldown journal)`. Candidates are evaluated in
//! ascending rule-id order and the first match wins: exactly one transition
//! per event.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use cueproto::{Condition, Event, GlobalState, Rule, SignalValue};
use serde_json::Value;

use crate::store::{RulesStore, StoreResult};

/// Cooldown journal the evaluator reads and writes.
///
/// Blanket-implemented for every [`RulesStore`]; tests use a map.
pub trait CooldownJournal {
    fn last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>>;
    fn set_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

impl<T: RulesStore + ?Sized> CooldownJournal for T {
    fn last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
        self.rule_last_fired(rule_id)
    }

    fn set_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.set_rule_last_fired(rule_id, at)
    }
}

/// Evaluate one event against the rule set.
///
/// Returns the (possibly transitioned) state and whether a rule fired. The
/// caller owns timestamping, version bump, persistence, and broadcast.
pub fn evaluate<C: CooldownJournal + ?Sized>(
    current: &GlobalState,
    event: &Event,
    rules: &[Rule],
    cooldowns: &C,
) -> StoreResult<(GlobalState, bool)> {
    for rule in candidates(event, rules) {
        if !rule.enabled {
            continue;
        }
        if !matches(rule, current, event) {
            continue;
        }
        if let Some(timing) = &rule.timing {
            if timing.cooldown_ms > 0 {
                if let Some(last) = cooldowns.last_fired(&rule.id)? {
                    let cooldown = Duration::milliseconds(timing.cooldown_ms);
                    if event.timestamp < last + cooldown {
                        continue;
                    }
                }
            }
        }
        let mut next = current.clone();
        if !rule.then.set_state.is_empty() {
            next.state = rule.then.set_state.clone();
        }
        cooldowns.set_last_fired(&rule.id, event.timestamp)?;
        return Ok((next, true));
    }
    Ok((current.clone(), false))
}

/// Candidates = rules referencing a signal present in the event, plus every
/// state-only rule. BTreeMap keyed by id gives the ascending evaluation
/// order for free.
fn candidates<'a>(event: &Event, rules: &'a [Rule]) -> impl Iterator<Item = &'a Rule> {
    let mut selected: BTreeMap<&'a str, &'a Rule> = BTreeMap::new();
    for rule in rules {
        let signals = rule_signals(rule);
        if signals.is_empty() {
            selected.insert(&rule.id, rule);
        } else if signals.iter().any(|name| event.signals.contains_key(*name)) {
            selected.insert(&rule.id, rule);
        }
    }
    selected.into_values()
}

fn rule_signals(rule: &Rule) -> Vec<&str> {
    let conditions = if rule.when.all.is_empty() {
        &rule.when.any
    } else {
        &rule.when.all
    };
    conditions
        .iter()
        .filter(|c| !c.signal.is_empty())
        .map(|c| c.signal.as_str())
        .collect()
}

fn matches(rule: &Rule, state: &GlobalState, event: &Event) -> bool {
    let group = &rule.when;
    if group.all.is_empty() && group.any.is_empty() {
        return false;
    }
    if !group.all.is_empty() {
        return group.all.iter().all(|c| condition_match(c, state, event));
    }
    group.any.iter().any(|c| condition_match(c, state, event))
}

fn condition_match(condition: &Condition, state: &GlobalState, event: &Event) -> bool {
    if let Some(expected) = &condition.state_is {
        return &state.state == expected;
    }
    if condition.signal.is_empty() {
        return false;
    }
    if let Some(source) = &condition.source {
        if !source.tags.is_empty() && !source.tags.iter().any(|t| event.tags.contains(t)) {
            return false;
        }
        if !source.logic_ids.is_empty() && !source.logic_ids.contains(&event.logic_id) {
            return false;
        }
        if !source.deployable_ids.is_empty()
            && !source.deployable_ids.contains(&event.deployable_id)
        {
            return false;
        }
    }
    let Some(value) = event.signals.get(&condition.signal) else {
        return false;
    };
    compare(value, &condition.op.to_lowercase(), condition.value.as_ref())
}

fn compare(signal: &SignalValue, op: &str, rhs: Option<&Value>) -> bool {
    match op {
        "equals" => equals(signal, rhs),
        "gt" => compare_number(signal, rhs, |a, b| a > b),
        "lt" => compare_number(signal, rhs, |a, b| a < b),
        "all" => compare_all(signal, rhs),
        _ => false,
    }
}

/// Type-aware equality: both sides must be the same kind.
fn equals(signal: &SignalValue, rhs: Option<&Value>) -> bool {
    let Some(rhs) = rhs else { return false };
    match signal {
        SignalValue::Bool(v) => rhs.as_bool() == Some(*v),
        SignalValue::Number(v) => rhs.as_f64() == Some(*v),
        SignalValue::String(v) => rhs.as_str() == Some(v.as_str()),
        SignalValue::Vector2(v) => cueproto::signal::as_vector2(rhs) == Some(*v),
    }
}

fn compare_number(signal: &SignalValue, rhs: Option<&Value>, cmp: fn(f64, f64) -> bool) -> bool {
    match (signal.as_number(), rhs.and_then(Value::as_f64)) {
        (Some(lhs), Some(rhs)) => cmp(lhs, rhs),
        _ => false,
    }
}

/// `all` is vector2-only: true iff both components are >= the rhs, where a
/// scalar rhs broadcasts to both components.
fn compare_all(signal: &SignalValue, rhs: Option<&Value>) -> bool {
    let Some(value) = signal.as_vector2() else {
        return false;
    };
    let Some(rhs) = rhs else { return false };
    let threshold = if let Some(n) = rhs.as_f64() {
        [n, n]
    } else if let Some(v) = cueproto::signal::as_vector2(rhs) {
        v
    } else {
        return false;
    };
    value[0] >= threshold[0] && value[1] >= threshold[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryJournal {
        fired: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    impl CooldownJournal for MemoryJournal {
        fn last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
            Ok(self.fired.lock().unwrap().get(rule_id).copied())
        }

        fn set_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
            self.fired.lock().unwrap().insert(rule_id.to_string(), at);
            Ok(())
        }
    }

    fn rule(json: serde_json::Value) -> Rule {
        serde_json::from_value(json).unwrap()
    }

    fn event_at(ts: DateTime<Utc>, signals: serde_json::Value) -> Event {
        serde_json::from_value(serde_json::json!({
            "deployable_id": "dep-1",
            "logic_id": "lobby",
            "tags": ["east"],
            "timestamp": ts,
            "signals": signals
        }))
        .unwrap()
    }

    fn button_event() -> Event {
        event_at(
            Utc::now(),
            serde_json::json!({"button": {"type": "bool", "value": true}}),
        )
    }

    fn state(name: &str) -> GlobalState {
        GlobalState::new(name)
    }

    #[test]
    fn test_simple_match_fires() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"}
        }))];
        let journal = MemoryJournal::default();
        let (next, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(fired);
        assert_eq!(next.state, "playing");
        // The engine does not stamp; that is the loop's job.
        assert_eq!(next.version, 1);
    }

    #[test]
    fn test_disabled_rule_skipped() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": false,
            "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"}
        }))];
        let journal = MemoryJournal::default();
        let (next, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(!fired);
        assert_eq!(next.state, "idle");
    }

    #[test]
    fn test_first_rule_by_id_wins() {
        let rules = vec![
            rule(serde_json::json!({
                "id": "r9", "enabled": true,
                "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
                "then": {"set_state": "late"}
            })),
            rule(serde_json::json!({
                "id": "r1", "enabled": true,
                "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
                "then": {"set_state": "early"}
            })),
        ];
        let journal = MemoryJournal::default();
        let (next, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(fired);
        assert_eq!(next.state, "early");
        // Only the winner's firing is journaled.
        assert!(journal.last_fired("r1").unwrap().is_some());
        assert!(journal.last_fired("r9").unwrap().is_none());
    }

    #[test]
    fn test_empty_group_never_matches() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": true, "when": {}, "then": {"set_state": "x"}
        }))];
        let journal = MemoryJournal::default();
        let (_, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(!fired);
    }

    #[test]
    fn test_state_only_rule_evaluated_without_signals() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{"state_is": "idle"}]},
            "then": {"set_state": "armed"}
        }))];
        let journal = MemoryJournal::default();
        let event = event_at(Utc::now(), serde_json::json!({}));
        let (next, fired) = evaluate(&state("idle"), &event, &rules, &journal).unwrap();
        assert!(fired);
        assert_eq!(next.state, "armed");
    }

    #[test]
    fn test_source_filters() {
        let base = serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{
                "signal": "button", "op": "equals", "value": true,
                "source": {"tags": ["west"]}
            }]},
            "then": {"set_state": "playing"}
        });
        let journal = MemoryJournal::default();
        let (_, fired) = evaluate(&state("idle"), &button_event(), &[rule(base)], &journal).unwrap();
        assert!(!fired, "tag filter without overlap must not match");

        let matching = rule(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{
                "signal": "button", "op": "equals", "value": true,
                "source": {"tags": ["east"], "logic_ids": ["lobby"], "deployable_ids": ["dep-1"]}
            }]},
            "then": {"set_state": "playing"}
        }));
        let (_, fired) = evaluate(&state("idle"), &button_event(), &[matching], &journal).unwrap();
        assert!(fired);
    }

    #[test]
    fn test_numeric_comparisons() {
        let mk = |op: &str, value: f64| {
            rule(serde_json::json!({
                "id": "r1", "enabled": true,
                "when": {"all": [{"signal": "level", "op": op, "value": value}]},
                "then": {"set_state": "hit"}
            }))
        };
        let event = event_at(
            Utc::now(),
            serde_json::json!({"level": {"type": "number", "value": 5.0}}),
        );
        let journal = MemoryJournal::default();
        assert!(evaluate(&state("idle"), &event, &[mk("gt", 4.0)], &journal).unwrap().1);
        assert!(!evaluate(&state("idle"), &event, &[mk("gt", 5.0)], &journal).unwrap().1);
        assert!(evaluate(&state("idle"), &event, &[mk("lt", 6.0)], &journal).unwrap().1);
        assert!(!evaluate(&state("idle"), &event, &[mk("bogus", 1.0)], &journal).unwrap().1);
    }

    #[test]
    fn test_vector_all_with_scalar_broadcast() {
        let mk = |value: serde_json::Value| {
            rule(serde_json::json!({
                "id": "r1", "enabled": true,
                "when": {"all": [{"signal": "pos", "op": "all", "value": value}]},
                "then": {"set_state": "hit"}
            }))
        };
        let event = event_at(
            Utc::now(),
            serde_json::json!({"pos": {"type": "vector2", "value": [3.0, 4.0]}}),
        );
        let journal = MemoryJournal::default();
        assert!(evaluate(&state("idle"), &event, &[mk(serde_json::json!(3.0))], &journal).unwrap().1);
        assert!(!evaluate(&state("idle"), &event, &[mk(serde_json::json!(3.5))], &journal).unwrap().1);
        assert!(evaluate(&state("idle"), &event, &[mk(serde_json::json!([3.0, 4.0]))], &journal).unwrap().1);
        assert!(!evaluate(&state("idle"), &event, &[mk(serde_json::json!([3.0, 4.5]))], &journal).unwrap().1);
    }

    #[test]
    fn test_missing_signal_no_match() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{"signal": "other", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"}
        }))];
        let journal = MemoryJournal::default();
        let (_, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(!fired);
    }

    #[test]
    fn test_any_group_matches_one_of() {
        let rules = vec![rule(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"any": [
                {"signal": "other", "op": "equals", "value": true},
                {"signal": "button", "op": "equals", "value": true}
            ]},
            "then": {"set_state": "playing"}
        }))];
        let journal = MemoryJournal::default();
        let (_, fired) = evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
        assert!(fired);
    }

    #[test]
    fn test_cooldown_window() {
        let rules = vec![rule(serde_json::json!({
            "id": "r2", "enabled": true,
            "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"},
            "timing": {"cooldown_ms": 1000}
        }))];
        let journal = MemoryJournal::default();
        let t0 = Utc::now();
        let signals = serde_json::json!({"button": {"type": "bool", "value": true}});

        let (_, fired) = evaluate(&state("idle"), &event_at(t0, signals.clone()), &rules, &journal).unwrap();
        assert!(fired, "first event fires");

        let t1 = t0 + Duration::milliseconds(500);
        let (_, fired) = evaluate(&state("idle"), &event_at(t1, signals.clone()), &rules, &journal).unwrap();
        assert!(!fired, "second event inside the cooldown is skipped");
        assert_eq!(journal.last_fired("r2").unwrap(), Some(t0));

        let t2 = t0 + Duration::milliseconds(1500);
        let (_, fired) = evaluate(&state("idle"), &event_at(t2, signals), &rules, &journal).unwrap();
        assert!(fired, "event after the cooldown fires again");
        assert_eq!(journal.last_fired("r2").unwrap(), Some(t2));
    }

    #[test]
    fn test_deterministic_for_same_inputs() {
        let rules = vec![
            rule(serde_json::json!({
                "id": "b", "enabled": true,
                "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
                "then": {"set_state": "two"}
            })),
            rule(serde_json::json!({
                "id": "a", "enabled": true,
                "when": {"all": [{"state_is": "idle"}]},
                "then": {"set_state": "one"}
            })),
        ];
        for _ in 0..10 {
            let journal = MemoryJournal::default();
            let (next, fired) =
                evaluate(&state("idle"), &button_event(), &rules, &journal).unwrap();
            assert!(fired);
            assert_eq!(next.state, "one");
        }
    }
}
