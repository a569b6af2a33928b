//! The state loop: a single task owning the authoritative global state.
//!
//! Events and operator overrides are serialized through this one task, so
//! every observer sees a total order consistent with version numbers.
//! Persistence precedes broadcast; a failed snapshot suppresses the
//! broadcast and leaves the in-memory state unchanged.

use std::sync::Arc;

use chrono::Utc;
use cueproto::{Event, GlobalState};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rules;
use crate::store::RulesStore;

/// Queue capacity for ingested events.
pub const EVENT_QUEUE: usize = 128;
/// Queue capacity for operator overrides.
pub const OVERRIDE_QUEUE: usize = 16;

/// Sink for committed states; the server wires in the fan-out here.
pub trait Broadcaster: Send + Sync {
    fn broadcast_state(&self, state: &GlobalState);
}

/// An operator-forced state change. Empty fields leave current values.
#[derive(Debug, Clone, Default)]
pub struct StateOverride {
    pub state: Option<String>,
    pub variables: Option<Map<String, Value>>,
}

pub struct StateLoop {
    store: Arc<dyn RulesStore>,
    broadcaster: Arc<dyn Broadcaster>,
    initial: GlobalState,
    events: mpsc::Receiver<Event>,
    overrides: mpsc::Receiver<StateOverride>,
}

/// Handles the HTTP layer uses to feed the loop.
#[derive(Clone)]
pub struct LoopHandles {
    pub events: mpsc::Sender<Event>,
    pub overrides: mpsc::Sender<StateOverride>,
}

impl LoopHandles {
    /// Non-blocking override enqueue; `false` means the queue is full and
    /// the caller should surface 503.
    pub fn try_override(&self, value: StateOverride) -> bool {
        self.overrides.try_send(value).is_ok()
    }
}

impl StateLoop {
    pub fn new(
        store: Arc<dyn RulesStore>,
        broadcaster: Arc<dyn Broadcaster>,
        initial: GlobalState,
    ) -> (Self, LoopHandles) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (overrides_tx, overrides_rx) = mpsc::channel(OVERRIDE_QUEUE);
        let state_loop = Self {
            store,
            broadcaster,
            initial,
            events: events_rx,
            overrides: overrides_rx,
        };
        let handles = LoopHandles {
            events: events_tx,
            overrides: overrides_tx,
        };
        (state_loop, handles)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut current = match self.store.load_state_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => self.initial.clone(),
            Err(err) => {
                warn!("state: snapshot load failed, using initial: {}", err);
                self.initial.clone()
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                override_msg = self.overrides.recv() => {
                    let Some(override_msg) = override_msg else { return };
                    self.apply_override(&mut current, override_msg);
                }
                event = self.events.recv() => {
                    let Some(event) = event else { return };
                    self.apply_event(&mut current, event);
                }
            }
        }
    }

    /// Overrides always bump the version and rebroadcast, even when nothing
    /// changed, so operators can force a re-push to the fleet.
    fn apply_override(&self, current: &mut GlobalState, override_msg: StateOverride) {
        let mut next = current.clone();
        if let Some(state) = override_msg.state {
            if !state.is_empty() {
                next.state = state;
            }
        }
        if let Some(variables) = override_msg.variables {
            next.variables = variables;
        }
        let changed = next.state != current.state || next.variables != current.variables;
        next.timestamp = Utc::now();
        next.version = current.version + 1;
        if changed {
            info!("state: override {} -> {} (v{})", current.state, next.state, next.version);
        } else {
            info!("state: override (forced) {} (v{})", next.state, next.version);
        }
        self.commit(current, next);
    }

    fn apply_event(&self, current: &mut GlobalState, event: Event) {
        let rules = match self.store.list_rules() {
            Ok(rules) => rules,
            Err(err) => {
                warn!("state: rules load failed, dropping event: {}", err);
                return;
            }
        };
        let (mut next, fired) =
            match rules::evaluate(current, &event, &rules, self.store.as_ref()) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!("state: evaluation failed, dropping event: {}", err);
                    return;
                }
            };
        if !fired {
            return;
        }
        next.timestamp = Utc::now();
        next.version = current.version + 1;
        info!("state: rule {} -> {} (v{})", current.state, next.state, next.version);
        self.commit(current, next);
    }

    /// Persist then broadcast. A persist failure suppresses the broadcast
    /// and does not advance the in-memory state, so any observer that
    /// reconnects and reads the snapshot sees exactly what was announced.
    fn commit(&self, current: &mut GlobalState, next: GlobalState) {
        if let Err(err) = self.store.save_state_snapshot(&next) {
            warn!("state: snapshot persist failed, broadcast suppressed: {}", err);
            return;
        }
        self.broadcaster.broadcast_state(&next);
        *current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreError, StoreResult};
    use chrono::{DateTime, Utc};
    use cueproto::{DeployableContext, Rule, SignalDefinition};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rules: Mutex<Vec<Rule>>,
        snapshot: Mutex<Option<GlobalState>>,
        fired: Mutex<HashMap<String, DateTime<Utc>>>,
        fail_persist: AtomicBool,
    }

    impl RulesStore for MemoryStore {
        fn list_rules(&self) -> StoreResult<Vec<Rule>> {
            Ok(self.rules.lock().unwrap().clone())
        }

        fn save_rules(&self, rules: &[Rule]) -> StoreResult<()> {
            *self.rules.lock().unwrap() = rules.to_vec();
            Ok(())
        }

        fn load_state_snapshot(&self) -> StoreResult<Option<GlobalState>> {
            Ok(self.snapshot.lock().unwrap().clone())
        }

        fn save_state_snapshot(&self, state: &GlobalState) -> StoreResult<()> {
            if self.fail_persist.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            *self.snapshot.lock().unwrap() = Some(state.clone());
            Ok(())
        }

        fn rule_last_fired(&self, rule_id: &str) -> StoreResult<Option<DateTime<Utc>>> {
            Ok(self.fired.lock().unwrap().get(rule_id).copied())
        }

        fn set_rule_last_fired(&self, rule_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
            self.fired.lock().unwrap().insert(rule_id.to_string(), at);
            Ok(())
        }

        fn deployable_context(&self, _id: &str) -> StoreResult<Option<DeployableContext>> {
            Ok(None)
        }

        fn save_deployable_context(&self, _context: &DeployableContext) -> StoreResult<()> {
            Ok(())
        }

        fn signal_definitions(&self, _id: &str) -> StoreResult<Option<Vec<SignalDefinition>>> {
            Ok(None)
        }

        fn save_signal_definitions(
            &self,
            _id: &str,
            _defs: &[SignalDefinition],
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<GlobalState>>,
    }

    impl Broadcaster for Recorder {
        fn broadcast_state(&self, state: &GlobalState) {
            self.states.lock().unwrap().push(state.clone());
        }
    }

    fn button_rule() -> Rule {
        serde_json::from_value(serde_json::json!({
            "id": "r1", "enabled": true,
            "when": {"all": [{"signal": "button", "op": "equals", "value": true}]},
            "then": {"set_state": "playing"}
        }))
        .unwrap()
    }

    fn button_event() -> Event {
        serde_json::from_value(serde_json::json!({
            "deployable_id": "dep-1",
            "timestamp": Utc::now(),
            "signals": {"button": {"type": "bool", "value": true}}
        }))
        .unwrap()
    }

    async fn run_loop(
        store: Arc<MemoryStore>,
        recorder: Arc<Recorder>,
    ) -> (LoopHandles, CancellationToken, tokio::task::JoinHandle<()>) {
        let (state_loop, handles) = StateLoop::new(
            store,
            recorder,
            GlobalState::new("idle"),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(state_loop.run(cancel.clone()));
        (handles, cancel, task)
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_event_fires_and_bumps_version() {
        let store = Arc::new(MemoryStore::default());
        store.save_rules(&[button_rule()]).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store.clone(), recorder.clone()).await;

        handles.events.send(button_event()).await.unwrap();
        settle().await;

        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].state, "playing");
        assert_eq!(states[0].version, 2);
        assert_eq!(
            store.load_state_snapshot().unwrap().unwrap().version,
            2,
            "snapshot persisted before broadcast"
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_matching_event_discarded() {
        let store = Arc::new(MemoryStore::default());
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store, recorder.clone()).await;

        handles.events.send(button_event()).await.unwrap();
        settle().await;

        assert!(recorder.states.lock().unwrap().is_empty());
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_override_always_bumps_and_rebroadcasts() {
        let store = Arc::new(MemoryStore::default());
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store, recorder.clone()).await;

        // Identical state: still bumps and rebroadcasts (forced re-push).
        assert!(handles.try_override(StateOverride {
            state: Some("idle".to_string()),
            variables: None,
        }));
        assert!(handles.try_override(StateOverride::default()));
        settle().await;

        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, "idle");
        assert_eq!(states[0].version, 2);
        assert_eq!(states[1].version, 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_failure_suppresses_and_does_not_advance() {
        let store = Arc::new(MemoryStore::default());
        store.save_rules(&[button_rule()]).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store.clone(), recorder.clone()).await;

        store.fail_persist.store(true, Ordering::SeqCst);
        handles.events.send(button_event()).await.unwrap();
        settle().await;
        assert!(recorder.states.lock().unwrap().is_empty());

        // Once persistence recovers the next transition starts from the
        // un-advanced version.
        store.fail_persist.store(false, Ordering::SeqCst);
        handles.events.send(button_event()).await.unwrap();
        settle().await;

        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].version, 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_versions_strictly_monotonic_across_mixed_inputs() {
        let store = Arc::new(MemoryStore::default());
        store.save_rules(&[button_rule()]).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store, recorder.clone()).await;

        for _ in 0..3 {
            handles.events.send(button_event()).await.unwrap();
            handles.try_override(StateOverride {
                state: Some("idle".to_string()),
                variables: None,
            });
        }
        settle().await;

        let states = recorder.states.lock().unwrap().clone();
        assert!(!states.is_empty());
        for pair in states.windows(2) {
            assert!(pair[1].version > pair[0].version);
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_resumed_on_start() {
        let store = Arc::new(MemoryStore::default());
        let mut resumed = GlobalState::new("showtime");
        resumed.version = 41;
        store.save_state_snapshot(&resumed).unwrap();
        let recorder = Arc::new(Recorder::default());
        let (handles, cancel, task) = run_loop(store, recorder.clone()).await;

        handles.try_override(StateOverride::default());
        settle().await;

        let states = recorder.states.lock().unwrap().clone();
        assert_eq!(states[0].state, "showtime");
        assert_eq!(states[0].version, 42);

        cancel.cancel();
        task.await.unwrap();
    }
}
