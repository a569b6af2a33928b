//! The show-logic interpreter.
//!
//! Owns the current state and the live timer set. A global-state update
//! runs `on_exit` of the previous state, cancels its timers, then runs
//! `on_enter` of the new state and arms its declared timers. Timers are
//! one-shot tasks that re-enter through [`Engine::on_timer`], the same
//! entry point sensor events use, so everything synchronizes on one mutex.
//!
//! The engine never executes anything itself: actions are published onto a
//! bounded channel and the dispatcher is the consumer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cueproto::{
    EngineAction, GlobalStateUpdate, SensorEvent, ShowLogicDefinition, ShowState, TimerEvent,
    ValidationError,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const ACTION_QUEUE: usize = 256;

#[derive(Default)]
struct EngineState {
    definition: ShowLogicDefinition,
    index: HashMap<String, ShowState>,
    current: String,
    running: bool,
    timers: HashMap<String, CancellationToken>,
}

pub struct Engine {
    state: Mutex<EngineState>,
    actions: mpsc::Sender<EngineAction>,
    /// Self-handle for the timer tasks armed on state entry.
    weak: Weak<Engine>,
}

impl Engine {
    /// Create an engine and the receiving end of its action channel.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<EngineAction>) {
        let (tx, rx) = mpsc::channel(ACTION_QUEUE);
        let engine = Arc::new_cyclic(|weak| Self {
            state: Mutex::new(EngineState::default()),
            actions: tx,
            weak: weak.clone(),
        });
        (engine, rx)
    }

    /// Install a definition. Structural validation only; action support is
    /// checked by the assignment flow before this is called.
    pub fn load(&self, definition: ShowLogicDefinition) -> Result<(), ValidationError> {
        definition.validate(None)?;
        let index: HashMap<String, ShowState> = definition
            .states
            .iter()
            .map(|state| (state.name.clone(), state.clone()))
            .collect();
        let mut state = self.state.lock().unwrap();
        state.definition = definition;
        state.index = index;
        Ok(())
    }

    /// Mark running and, when an initial state is known, drive a synthetic
    /// version-0 update so its `on_enter` fires.
    pub fn start(&self, initial_state: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.running = true;
        }
        if !initial_state.is_empty() {
            self.on_global_state(GlobalStateUpdate {
                state: initial_state.to_string(),
                version: 0,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        for token in state.timers.values() {
            token.cancel();
        }
        state.timers.clear();
        state.running = false;
        state.current.clear();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn current_state(&self) -> String {
        self.state.lock().unwrap().current.clone()
    }

    /// Apply a fleet state transition.
    ///
    /// Same-name updates are idempotent; unknown states are logged and
    /// skipped (fail-open) so a stale document never wedges the device.
    pub fn on_global_state(&self, update: GlobalStateUpdate) {
        let (prev, next) = {
            let state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            if update.state == state.current {
                return;
            }
            let Some(next) = state.index.get(&update.state).cloned() else {
                drop(state);
                tracing::warn!(state = %update.state, "state not in show logic, skipped");
                return;
            };
            let prev = if state.current.is_empty() {
                None
            } else {
                state.index.get(&state.current).cloned()
            };
            (prev, next)
        };

        if let Some(prev) = prev {
            self.publish_actions(&prev.on_exit);
            self.cancel_timers();
        }

        {
            let mut state = self.state.lock().unwrap();
            state.current = next.name.clone();
        }

        self.publish_actions(&next.on_enter);
        self.arm_timers(&next);
    }

    /// Run every matching sensor handler of the current state with no
    /// short-circuit, two matching handlers both run.
    pub fn on_sensor_event(&self, event: &SensorEvent) {
        let handlers = {
            let state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state
                .index
                .get(&state.current)
                .map(|s| s.sensor_handlers.clone())
                .unwrap_or_default()
        };
        for handler in &handlers {
            if !handler.sensor_id.is_empty() && handler.sensor_id != event.sensor_id {
                continue;
            }
            if !handler.event_type.is_empty() && handler.event_type != event.event_type {
                continue;
            }
            if !condition_matches(&handler.condition, &event.value) {
                continue;
            }
            self.publish_actions(&handler.actions);
        }
    }

    /// Timer firings match handlers by exact id.
    pub fn on_timer(&self, event: &TimerEvent) {
        let handlers = {
            let state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state
                .index
                .get(&state.current)
                .map(|s| s.timer_handlers.clone())
                .unwrap_or_default()
        };
        for handler in &handlers {
            if handler.timer_id == event.timer_id {
                self.publish_actions(&handler.actions);
            }
        }
    }

    fn publish_actions(&self, actions: &[cueproto::ActionTemplate]) {
        for action in actions {
            let engine_action = EngineAction {
                action: action.action.clone(),
                target: action.target.clone(),
                params: action.params.clone(),
            };
            if self.actions.try_send(engine_action).is_err() {
                tracing::warn!(action = %action.action, "action queue full, dropped");
            }
        }
    }

    /// Arm the state's declared one-shot timers. Non-positive delays are
    /// not armed.
    fn arm_timers(&self, state: &ShowState) {
        let mut engine_state = self.state.lock().unwrap();
        for timer in &state.timers {
            if timer.delay_ms <= 0 {
                continue;
            }
            let Some(engine) = self.weak.upgrade() else {
                return;
            };
            let token = CancellationToken::new();
            engine_state
                .timers
                .insert(timer.timer_id.clone(), token.clone());
            let timer_id = timer.timer_id.clone();
            let delay = Duration::from_millis(timer.delay_ms as u64);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        engine.on_timer(&TimerEvent {
                            timer_id,
                            timestamp: chrono::Utc::now(),
                        });
                    }
                }
            });
        }
    }

    fn cancel_timers(&self) {
        let mut state = self.state.lock().unwrap();
        for token in state.timers.values() {
            token.cancel();
        }
        state.timers.clear();
    }
}

/// Sensor handler conditions: empty matches everything; an `eq` entry must
/// equal the event value exactly.
fn condition_matches(condition: &serde_json::Map<String, serde_json::Value>, value: &serde_json::Value) -> bool {
    if condition.is_empty() {
        return true;
    }
    match condition.get("eq") {
        Some(expected) => expected == value,
        None => true,
    }
}
