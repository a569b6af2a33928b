//! Engine → dispatcher → playback channel, wired the way main wires it.
//!
//! Exercises the local data flow end to end: a state transition publishes
//! actions, the dispatcher routes them to executors, and the playback
//! channel keeps at most one backend instance per output.

use std::sync::Arc;
use std::time::Duration;

use cueproto::{GlobalStateUpdate, ShowLogicDefinition};
use stagehand::actions::{default_executors, Dispatcher, ERROR_QUEUE};
use stagehand::engine::Engine;
use stagehand::playback::{Manager, OutputDevice, StubBackend};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn definition() -> ShowLogicDefinition {
    serde_json::from_value(serde_json::json!({
        "logic_id": "lobby",
        "version": 1,
        "states": [
            {
                "name": "attract",
                "on_enter": [{"action": "play_video", "target": "display-0",
                              "params": {"file": "attract.mp4", "loop": true}}],
                "on_exit": [{"action": "stop_video", "target": "display-0"}]
            },
            {
                "name": "feature",
                "on_enter": [{"action": "play_video", "target": "display-0",
                              "params": {"file": "feature.mp4"}}]
            }
        ]
    }))
    .unwrap()
}

fn update(state: &str, version: u64) -> GlobalStateUpdate {
    GlobalStateUpdate {
        state: state.to_string(),
        version,
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn state_transitions_drive_playback_with_exclusivity() {
    let assets = tempfile::TempDir::new().unwrap();
    std::fs::write(assets.path().join("attract.mp4"), b"a").unwrap();
    std::fs::write(assets.path().join("feature.mp4"), b"f").unwrap();

    let backend = Arc::new(StubBackend::new());
    let player = Arc::new(Manager::new(assets.path(), backend.clone()));
    player.configure_outputs(vec![OutputDevice {
        id: "display-0".to_string(),
        name: "HDMI".to_string(),
        kind: "video".to_string(),
        index: 0,
    }]);

    let (engine, engine_actions) = Engine::new();
    let dispatcher = Dispatcher::new(default_executors(player.clone()));
    let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE);
    let cancel = CancellationToken::new();
    let dispatch_task = tokio::spawn(dispatcher.run(engine_actions, error_tx, cancel.clone()));

    engine.load(definition()).unwrap();
    engine.start("attract");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.stats().live(), 1);

    engine.on_global_state(update("feature", 2));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = backend.stats();
    assert_eq!(stats.opened(), 2);
    assert_eq!(stats.live(), 1, "exactly one instance after the transition");
    assert_eq!(stats.max_live(), 1, "old media stopped before new opened");
    assert!(error_rx.try_recv().is_err(), "no playback errors reported");

    // Stop ordering: the attract instance was stopped and closed before the
    // feature instance opened.
    let ops = backend.stats().operations();
    let close_at = ops.iter().position(|op| op == "close").unwrap();
    let reopen_at = ops
        .iter()
        .position(|op| op.starts_with("open(feature.mp4"))
        .unwrap();
    assert!(close_at < reopen_at);

    cancel.cancel();
    dispatch_task.await.unwrap();
}

#[tokio::test]
async fn missing_asset_reports_error_and_keeps_channel_usable() {
    let assets = tempfile::TempDir::new().unwrap();
    std::fs::write(assets.path().join("good.mp4"), b"g").unwrap();

    let backend = Arc::new(StubBackend::new());
    let player = Arc::new(Manager::new(assets.path(), backend.clone()));
    player.configure_outputs(vec![OutputDevice {
        id: "display-0".to_string(),
        name: "HDMI".to_string(),
        kind: "video".to_string(),
        index: 0,
    }]);

    let (engine, engine_actions) = Engine::new();
    let dispatcher = Dispatcher::new(default_executors(player.clone()));
    let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE);
    let cancel = CancellationToken::new();
    let dispatch_task = tokio::spawn(dispatcher.run(engine_actions, error_tx, cancel.clone()));

    let definition: ShowLogicDefinition = serde_json::from_value(serde_json::json!({
        "logic_id": "lobby",
        "version": 1,
        "states": [
            {"name": "broken",
             "on_enter": [{"action": "play_video", "target": "display-0",
                           "params": {"file": "nope.mp4"}}]},
            {"name": "good",
             "on_enter": [{"action": "play_video", "target": "display-0",
                           "params": {"file": "good.mp4"}}]}
        ]
    }))
    .unwrap();
    engine.load(definition).unwrap();
    engine.start("broken");

    let failure = tokio::time::timeout(Duration::from_secs(1), error_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.action.action, "play_video");
    assert!(failure.error.contains("nope.mp4"));

    // The channel stays usable after the failure.
    engine.on_global_state(update("good", 2));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.stats().live(), 1);

    cancel.cancel();
    dispatch_task.await.unwrap();
}
