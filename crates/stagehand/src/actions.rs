//! Action dispatcher: routes engine-published actions to executors.
//!
//! Executor failures are never fatal: they are pushed onto an error
//! channel and forwarded to the server as `playback_error` frames, and the
//! dispatcher keeps consuming.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use cueproto::EngineAction;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::playback::{Manager, PlayRequest};

pub const ERROR_QUEUE: usize = 32;

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn action_name(&self) -> &'static str;
    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()>;
}

/// A failed action, forwarded upstream as `playback_error`.
#[derive(Debug, Clone)]
pub struct DispatchError {
    pub action: EngineAction,
    pub error: String,
}

pub struct Dispatcher {
    executors: HashMap<&'static str, Arc<dyn ActionExecutor>>,
}

impl Dispatcher {
    pub fn new(executors: Vec<Arc<dyn ActionExecutor>>) -> Self {
        let executors = executors
            .into_iter()
            .map(|executor| (executor.action_name(), executor))
            .collect();
        Self { executors }
    }

    /// Every executor the full default set registers, used to validate
    /// incoming show logic before accepting an assignment.
    pub fn supported_actions(&self) -> HashSet<String> {
        self.executors.keys().map(|name| name.to_string()).collect()
    }

    /// Consume engine actions until the channel closes or cancellation.
    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<EngineAction>,
        errors: mpsc::Sender<DispatchError>,
        cancel: CancellationToken,
    ) {
        loop {
            let action = tokio::select! {
                _ = cancel.cancelled() => return,
                action = incoming.recv() => match action {
                    Some(action) => action,
                    None => return,
                },
            };
            let Some(executor) = self.executors.get(action.action.as_str()) else {
                tracing::warn!(action = %action.action, "action executor not found");
                continue;
            };
            if let Err(err) = executor.execute(&action.target, &action.params).await {
                tracing::warn!(action = %action.action, target = %action.target,
                    "action failed: {}", err);
                let report = DispatchError {
                    action,
                    error: err.to_string(),
                };
                if errors.try_send(report).is_err() {
                    tracing::warn!("dispatch error queue full, report dropped");
                }
            }
        }
    }
}

/// The full executor set wired against one playback manager.
pub fn default_executors(player: Arc<Manager>) -> Vec<Arc<dyn ActionExecutor>> {
    vec![
        Arc::new(PlayVideo { player: player.clone() }),
        Arc::new(StopMedia { player: player.clone(), name: "stop_video" }),
        Arc::new(PlayAudio { player: player.clone() }),
        Arc::new(StopMedia { player: player.clone(), name: "stop_audio" }),
        Arc::new(SetVolume { player: player.clone() }),
        Arc::new(FadeVolume { player: player.clone(), name: "fade_volume" }),
        Arc::new(Seek { player: player.clone(), name: "seek" }),
        Arc::new(Pause { player: player.clone(), name: "pause" }),
        Arc::new(Resume { player: player.clone(), name: "resume" }),
        Arc::new(StopAll { player: player.clone() }),
        Arc::new(MediaPlay { player: player.clone() }),
        Arc::new(StopMedia { player: player.clone(), name: "media.stop" }),
        Arc::new(Pause { player: player.clone(), name: "media.pause" }),
        Arc::new(Resume { player: player.clone(), name: "media.resume" }),
        Arc::new(Seek { player: player.clone(), name: "media.seek" }),
        Arc::new(MediaSet { player: player.clone() }),
        Arc::new(FadeVolume { player, name: "media.fade" }),
    ]
}

struct PlayVideo {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for PlayVideo {
    fn action_name(&self) -> &'static str {
        "play_video"
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let request = play_request(params, "file", false)?;
        Ok(self.player.play(target, request).await?)
    }
}

struct PlayAudio {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for PlayAudio {
    fn action_name(&self) -> &'static str {
        "play_audio"
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let request = play_request(params, "file", true)?;
        Ok(self.player.play(target, request).await?)
    }
}

struct MediaPlay {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for MediaPlay {
    fn action_name(&self) -> &'static str {
        "media.play"
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let request = play_request(params, "asset", true)?;
        Ok(self.player.play(target, request).await?)
    }
}

struct StopMedia {
    player: Arc<Manager>,
    name: &'static str,
}

#[async_trait]
impl ActionExecutor for StopMedia {
    fn action_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, target: &str, _params: &Map<String, Value>) -> Result<()> {
        Ok(self.player.stop(target).await?)
    }
}

struct Pause {
    player: Arc<Manager>,
    name: &'static str,
}

#[async_trait]
impl ActionExecutor for Pause {
    fn action_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, target: &str, _params: &Map<String, Value>) -> Result<()> {
        Ok(self.player.pause(target).await?)
    }
}

struct Resume {
    player: Arc<Manager>,
    name: &'static str,
}

#[async_trait]
impl ActionExecutor for Resume {
    fn action_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, target: &str, _params: &Map<String, Value>) -> Result<()> {
        Ok(self.player.resume(target).await?)
    }
}

struct SetVolume {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for SetVolume {
    fn action_name(&self) -> &'static str {
        "set_volume"
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let volume = float_param(params, &["volume", "value"])?;
        Ok(self.player.set_volume(target, volume).await?)
    }
}

struct MediaSet {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for MediaSet {
    fn action_name(&self) -> &'static str {
        "media.set"
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        if params.contains_key("volume") {
            let volume = float_param(params, &["volume"])?;
            return Ok(self.player.set_volume(target, volume).await?);
        }
        bail!("media.set requires supported params")
    }
}

struct FadeVolume {
    player: Arc<Manager>,
    name: &'static str,
}

#[async_trait]
impl ActionExecutor for FadeVolume {
    fn action_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let to = float_param(params, &["target", "to"])?;
        let duration_ms = u64_param(params, &["duration_ms"]);
        Ok(self.player.fade_volume(target, to, duration_ms).await?)
    }
}

struct Seek {
    player: Arc<Manager>,
    name: &'static str,
}

#[async_trait]
impl ActionExecutor for Seek {
    fn action_name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, target: &str, params: &Map<String, Value>) -> Result<()> {
        let position_ms = u64_param(params, &["position_ms", "start_ms"]);
        Ok(self.player.seek(target, position_ms).await?)
    }
}

struct StopAll {
    player: Arc<Manager>,
}

#[async_trait]
impl ActionExecutor for StopAll {
    fn action_name(&self) -> &'static str {
        "stop_all"
    }

    /// Stops every known output; per-output failures are ignored.
    async fn execute(&self, _target: &str, _params: &Map<String, Value>) -> Result<()> {
        for output in self.player.list_outputs() {
            let _ = self.player.stop(&output.id).await;
        }
        Ok(())
    }
}

fn play_request(params: &Map<String, Value>, path_key: &str, allow_volume: bool) -> Result<PlayRequest> {
    let asset_path = params
        .get(path_key)
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
        .ok_or_else(|| anyhow!("play requires params.{}", path_key))?;
    let mut request = PlayRequest {
        asset_path: asset_path.to_string(),
        loop_playback: bool_param(params, "loop"),
        start_ms: u64_param(params, &["start_ms"]),
        volume: None,
        fade_in_ms: u64_param(params, &["fade_in_ms"]),
    };
    if allow_volume {
        request.volume = optional_float(params, "volume")?;
    }
    Ok(request)
}

fn bool_param(params: &Map<String, Value>, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn u64_param(params: &Map<String, Value>, keys: &[&str]) -> u64 {
    for key in keys {
        if let Some(value) = params.get(*key).and_then(Value::as_f64) {
            if value > 0.0 {
                return value as u64;
            }
            return 0;
        }
    }
    0
}

fn float_param(params: &Map<String, Value>, keys: &[&str]) -> Result<f64> {
    for key in keys {
        if let Some(raw) = params.get(*key) {
            return raw
                .as_f64()
                .ok_or_else(|| anyhow!("invalid numeric param: {}", raw));
        }
    }
    bail!("missing numeric param: {}", keys.join("/"))
}

fn optional_float(params: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .as_f64()
            .map(Some)
            .ok_or_else(|| anyhow!("invalid numeric param: {}", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{OutputDevice, StubBackend};
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<StubBackend>, Arc<Manager>, Dispatcher) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        let backend = Arc::new(StubBackend::new());
        let manager = Arc::new(Manager::new(dir.path(), backend.clone()));
        manager.configure_outputs(vec![
            OutputDevice {
                id: "display-0".to_string(),
                name: "HDMI".to_string(),
                kind: "video".to_string(),
                index: 0,
            },
            OutputDevice {
                id: "audio-0".to_string(),
                name: "Speakers".to_string(),
                kind: "audio".to_string(),
                index: 0,
            },
        ]);
        let dispatcher = Dispatcher::new(default_executors(manager.clone()));
        (dir, backend, manager, dispatcher)
    }

    #[tokio::test]
    async fn test_supported_actions_cover_wire_names() {
        let (_dir, _backend, _manager, dispatcher) = setup();
        let supported = dispatcher.supported_actions();
        for name in [
            "play_video", "stop_video", "play_audio", "stop_audio", "set_volume",
            "fade_volume", "seek", "pause", "resume", "stop_all",
            "media.play", "media.stop", "media.pause", "media.resume",
            "media.seek", "media.set", "media.fade",
        ] {
            assert!(supported.contains(name), "missing executor: {}", name);
        }
    }

    #[tokio::test]
    async fn test_dispatch_executes_and_reports_errors() {
        let (_dir, backend, _manager, dispatcher) = setup();
        let (action_tx, action_rx) = mpsc::channel(16);
        let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(action_rx, error_tx, cancel.clone()));

        action_tx
            .send(EngineAction {
                action: "play_video".to_string(),
                target: "display-0".to_string(),
                params: params(json!({"file": "a.mp4"})),
            })
            .await
            .unwrap();
        action_tx
            .send(EngineAction {
                action: "play_video".to_string(),
                target: "display-0".to_string(),
                params: params(json!({"file": "missing.mp4"})),
            })
            .await
            .unwrap();

        let failure = tokio::time::timeout(std::time::Duration::from_secs(1), error_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.action.action, "play_video");
        assert!(failure.error.contains("missing.mp4"));
        assert_eq!(backend.stats().opened(), 1, "first play succeeded");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_action_dropped_without_error_report() {
        let (_dir, _backend, _manager, dispatcher) = setup();
        let (action_tx, action_rx) = mpsc::channel(16);
        let (error_tx, mut error_rx) = mpsc::channel(ERROR_QUEUE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(dispatcher.run(action_rx, error_tx, cancel.clone()));

        action_tx
            .send(EngineAction {
                action: "levitate".to_string(),
                target: "stage".to_string(),
                params: Map::new(),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(error_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_ignores_per_output_errors() {
        let (_dir, backend, manager, _dispatcher) = setup();
        manager
            .play(
                "display-0",
                PlayRequest {
                    asset_path: "a.mp4".to_string(),
                    ..PlayRequest::default()
                },
            )
            .await
            .unwrap();
        let stop_all = StopAll { player: manager };
        stop_all.execute("", &Map::new()).await.unwrap();
        assert_eq!(backend.stats().live(), 0);
    }

    #[test]
    fn test_play_request_parsing() {
        let request = play_request(
            &params(json!({"file": "a.mp4", "loop": true, "start_ms": 250, "fade_in_ms": 100,
                           "volume": 0.5})),
            "file",
            true,
        )
        .unwrap();
        assert!(request.loop_playback);
        assert_eq!(request.start_ms, 250);
        assert_eq!(request.fade_in_ms, 100);
        assert_eq!(request.volume, Some(0.5));

        // Video play ignores volume.
        let request = play_request(
            &params(json!({"file": "a.mp4", "volume": 0.5})),
            "file",
            false,
        )
        .unwrap();
        assert_eq!(request.volume, None);

        assert!(play_request(&params(json!({})), "file", false).is_err());
        assert!(play_request(&params(json!({"file": "a.mp4", "volume": "loud"})), "file", true).is_err());
    }
}
