//! Playback manager: one single-consumer channel task per output device.
//!
//! The manager only resolves targets and forwards commands; each channel
//! task exclusively owns at most one live [`BackendInstance`] and serializes
//! every operation through a bounded command queue with per-call replies, so
//! callers observe completion synchronously and no two operations ever race
//! on one output.

pub mod backend;
pub mod vlc;

pub use backend::{BackendInstance, MediaBackend, StubBackend};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const COMMAND_QUEUE: usize = 16;
/// Fades step at most this often; shorter fades use fewer steps.
const FADE_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDevice {
    pub id: String,
    pub name: String,
    /// "video" or "audio".
    pub kind: String,
    pub index: u32,
}

/// Parameters for starting playback on one output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayRequest {
    pub asset_path: String,
    pub loop_playback: bool,
    pub start_ms: u64,
    pub volume: Option<f64>,
    pub fade_in_ms: u64,
}

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("output not found: {0}")]
    OutputNotFound(String),
    #[error("no active media")]
    NoActiveMedia,
    #[error("asset_path required")]
    EmptyAssetPath,
    #[error("invalid asset path: {0}")]
    InvalidAssetPath(String),
    #[error("asset not found: {0}")]
    AssetNotFound(String),
    #[error("asset path is a directory: {0}")]
    AssetIsDirectory(String),
    #[error("playback backend error: {0}")]
    Backend(String),
    #[error("playback channel closed")]
    ChannelClosed,
}

type Reply = oneshot::Sender<Result<(), PlaybackError>>;

enum Command {
    Play { request: PlayRequest, reply: Reply },
    Stop { reply: Reply },
    Pause { reply: Reply },
    Resume { reply: Reply },
    SetVolume { volume: f64, reply: Reply },
    FadeVolume { target: f64, duration_ms: u64, reply: Reply },
    Seek { position_ms: u64, reply: Reply },
    Snapshot { reply: oneshot::Sender<ChannelSnapshot> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub output: OutputDevice,
    pub active: bool,
    pub volume: f64,
}

struct ManagerInner {
    outputs: HashMap<String, OutputDevice>,
    channels: HashMap<String, mpsc::Sender<Command>>,
    aliases: HashMap<String, String>,
}

pub struct Manager {
    assets_dir: PathBuf,
    backend: Arc<dyn MediaBackend>,
    inner: Mutex<ManagerInner>,
}

impl Manager {
    pub fn new(assets_dir: impl Into<PathBuf>, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            backend,
            inner: Mutex::new(ManagerInner {
                outputs: HashMap::new(),
                channels: HashMap::new(),
                aliases: HashMap::new(),
            }),
        }
    }

    /// Register outputs and spawn a channel task for each new one. Alias
    /// cache resets because resolution may change with the device set.
    pub fn configure_outputs(&self, outputs: Vec<OutputDevice>) {
        let mut inner = self.inner.lock().unwrap();
        inner.aliases.clear();
        for output in outputs {
            if output.id.is_empty() {
                continue;
            }
            if !inner.channels.contains_key(&output.id) {
                let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
                let channel = Channel {
                    output: output.clone(),
                    backend: self.backend.clone(),
                    assets_dir: self.assets_dir.clone(),
                    rx,
                    instance: None,
                    volume: 1.0,
                    fade: None,
                };
                tokio::spawn(channel.run());
                inner.channels.insert(output.id.clone(), tx);
            }
            inner.outputs.insert(output.id.clone(), output);
        }
    }

    pub fn list_outputs(&self) -> Vec<OutputDevice> {
        let inner = self.inner.lock().unwrap();
        let mut outputs: Vec<OutputDevice> = inner.outputs.values().cloned().collect();
        outputs.sort_by(|a, b| a.id.cmp(&b.id));
        outputs
    }

    pub async fn play(&self, target: &str, request: PlayRequest) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::Play { request, reply })
            .await
    }

    pub async fn stop(&self, target: &str) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::Stop { reply }).await
    }

    pub async fn pause(&self, target: &str) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self, target: &str) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::Resume { reply }).await
    }

    pub async fn set_volume(&self, target: &str, volume: f64) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::SetVolume { volume, reply })
            .await
    }

    pub async fn fade_volume(
        &self,
        target: &str,
        to: f64,
        duration_ms: u64,
    ) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::FadeVolume {
            target: to,
            duration_ms,
            reply,
        })
        .await
    }

    pub async fn seek(&self, target: &str, position_ms: u64) -> Result<(), PlaybackError> {
        self.dispatch(target, |reply| Command::Seek { position_ms, reply })
            .await
    }

    /// Channel state for the status endpoint.
    pub async fn snapshot(&self) -> serde_json::Value {
        let channels: Vec<(String, mpsc::Sender<Command>)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .channels
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };
        let mut snapshots = serde_json::Map::new();
        for (id, tx) in channels {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Snapshot { reply }).await.is_err() {
                continue;
            }
            if let Ok(snapshot) = rx.await {
                if let Ok(value) = serde_json::to_value(&snapshot) {
                    snapshots.insert(id, value);
                }
            }
        }
        serde_json::json!({
            "outputs": self.list_outputs(),
            "channels": snapshots,
        })
    }

    async fn dispatch(
        &self,
        target: &str,
        build: impl FnOnce(Reply) -> Command,
    ) -> Result<(), PlaybackError> {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            let resolved = resolve_output(&mut inner, target)
                .ok_or_else(|| PlaybackError::OutputNotFound(target.to_string()))?;
            inner
                .channels
                .get(&resolved)
                .cloned()
                .ok_or_else(|| PlaybackError::OutputNotFound(target.to_string()))?
        };
        let (reply, rx) = oneshot::channel();
        tx.send(build(reply))
            .await
            .map_err(|_| PlaybackError::ChannelClosed)?;
        rx.await.map_err(|_| PlaybackError::ChannelClosed)?
    }
}

/// Resolution order: exact id, alias cache, lowercased name, then the
/// `display-N` / `audio-N` / `hdmiN` prefix heuristics.
fn resolve_output(inner: &mut ManagerInner, target: &str) -> Option<String> {
    if target.is_empty() {
        return None;
    }
    if inner.outputs.contains_key(target) {
        return Some(target.to_string());
    }
    if let Some(resolved) = inner.aliases.get(target) {
        return Some(resolved.clone());
    }
    let lower = target.trim().to_lowercase();
    let candidate = if lower.starts_with("hdmi") || lower.starts_with("display") {
        parse_indexed_suffix(&lower).map(|idx| format!("display-{}", idx))
    } else if lower.starts_with("audio") {
        parse_indexed_suffix(&lower).map(|idx| format!("audio-{}", idx))
    } else {
        None
    };
    if let Some(id) = candidate {
        if inner.outputs.contains_key(&id) {
            inner.aliases.insert(target.to_string(), id.clone());
            return Some(id);
        }
    }
    let by_name = inner
        .outputs
        .values()
        .find(|output| output.name.to_lowercase() == lower)
        .map(|output| output.id.clone());
    if let Some(id) = by_name {
        inner.aliases.insert(target.to_string(), id.clone());
        return Some(id);
    }
    None
}

fn parse_indexed_suffix(value: &str) -> Option<u32> {
    let digits: String = value
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Validate a playback asset path and resolve it under the assets root.
///
/// Rejects empty, absolute, and `..`-carrying paths, anything whose joined
/// form escapes the root, missing files, and directories.
pub fn validate_asset_path(assets_dir: &Path, asset: &str) -> Result<PathBuf, PlaybackError> {
    if asset.is_empty() {
        return Err(PlaybackError::EmptyAssetPath);
    }
    let relative = Path::new(asset);
    if relative.is_absolute() {
        return Err(PlaybackError::InvalidAssetPath(asset.to_string()));
    }
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(PlaybackError::InvalidAssetPath(asset.to_string())),
        }
    }
    let full = assets_dir.join(relative);
    // Canonical check catches symlinked escapes the component walk cannot.
    let canonical = full
        .canonicalize()
        .map_err(|_| PlaybackError::AssetNotFound(asset.to_string()))?;
    let root = assets_dir
        .canonicalize()
        .map_err(|_| PlaybackError::AssetNotFound(asset.to_string()))?;
    if !canonical.starts_with(&root) {
        return Err(PlaybackError::InvalidAssetPath(asset.to_string()));
    }
    if canonical.is_dir() {
        return Err(PlaybackError::AssetIsDirectory(asset.to_string()));
    }
    Ok(canonical)
}

pub(crate) fn clamp_volume(volume: f64) -> f64 {
    volume.clamp(0.0, 1.0)
}

struct Fade {
    target: f64,
    delta: f64,
    steps_left: u32,
    interval: tokio::time::Interval,
}

struct Channel {
    output: OutputDevice,
    backend: Arc<dyn MediaBackend>,
    assets_dir: PathBuf,
    rx: mpsc::Receiver<Command>,
    instance: Option<Box<dyn BackendInstance>>,
    volume: f64,
    fade: Option<Fade>,
}

enum Wake {
    Command(Option<Command>),
    FadeTick,
}

impl Channel {
    async fn run(mut self) {
        loop {
            let wake = if let Some(fade) = self.fade.as_mut() {
                tokio::select! {
                    command = self.rx.recv() => Wake::Command(command),
                    _ = fade.interval.tick() => Wake::FadeTick,
                }
            } else {
                Wake::Command(self.rx.recv().await)
            };
            match wake {
                Wake::Command(Some(command)) => self.handle(command).await,
                Wake::Command(None) => break,
                Wake::FadeTick => self.step_fade().await,
            }
        }
        let _ = self.stop_instance().await;
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Play { request, reply } => {
                let _ = reply.send(self.handle_play(request).await);
            }
            Command::Stop { reply } => {
                let _ = reply.send(self.stop_instance().await);
            }
            Command::Pause { reply } => {
                let result = match self.instance.as_mut() {
                    Some(instance) => instance.pause().await,
                    None => Err(PlaybackError::NoActiveMedia),
                };
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = match self.instance.as_mut() {
                    Some(instance) => instance.resume().await,
                    None => Err(PlaybackError::NoActiveMedia),
                };
                let _ = reply.send(result);
            }
            Command::SetVolume { volume, reply } => {
                let result = match self.instance.as_mut() {
                    Some(instance) => {
                        self.volume = clamp_volume(volume);
                        instance.set_volume(self.volume).await
                    }
                    None => Err(PlaybackError::NoActiveMedia),
                };
                let _ = reply.send(result);
            }
            Command::FadeVolume {
                target,
                duration_ms,
                reply,
            } => {
                let _ = reply.send(self.handle_fade(target, duration_ms).await);
            }
            Command::Seek { position_ms, reply } => {
                let result = match self.instance.as_mut() {
                    Some(instance) => instance.seek(position_ms).await,
                    None => Err(PlaybackError::NoActiveMedia),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(ChannelSnapshot {
                    output: self.output.clone(),
                    active: self.instance.is_some(),
                    volume: self.volume,
                });
            }
        }
    }

    /// Play replaces whatever was on the output: the previous instance is
    /// stopped and closed before the new one opens, so at most one lives
    /// per output at any instant.
    async fn handle_play(&mut self, request: PlayRequest) -> Result<(), PlaybackError> {
        let full_path = validate_asset_path(&self.assets_dir, &request.asset_path)?;
        self.stop_instance().await?;

        let mut instance = self.backend.open(&full_path, &self.output).await?;
        instance.set_loop(request.loop_playback).await?;
        if let Some(volume) = request.volume {
            self.volume = clamp_volume(volume);
            instance.set_volume(self.volume).await?;
        }
        if request.start_ms > 0 {
            instance.seek(request.start_ms).await?;
        }
        if request.fade_in_ms > 0 {
            let target = if request.volume.is_some() {
                self.volume
            } else {
                self.volume = 1.0;
                1.0
            };
            instance.set_volume(0.0).await?;
            self.instance = Some(instance);
            self.start_fade(0.0, target, request.fade_in_ms);
            if let Some(instance) = self.instance.as_mut() {
                if let Err(err) = instance.play().await {
                    let _ = self.stop_instance().await;
                    return Err(err);
                }
            }
            return Ok(());
        }
        if let Err(err) = instance.play().await {
            let _ = instance.close().await;
            return Err(err);
        }
        self.instance = Some(instance);
        Ok(())
    }

    async fn handle_fade(&mut self, target: f64, duration_ms: u64) -> Result<(), PlaybackError> {
        let Some(instance) = self.instance.as_mut() else {
            return Err(PlaybackError::NoActiveMedia);
        };
        let target = clamp_volume(target);
        if duration_ms == 0 {
            self.fade = None;
            self.volume = target;
            return instance.set_volume(target).await;
        }
        let from = self.volume;
        self.start_fade(from, target, duration_ms);
        Ok(())
    }

    /// Replace any in-progress fade with a fresh ramp of <=50 ms steps.
    fn start_fade(&mut self, from: f64, to: f64, duration_ms: u64) {
        let steps = (duration_ms / FADE_STEP.as_millis() as u64).max(1) as u32;
        let step_duration = Duration::from_millis(duration_ms / steps as u64);
        let mut interval = tokio::time::interval(step_duration.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it during the next loop
        // iteration as the first step instead.
        self.volume = from;
        self.fade = Some(Fade {
            target: to,
            delta: (to - from) / steps as f64,
            steps_left: steps,
            interval,
        });
    }

    async fn step_fade(&mut self) {
        let Some(fade) = self.fade.as_mut() else { return };
        let Some(instance) = self.instance.as_mut() else {
            self.fade = None;
            return;
        };
        self.volume = clamp_volume(self.volume + fade.delta);
        fade.steps_left -= 1;
        let finished = fade.steps_left == 0;
        let level = if finished { fade.target } else { self.volume };
        if finished {
            self.volume = fade.target;
            self.fade = None;
        }
        if let Err(err) = instance.set_volume(clamp_volume(level)).await {
            tracing::warn!(output = %self.output.id, "fade step failed: {}", err);
            self.fade = None;
        }
    }

    /// Cancel fades, then stop and close the current instance (no-op when
    /// the channel is idle).
    async fn stop_instance(&mut self) -> Result<(), PlaybackError> {
        self.fade = None;
        let Some(mut instance) = self.instance.take() else {
            return Ok(());
        };
        let _ = instance.stop().await;
        instance.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> Vec<OutputDevice> {
        vec![
            OutputDevice {
                id: "display-0".to_string(),
                name: "HDMI Main".to_string(),
                kind: "video".to_string(),
                index: 0,
            },
            OutputDevice {
                id: "audio-0".to_string(),
                name: "Main Speakers".to_string(),
                kind: "audio".to_string(),
                index: 0,
            },
        ]
    }

    fn manager_with_assets() -> (tempfile::TempDir, Arc<StubBackend>, Manager) {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"b").unwrap();
        let backend = Arc::new(StubBackend::new());
        let manager = Manager::new(dir.path(), backend.clone());
        manager.configure_outputs(outputs());
        (dir, backend, manager)
    }

    fn play(file: &str) -> PlayRequest {
        PlayRequest {
            asset_path: file.to_string(),
            ..PlayRequest::default()
        }
    }

    #[tokio::test]
    async fn test_play_stop_lifecycle() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("display-0", play("a.mp4")).await.unwrap();
        assert_eq!(backend.stats().live(), 1);
        manager.stop("display-0").await.unwrap();
        assert_eq!(backend.stats().live(), 0);
    }

    #[tokio::test]
    async fn test_play_replaces_existing_instance() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("display-0", play("a.mp4")).await.unwrap();
        manager.play("display-0", play("b.mp4")).await.unwrap();
        let stats = backend.stats();
        assert_eq!(stats.opened(), 2);
        assert_eq!(stats.closed(), 1);
        assert_eq!(stats.live(), 1, "at most one instance per output");
        assert_eq!(stats.max_live(), 1, "never two live at once");
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let (_dir, _backend, manager) = manager_with_assets();
        let err = manager.play("display-9", play("a.mp4")).await.unwrap_err();
        assert!(matches!(err, PlaybackError::OutputNotFound(_)));
    }

    #[tokio::test]
    async fn test_target_resolution_heuristics() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("hdmi0", play("a.mp4")).await.unwrap();
        manager.play("HDMI Main", play("a.mp4")).await.unwrap();
        manager.play("audio0", play("a.mp4")).await.unwrap();
        assert_eq!(backend.stats().opened(), 3);
    }

    #[tokio::test]
    async fn test_controls_on_empty_channel() {
        let (_dir, _backend, manager) = manager_with_assets();
        // Stop on an idle channel is a no-op; everything else reports no
        // active media.
        manager.stop("display-0").await.unwrap();
        assert!(matches!(
            manager.pause("display-0").await.unwrap_err(),
            PlaybackError::NoActiveMedia
        ));
        assert!(matches!(
            manager.resume("display-0").await.unwrap_err(),
            PlaybackError::NoActiveMedia
        ));
        assert!(matches!(
            manager.seek("display-0", 100).await.unwrap_err(),
            PlaybackError::NoActiveMedia
        ));
        assert!(matches!(
            manager.set_volume("display-0", 0.5).await.unwrap_err(),
            PlaybackError::NoActiveMedia
        ));
        assert!(matches!(
            manager.fade_volume("display-0", 0.5, 100).await.unwrap_err(),
            PlaybackError::NoActiveMedia
        ));
    }

    #[tokio::test]
    async fn test_volume_clamped() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("audio-0", play("a.mp4")).await.unwrap();
        manager.set_volume("audio-0", 3.0).await.unwrap();
        assert_eq!(backend.stats().last_volume(), 1.0);
        manager.set_volume("audio-0", -1.0).await.unwrap();
        assert_eq!(backend.stats().last_volume(), 0.0);
    }

    #[tokio::test]
    async fn test_fade_zero_duration_snaps() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("audio-0", play("a.mp4")).await.unwrap();
        manager.fade_volume("audio-0", 0.25, 0).await.unwrap();
        assert_eq!(backend.stats().last_volume(), 0.25);
    }

    #[tokio::test]
    async fn test_fade_ramps_to_target() {
        let (_dir, backend, manager) = manager_with_assets();
        manager.play("audio-0", play("a.mp4")).await.unwrap();
        manager.fade_volume("audio-0", 0.0, 200).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(backend.stats().last_volume(), 0.0);
        assert!(
            backend.stats().volume_calls() > 2,
            "fade interpolates in steps"
        );
    }

    #[tokio::test]
    async fn test_play_with_fade_in_starts_silent() {
        let (_dir, backend, manager) = manager_with_assets();
        let request = PlayRequest {
            asset_path: "a.mp4".to_string(),
            volume: Some(0.8),
            fade_in_ms: 150,
            ..PlayRequest::default()
        };
        manager.play("audio-0", request).await.unwrap();
        let ops = backend.stats().operations();
        let muted_at = ops.iter().rposition(|op| op == "set_volume(0)").unwrap();
        let play_at = ops.iter().position(|op| op == "play").unwrap();
        assert!(muted_at < play_at, "fade-in mutes before play");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!((backend.stats().last_volume() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_play_preconditions_applied_in_order() {
        let (_dir, backend, manager) = manager_with_assets();
        let request = PlayRequest {
            asset_path: "a.mp4".to_string(),
            loop_playback: true,
            start_ms: 1500,
            ..PlayRequest::default()
        };
        manager.play("display-0", request).await.unwrap();
        let ops = backend.stats().operations();
        let loop_at = ops.iter().position(|op| op == "set_loop(true)").unwrap();
        let seek_at = ops.iter().position(|op| op == "seek(1500)").unwrap();
        let play_at = ops.iter().position(|op| op == "play").unwrap();
        assert!(loop_at < play_at);
        assert!(seek_at < play_at);
    }

    #[test]
    fn test_asset_path_validation() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.mp4"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        assert!(validate_asset_path(dir.path(), "ok.mp4").is_ok());
        assert!(matches!(
            validate_asset_path(dir.path(), ""),
            Err(PlaybackError::EmptyAssetPath)
        ));
        assert!(matches!(
            validate_asset_path(dir.path(), "../escape.mp4"),
            Err(PlaybackError::InvalidAssetPath(_))
        ));
        assert!(matches!(
            validate_asset_path(dir.path(), "sub/../../escape.mp4"),
            Err(PlaybackError::InvalidAssetPath(_))
        ));
        assert!(matches!(
            validate_asset_path(dir.path(), "/etc/passwd"),
            Err(PlaybackError::InvalidAssetPath(_))
        ));
        assert!(matches!(
            validate_asset_path(dir.path(), "missing.mp4"),
            Err(PlaybackError::AssetNotFound(_))
        ));
        assert!(matches!(
            validate_asset_path(dir.path(), "sub"),
            Err(PlaybackError::AssetIsDirectory(_))
        ));
    }

    #[test]
    fn test_parse_indexed_suffix() {
        assert_eq!(parse_indexed_suffix("hdmi1"), Some(1));
        assert_eq!(parse_indexed_suffix("display-12"), Some(12));
        assert_eq!(parse_indexed_suffix("audio"), None);
    }
}
