//! Runtime orchestration: boot, assignment negotiation, and state routing.
//!
//! Owns the persisted identity and assignment, decides when the engine
//! (re)starts, and is the single consumer of server frames, so assignment
//! handling, state updates, and identify requests are serialized.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use cueproto::{
    CapabilityReport, DeviceFrame, ExecutionProfile, GlobalStateUpdate, Hello, SensorEvent,
    ServerFrame, ShowLogicDefinition,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actions::DispatchError;
use crate::assets::Syncer;
use crate::capabilities;
use crate::engine::Engine;
use crate::playback::Manager;
use crate::store::{generate_pairing_code, LocalAssignment, LocalDevice, Store};

pub const OUTGOING_QUEUE: usize = 32;

struct RuntimeState {
    device: Option<LocalDevice>,
    assignment: LocalAssignment,
    profile: Option<ExecutionProfile>,
    show_logic: Option<ShowLogicDefinition>,
    capabilities: CapabilityReport,
    pairing_code: String,
    last_state: String,
    last_version: u64,
    last_connected: Option<DateTime<Utc>>,
    engine_started: bool,
}

pub struct Runtime {
    store: Store,
    syncer: Syncer,
    engine: Arc<Engine>,
    player: Arc<Manager>,
    supported_actions: HashSet<String>,
    outgoing: mpsc::Sender<DeviceFrame>,
    agent_version: String,
    assets_cleanup: bool,
    state: Mutex<RuntimeState>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        syncer: Syncer,
        engine: Arc<Engine>,
        player: Arc<Manager>,
        supported_actions: HashSet<String>,
        outgoing: mpsc::Sender<DeviceFrame>,
        agent_version: String,
        assets_cleanup: bool,
    ) -> Self {
        Self {
            store,
            syncer,
            engine,
            player,
            supported_actions,
            outgoing,
            agent_version,
            assets_cleanup,
            state: Mutex::new(RuntimeState {
                device: None,
                assignment: LocalAssignment::default(),
                profile: None,
                show_logic: None,
                capabilities: CapabilityReport::default(),
                pairing_code: String::new(),
                last_state: String::new(),
                last_version: 0,
                last_connected: None,
                engine_started: false,
            }),
        }
    }

    /// Boot with persisted identity; fatal errors abort the process.
    pub fn boot(&self, video_outputs: &[String], audio_outputs: &[String]) -> Result<()> {
        tracing::info!("boot: starting deployable runtime");
        self.store.ensure_dirs().context("failed to create directories")?;
        let device = self.store.load_or_create_device()?;
        tracing::info!(device_id = %device.device_id, "boot: identity loaded");
        let assignment = self.store.load_assignment()?;

        let report = capabilities::report_from_config(video_outputs, audio_outputs);
        self.player
            .configure_outputs(capabilities::output_devices(&report));
        tracing::info!(
            video_outputs = report.video_outputs.len(),
            audio_outputs = report.audio_outputs.len(),
            "boot: outputs configured"
        );

        let profile = self.store.load_profile()?;
        let show_logic = self.store.load_show_logic()?;

        let mut state = self.state.lock().unwrap();
        if assignment.role_id.is_empty() {
            state.pairing_code = generate_pairing_code();
            tracing::info!(pairing_code = %state.pairing_code, "boot: unassigned");
        } else {
            tracing::info!(role = %assignment.role_id, "boot: assigned");
        }
        state.device = Some(device);
        state.assignment = assignment.clone();
        state.capabilities = report;
        state.profile = profile;
        state.show_logic = show_logic.clone();
        drop(state);

        if let Some(definition) = show_logic {
            if !assignment.role_id.is_empty() {
                match self.engine.load(definition) {
                    Ok(()) => {
                        self.engine.start("");
                        self.state.lock().unwrap().engine_started = true;
                        tracing::info!("boot: engine started with existing assignment");
                    }
                    Err(err) => {
                        tracing::warn!("boot: persisted show logic rejected: {}", err);
                    }
                }
            }
        }
        tracing::info!("boot: complete");
        Ok(())
    }

    /// Generate the diagnostic document when none is installed yet.
    pub fn apply_diagnostic_show_logic(&self) -> Result<()> {
        if self.store.show_logic_path().exists() {
            tracing::info!("diagnostic show logic: existing file found, skipping");
            return Ok(());
        }
        let capabilities = self.state.lock().unwrap().capabilities.clone();
        let definition = diagnostic_show_logic(&capabilities);
        self.store.save_show_logic(&definition)?;
        self.engine
            .load(definition.clone())
            .map_err(|err| anyhow::anyhow!("diagnostic logic rejected: {}", err))?;
        let mut state = self.state.lock().unwrap();
        state.show_logic = Some(definition);
        Ok(())
    }

    /// Run without a server: start at the document's first state.
    pub fn start_offline(&self) {
        let Some(definition) = self.state.lock().unwrap().show_logic.clone() else {
            tracing::warn!("offline mode: no show logic loaded");
            return;
        };
        let Some(first_state) = definition.states.first().map(|s| s.name.clone()) else {
            tracing::warn!("offline mode: show logic has no states");
            return;
        };
        if let Err(err) = self.engine.load(definition) {
            tracing::warn!("offline mode: show logic load failed: {}", err);
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.last_state = first_state.clone();
            state.last_version = 1;
            state.engine_started = true;
        }
        self.engine.start(&first_state);
        tracing::info!(state = %first_state, "offline mode: started");
    }

    /// The hello announced on every (re)connect.
    pub fn hello(&self) -> Hello {
        let state = self.state.lock().unwrap();
        Hello {
            device_id: state
                .device
                .as_ref()
                .map(|d| d.device_id.clone())
                .unwrap_or_default(),
            hostname: hostname(),
            ip: String::new(),
            agent_version: self.agent_version.clone(),
            pairing_code: state.pairing_code.clone(),
            assigned_logic_id: state.assignment.role_id.clone(),
            assigned_profile_version: state.assignment.profile_version,
            assigned_show_logic_version: state.assignment.show_logic_version,
            capabilities: state.capabilities.clone(),
        }
    }

    pub fn device_id(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .device
            .as_ref()
            .map(|d| d.device_id.clone())
            .unwrap_or_default()
    }

    pub fn set_connected(&self, at: DateTime<Utc>) {
        self.state.lock().unwrap().last_connected = Some(at);
    }

    /// Single entry point for frames from the server client.
    pub async fn handle_server_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Identify => {
                let supported = self.state.lock().unwrap().capabilities.supports_identify();
                tracing::info!(supported, "registration: identify requested");
                self.send(DeviceFrame::IdentifyAck {
                    device_id: self.device_id(),
                    supported,
                });
            }
            ServerFrame::AssignRole {
                logic_id,
                server_id,
                profile,
                show_logic,
                ..
            } => {
                tracing::info!(
                    logic = %logic_id, profile = %profile.profile_id,
                    logic_ver = show_logic.version,
                    "registration: assign_role received"
                );
                let ack = match self.handle_assign(&server_id, profile, show_logic).await {
                    Ok(()) => {
                        tracing::info!("registration: assign_role success, acking");
                        DeviceFrame::AssignRoleAck {
                            device_id: self.device_id(),
                            logic_id,
                            status: cueproto::AckStatus::Ok,
                            error: None,
                        }
                    }
                    Err(err) => {
                        tracing::warn!("registration: assign_role failed: {}", err);
                        DeviceFrame::AssignRoleAck {
                            device_id: self.device_id(),
                            logic_id,
                            status: cueproto::AckStatus::Error,
                            error: Some(err.to_string()),
                        }
                    }
                };
                self.send(ack);
            }
            ServerFrame::StateUpdate { state, version, .. } => {
                tracing::info!(state = %state, version, "state: update received");
                self.handle_state_update(&state, version);
            }
            ServerFrame::LogicUpdateAvailable => {
                tracing::info!("logic update available, awaiting assign_role push");
            }
        }
    }

    /// Validate, sync assets, persist, then restart the engine, in that
    /// order. Nothing is written until assets are in place, so a failed
    /// sync leaves the previous assignment and the engine untouched.
    async fn handle_assign(
        &self,
        server_id: &str,
        profile: ExecutionProfile,
        show_logic: ShowLogicDefinition,
    ) -> Result<()> {
        let capabilities = self.state.lock().unwrap().capabilities.clone();
        validate_profile(&profile, &capabilities)?;
        show_logic
            .validate(Some(&self.supported_actions))
            .map_err(|err| anyhow::anyhow!(err))?;

        let required = show_logic.referenced_assets();
        tracing::info!(count = required.len(), "registration: verifying assets");
        self.syncer.ensure_assets(&required).await?;
        if self.assets_cleanup {
            self.syncer.cleanup_assets(&required)?;
        }

        self.store.save_profile(&profile)?;
        self.store.save_show_logic(&show_logic)?;
        let assignment = LocalAssignment {
            server_id: server_id.to_string(),
            role_id: show_logic.logic_id.clone(),
            profile_id: profile.profile_id.clone(),
            profile_version: profile.version,
            show_logic_id: show_logic.logic_id.clone(),
            show_logic_version: show_logic.version,
        };
        self.store.save_assignment(&assignment)?;
        tracing::info!(
            role = %assignment.role_id,
            logic_ver = assignment.show_logic_version,
            "registration: saved assignment"
        );

        let resume_state = {
            let mut state = self.state.lock().unwrap();
            state.assignment = assignment;
            state.profile = Some(profile);
            state.show_logic = Some(show_logic.clone());
            state.pairing_code.clear();
            state.engine_started = false;
            state.last_state.clone()
        };

        self.engine.stop();
        self.engine
            .load(show_logic)
            .map_err(|err| anyhow::anyhow!(err))?;
        self.engine.start(&resume_state);
        self.state.lock().unwrap().engine_started = true;
        tracing::info!("registration: complete");
        Ok(())
    }

    /// Monotonic gate: updates at or below the last applied version are
    /// discarded, which survives reconnects and redeliveries.
    pub fn handle_state_update(&self, state_name: &str, version: u64) {
        {
            let mut state = self.state.lock().unwrap();
            if version <= state.last_version {
                tracing::info!(
                    current = state.last_version,
                    incoming = version,
                    "state: update ignored (stale)"
                );
                return;
            }
            if !state.engine_started && state.show_logic.is_some() {
                state.last_state = state_name.to_string();
                state.last_version = version;
                state.engine_started = true;
                drop(state);
                tracing::info!(state = %state_name, "state: engine start on first update");
                self.engine.start(state_name);
                return;
            }
            state.last_state = state_name.to_string();
            state.last_version = version;
        }
        self.engine.on_global_state(GlobalStateUpdate {
            state: state_name.to_string(),
            version,
            timestamp: Utc::now(),
        });
    }

    /// Sensor events drive the engine and are forwarded to the server.
    pub fn handle_sensor_event(&self, mut event: SensorEvent) {
        if event.device_id.is_empty() {
            event.device_id = self.device_id();
        }
        self.engine.on_sensor_event(&event);
        self.send(DeviceFrame::SensorEvent(event));
    }

    /// Executor failures go upstream as `playback_error`.
    pub fn handle_dispatch_error(&self, failure: DispatchError) {
        self.send(DeviceFrame::PlaybackError {
            device_id: self.device_id(),
            action: failure.action.action,
            error: failure.error,
            timestamp: Utc::now(),
        });
    }

    /// Local status snapshot for the web endpoint.
    pub async fn status(&self) -> serde_json::Value {
        let (device, assignment, profile, show_logic, pairing, last_state, last_version, connected) = {
            let state = self.state.lock().unwrap();
            (
                state.device.clone(),
                state.assignment.clone(),
                state.profile.clone(),
                state.show_logic.as_ref().map(|d| {
                    json!({"logic_id": d.logic_id, "name": d.name, "version": d.version,
                           "states": d.states.len()})
                }),
                state.pairing_code.clone(),
                state.last_state.clone(),
                state.last_version,
                state.last_connected,
            )
        };
        json!({
            "device": device,
            "assignment": assignment,
            "profile": profile,
            "show_logic": show_logic,
            "pairing_code": pairing,
            "last_state": {"state": last_state, "version": last_version},
            "last_connected": connected,
            "engine": {
                "running": self.engine.is_running(),
                "current_state": self.engine.current_state(),
            },
            "playback": self.player.snapshot().await,
        })
    }

    /// Consume server frames until cancelled.
    pub async fn run_incoming(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<ServerFrame>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = incoming.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            self.handle_server_frame(frame).await;
        }
    }

    fn send(&self, frame: DeviceFrame) {
        if self.outgoing.try_send(frame).is_err() {
            tracing::warn!("outgoing queue full, frame dropped");
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_default()
}

fn validate_profile(profile: &ExecutionProfile, capabilities: &CapabilityReport) -> Result<()> {
    if profile.profile_id.is_empty() {
        bail!("profile missing profile_id");
    }
    if profile.version == 0 {
        bail!("profile missing version");
    }
    if let Some(minimum) = profile
        .requires
        .get("video_outputs")
        .and_then(serde_json::Value::as_f64)
    {
        if (capabilities.video_outputs.len() as f64) < minimum {
            bail!("profile requires video outputs");
        }
    }
    Ok(())
}

/// Two-state diagnostic document: loop test media on every discovered
/// output, and an idle state that silences everything.
fn diagnostic_show_logic(capabilities: &CapabilityReport) -> ShowLogicDefinition {
    let mut on_enter = Vec::new();
    let mut on_exit = Vec::new();
    for detail in &capabilities.video_output_details {
        on_enter.push(action(
            "play_video",
            &detail.id,
            json!({"file": "diagnostic_video.mp4", "loop": true, "fade_in_ms": 250}),
        ));
        on_exit.push(action("stop_video", &detail.id, json!({})));
    }
    for detail in &capabilities.audio_output_details {
        on_enter.push(action(
            "play_audio",
            &detail.id,
            json!({"file": "diagnostic_audio.mp3", "loop": true, "volume": 0.8}),
        ));
        on_exit.push(action("stop_audio", &detail.id, json!({})));
    }
    if on_enter.is_empty() {
        on_enter.push(action("stop_all", "", json!({})));
    }

    serde_json::from_value(json!({
        "logic_id": "diagnostic",
        "name": "Diagnostic",
        "version": 1,
        "states": [
            {"name": "diagnostic", "on_enter": on_enter, "on_exit": on_exit},
            {"name": "idle", "on_enter": [action("stop_all", "", json!({}))]}
        ]
    }))
    .expect("diagnostic document is well-formed")
}

fn action(name: &str, target: &str, params: serde_json::Value) -> serde_json::Value {
    json!({"action": name, "target": target, "params": params})
}
