//! Deployable session manager: one websocket per deployable.
//!
//! Sockets land on `/ws/deployable`. A hello upserts the in-memory session
//! and the durable registry record; acks move the lifecycle; a read or
//! write failure marks the session disconnected without touching its
//! status. Each session writes through its own bounded channel and writer
//! task, so the shared socket has exactly one writer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use cueproto::{
    AckStatus, CapabilityReport, DeployableStatus, DeviceFrame, ExecutionProfile, GlobalState,
    Hello, ServerFrame,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::hub::Hub;
use crate::store::{PackageStore, RegistryStore};

const SESSION_QUEUE: usize = 16;
const PING_PERIOD: Duration = Duration::from_secs(50);
const PONG_WAIT: Duration = Duration::from_secs(60);
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Connection-scoped lifecycle, distinct from the durable record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Active,
    AssignSent,
    Error,
}

/// Serializable view of one live session, merged into the REST listing and
/// pushed to operator monitors on lifecycle changes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub device_id: String,
    pub hostname: String,
    pub ip: String,
    pub agent_version: String,
    pub pairing_code: String,
    pub assigned_logic_id: String,
    pub assigned_profile_version: u32,
    pub assigned_show_logic_version: u32,
    pub capabilities: CapabilityReport,
    pub last_seen: DateTime<Utc>,
    pub status: SessionStatus,
    pub name: String,
    pub location: String,
    pub connected: bool,
}

#[derive(Clone)]
struct SessionConn {
    id: Uuid,
    tx: mpsc::Sender<ServerFrame>,
}

struct Session {
    info: SessionInfo,
    conn: Option<SessionConn>,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    registry: Arc<dyn RegistryStore>,
    packages: Arc<dyn PackageStore>,
    hub: Arc<Hub>,
    server_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("deployable not connected")]
    NotConnected,
    #[error("deployable send queue full")]
    QueueFull,
}

impl SessionManager {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        packages: Arc<dyn PackageStore>,
        hub: Arc<Hub>,
        server_version: String,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            packages,
            hub,
            server_version,
        }
    }

    /// Drive one deployable socket to completion.
    pub async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel::<ServerFrame>(SESSION_QUEUE);
        let (mut sink, mut stream) = socket.split();

        let writer_manager = self.clone();
        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(PING_PERIOD);
            ping.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        let Ok(payload) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        let send = sink.send(Message::Text(payload.into()));
                        match tokio::time::timeout(WRITE_WAIT, send).await {
                            Ok(Ok(())) => {}
                            _ => break,
                        }
                    }
                    _ = ping.tick() => {
                        let send = sink.send(Message::Ping(Vec::new().into()));
                        match tokio::time::timeout(WRITE_WAIT, send).await {
                            Ok(Ok(())) => {}
                            _ => break,
                        }
                    }
                }
            }
            writer_manager.mark_disconnected(conn_id);
        });

        // Any inbound frame (pongs included) refreshes the read deadline; a
        // silent half-open connection is torn down when the deadline lapses.
        loop {
            let message = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(_) => break,
                Err(_) => {
                    tracing::warn!("deployable socket missed pong deadline, closing");
                    break;
                }
            };
            let Message::Text(text) = message else {
                continue;
            };
            self.handle_frame(conn_id, &tx, text.as_str());
        }

        self.mark_disconnected(conn_id);
        writer.abort();
    }

    fn handle_frame(&self, conn_id: Uuid, tx: &mpsc::Sender<ServerFrame>, text: &str) {
        // Decode through Value first so unknown types are logged, not fatal.
        let Ok(raw) = serde_json::from_str::<serde_json::Value>(text) else {
            tracing::warn!("registration: undecodable frame dropped");
            return;
        };
        let frame: DeviceFrame = match serde_json::from_value(raw.clone()) {
            Ok(frame) => frame,
            Err(_) => {
                let kind = raw.get("type").and_then(|v| v.as_str()).unwrap_or("?");
                tracing::warn!(frame_type = %kind, "registration: unknown frame dropped");
                return;
            }
        };
        match frame {
            DeviceFrame::Hello(hello) => self.handle_hello(conn_id, tx.clone(), hello),
            DeviceFrame::AssignRoleAck {
                device_id,
                status,
                error,
                ..
            } => self.handle_ack(&device_id, status, error),
            DeviceFrame::PlaybackError {
                device_id,
                action,
                error,
                ..
            } => {
                tracing::warn!(device_id = %device_id, action = %action, error = %error,
                    "playback error reported");
            }
            DeviceFrame::SensorEvent(event) => {
                tracing::debug!(device_id = %event.device_id, sensor_id = %event.sensor_id,
                    "sensor event (websocket path ignored, events ingest over HTTP)");
            }
            DeviceFrame::IdentifyAck {
                device_id,
                supported,
            } => {
                tracing::info!(device_id = %device_id, supported, "identify ack");
            }
        }
    }

    fn handle_hello(&self, conn_id: Uuid, tx: mpsc::Sender<ServerFrame>, hello: Hello) {
        if hello.device_id.is_empty() {
            return;
        }
        if let Err(err) = self.registry.upsert_from_hello(&hello) {
            tracing::warn!(device_id = %hello.device_id, "registry upsert failed: {}", err);
        }
        let status = if hello.assigned_logic_id.is_empty() {
            SessionStatus::Pending
        } else {
            SessionStatus::Active
        };
        let info = {
            let mut sessions = self.sessions.write().unwrap();
            let session = sessions
                .entry(hello.device_id.clone())
                .or_insert_with(|| Session {
                    info: empty_info(&hello.device_id),
                    conn: None,
                });
            session.info.hostname = hello.hostname.clone();
            session.info.ip = hello.ip.clone();
            session.info.agent_version = hello.agent_version.clone();
            session.info.pairing_code = hello.pairing_code.clone();
            session.info.assigned_logic_id = hello.assigned_logic_id.clone();
            session.info.assigned_profile_version = hello.assigned_profile_version;
            session.info.assigned_show_logic_version = hello.assigned_show_logic_version;
            session.info.capabilities = hello.capabilities.clone();
            session.info.last_seen = Utc::now();
            session.info.status = status;
            session.info.connected = true;
            session.conn = Some(SessionConn { id: conn_id, tx });
            session.info.clone()
        };
        tracing::info!(
            device_id = %info.device_id, status = ?info.status,
            logic = %info.assigned_logic_id, logic_ver = info.assigned_show_logic_version,
            "registration: hello"
        );
        self.notify("upsert", &info);
        self.maybe_push_assign(&hello);
    }

    /// Push the latest package when the hello reports an older version (or
    /// none at all).
    fn maybe_push_assign(&self, hello: &Hello) {
        if hello.assigned_logic_id.is_empty() {
            return;
        }
        let latest = match self.packages.latest_for_logic(&hello.assigned_logic_id) {
            Ok(Some(pkg)) => pkg,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!("package lookup failed: {}", err);
                return;
            }
        };
        if hello.assigned_show_logic_version != 0
            && latest.logic_version <= hello.assigned_show_logic_version
        {
            return;
        }
        let Ok(definition) = latest.definition() else {
            tracing::warn!(package_id = %latest.package_id, "stored package body undecodable");
            return;
        };
        let frame = ServerFrame::AssignRole {
            logic_id: hello.assigned_logic_id.clone(),
            server_id: self.server_version.clone(),
            profile: default_profile(),
            show_logic: definition,
            name: None,
        };
        match self.send_to(&hello.device_id, frame) {
            Ok(()) => {
                tracing::info!(
                    device_id = %hello.device_id, logic = %hello.assigned_logic_id,
                    package = %latest.package_id, version = latest.logic_version,
                    "registration: auto-assign pushed"
                );
            }
            Err(err) => {
                tracing::warn!(device_id = %hello.device_id, "auto-assign push failed: {}", err);
            }
        }
    }

    fn handle_ack(&self, device_id: &str, status: AckStatus, error: Option<String>) {
        if device_id.is_empty() {
            return;
        }
        let (session_status, record_status, active) = match status {
            AckStatus::Ok => (SessionStatus::Active, DeployableStatus::Active, true),
            AckStatus::Error => (SessionStatus::Error, DeployableStatus::Error, false),
        };
        let info = {
            let mut sessions = self.sessions.write().unwrap();
            let Some(session) = sessions.get_mut(device_id) else {
                return;
            };
            session.info.status = session_status;
            session.info.last_seen = Utc::now();
            session.info.clone()
        };
        if let Err(err) = self.registry.update_status(device_id, record_status) {
            tracing::warn!(device_id = %device_id, "record status update failed: {}", err);
        }
        self.hub.set_active(device_id, active);
        match status {
            AckStatus::Ok => {
                tracing::info!(device_id = %device_id, logic = %info.assigned_logic_id,
                    "registration: complete");
            }
            AckStatus::Error => {
                tracing::warn!(device_id = %device_id, error = ?error,
                    "registration: assignment rejected");
            }
        }
        self.notify("assign_ack", &info);
    }

    fn mark_disconnected(&self, conn_id: Uuid) {
        let info = {
            let mut sessions = self.sessions.write().unwrap();
            let session = sessions
                .values_mut()
                .find(|s| s.conn.as_ref().is_some_and(|c| c.id == conn_id));
            let Some(session) = session else { return };
            session.conn = None;
            session.info.connected = false;
            session.info.clone()
        };
        tracing::info!(device_id = %info.device_id, "registration: disconnected");
        self.notify("disconnect", &info);
    }

    /// Queue a frame on one deployable's socket.
    pub fn send_to(&self, device_id: &str, frame: ServerFrame) -> Result<(), SendError> {
        let sessions = self.sessions.read().unwrap();
        let conn = sessions
            .get(device_id)
            .filter(|s| s.info.connected)
            .and_then(|s| s.conn.as_ref())
            .ok_or(SendError::NotConnected)?;
        conn.tx.try_send(frame).map_err(|_| SendError::QueueFull)
    }

    /// Record an operator-initiated assignment on the session.
    pub fn note_assign_sent(&self, device_id: &str, logic_id: &str, name: &str) {
        let info = {
            let mut sessions = self.sessions.write().unwrap();
            let Some(session) = sessions.get_mut(device_id) else {
                return;
            };
            if !name.is_empty() {
                session.info.name = name.to_string();
            }
            session.info.assigned_logic_id = logic_id.to_string();
            session.info.status = SessionStatus::AssignSent;
            session.info.clone()
        };
        self.notify("assign_sent", &info);
    }

    pub fn update_name_location(&self, device_id: &str, name: &str, location: &str) {
        let info = {
            let mut sessions = self.sessions.write().unwrap();
            let Some(session) = sessions.get_mut(device_id) else {
                return;
            };
            if !name.is_empty() {
                session.info.name = name.to_string();
            }
            if !location.is_empty() {
                session.info.location = location.to_string();
            }
            session.info.clone()
        };
        self.notify("upsert", &info);
    }

    /// Write the `state_update` frame to every connected deployable socket.
    pub fn broadcast_state(&self, state: &GlobalState) {
        let frame = ServerFrame::StateUpdate {
            state: state.state.clone(),
            version: state.version,
            timestamp: state.timestamp,
            variables: None,
        };
        let sessions = self.sessions.read().unwrap();
        let mut count = 0usize;
        for session in sessions.values() {
            let Some(conn) = session.conn.as_ref().filter(|_| session.info.connected) else {
                continue;
            };
            if conn.tx.try_send(frame.clone()).is_err() {
                tracing::warn!(device_id = %session.info.device_id,
                    "state frame dropped, session queue full");
                continue;
            }
            count += 1;
        }
        tracing::info!(state = %state.state, version = state.version, count,
            "state: broadcast to deployables");
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap();
        let mut list: Vec<SessionInfo> = sessions.values().map(|s| s.info.clone()).collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn pending(&self) -> Vec<SessionInfo> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.assigned_logic_id.is_empty())
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<SessionInfo> {
        self.sessions
            .read()
            .unwrap()
            .get(device_id)
            .map(|s| s.info.clone())
    }

    fn notify(&self, event: &str, info: &SessionInfo) {
        if let Ok(item) = serde_json::to_value(info) {
            self.hub.notify_monitors(event, item);
        }
    }
}

fn empty_info(device_id: &str) -> SessionInfo {
    SessionInfo {
        device_id: device_id.to_string(),
        hostname: String::new(),
        ip: String::new(),
        agent_version: String::new(),
        pairing_code: String::new(),
        assigned_logic_id: String::new(),
        assigned_profile_version: 0,
        assigned_show_logic_version: 0,
        capabilities: CapabilityReport::default(),
        last_seen: Utc::now(),
        status: SessionStatus::Pending,
        name: String::new(),
        location: String::new(),
        connected: false,
    }
}

/// Profile used for hello-triggered auto-assignments.
pub fn default_profile() -> ExecutionProfile {
    ExecutionProfile {
        profile_id: "default".to_string(),
        version: 1,
        requires: serde_json::Map::new(),
    }
}
