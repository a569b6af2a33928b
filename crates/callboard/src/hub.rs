//! Operator/state websocket hub.
//!
//! Clients connect on `/ws/state`, optionally tagged with a deployable id.
//! Tagged clients only receive broadcasts while that deployable is marked
//! active; untagged operator monitors always receive. Each client has a
//! bounded send queue; overflow closes the client (backpressure =
//! drop-the-slow-reader; reconnection restores).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use cueproto::{GlobalState, ServerFrame};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

const SEND_QUEUE: usize = 16;
const PING_PERIOD: Duration = Duration::from_secs(50);
const PONG_WAIT: Duration = Duration::from_secs(60);
const WRITE_WAIT: Duration = Duration::from_secs(10);

struct HubClient {
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubInner {
    /// Clients grouped by deployable id; "" holds the untagged monitors.
    clients: HashMap<String, HashMap<Uuid, HubClient>>,
    active: HashMap<String, bool>,
}

#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client; the receiver feeds its socket writer task.
    pub fn register(&self, deployable_id: &str) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SEND_QUEUE);
        let mut inner = self.inner.write().unwrap();
        inner
            .clients
            .entry(deployable_id.to_string())
            .or_default()
            .insert(id, HubClient { tx });
        tracing::debug!(client_id = %id, deployable_id = %deployable_id, "hub client registered");
        (id, rx)
    }

    pub fn unregister(&self, deployable_id: &str, id: Uuid) {
        let mut inner = self.inner.write().unwrap();
        if let Some(set) = inner.clients.get_mut(deployable_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.clients.remove(deployable_id);
            }
        }
    }

    /// Gate broadcasts for a tagged client set.
    pub fn set_active(&self, deployable_id: &str, active: bool) {
        if deployable_id.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        inner.active.insert(deployable_id.to_string(), active);
    }

    /// Fan one committed state to every eligible client.
    pub fn broadcast_state(&self, state: &GlobalState) {
        let frame = ServerFrame::StateUpdate {
            state: state.state.clone(),
            version: state.version,
            timestamp: state.timestamp,
            variables: Some(state.variables.clone()),
        };
        let Ok(payload) = serde_json::to_string(&frame) else {
            return;
        };
        self.send_where(&payload, |inner, deployable_id| {
            deployable_id.is_empty() || inner.active.get(deployable_id).copied().unwrap_or(false)
        });
    }

    /// Tell one deployable's state sockets a newer package exists.
    pub fn notify_logic_update(&self, deployable_id: &str) {
        if deployable_id.is_empty() {
            return;
        }
        let Ok(payload) = serde_json::to_string(&ServerFrame::LogicUpdateAvailable) else {
            return;
        };
        self.send_where(&payload, |_, id| id == deployable_id);
    }

    /// Push a session lifecycle notification to the untagged monitors.
    pub fn notify_monitors(&self, event: &str, item: serde_json::Value) {
        let payload = serde_json::json!({"type": event, "item": item}).to_string();
        self.send_where(&payload, |_, id| id.is_empty());
    }

    fn send_where(&self, payload: &str, eligible: impl Fn(&HubInner, &str) -> bool) {
        let mut dropped: Vec<(String, Uuid)> = Vec::new();
        {
            let inner = self.inner.read().unwrap();
            for (deployable_id, set) in &inner.clients {
                if !eligible(&inner, deployable_id) {
                    continue;
                }
                for (id, client) in set {
                    if client.tx.try_send(payload.to_string()).is_err() {
                        // Full or closed: disconnect the slow reader.
                        dropped.push((deployable_id.clone(), *id));
                    }
                }
            }
        }
        for (deployable_id, id) in dropped {
            tracing::warn!(client_id = %id, "hub client queue full, disconnecting");
            self.unregister(&deployable_id, id);
        }
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.inner
            .read()
            .unwrap()
            .clients
            .values()
            .map(|set| set.len())
            .sum()
    }
}

/// Drive one state socket until either side drops it.
///
/// Reads are discarded (monitors only listen); the writer drains the hub
/// queue and pings on an interval, closing on any write failure.
pub async fn serve_state_socket(hub: std::sync::Arc<Hub>, socket: WebSocket, deployable_id: String) {
    let (client_id, mut rx) = hub.register(&deployable_id);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.tick().await; // immediate first tick
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let send = sink.send(Message::Text(message.into()));
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
    });

    // Read loop: anything counts as liveness; errors or a pong drought end
    // the connection.
    loop {
        match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }

    hub.unregister(&deployable_id, client_id);
    writer.abort();
}
