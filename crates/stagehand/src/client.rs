//! Reconnecting websocket client to the callboard.
//!
//! Backoff starts at 1 s and doubles to a 30 s cap, resetting on a
//! successful connect. Each connection announces itself with a fresh hello,
//! then pumps frames both ways until either side fails, which tears the
//! connection down and restarts the dial loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cueproto::{DeviceFrame, Hello, ServerFrame};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const BACKOFF_START: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Next delay after a failed dial: double, capped.
pub fn backoff_after(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

pub struct Client {
    pub server_url: String,
}

impl Client {
    /// Run the reconnect loop until cancelled.
    ///
    /// `hello` is re-evaluated on every connect so the announced assignment
    /// reflects whatever the runtime accepted meanwhile. `connected`
    /// receives a timestamp per successful dial.
    pub async fn run(
        &self,
        hello: impl Fn() -> Hello,
        incoming: mpsc::Sender<ServerFrame>,
        mut outgoing: mpsc::Receiver<DeviceFrame>,
        connected: mpsc::Sender<DateTime<Utc>>,
        cancel: CancellationToken,
    ) {
        let mut backoff = BACKOFF_START;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let socket = tokio::select! {
                _ = cancel.cancelled() => return,
                result = connect_async(self.server_url.as_str()) => match result {
                    Ok((socket, _)) => socket,
                    Err(err) => {
                        tracing::warn!("server connection failed: {}", err);
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = backoff_after(backoff);
                        continue;
                    }
                },
            };
            backoff = BACKOFF_START;
            let _ = connected.try_send(Utc::now());
            tracing::info!(url = %self.server_url, "connected to server");

            let (mut sink, mut stream) = socket.split();
            let hello_frame = DeviceFrame::Hello(hello());
            if let Ok(payload) = serde_json::to_string(&hello_frame) {
                if sink.send(Message::text(payload)).await.is_err() {
                    tracing::warn!("hello send failed");
                    continue;
                }
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = sink.close().await;
                        return;
                    }
                    message = stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(frame) = decode_frame(text.as_str()) {
                                    if incoming.send(frame).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Ok(_)) => {} // pings and binary noise
                            _ => {
                                tracing::warn!("server read failed, reconnecting");
                                break;
                            }
                        }
                    }
                    frame = outgoing.recv() => {
                        let Some(frame) = frame else { return };
                        let Ok(payload) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        let send = sink.send(Message::text(payload));
                        match tokio::time::timeout(WRITE_WAIT, send).await {
                            Ok(Ok(())) => {}
                            _ => {
                                tracing::warn!("server write failed, reconnecting");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn decode_frame(text: &str) -> Option<ServerFrame> {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!("undecodable server frame dropped: {}", err);
            return None;
        }
    };
    match serde_json::from_value::<ServerFrame>(raw.clone()) {
        Ok(frame) => Some(frame),
        Err(_) => {
            let kind = raw.get("type").and_then(|v| v.as_str()).unwrap_or("?");
            tracing::warn!(frame_type = %kind, "unknown message type");
            None
        }
    }
}
