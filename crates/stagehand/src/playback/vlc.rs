//! VLC backend: one VLC process per instance, driven over its RC interface.
//!
//! The process is launched with the RC console bound to an ephemeral local
//! TCP port; connect retries for up to 10 s (50 x 200 ms) while VLC starts.
//! Commands map one-to-one onto RC console verbs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};

use super::{clamp_volume, BackendInstance, MediaBackend, OutputDevice, PlaybackError};

const RC_CONNECT_ATTEMPTS: u32 = 50;
const RC_CONNECT_PAUSE: Duration = Duration::from_millis(200);

pub struct VlcBackend {
    vlc_path: String,
}

impl VlcBackend {
    pub fn new(vlc_path: impl Into<String>) -> Self {
        let vlc_path = vlc_path.into();
        Self {
            vlc_path: if vlc_path.trim().is_empty() {
                "vlc".to_string()
            } else {
                vlc_path
            },
        }
    }
}

#[async_trait]
impl MediaBackend for VlcBackend {
    async fn open(
        &self,
        asset_path: &Path,
        output: &OutputDevice,
    ) -> Result<Box<dyn BackendInstance>, PlaybackError> {
        let port = pick_port().await?;
        let bind = format!("127.0.0.1:{}", port);

        let mut args: Vec<String> = vec![
            "--intf".to_string(),
            "dummy".to_string(),
            "--extraintf".to_string(),
            "rc".to_string(),
            "--rc-host".to_string(),
            bind.clone(),
            "--quiet".to_string(),
            "--no-video-title-show".to_string(),
        ];
        if output.kind == "video" {
            args.push("--fullscreen".to_string());
        }
        args.push(asset_path.to_string_lossy().into_owned());

        tracing::info!(output = %output.id, rc = %bind, "vlc: launching {}", self.vlc_path);
        let child = Command::new(&self.vlc_path)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| PlaybackError::Backend(format!("vlc spawn failed: {}", err)))?;

        let stream = connect_rc(&bind, &child).await?;
        Ok(Box::new(VlcInstance {
            child,
            stream,
            paused: false,
        }))
    }
}

/// Reserve an ephemeral local port for the RC console.
async fn pick_port() -> Result<u16, PlaybackError> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| PlaybackError::Backend(err.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|err| PlaybackError::Backend(err.to_string()))?
        .port();
    drop(listener);
    Ok(port)
}

async fn connect_rc(address: &str, child: &Child) -> Result<TcpStream, PlaybackError> {
    let mut last_error = None;
    for _ in 0..RC_CONNECT_ATTEMPTS {
        match tokio::time::timeout(RC_CONNECT_PAUSE, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => last_error = Some(err.to_string()),
            Err(_) => last_error = Some("connect timeout".to_string()),
        }
        if child.id().is_none() {
            return Err(PlaybackError::Backend(
                "vlc exited before rc became available".to_string(),
            ));
        }
        tokio::time::sleep(RC_CONNECT_PAUSE).await;
    }
    Err(PlaybackError::Backend(format!(
        "vlc rc connect failed: {}",
        last_error.unwrap_or_else(|| "no attempts".to_string())
    )))
}

struct VlcInstance {
    child: Child,
    stream: TcpStream,
    paused: bool,
}

impl VlcInstance {
    async fn send(&mut self, command: &str) -> Result<(), PlaybackError> {
        self.stream
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|err| PlaybackError::Backend(format!("vlc rc write failed: {}", err)))
    }
}

#[async_trait]
impl BackendInstance for VlcInstance {
    async fn play(&mut self) -> Result<(), PlaybackError> {
        self.send("play").await
    }

    async fn stop(&mut self) -> Result<(), PlaybackError> {
        self.send("stop").await
    }

    async fn pause(&mut self) -> Result<(), PlaybackError> {
        // The RC console only has a toggle; track state to keep pause
        // idempotent.
        if self.paused {
            return Ok(());
        }
        self.send("pause").await?;
        self.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), PlaybackError> {
        if !self.paused {
            return Ok(());
        }
        self.send("pause").await?;
        self.paused = false;
        Ok(())
    }

    async fn seek(&mut self, position_ms: u64) -> Result<(), PlaybackError> {
        let seconds = position_ms / 1000;
        self.send(&format!("seek {}", seconds)).await
    }

    async fn set_volume(&mut self, volume: f64) -> Result<(), PlaybackError> {
        // RC volume range is 0..256.
        let value = (clamp_volume(volume) * 256.0) as u32;
        self.send(&format!("volume {}", value)).await
    }

    async fn set_loop(&mut self, looped: bool) -> Result<(), PlaybackError> {
        self.send(if looped { "loop on" } else { "loop off" }).await
    }

    async fn close(&mut self) -> Result<(), PlaybackError> {
        let _ = self.send("stop").await;
        let _ = self.send("quit").await;
        let _ = self.child.kill().await;
        Ok(())
    }
}
