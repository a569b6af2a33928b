//! Configuration loading for both fleet binaries.
//!
//! Kept dependency-light so either binary can import it without dragging in
//! the other's stack. Load order (later wins):
//!
//! 1. Compiled defaults
//! 2. An optional TOML file (`--config` on either binary)
//! 3. Environment variables (`CALLBOARD_*` / `STAGEHAND_*`)
//!
//! CLI flags override everything; that merge happens in each `main`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// State server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallboardConfig {
    /// HTTP/websocket listen address.
    pub listen_addr: String,
    /// Directory for durable JSON collections.
    pub data_dir: PathBuf,
    /// Directory served read-only under `/assets/` for deployable fetches.
    pub assets_dir: PathBuf,
    /// Name of the state used when no snapshot exists yet.
    pub initial_state: String,
    /// Engine contract versions this server will accept in packages.
    pub engine_contract_versions: Vec<String>,
    /// Version string reported as `server_id` in assignments.
    pub server_version: String,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for CallboardConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8081".to_string(),
            data_dir: PathBuf::from("data"),
            assets_dir: PathBuf::from("assets"),
            initial_state: "init".to_string(),
            engine_contract_versions: vec!["1.0.0".to_string()],
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            log_filter: "callboard=info,tower_http=warn".to_string(),
        }
    }
}

impl CallboardConfig {
    /// Load with the standard precedence. `path` is the optional TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_toml(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CALLBOARD_LISTEN") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("CALLBOARD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CALLBOARD_ASSETS_DIR") {
            self.assets_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CALLBOARD_INITIAL_STATE") {
            self.initial_state = v;
        }
        if let Ok(v) = std::env::var("CALLBOARD_ENGINE_VERS") {
            let versions: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !versions.is_empty() {
                self.engine_contract_versions = versions;
            }
        }
    }
}

/// Deployable runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagehandConfig {
    /// State server websocket URL.
    pub server_url: String,
    /// Persistent data directory (identity, assignment, show logic).
    pub data_dir: PathBuf,
    /// Local media assets directory.
    pub assets_dir: PathBuf,
    /// Optional directory assets are copied from when missing.
    pub assets_source_dir: Option<PathBuf>,
    /// Optional base URL assets are downloaded from when missing.
    pub assets_source_url: Option<String>,
    /// Local status endpoint listen address.
    pub web_addr: String,
    /// Playback backend: "stub" or "vlc".
    pub playback_backend: String,
    /// Path to the VLC executable for the vlc backend.
    pub vlc_path: String,
    /// Agent version string reported in hellos.
    pub agent_version: String,
    /// Run without a state server.
    pub offline: bool,
    /// Generate a diagnostic show-logic document from discovered outputs.
    pub diagnostic_show_logic: bool,
    /// Delete unreferenced assets after a successful sync.
    pub assets_cleanup: bool,
    /// Declared output ports (used when no platform discovery is wired in).
    pub video_outputs: Vec<String>,
    pub audio_outputs: Vec<String>,
    /// Default tracing filter when RUST_LOG is unset.
    pub log_filter: String,
}

impl Default for StagehandConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8081/ws/deployable".to_string(),
            data_dir: PathBuf::from("data"),
            assets_dir: PathBuf::from("assets"),
            assets_source_dir: None,
            assets_source_url: None,
            web_addr: "0.0.0.0:8090".to_string(),
            playback_backend: "stub".to_string(),
            vlc_path: "vlc".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            offline: false,
            diagnostic_show_logic: false,
            assets_cleanup: false,
            video_outputs: Vec::new(),
            audio_outputs: Vec::new(),
            log_filter: "stagehand=info".to_string(),
        }
    }
}

impl StagehandConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => read_toml(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STAGEHAND_SERVER_URL") {
            self.server_url = v;
        }
        if let Ok(v) = std::env::var("STAGEHAND_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STAGEHAND_ASSETS_DIR") {
            self.assets_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("STAGEHAND_ASSETS_SOURCE_DIR") {
            if !v.is_empty() {
                self.assets_source_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("STAGEHAND_ASSETS_SOURCE_URL") {
            if !v.is_empty() {
                self.assets_source_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("STAGEHAND_WEB_ADDR") {
            self.web_addr = v;
        }
        if let Ok(v) = std::env::var("STAGEHAND_PLAYBACK_BACKEND") {
            self.playback_backend = v.to_lowercase();
        }
        if let Ok(v) = std::env::var("STAGEHAND_VLC_PATH") {
            self.vlc_path = v;
        }
        if let Ok(v) = std::env::var("STAGEHAND_OFFLINE") {
            self.offline = env_bool(&v);
        }
        if let Ok(v) = std::env::var("STAGEHAND_ASSETS_CLEANUP") {
            self.assets_cleanup = env_bool(&v);
        }
    }
}

fn env_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y"
    )
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
