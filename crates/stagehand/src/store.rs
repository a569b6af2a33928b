//! Local persistent state: identity, assignment, profile, show logic.
//!
//! Four JSON files in the data directory, each written temp-file + atomic
//! rename. The device id is minted once on first boot and survives
//! everything after that.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cueproto::{ExecutionProfile, ShowLogicDefinition};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("device id missing in device.json")]
    MissingDeviceId,
}

/// Persistent identity minted on first boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDevice {
    pub device_id: String,
    pub first_boot: DateTime<Utc>,
}

/// The accepted assignment as last acked to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalAssignment {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub role_id: String,
    #[serde(default)]
    pub profile_id: String,
    #[serde(default)]
    pub profile_version: u32,
    #[serde(default)]
    pub show_logic_id: String,
    #[serde(default)]
    pub show_logic_version: u32,
}

pub struct Store {
    data_dir: PathBuf,
    assets_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            assets_dir: assets_dir.into(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.assets_dir)?;
        Ok(())
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    fn device_path(&self) -> PathBuf {
        self.data_dir.join("device.json")
    }

    fn assignment_path(&self) -> PathBuf {
        self.data_dir.join("assignment.json")
    }

    fn profile_path(&self) -> PathBuf {
        self.data_dir.join("profile.json")
    }

    pub fn show_logic_path(&self) -> PathBuf {
        self.data_dir.join("show_logic.json")
    }

    /// Load the persisted identity, minting one on first boot.
    pub fn load_or_create_device(&self) -> Result<LocalDevice, StoreError> {
        let path = self.device_path();
        if path.exists() {
            let device: LocalDevice = read_json(&path)?;
            if device.device_id.is_empty() {
                return Err(StoreError::MissingDeviceId);
            }
            return Ok(device);
        }
        let device = LocalDevice {
            device_id: new_device_id(),
            first_boot: Utc::now(),
        };
        write_json_atomic(&path, &device)?;
        Ok(device)
    }

    /// Missing assignment file means "never assigned", not an error.
    pub fn load_assignment(&self) -> Result<LocalAssignment, StoreError> {
        let path = self.assignment_path();
        if !path.exists() {
            return Ok(LocalAssignment::default());
        }
        read_json(&path)
    }

    pub fn save_assignment(&self, assignment: &LocalAssignment) -> Result<(), StoreError> {
        write_json_atomic(&self.assignment_path(), assignment)
    }

    pub fn load_profile(&self) -> Result<Option<ExecutionProfile>, StoreError> {
        let path = self.profile_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_profile(&self, profile: &ExecutionProfile) -> Result<(), StoreError> {
        write_json_atomic(&self.profile_path(), profile)
    }

    pub fn load_show_logic(&self) -> Result<Option<ShowLogicDefinition>, StoreError> {
        let path = self.show_logic_path();
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    pub fn save_show_logic(&self, definition: &ShowLogicDefinition) -> Result<(), StoreError> {
        write_json_atomic(&self.show_logic_path(), definition)
    }
}

fn new_device_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Six decimal digits shown to the operator while a device awaits pairing.
pub fn generate_pairing_code() -> String {
    let code = rand::thread_rng().next_u32() % 1_000_000;
    format!("{:06}", code)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        let store = Store::new(dir.path().join("data"), dir.path().join("assets"));
        store.ensure_dirs().unwrap();
        store
    }

    #[test]
    fn test_device_id_minted_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let first = store.load_or_create_device().unwrap();
        assert_eq!(first.device_id.len(), 32);
        let second = store.load_or_create_device().unwrap();
        assert_eq!(first, second, "identity survives reboot");
    }

    #[test]
    fn test_assignment_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.load_assignment().unwrap(), LocalAssignment::default());

        let assignment = LocalAssignment {
            server_id: "0.3.0".to_string(),
            role_id: "lobby".to_string(),
            profile_id: "default".to_string(),
            profile_version: 1,
            show_logic_id: "lobby".to_string(),
            show_logic_version: 2,
        };
        store.save_assignment(&assignment).unwrap();
        assert_eq!(store.load_assignment().unwrap(), assignment);
    }

    #[test]
    fn test_show_logic_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert!(store.load_show_logic().unwrap().is_none());

        let definition: ShowLogicDefinition = serde_json::from_value(serde_json::json!({
            "logic_id": "lobby", "version": 3,
            "states": [{"name": "idle"}]
        }))
        .unwrap();
        store.save_show_logic(&definition).unwrap();
        assert_eq!(store.load_show_logic().unwrap(), Some(definition));
    }

    #[test]
    fn test_pairing_code_shape() {
        for _ in 0..20 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }
}
