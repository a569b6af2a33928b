//! Capability snapshot a deployable reports in its hello.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    #[serde(default)]
    pub video_outputs: Vec<String>,
    #[serde(default)]
    pub audio_outputs: Vec<String>,
    #[serde(default)]
    pub video_inputs: Vec<String>,
    #[serde(default)]
    pub audio_inputs: Vec<String>,
    #[serde(default)]
    pub serial_ports: Vec<String>,
    #[serde(default)]
    pub usb_devices: Vec<String>,
    #[serde(default)]
    pub status_leds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub video_output_details: Vec<OutputCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio_output_details: Vec<OutputCapability>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A fully described output port (id wins over the bare name lists above).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCapability {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub index: u32,
}

impl CapabilityReport {
    /// Whether this deployable can visibly or audibly identify itself.
    pub fn supports_identify(&self) -> bool {
        !self.video_outputs.is_empty()
            || !self.audio_outputs.is_empty()
            || !self.status_leds.is_empty()
    }
}
