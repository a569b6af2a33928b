//! Capability report assembly.
//!
//! Platform enumeration lives outside this runtime; outputs come from the
//! configuration and are turned into the report the hello carries and the
//! device list the playback manager registers.

use cueproto::{CapabilityReport, OutputCapability};

use crate::playback::OutputDevice;

/// Build the report from configured output names.
pub fn report_from_config(video_outputs: &[String], audio_outputs: &[String]) -> CapabilityReport {
    let video_details: Vec<OutputCapability> = video_outputs
        .iter()
        .enumerate()
        .map(|(index, name)| OutputCapability {
            id: format!("display-{}", index),
            name: name.clone(),
            kind: "video".to_string(),
            index: index as u32,
        })
        .collect();
    let audio_details: Vec<OutputCapability> = audio_outputs
        .iter()
        .enumerate()
        .map(|(index, name)| OutputCapability {
            id: format!("audio-{}", index),
            name: name.clone(),
            kind: "audio".to_string(),
            index: index as u32,
        })
        .collect();
    CapabilityReport {
        video_outputs: video_outputs.to_vec(),
        audio_outputs: audio_outputs.to_vec(),
        video_output_details: video_details,
        audio_output_details: audio_details,
        ..CapabilityReport::default()
    }
}

/// Playback devices for every output the report describes.
pub fn output_devices(report: &CapabilityReport) -> Vec<OutputDevice> {
    report
        .video_output_details
        .iter()
        .chain(report.audio_output_details.iter())
        .map(|detail| OutputDevice {
            id: detail.id.clone(),
            name: detail.name.clone(),
            kind: detail.kind.clone(),
            index: detail.index,
        })
        .collect()
}
