//! Recording metadata documents
//!
//! Two documents accompany every data file:
//! - a BIDS JSON sidecar (sampling rate, channel count, task and device
//!   descriptions) extended with a `SenseRecord` provenance block
//! - a BIDS `channels.tsv` table describing the channel layout
//!
//! The sidecar is written when the recording starts, with no stop time, and
//! rewritten with the stop time and sample count when it stops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::catalog::BoardInfo;
use crate::error::Result;
use crate::identifiers::SessionIdentifiers;

/// Experiment metadata supplied by configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDefaults {
    #[serde(default)]
    pub task: TaskMetadata,
    #[serde(default)]
    pub board: DeviceMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub label: Option<String>,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub institution: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub manufacturer: Option<String>,
    pub modelname: Option<String>,
    #[serde(default)]
    pub cap: CapMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapMetadata {
    pub manufacturer: Option<String>,
    pub modelname: Option<String>,
}

/// Session context recorded alongside the BIDS keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Provenance {
    pub recording_id: String,
    pub board: String,
    pub subject: String,
    pub session: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition: Option<String>,
    pub run: String,
    pub data_type: String,
    pub modality: String,
    pub data_file: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub sample_count: Option<u64>,
}

/// BIDS sidecar document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    #[serde(rename = "SamplingFrequency")]
    pub sampling_frequency: u32,
    #[serde(rename = "EEGChannelCount")]
    pub eeg_channel_count: usize,
    #[serde(rename = "RecordingType")]
    pub recording_type: String,
    #[serde(rename = "RecordingDuration", skip_serializing_if = "Option::is_none")]
    pub recording_duration: Option<f64>,
    #[serde(rename = "TaskName")]
    pub task_name: String,
    #[serde(rename = "TaskDescription", skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    #[serde(rename = "Instructions", skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(rename = "InstitutionName", skip_serializing_if = "Option::is_none")]
    pub institution_name: Option<String>,
    #[serde(rename = "Manufacturer", skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(rename = "ManufacturersModelName", skip_serializing_if = "Option::is_none")]
    pub manufacturers_model_name: Option<String>,
    #[serde(rename = "CapManufacturer", skip_serializing_if = "Option::is_none")]
    pub cap_manufacturer: Option<String>,
    #[serde(
        rename = "CapManufacturersModelName",
        skip_serializing_if = "Option::is_none"
    )]
    pub cap_manufacturers_model_name: Option<String>,
    #[serde(rename = "SenseRecord", skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Sidecar {
    /// The time-independent part of the sidecar
    pub fn template(
        identifiers: &SessionIdentifiers,
        info: &BoardInfo,
        defaults: &MetadataDefaults,
    ) -> Self {
        let task = &defaults.task;
        let device = &defaults.board;
        Self {
            sampling_frequency: info.sampling_rate,
            eeg_channel_count: info.channel_count(),
            recording_type: "continuous".to_string(),
            recording_duration: None,
            task_name: task
                .label
                .clone()
                .unwrap_or_else(|| identifiers.task().to_string()),
            task_description: task.description.clone(),
            instructions: task.instructions.clone(),
            institution_name: task.institution.clone(),
            manufacturer: device
                .manufacturer
                .clone()
                .or_else(|| info.manufacturer.clone()),
            manufacturers_model_name: device
                .modelname
                .clone()
                .or_else(|| info.model_name.clone()),
            cap_manufacturer: device.cap.manufacturer.clone(),
            cap_manufacturers_model_name: device.cap.modelname.clone(),
            provenance: None,
        }
    }

    /// A sidecar for a recording that has just started
    pub fn started(
        template: Sidecar,
        identifiers: &SessionIdentifiers,
        board: &str,
        data_file: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            provenance: Some(Provenance {
                recording_id: uuid::Uuid::new_v4().to_string(),
                board: board.to_string(),
                subject: identifiers.subject().to_string(),
                session: identifiers.session().to_string(),
                task: identifiers.task().to_string(),
                acquisition: identifiers.acquisition().map(String::from),
                run: identifiers.run().to_string(),
                data_type: identifiers.data_type().to_string(),
                modality: identifiers.modality().to_string(),
                data_file: data_file.to_string(),
                start_time,
                stop_time: None,
                sample_count: None,
            }),
            ..template
        }
    }

    /// Record the stop time and, when known, the sample count
    ///
    /// A stop time earlier than the start (clock adjustment) is clamped to the start.
    pub fn finish(&mut self, stop_time: DateTime<Utc>, sample_count: Option<u64>) {
        if let Some(provenance) = self.provenance.as_mut() {
            let stop_time = stop_time.max(provenance.start_time);
            let duration = (stop_time - provenance.start_time).num_milliseconds() as f64 / 1000.0;
            provenance.stop_time = Some(stop_time);
            provenance.sample_count = sample_count;
            self.recording_duration = Some(duration);
        }
    }

    /// Pretty JSON with sorted keys
    pub fn render(&self) -> Result<String> {
        // serde_json::Value maps are ordered, which sorts the keys
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut contents = self.render()?;
        contents.push('\n');
        std::fs::write(path, contents)?;
        tracing::info!("Sidecar json file written to {}", path.display());
        Ok(())
    }
}

/// BIDS `channels.tsv` content for `info`
pub fn render_channels(info: &BoardInfo) -> String {
    let mut out = String::from("name\ttype\tunits\n");
    for channel in &info.eeg_channels {
        out.push_str(channel);
        out.push_str("\tEEG\tuV\n");
    }
    out
}

pub fn write_channels(path: &Path, info: &BoardInfo) -> Result<()> {
    std::fs::write(path, render_channels(info))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BoardKind;
    use chrono::Duration;

    fn ids() -> SessionIdentifiers {
        SessionIdentifiers::new("001", "testSession", "myExperiment", "001", "eeg", "eeg").unwrap()
    }

    fn defaults() -> MetadataDefaults {
        MetadataDefaults {
            task: TaskMetadata {
                label: Some("My Experiment".into()),
                institution: Some("Example University".into()),
                ..Default::default()
            },
            board: DeviceMetadata {
                cap: CapMetadata {
                    manufacturer: Some("EasyCap".into()),
                    modelname: None,
                },
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_template_keys() {
        let info = BoardKind::CytonBoard.info();
        let sidecar = Sidecar::template(&ids(), &info, &defaults());
        let json: serde_json::Value = serde_json::from_str(&sidecar.render().unwrap()).unwrap();

        assert_eq!(json["SamplingFrequency"], 250);
        assert_eq!(json["EEGChannelCount"], 8);
        assert_eq!(json["TaskName"], "My Experiment");
        assert_eq!(json["InstitutionName"], "Example University");
        assert_eq!(json["Manufacturer"], "OpenBCI");
        assert_eq!(json["CapManufacturer"], "EasyCap");
        assert!(json.get("CapManufacturersModelName").is_none());
        assert!(json.get("SenseRecord").is_none());
    }

    #[test]
    fn test_template_is_deterministic() {
        let info = BoardKind::SyntheticBoard.info();
        let a = Sidecar::template(&ids(), &info, &MetadataDefaults::default());
        let b = Sidecar::template(&ids(), &info, &MetadataDefaults::default());
        assert_eq!(a.render().unwrap(), b.render().unwrap());
        assert_eq!(a.task_name, "myExperiment");
    }

    #[test]
    fn test_rendered_keys_sorted() {
        let info = BoardKind::SyntheticBoard.info();
        let rendered = Sidecar::template(&ids(), &info, &defaults()).render().unwrap();
        let eeg = rendered.find("\"EEGChannelCount\"").unwrap();
        let sampling = rendered.find("\"SamplingFrequency\"").unwrap();
        assert!(eeg < sampling);
    }

    #[test]
    fn test_finish_records_stop() {
        let info = BoardKind::SyntheticBoard.info();
        let start = Utc::now();
        let template = Sidecar::template(&ids(), &info, &MetadataDefaults::default());
        let mut sidecar = Sidecar::started(template, &ids(), "SYNTHETIC_BOARD", "x.csv", start);
        assert!(sidecar.provenance.as_ref().unwrap().stop_time.is_none());

        sidecar.finish(start + Duration::milliseconds(1500), Some(375));
        let provenance = sidecar.provenance.as_ref().unwrap();
        assert_eq!(provenance.sample_count, Some(375));
        assert!(provenance.stop_time.unwrap() >= provenance.start_time);
        assert_eq!(sidecar.recording_duration, Some(1.5));
    }

    #[test]
    fn test_finish_clamps_backwards_clock() {
        let info = BoardKind::SyntheticBoard.info();
        let start = Utc::now();
        let template = Sidecar::template(&ids(), &info, &MetadataDefaults::default());
        let mut sidecar = Sidecar::started(template, &ids(), "SYNTHETIC_BOARD", "x.csv", start);
        sidecar.finish(start - Duration::seconds(5), None);
        assert_eq!(sidecar.provenance.unwrap().stop_time, Some(start));
    }

    #[test]
    fn test_channels_table() {
        let tsv = render_channels(&BoardKind::BrainbitBoard.info());
        let lines: Vec<&str> = tsv.lines().collect();
        assert_eq!(lines[0], "name\ttype\tunits");
        assert_eq!(lines[1], "T3\tEEG\tuV");
        assert_eq!(lines.len(), 5);
    }
}
