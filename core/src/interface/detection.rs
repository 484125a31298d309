use serde::{Deserialize, Serialize};

use crate::interface::frame::{FrameContext, SensorId};

/// Whether a calibration artifact took part in producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStatus {
    Applied,
    /// An artifact was supplied but its fingerprint no longer matches the
    /// config, or it belongs to another sensor.
    RejectedStale,
    NoneSupplied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceOutput {
    pub detected: bool,
    pub score: f32,
    pub intra_score: f32,
    pub inter_score: f32,
    pub distance_m: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistancePeak {
    pub index: usize,
    pub distance_m: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceOutput {
    /// Sorted by descending amplitude.
    pub peaks: Vec<DistancePeak>,
    pub noise_floor: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detector", rename_all = "snake_case")]
pub enum DetectionOutput {
    Presence(PresenceOutput),
    Distance(DistanceOutput),
}

/// One detector's verdict for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub sensor_id: SensorId,
    pub sequence: u32,
    pub timestamp_us: u64,
    pub calibration: CalibrationStatus,
    /// Sensor conditions of the frame the result came from.
    #[serde(default)]
    pub frame: FrameContext,
    pub output: DetectionOutput,
}

impl DetectionResult {
    /// The sensor asked for a new calibration, whatever the status of the
    /// artifact currently applied.
    pub fn calibration_needed(&self) -> bool {
        self.frame.calibration_needed
    }

    pub fn presence(&self) -> Option<&PresenceOutput> {
        match &self.output {
            DetectionOutput::Presence(output) => Some(output),
            DetectionOutput::Distance(_) => None,
        }
    }

    pub fn distance(&self) -> Option<&DistanceOutput> {
        match &self.output {
            DetectionOutput::Distance(output) => Some(output),
            DetectionOutput::Presence(_) => None,
        }
    }
}
