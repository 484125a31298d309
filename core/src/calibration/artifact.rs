use std::collections::BTreeMap;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::interface::{SensorConfig, SensorId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    /// Per-point amplitude standard deviation of the background.
    Noise,
    /// Per-point complex background, interleaved re/im.
    Offset,
}

/// Calibration data for one sensor, valid only for the config it was computed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationArtifact {
    pub sensor_id: SensorId,
    pub fingerprint: String,
    pub frames_used: usize,
    pub coefficients: BTreeMap<CalibrationKind, Vec<f32>>,
}

impl CalibrationArtifact {
    pub fn matches(&self, config: &SensorConfig) -> bool {
        self.fingerprint == config.fingerprint()
    }

    /// Computed for this sensor under exactly this config.
    pub fn applies_to(&self, sensor_id: SensorId, config: &SensorConfig) -> bool {
        self.sensor_id == sensor_id && self.matches(config)
    }

    pub fn coefficients(&self, kind: CalibrationKind) -> Option<&[f32]> {
        self.coefficients.get(&kind).map(Vec::as_slice)
    }

    pub fn noise(&self) -> Option<&[f32]> {
        self.coefficients(CalibrationKind::Noise)
    }

    pub fn offset(&self) -> Option<Vec<Complex32>> {
        self.coefficients(CalibrationKind::Offset).map(|values| {
            values
                .chunks_exact(2)
                .map(|pair| Complex32::new(pair[0], pair[1]))
                .collect()
        })
    }
}
