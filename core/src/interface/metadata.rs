use serde::{Deserialize, Serialize};

use crate::interface::config::{SensorConfig, SessionConfig, APPROX_BASE_STEP_LENGTH_M};
use crate::interface::frame::SensorId;

/// Version of the wire protocol and record format this crate speaks.
pub const PROTOCOL_VERSION: u16 = 1;

/// How one sensor's frames are laid out for the configured session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub sensor_id: SensorId,
    pub sweeps_per_frame: usize,
    pub sweep_data_length: usize,
    pub subsweep_offsets: Vec<usize>,
    pub subsweep_lengths: Vec<usize>,
    pub base_step_length_m: f32,
    pub max_sweep_rate: f32,
}

impl FrameLayout {
    pub fn from_config(sensor_id: SensorId, config: &SensorConfig) -> Self {
        let mut offsets = Vec::with_capacity(config.subsweeps.len());
        let mut lengths = Vec::with_capacity(config.subsweeps.len());
        let mut offset = 0;
        for subsweep in &config.subsweeps {
            offsets.push(offset);
            lengths.push(usize::from(subsweep.num_points));
            offset += usize::from(subsweep.num_points);
        }
        let max_sweep_rate = config
            .subsweeps
            .iter()
            .map(|s| s.approx_max_sweep_rate())
            .fold(f32::INFINITY, f32::min);

        Self {
            sensor_id,
            sweeps_per_frame: usize::from(config.sweeps_per_frame),
            sweep_data_length: offset,
            subsweep_offsets: offsets,
            subsweep_lengths: lengths,
            base_step_length_m: APPROX_BASE_STEP_LENGTH_M,
            max_sweep_rate: if max_sweep_rate.is_finite() {
                max_sweep_rate
            } else {
                0.0
            },
        }
    }

    pub fn frame_data_length(&self) -> usize {
        self.sweeps_per_frame * self.sweep_data_length
    }
}

/// Facts the server reports once a session is configured. Immutable for the
/// lifetime of that configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub protocol_version: u16,
    pub server_version: String,
    pub config: SessionConfig,
    pub update_rate: f32,
    pub ticks_per_second: u64,
    pub layouts: Vec<FrameLayout>,
}

impl SessionMetadata {
    pub fn layout_for(&self, sensor_id: SensorId) -> Option<&FrameLayout> {
        self.layouts.iter().find(|l| l.sensor_id == sensor_id)
    }

    pub fn sensor_config(&self) -> &SensorConfig {
        &self.config.sensor_config
    }

    /// Server ticks converted to microseconds since session start.
    pub fn tick_to_us(&self, tick: u64) -> u64 {
        if self.ticks_per_second == 0 {
            return 0;
        }
        ((u128::from(tick) * 1_000_000) / u128::from(self.ticks_per_second)) as u64
    }
}
