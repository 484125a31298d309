use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::interface::frame::SensorId;

/// Base distance between two consecutive points at step length 1.
pub const APPROX_BASE_STEP_LENGTH_M: f32 = 2.5e-3;

/// Points per pulse unit; step lengths must divide or be a multiple of it.
pub const SPARSE_IQ_PPC: u16 = 24;

const MAX_HWAAS: u16 = 511;
const MAX_RECEIVER_GAIN: u8 = 23;
const SENSOR_BUFFER_SIZE: usize = 4096;

/// Acquisition profile. Higher profiles use longer pulses (coarser resolution, more energy).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    P1,
    P2,
    P3,
    P4,
    P5,
}

impl Profile {
    /// Full width at half maximum of the pulse envelope.
    pub fn envelope_fwhm_m(self) -> f32 {
        match self {
            Profile::P1 => 0.04,
            Profile::P2 => 0.07,
            Profile::P3 => 0.14,
            Profile::P4 => 0.19,
            Profile::P5 => 0.32,
        }
    }

    /// Relative amplitude gain of the profile's pulse compared to profile 1.
    pub fn amplitude_gain(self) -> f32 {
        match self {
            Profile::P1 => 1.0,
            Profile::P2 => 1.6,
            Profile::P3 => 2.6,
            Profile::P4 => 3.2,
            Profile::P5 => 4.3,
        }
    }

    pub(crate) fn points_per_pulse_unit(self) -> u32 {
        match self {
            Profile::P1 => 24,
            Profile::P2 => 20,
            _ => 16,
        }
    }
}

/// Pulse repetition frequency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Prf {
    Mhz19_5,
    Mhz15_6,
    Mhz13_0,
    Mhz8_7,
    Mhz6_5,
    Mhz5_2,
}

impl Prf {
    pub fn frequency_hz(self) -> f32 {
        match self {
            Prf::Mhz19_5 => 19.5e6,
            Prf::Mhz15_6 => 15.6e6,
            Prf::Mhz13_0 => 13.0e6,
            Prf::Mhz8_7 => 8.7e6,
            Prf::Mhz6_5 => 6.5e6,
            Prf::Mhz5_2 => 5.2e6,
        }
    }

    /// Furthest end point the PRF allows.
    pub fn max_measurable_distance_m(self) -> f32 {
        match self {
            Prf::Mhz19_5 => 3.1,
            Prf::Mhz15_6 => 5.1,
            Prf::Mhz13_0 => 7.0,
            Prf::Mhz8_7 => 12.7,
            Prf::Mhz6_5 => 18.5,
            Prf::Mhz5_2 => 24.5,
        }
    }
}

/// One contiguous range segment of a sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubsweepConfig {
    pub start_point: i32,
    pub num_points: u16,
    pub step_length: u16,
    pub profile: Profile,
    pub hwaas: u16,
    pub receiver_gain: u8,
    pub prf: Prf,
    pub enable_tx: bool,
}

impl Default for SubsweepConfig {
    fn default() -> Self {
        Self {
            start_point: 80,
            num_points: 160,
            step_length: 1,
            profile: Profile::P3,
            hwaas: 8,
            receiver_gain: 16,
            prf: Prf::Mhz13_0,
            enable_tx: true,
        }
    }
}

impl SubsweepConfig {
    pub fn end_point(&self) -> i32 {
        self.start_point + i32::from(self.num_points) * i32::from(self.step_length)
    }

    pub fn step_length_m(&self) -> f32 {
        f32::from(self.step_length) * APPROX_BASE_STEP_LENGTH_M
    }

    /// Approximate highest sweep rate the sensor can run this subsweep at.
    pub fn approx_max_sweep_rate(&self) -> f32 {
        let ppp = self.profile.points_per_pulse_unit();
        let pulses = 3 * ppp + u32::from(self.num_points) * u32::from(self.hwaas) * ppp;
        self.prf.frequency_hz() / pulses as f32
    }

    fn collect_violations(&self, index: usize, out: &mut Vec<ConfigViolation>) {
        let mut push = |field: &str, message: String| {
            out.push(ConfigViolation {
                field: format!("subsweeps[{}].{}", index, field),
                message,
            })
        };

        if self.num_points == 0 {
            push("num_points", "must be at least 1".into());
        }
        if self.step_length == 0 {
            push("step_length", "must be greater than 0".into());
        } else if SPARSE_IQ_PPC % self.step_length != 0 && self.step_length % SPARSE_IQ_PPC != 0 {
            push(
                "step_length",
                format!("must be a divisor or multiple of {}", SPARSE_IQ_PPC),
            );
        }
        if self.hwaas == 0 || self.hwaas > MAX_HWAAS {
            push("hwaas", format!("must be within 1..={}", MAX_HWAAS));
        }
        if self.receiver_gain > MAX_RECEIVER_GAIN {
            push(
                "receiver_gain",
                format!("must be within 0..={}", MAX_RECEIVER_GAIN),
            );
        }
        if self.prf == Prf::Mhz19_5 && !matches!(self.profile, Profile::P1 | Profile::P2) {
            push("prf", "19.5 MHz is only compatible with profile 1 and 2".into());
        }
        let end_m = self.end_point() as f32 * APPROX_BASE_STEP_LENGTH_M;
        if end_m > self.prf.max_measurable_distance_m() {
            push(
                "num_points",
                format!(
                    "end point {:.3} m exceeds the {:.1} m reachable with this PRF",
                    end_m,
                    self.prf.max_measurable_distance_m()
                ),
            );
        }
    }
}

/// Acquisition parameters for one sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    pub subsweeps: Vec<SubsweepConfig>,
    pub sweeps_per_frame: u16,
    pub sweep_rate: Option<f32>,
    pub frame_rate: Option<f32>,
    pub continuous_sweep_mode: bool,
    pub double_buffering: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            subsweeps: vec![SubsweepConfig::default()],
            sweeps_per_frame: 1,
            sweep_rate: None,
            frame_rate: None,
            continuous_sweep_mode: false,
            double_buffering: false,
        }
    }
}

impl SensorConfig {
    pub fn single(subsweep: SubsweepConfig) -> Self {
        Self {
            subsweeps: vec![subsweep],
            ..Default::default()
        }
    }

    /// The first subsweep. Processors that do not handle subsweeps work on this one.
    pub fn primary(&self) -> Option<&SubsweepConfig> {
        self.subsweeps.first()
    }

    pub fn points_per_sweep(&self) -> usize {
        self.subsweeps.iter().map(|s| usize::from(s.num_points)).sum()
    }

    /// Hex SHA-256 of the canonical JSON form of the config.
    ///
    /// Every field takes part, so two configs differing in any single field
    /// never share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|byte| format!("{:02x}", byte)).collect()
    }

    /// Checks internal consistency. All violations are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }

    pub fn violations(&self) -> Vec<ConfigViolation> {
        let mut out = Vec::new();
        let mut push = |field: &str, message: &str| {
            out.push(ConfigViolation {
                field: field.to_string(),
                message: message.to_string(),
            })
        };

        if self.subsweeps.is_empty() {
            push("subsweeps", "at least one subsweep is required");
        }
        if self.sweeps_per_frame == 0 {
            push("sweeps_per_frame", "must be at least 1");
        }
        if matches!(self.sweep_rate, Some(rate) if !(rate > 0.0)) {
            push("sweep_rate", "must be positive");
        }
        if matches!(self.frame_rate, Some(rate) if !(rate > 0.0)) {
            push("frame_rate", "must be positive");
        }
        if self.continuous_sweep_mode {
            if self.frame_rate.is_some() {
                push("frame_rate", "must be unset in continuous sweep mode");
            }
            if self.sweep_rate.is_none() {
                push("sweep_rate", "must be set in continuous sweep mode");
            }
        }
        if let (Some(sweep_rate), Some(frame_rate)) = (self.sweep_rate, self.frame_rate) {
            if sweep_rate > 0.0 && self.sweeps_per_frame > 0 {
                let max_frame_rate = sweep_rate / f32::from(self.sweeps_per_frame);
                if frame_rate > max_frame_rate {
                    push(
                        "frame_rate",
                        "faster than sweep_rate / sweeps_per_frame allows",
                    );
                }
            }
        }

        let available = if self.double_buffering {
            SENSOR_BUFFER_SIZE / 2 - 1
        } else {
            SENSOR_BUFFER_SIZE - 1
        };
        let required = self.points_per_sweep() * usize::from(self.sweeps_per_frame);
        if required > available {
            out.push(ConfigViolation {
                field: "sweeps_per_frame".into(),
                message: format!(
                    "requires buffer size {}, but the max is {}",
                    required, available
                ),
            });
        }

        for (index, subsweep) in self.subsweeps.iter().enumerate() {
            subsweep.collect_violations(index, &mut out);
        }
        out
    }
}

/// Which sensors a session drives and with which configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub sensor_ids: Vec<SensorId>,
    pub sensor_config: SensorConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_rate: Option<f32>,
}

impl SessionConfig {
    pub fn new(sensor_ids: Vec<SensorId>, sensor_config: SensorConfig) -> Self {
        Self {
            sensor_ids,
            sensor_config,
            update_rate: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = self.sensor_config.violations();
        if self.sensor_ids.is_empty() {
            violations.push(ConfigViolation {
                field: "sensor_ids".into(),
                message: "at least one sensor is required".into(),
            });
        }
        if self.sensor_ids.iter().any(|id| id.get() == 0) {
            violations.push(ConfigViolation {
                field: "sensor_ids".into(),
                message: "sensor id 0 is reserved".into(),
            });
        }
        let mut sorted = self.sensor_ids.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != self.sensor_ids.len() {
            violations.push(ConfigViolation {
                field: "sensor_ids".into(),
                message: "sensor ids must be unique".into(),
            });
        }
        if matches!(self.update_rate, Some(rate) if !(rate > 0.0)) {
            violations.push(ConfigViolation {
                field: "update_rate".into(),
                message: "must be positive".into(),
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }
}

impl From<SensorConfig> for SessionConfig {
    fn from(sensor_config: SensorConfig) -> Self {
        Self::new(vec![SensorId::new(1)], sensor_config)
    }
}

/// A single violated configuration rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    pub field: String,
    pub message: String,
}

/// Rejected configuration with every rule it violates.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid config: {}", summarize(.violations))]
pub struct ConfigError {
    pub violations: Vec<ConfigViolation>,
}

fn summarize(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}
