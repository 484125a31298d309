use std::fmt;

use ndarray::Array2;
use num_complex::{Complex, Complex32};
use serde::{Deserialize, Serialize};

/// Identifier of a sensor attached to the module. Zero is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(u8);

impl SensorId {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for SensorId {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

/// Conditions the sensor reported alongside a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameContext {
    /// At least one sample hit the ADC limits.
    pub data_saturated: bool,
    /// The frame was produced later than the configured rate allows.
    pub frame_delayed: bool,
    /// The sensor drifted (e.g. in temperature) far enough from its last
    /// calibration that background artifacts should be recomputed.
    pub calibration_needed: bool,
    /// Sensor temperature in degrees Celsius.
    pub temperature: i16,
}

impl FrameContext {
    const SATURATED: u8 = 0x01;
    const DELAYED: u8 = 0x02;
    const CALIBRATION_NEEDED: u8 = 0x04;

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.data_saturated {
            flags |= Self::SATURATED;
        }
        if self.frame_delayed {
            flags |= Self::DELAYED;
        }
        if self.calibration_needed {
            flags |= Self::CALIBRATION_NEEDED;
        }
        flags
    }

    pub fn from_flags(flags: u8, temperature: i16) -> Self {
        Self {
            data_saturated: flags & Self::SATURATED != 0,
            frame_delayed: flags & Self::DELAYED != 0,
            calibration_needed: flags & Self::CALIBRATION_NEEDED != 0,
            temperature,
        }
    }

    /// True when any condition worth warning about is set.
    pub fn has_warnings(&self) -> bool {
        self.data_saturated || self.frame_delayed || self.calibration_needed
    }
}

/// One frame of IQ sweeps from one sensor.
///
/// `samples` is row-major `(sweep, point)` with `sweeps_per_frame * sweep_len`
/// entries. Frames are immutable once produced; consumers clone if they need
/// to keep one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepFrame {
    pub sensor_id: SensorId,
    pub sequence: u32,
    pub tick: u64,
    pub timestamp_us: u64,
    pub sweeps_per_frame: usize,
    pub sweep_len: usize,
    pub samples: Vec<Complex<i16>>,
    #[serde(default)]
    pub context: FrameContext,
}

impl SweepFrame {
    pub fn sweep(&self, index: usize) -> Option<&[Complex<i16>]> {
        let start = index.checked_mul(self.sweep_len)?;
        self.samples.get(start..start + self.sweep_len)
    }

    /// Samples as a `(sweeps_per_frame, sweep_len)` float matrix.
    pub fn to_array(&self) -> Array2<Complex32> {
        Array2::from_shape_fn((self.sweeps_per_frame, self.sweep_len), |(sweep, point)| {
            let sample = self.samples[sweep * self.sweep_len + point];
            Complex32::new(f32::from(sample.re), f32::from(sample.im))
        })
    }

    /// Coherent mean over the sweeps of the frame.
    pub fn mean_sweep(&self) -> Vec<Complex32> {
        let mut mean = vec![Complex32::new(0.0, 0.0); self.sweep_len];
        if self.sweeps_per_frame == 0 {
            return mean;
        }
        for sweep in self.samples.chunks_exact(self.sweep_len.max(1)) {
            for (acc, sample) in mean.iter_mut().zip(sweep) {
                acc.re += f32::from(sample.re);
                acc.im += f32::from(sample.im);
            }
        }
        let scale = 1.0 / self.sweeps_per_frame as f32;
        mean.iter_mut().for_each(|value| *value *= scale);
        mean
    }

    pub fn is_consistent(&self) -> bool {
        self.samples.len() == self.sweeps_per_frame * self.sweep_len
    }
}

/// What a frame source yields on each pull.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Frame(SweepFrame),
    /// `count` frames of `sensor_id` were lost before the next frame.
    DroppedFrames { sensor_id: SensorId, count: u32 },
    EndOfStream,
}
