use std::sync::Arc;

use ndarray::{s, Array2};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationArtifact, CalibrationManager};
use crate::interface::{
    CalibrationStatus, DetectionOutput, DetectionResult, PresenceOutput, SensorConfig, SensorId,
    SessionMetadata, SubsweepConfig, SweepFrame,
};
use crate::math::MatrixHelper;
use crate::prelude::{Processor, ProcessorError, ProcessorResult};
use crate::processing::filters::{
    cutoff_to_sf, depth_filter, depth_filter_length, dynamic_sf, smooth, tc_to_sf,
};
use crate::telemetry::LogManager;

/// Normalisation of the third-order sweep difference: sqrt(sum of squared
/// binomial coefficients of order 3).
const NOISE_NORM_FACTOR: f32 = 4.472_136;
/// Noise levels below this leave the point out of the score.
const NOISE_FLOOR: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub intra_enable: bool,
    pub inter_enable: bool,
    pub intra_threshold: f32,
    pub inter_threshold: f32,
    pub inter_fast_cutoff_hz: f32,
    pub inter_slow_cutoff_hz: f32,
    pub inter_deviation_tc_s: f32,
    pub inter_output_tc_s: f32,
    pub intra_frame_tc_s: f32,
    pub intra_output_tc_s: f32,
    pub noise_tc_s: f32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            intra_enable: true,
            inter_enable: true,
            intra_threshold: 1.3,
            inter_threshold: 1.0,
            inter_fast_cutoff_hz: 20.0,
            inter_slow_cutoff_hz: 0.2,
            inter_deviation_tc_s: 0.5,
            inter_output_tc_s: 5.0,
            intra_frame_tc_s: 0.15,
            intra_output_tc_s: 0.5,
            noise_tc_s: 10.0,
        }
    }
}

struct SmoothingFactors {
    fast: f32,
    slow: f32,
    inter_dev: f32,
    inter_output: f32,
    intra: f32,
    intra_output: f32,
    noise: f32,
}

impl SmoothingFactors {
    fn new(config: &PresenceConfig, rate: f32) -> Self {
        Self {
            fast: cutoff_to_sf(config.inter_fast_cutoff_hz, rate),
            slow: cutoff_to_sf(config.inter_slow_cutoff_hz, rate),
            inter_dev: tc_to_sf(config.inter_deviation_tc_s, rate),
            inter_output: tc_to_sf(config.inter_output_tc_s, rate),
            intra: tc_to_sf(config.intra_frame_tc_s, rate),
            intra_output: tc_to_sf(config.intra_output_tc_s, rate),
            noise: tc_to_sf(config.noise_tc_s, rate),
        }
    }
}

/// Frame-to-frame memory of the detector.
#[derive(Default)]
struct PresenceState {
    fast_lp: Vec<f32>,
    slow_lp: Vec<f32>,
    lp_inter_dev: Vec<f32>,
    lp_intra_dev: Vec<f32>,
    lp_noise: Vec<f32>,
    intra_score: f32,
    inter_score: f32,
    update_index: u64,
}

impl PresenceState {
    fn new(points: usize) -> Self {
        Self {
            fast_lp: vec![0.0; points],
            slow_lp: vec![0.0; points],
            lp_inter_dev: vec![0.0; points],
            lp_intra_dev: vec![0.0; points],
            lp_noise: vec![0.0; points],
            ..Default::default()
        }
    }
}

/// Motion detector scoring fast (intra-frame) and slow (inter-frame) changes
/// in the primary subsweep.
pub struct PresenceDetector {
    sensor_id: SensorId,
    config: PresenceConfig,
    sensor_config: SensorConfig,
    subsweep: SubsweepConfig,
    sweep_len: usize,
    sweeps_per_frame: usize,
    distances: Vec<f32>,
    depth_filter_length: usize,
    sf: SmoothingFactors,
    state: PresenceState,
    calibration: Option<Arc<CalibrationArtifact>>,
    status: CalibrationStatus,
    detected: bool,
    logger: LogManager,
}

impl PresenceDetector {
    pub fn new(
        sensor_id: SensorId,
        metadata: &SessionMetadata,
        config: PresenceConfig,
    ) -> ProcessorResult<Self> {
        let sensor_config = metadata.sensor_config().clone();
        let subsweep = sensor_config
            .primary()
            .cloned()
            .ok_or_else(|| ProcessorError::InvalidInput("config has no subsweeps".into()))?;
        if metadata.update_rate.is_nan() || metadata.update_rate <= 0.0 {
            return Err(ProcessorError::InvalidInput(format!(
                "update rate {} Hz cannot drive presence smoothing",
                metadata.update_rate
            )));
        }

        let points = usize::from(subsweep.num_points);
        let distances = (0..points)
            .map(|i| {
                (subsweep.start_point + i as i32 * i32::from(subsweep.step_length)) as f32
                    * crate::interface::APPROX_BASE_STEP_LENGTH_M
            })
            .collect();

        Ok(Self {
            sensor_id,
            sf: SmoothingFactors::new(&config, metadata.update_rate),
            config,
            sweep_len: sensor_config.points_per_sweep(),
            sweeps_per_frame: usize::from(sensor_config.sweeps_per_frame),
            depth_filter_length: depth_filter_length(&subsweep),
            state: PresenceState::new(points),
            distances,
            subsweep,
            sensor_config,
            calibration: None,
            status: CalibrationStatus::NoneSupplied,
            detected: false,
            logger: LogManager::new("presence"),
        })
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn subsweep(&self) -> &SubsweepConfig {
        &self.subsweep
    }

    fn noise_estimate(&mut self, frame: &Array2<Complex32>) -> Vec<f32> {
        if let Some(noise) = self.calibration.as_ref().and_then(|a| a.noise()) {
            return noise[..self.distances.len().min(noise.len())].to_vec();
        }
        if frame.nrows() <= 3 {
            return vec![NOISE_FLOOR; self.distances.len()];
        }
        let diff = MatrixHelper::third_difference(frame.view());
        let noise: Vec<f32> = MatrixHelper::column_abs_dev(diff.view(), 0, false)
            .iter()
            .map(|v| v / NOISE_NORM_FACTOR)
            .collect();
        let sf = dynamic_sf(self.sf.noise, self.state.update_index);
        smooth(&mut self.state.lp_noise, &noise, sf);
        self.state.lp_noise.clone()
    }
}

fn normalize(values: &[f32], noise: &[f32], scale: f32) -> Vec<f32> {
    values
        .iter()
        .zip(noise)
        .map(|(&v, &n)| if n >= NOISE_FLOOR { v / n * scale } else { 0.0 })
        .collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

impl Processor for PresenceDetector {
    fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    fn update(&mut self, frame: &SweepFrame) -> ProcessorResult<DetectionResult> {
        if frame.sensor_id != self.sensor_id {
            return Err(ProcessorError::ProcessorMismatch {
                expected: vec![self.sensor_id],
                found: frame.sensor_id,
            });
        }
        if frame.sweep_len != self.sweep_len
            || frame.sweeps_per_frame != self.sweeps_per_frame
            || !frame.is_consistent()
        {
            return Err(ProcessorError::InvalidInput(format!(
                "frame {} is {}x{}, expected {}x{}",
                frame.sequence,
                frame.sweeps_per_frame,
                frame.sweep_len,
                self.sweeps_per_frame,
                self.sweep_len
            )));
        }

        let points = self.distances.len();
        let frame_array = frame.to_array().slice(s![.., ..points]).to_owned();
        let noise = self.noise_estimate(&frame_array);
        let index = self.state.update_index;

        // Intra-frame: sweep-to-sweep deviation within the frame.
        let sweep_dev = MatrixHelper::column_abs_dev(frame_array.view(), 1, true).to_vec();
        smooth(&mut self.state.lp_intra_dev, &sweep_dev, dynamic_sf(self.sf.intra, index));
        let intra = depth_filter(
            &normalize(&self.state.lp_intra_dev, &noise, 1.0),
            self.depth_filter_length,
        );
        let intra_index = argmax(&intra);
        let intra_peak = intra.get(intra_index).copied().unwrap_or(0.0);
        self.state.intra_score =
            self.sf.intra_output * self.state.intra_score + (1.0 - self.sf.intra_output) * intra_peak;

        // Inter-frame: drift between fast and slow averages of the amplitude.
        let abs_mean: Vec<f32> = MatrixHelper::column_mean(frame_array.view())
            .iter()
            .map(|v| v.norm())
            .collect();
        smooth(&mut self.state.fast_lp, &abs_mean, dynamic_sf(self.sf.fast, index));
        smooth(&mut self.state.slow_lp, &abs_mean, dynamic_sf(self.sf.slow, index));
        let inter_dev: Vec<f32> = self
            .state
            .fast_lp
            .iter()
            .zip(&self.state.slow_lp)
            .map(|(fast, slow)| (fast - slow).abs())
            .collect();
        smooth(&mut self.state.lp_inter_dev, &inter_dev, dynamic_sf(self.sf.inter_dev, index));
        let spf_gain = (self.sweeps_per_frame as f32).sqrt();
        let inter = depth_filter(
            &normalize(&self.state.lp_inter_dev, &noise, spf_gain),
            self.depth_filter_length,
        );
        let inter_index = argmax(&inter);
        let inter_peak = inter.get(inter_index).copied().unwrap_or(0.0);
        let sf = dynamic_sf(self.sf.inter_output, index);
        self.state.inter_score = sf * self.state.inter_score + (1.0 - sf) * inter_peak;

        self.state.update_index += 1;

        let (intra_score, inter_score) = (self.state.intra_score, self.state.inter_score);
        let presence_index = if self.config.intra_enable && intra_score > self.config.intra_threshold {
            Some(intra_index)
        } else if self.config.inter_enable && inter_score > self.config.inter_threshold {
            Some(inter_index)
        } else {
            None
        };

        let detected = presence_index.is_some();
        if detected != self.detected {
            self.logger.record(&format!(
                "sensor {} presence {} at frame {}",
                self.sensor_id,
                if detected { "detected" } else { "lost" },
                frame.sequence
            ));
            self.detected = detected;
        }

        let score = match (self.config.intra_enable, self.config.inter_enable) {
            (true, true) => intra_score.max(inter_score),
            (true, false) => intra_score,
            (false, true) => inter_score,
            (false, false) => 0.0,
        };

        Ok(DetectionResult {
            sensor_id: self.sensor_id,
            sequence: frame.sequence,
            timestamp_us: frame.timestamp_us,
            calibration: self.status,
            frame: frame.context,
            output: DetectionOutput::Presence(PresenceOutput {
                detected,
                score,
                intra_score,
                inter_score,
                distance_m: presence_index.map(|i| self.distances[i]),
            }),
        })
    }

    fn reset_history(&mut self) {
        self.state = PresenceState::new(self.distances.len());
        self.detected = false;
        self.logger
            .record(&format!("sensor {} history reset", self.sensor_id));
    }

    fn recalibrate(&mut self, artifact: Option<Arc<CalibrationArtifact>>) {
        self.status = CalibrationManager::status_for(
            artifact.as_deref(),
            self.sensor_id,
            &self.sensor_config,
        );
        self.calibration = match self.status {
            CalibrationStatus::Applied => artifact,
            _ => None,
        };
        if self.status == CalibrationStatus::RejectedStale {
            self.logger.anomaly(&format!(
                "sensor {} calibration is stale, running uncalibrated",
                self.sensor_id
            ));
        }
    }

    fn calibration_status(&self) -> CalibrationStatus {
        self.status
    }
}
