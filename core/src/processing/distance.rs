use std::sync::Arc;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::calibration::{CalibrationArtifact, CalibrationManager};
use crate::interface::{
    CalibrationStatus, DetectionOutput, DetectionResult, DistanceOutput, DistancePeak, SensorConfig,
    SensorId, SessionMetadata, SubsweepConfig, SweepFrame, APPROX_BASE_STEP_LENGTH_M,
};
use crate::math::StatsHelper;
use crate::prelude::{Processor, ProcessorError, ProcessorResult};
use crate::processing::buffer_pool::BufferPool;
use crate::processing::cfar::{find_peaks, interpolate_peak, Cfar};
use crate::processing::filters::DistanceFilter;
use crate::telemetry::LogManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceConfig {
    /// 0 gives the fewest false detections, 1 the most sensitive threshold.
    pub sensitivity: f32,
    pub max_peaks: usize,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            sensitivity: 0.5,
            max_peaks: 5,
        }
    }
}

/// Reflector distance estimator on the primary subsweep.
pub struct DistanceDetector {
    sensor_id: SensorId,
    config: DistanceConfig,
    sensor_config: SensorConfig,
    subsweep: SubsweepConfig,
    sweep_len: usize,
    sweeps_per_frame: usize,
    filter: DistanceFilter,
    cfar: Cfar,
    processing_gain: f32,
    pool: BufferPool,
    calibration: Option<Arc<CalibrationArtifact>>,
    status: CalibrationStatus,
    logger: LogManager,
}

impl DistanceDetector {
    pub fn new(
        sensor_id: SensorId,
        metadata: &SessionMetadata,
        config: DistanceConfig,
    ) -> ProcessorResult<Self> {
        let sensor_config = metadata.sensor_config().clone();
        let subsweep = sensor_config
            .primary()
            .cloned()
            .ok_or_else(|| ProcessorError::InvalidInput("config has no subsweeps".into()))?;
        let points = usize::from(subsweep.num_points);

        Ok(Self {
            sensor_id,
            filter: DistanceFilter::new(points, &subsweep),
            cfar: Cfar::for_subsweep(&subsweep, config.sensitivity),
            processing_gain: f32::from(subsweep.hwaas).sqrt() * subsweep.profile.amplitude_gain(),
            sweep_len: sensor_config.points_per_sweep(),
            sweeps_per_frame: usize::from(sensor_config.sweeps_per_frame),
            pool: BufferPool::with_capacity(2),
            config,
            subsweep,
            sensor_config,
            calibration: None,
            status: CalibrationStatus::NoneSupplied,
            logger: LogManager::new("distance"),
        })
    }

    pub fn config(&self) -> &DistanceConfig {
        &self.config
    }

    pub fn cfar(&self) -> &Cfar {
        &self.cfar
    }

    fn distance_at(&self, index: f32) -> f32 {
        (self.subsweep.start_point as f32 + index * f32::from(self.subsweep.step_length))
            * APPROX_BASE_STEP_LENGTH_M
    }

    fn noise_levels(&self, amplitude: &[f32]) -> Vec<f32> {
        match self.calibration.as_ref().and_then(|a| a.noise()) {
            Some(noise) => {
                let scale = 1.0 / (self.sweeps_per_frame.max(1) as f32).sqrt();
                (0..amplitude.len())
                    .map(|i| noise.get(i).copied().unwrap_or(0.0) * scale)
                    .collect()
            }
            None => vec![StatsHelper::lower_half_mean(amplitude); amplitude.len()],
        }
    }
}

impl Processor for DistanceDetector {
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

        let points = usize::from(self.subsweep.num_points);
        let mut sweep = frame.mean_sweep();
        sweep.truncate(points);
        if let Some(offset) = self.calibration.as_ref().and_then(|a| a.offset()) {
            for (value, background) in sweep.iter_mut().zip(offset) {
                *value -= background;
            }
        }

        let filtered: Vec<Complex32> = self.filter.apply(&sweep);
        let mut amplitude = self.pool.checkout(points)?;
        for (slot, value) in amplitude.iter_mut().zip(&filtered) {
            *slot = value.norm();
        }

        let noise = self.noise_levels(&amplitude);
        let threshold = self.cfar.threshold(&amplitude, &noise);
        let mut peaks: Vec<DistancePeak> = find_peaks(&amplitude, &threshold)
            .into_iter()
            .map(|index| {
                let (location, peak) = interpolate_peak(&amplitude, index);
                DistancePeak {
                    index,
                    distance_m: self.distance_at(location),
                    amplitude: peak / self.processing_gain,
                }
            })
            .collect();
        self.pool.release(amplitude);

        peaks.sort_by(|a, b| b.amplitude.total_cmp(&a.amplitude));
        peaks.truncate(self.config.max_peaks);

        Ok(DetectionResult {
            sensor_id: self.sensor_id,
            sequence: frame.sequence,
            timestamp_us: frame.timestamp_us,
            calibration: self.status,
            frame: frame.context,
            output: DetectionOutput::Distance(DistanceOutput {
                peaks,
                noise_floor: StatsHelper::mean(&noise) / self.processing_gain,
            }),
        })
    }

    /// Distance estimation is memoryless across frames.
    fn reset_history(&mut self) {
        self.pool.reset();
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
        match self.status {
            CalibrationStatus::Applied => self
                .logger
                .record(&format!("sensor {} background calibration applied", self.sensor_id)),
            CalibrationStatus::RejectedStale => self.logger.anomaly(&format!(
                "sensor {} calibration is stale, running uncalibrated",
                self.sensor_id
            )),
            CalibrationStatus::NoneSupplied => {}
        }
    }

    fn calibration_status(&self) -> CalibrationStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::ArtifactStore;
    use crate::interface::{FrameLayout, Profile, SessionConfig, PROTOCOL_VERSION};
    use num_complex::Complex;

    fn sensor_config() -> SensorConfig {
        SensorConfig::single(SubsweepConfig {
            start_point: 200,
            num_points: 100,
            step_length: 1,
            profile: Profile::P1,
            hwaas: 4,
            ..Default::default()
        })
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            protocol_version: PROTOCOL_VERSION,
            server_version: "test".into(),
            layouts: vec![FrameLayout::from_config(SensorId::new(1), &sensor_config())],
            config: SessionConfig::from(sensor_config()),
            update_rate: 10.0,
            ticks_per_second: 1_000,
        }
    }

    fn gaussian_frame(sequence: u32, centre: f32, peak: f32, background: i16) -> SweepFrame {
        let sigma = 16.0 / 2.355;
        let samples = (0..100)
            .map(|i| {
                let x = (i as f32 - centre) / sigma;
                let amplitude = peak * (-0.5 * x * x).exp();
                Complex::new(amplitude as i16 + background, if i % 3 == 0 { 1 } else { -1 })
            })
            .collect();
        SweepFrame {
            sensor_id: SensorId::new(1),
            sequence,
            tick: 0,
            timestamp_us: 0,
            sweeps_per_frame: 1,
            sweep_len: 100,
            samples,
            context: Default::default(),
        }
    }

    #[test]
    fn strongest_peak_lands_on_reflector() {
        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), DistanceConfig::default()).unwrap();
        let result = detector.update(&gaussian_frame(0, 40.0, 4000.0, 0)).unwrap();
        let output = result.distance().unwrap();
        let strongest = &output.peaks[0];
        assert!((strongest.index as i64 - 40).abs() <= 1);
        assert!((strongest.distance_m - 240.0 * 2.5e-3).abs() < 2.5e-3);
        assert!(strongest.amplitude > output.noise_floor);
        assert!(output.peaks.windows(2).all(|w| w[0].amplitude >= w[1].amplitude));
        assert_eq!(result.calibration, CalibrationStatus::NoneSupplied);
    }

    #[test]
    fn flat_sweep_has_no_peaks() {
        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), DistanceConfig::default()).unwrap();
        let result = detector.update(&gaussian_frame(0, 40.0, 0.0, 50)).unwrap();
        assert!(result.distance().unwrap().peaks.is_empty());
    }

    fn two_echo_frame() -> SweepFrame {
        let near = gaussian_frame(0, 38.0, 4000.0, 0);
        let far = gaussian_frame(0, 62.0, 2000.0, 0);
        SweepFrame {
            samples: near
                .samples
                .iter()
                .zip(&far.samples)
                .map(|(a, b)| Complex::new(a.re + b.re, a.im))
                .collect(),
            ..near
        }
    }

    #[test]
    fn peak_count_is_capped_to_the_strongest() {
        let uncapped = DistanceConfig {
            sensitivity: 1.0,
            max_peaks: 5,
        };
        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), uncapped).unwrap();
        let result = detector.update(&two_echo_frame()).unwrap();
        assert!(result.distance().unwrap().peaks.len() >= 2);

        let capped = DistanceConfig {
            sensitivity: 1.0,
            max_peaks: 1,
        };
        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), capped).unwrap();
        let result = detector.update(&two_echo_frame()).unwrap();
        let peaks = &result.distance().unwrap().peaks;
        assert_eq!(peaks.len(), 1);
        assert!((peaks[0].index as i64 - 38).abs() <= 1);
    }

    #[test]
    fn applied_background_removes_static_reflector() {
        let manager = CalibrationManager::new(Arc::new(ArtifactStore::in_memory()));
        let background: Vec<SweepFrame> = (0..10).map(|seq| gaussian_frame(seq, 40.0, 4000.0, 0)).collect();
        let artifact = manager
            .compute(SensorId::new(1), &sensor_config(), &background)
            .unwrap();

        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), DistanceConfig::default()).unwrap();
        detector.recalibrate(Some(Arc::new(artifact)));
        assert_eq!(detector.calibration_status(), CalibrationStatus::Applied);

        let result = detector.update(&gaussian_frame(10, 40.0, 4000.0, 0)).unwrap();
        assert_eq!(result.calibration, CalibrationStatus::Applied);
        assert!(result.distance().unwrap().peaks.is_empty());
    }

    #[test]
    fn malformed_frame_is_invalid_input() {
        let mut detector = DistanceDetector::new(SensorId::new(1), &metadata(), DistanceConfig::default()).unwrap();
        let mut frame = gaussian_frame(0, 40.0, 100.0, 0);
        frame.samples.pop();
        assert!(matches!(
            detector.update(&frame),
            Err(ProcessorError::InvalidInput(_))
        ));
    }
}
