use std::collections::BTreeMap;
use std::sync::Arc;

use num_complex::Complex32;

use crate::calibration::artifact::{CalibrationArtifact, CalibrationKind};
use crate::calibration::store::ArtifactStore;
use crate::calibration::CalibrationError;
use crate::interface::{CalibrationStatus, SensorConfig, SensorId, SweepFrame};
use crate::telemetry::LogManager;

pub const DEFAULT_MIN_FRAMES: usize = 10;
/// Lowest noise level an artifact may report, in raw sample units.
pub const DEFAULT_NOISE_FLOOR: f32 = 1.0;

/// Produces, checks and hands out calibration artifacts.
pub struct CalibrationManager {
    store: Arc<ArtifactStore>,
    min_frames: usize,
    noise_floor: f32,
    logger: LogManager,
}

impl CalibrationManager {
    pub fn new(store: Arc<ArtifactStore>) -> Self {
        Self {
            store,
            min_frames: DEFAULT_MIN_FRAMES,
            noise_floor: DEFAULT_NOISE_FLOOR,
            logger: LogManager::new("calibration"),
        }
    }

    pub fn with_min_frames(mut self, min_frames: usize) -> Self {
        self.min_frames = min_frames.max(1);
        self
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Derives noise and offset profiles from background frames.
    pub fn compute(
        &self,
        sensor_id: SensorId,
        config: &SensorConfig,
        frames: &[SweepFrame],
    ) -> Result<CalibrationArtifact, CalibrationError> {
        if frames.len() < self.min_frames {
            return Err(CalibrationError::InsufficientData {
                required: self.min_frames,
                supplied: frames.len(),
            });
        }
        let sweep_len = config.points_per_sweep();
        let sweeps_per_frame = usize::from(config.sweeps_per_frame);
        for frame in frames {
            if frame.sensor_id != sensor_id {
                return Err(CalibrationError::SensorMismatch {
                    expected: sensor_id,
                    found: frame.sensor_id,
                });
            }
            if frame.sweep_len != sweep_len
                || frame.sweeps_per_frame != sweeps_per_frame
                || !frame.is_consistent()
            {
                return Err(CalibrationError::LayoutMismatch(format!(
                    "frame {} is {}x{}, config expects {}x{}",
                    frame.sequence, frame.sweeps_per_frame, frame.sweep_len, sweeps_per_frame, sweep_len
                )));
            }
        }

        let total_sweeps = (frames.len() * sweeps_per_frame) as f32;
        let mut offset = vec![Complex32::new(0.0, 0.0); sweep_len];
        for frame in frames {
            for sweep in frame.samples.chunks_exact(sweep_len) {
                for (acc, sample) in offset.iter_mut().zip(sweep) {
                    acc.re += f32::from(sample.re);
                    acc.im += f32::from(sample.im);
                }
            }
        }
        offset.iter_mut().for_each(|value| *value /= total_sweeps);

        let mut variance = vec![0f32; sweep_len];
        for frame in frames {
            for sweep in frame.samples.chunks_exact(sweep_len) {
                for ((acc, sample), mean) in variance.iter_mut().zip(sweep).zip(&offset) {
                    let value = Complex32::new(f32::from(sample.re), f32::from(sample.im));
                    *acc += (value - mean).norm_sqr();
                }
            }
        }
        let noise: Vec<f32> = variance
            .iter()
            .map(|&sum| (sum / total_sweeps).sqrt().max(self.noise_floor))
            .collect();

        let mut coefficients = BTreeMap::new();
        coefficients.insert(CalibrationKind::Noise, noise);
        coefficients.insert(
            CalibrationKind::Offset,
            offset.iter().flat_map(|value| [value.re, value.im]).collect(),
        );

        self.logger.record(&format!(
            "computed calibration for sensor {} from {} frames",
            sensor_id,
            frames.len()
        ));
        Ok(CalibrationArtifact {
            sensor_id,
            fingerprint: config.fingerprint(),
            frames_used: frames.len(),
            coefficients,
        })
    }

    /// True only when the artifact was computed for exactly this config.
    pub fn validate(artifact: &CalibrationArtifact, config: &SensorConfig) -> bool {
        artifact.matches(config)
    }

    /// An artifact computed for another sensor is rejected like a stale one.
    pub fn status_for(
        artifact: Option<&CalibrationArtifact>,
        sensor_id: SensorId,
        config: &SensorConfig,
    ) -> CalibrationStatus {
        match artifact {
            None => CalibrationStatus::NoneSupplied,
            Some(artifact) if artifact.applies_to(sensor_id, config) => CalibrationStatus::Applied,
            Some(_) => CalibrationStatus::RejectedStale,
        }
    }

    pub fn store_artifact(&self, artifact: CalibrationArtifact) -> Result<Arc<CalibrationArtifact>, CalibrationError> {
        let stored = self.store.put(artifact)?;
        self.logger
            .record(&format!("stored calibration for sensor {}", stored.sensor_id));
        Ok(stored)
    }

    pub fn load(&self, sensor_id: SensorId) -> Option<Arc<CalibrationArtifact>> {
        self.store.get(sensor_id)
    }

    /// The stored artifact for `sensor_id` together with whether it may be
    /// applied under `config`. Stale artifacts are returned so the caller
    /// can report them.
    pub fn lookup(
        &self,
        sensor_id: SensorId,
        config: &SensorConfig,
    ) -> (Option<Arc<CalibrationArtifact>>, CalibrationStatus) {
        let artifact = self.load(sensor_id);
        let status = Self::status_for(artifact.as_deref(), sensor_id, config);
        if status == CalibrationStatus::RejectedStale {
            self.logger.anomaly(&format!(
                "calibration for sensor {} does not match the active config",
                sensor_id
            ));
        }
        (artifact, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::SubsweepConfig;
    use num_complex::Complex;

    fn config() -> SensorConfig {
        SensorConfig::single(SubsweepConfig {
            num_points: 8,
            ..Default::default()
        })
    }

    fn frames(count: usize, sensor: u8) -> Vec<SweepFrame> {
        (0..count)
            .map(|i| SweepFrame {
                sensor_id: SensorId::new(sensor),
                sequence: i as u32,
                tick: 0,
                timestamp_us: 0,
                sweeps_per_frame: 1,
                sweep_len: 8,
                samples: (0..8).map(|p| Complex::new(10 + p as i16, -2)).collect(),
                context: Default::default(),
            })
            .collect()
    }

    fn manager() -> CalibrationManager {
        CalibrationManager::new(Arc::new(ArtifactStore::in_memory()))
    }

    #[test]
    fn too_few_frames_is_insufficient_data() {
        let err = manager()
            .compute(SensorId::new(1), &config(), &frames(9, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData { required: 10, supplied: 9 }
        ));
    }

    #[test]
    fn frames_from_another_sensor_are_rejected() {
        let err = manager()
            .compute(SensorId::new(1), &config(), &frames(10, 2))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::SensorMismatch { .. }));
    }

    #[test]
    fn identical_frames_give_floored_noise_and_exact_offset() {
        let artifact = manager()
            .compute(SensorId::new(1), &config(), &frames(10, 1))
            .unwrap();
        assert!(artifact.noise().unwrap().iter().all(|&n| n == DEFAULT_NOISE_FLOOR));
        assert_eq!(artifact.offset().unwrap()[3], Complex32::new(13.0, -2.0));
        assert!(CalibrationManager::validate(&artifact, &config()));
    }

    #[test]
    fn status_distinguishes_all_three_cases() {
        let artifact = manager()
            .compute(SensorId::new(1), &config(), &frames(10, 1))
            .unwrap();
        let changed = SensorConfig {
            sweep_rate: Some(50.0),
            ..config()
        };
        let sensor = SensorId::new(1);
        assert_eq!(
            CalibrationManager::status_for(None, sensor, &config()),
            CalibrationStatus::NoneSupplied
        );
        assert_eq!(
            CalibrationManager::status_for(Some(&artifact), sensor, &config()),
            CalibrationStatus::Applied
        );
        assert_eq!(
            CalibrationManager::status_for(Some(&artifact), sensor, &changed),
            CalibrationStatus::RejectedStale
        );
    }

    #[test]
    fn artifact_of_another_sensor_is_not_applied() {
        let artifact = manager()
            .compute(SensorId::new(2), &config(), &frames(10, 2))
            .unwrap();
        assert_eq!(
            CalibrationManager::status_for(Some(&artifact), SensorId::new(1), &config()),
            CalibrationStatus::RejectedStale
        );
        assert_eq!(
            CalibrationManager::status_for(Some(&artifact), SensorId::new(2), &config()),
            CalibrationStatus::Applied
        );
    }

    #[test]
    fn lookup_returns_stale_artifacts_flagged() {
        let manager = manager();
        let artifact = manager
            .compute(SensorId::new(1), &config(), &frames(10, 1))
            .unwrap();
        manager.store_artifact(artifact).unwrap();

        let changed = SensorConfig {
            sweeps_per_frame: 2,
            ..config()
        };
        let (found, status) = manager.lookup(SensorId::new(1), &changed);
        assert!(found.is_some());
        assert_eq!(status, CalibrationStatus::RejectedStale);
        assert_eq!(manager.lookup(SensorId::new(4), &config()).1, CalibrationStatus::NoneSupplied);
    }
}
