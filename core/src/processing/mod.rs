pub mod buffer_pool;
pub mod cfar;
pub mod distance;
pub mod filters;
pub mod presence;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationArtifact;
use crate::interface::{CalibrationStatus, DetectionResult, SensorId, SessionMetadata, SweepFrame};
use crate::prelude::{Processor, ProcessorError, ProcessorResult};

pub use buffer_pool::BufferPool;
pub use distance::{DistanceConfig, DistanceDetector};
pub use presence::{PresenceConfig, PresenceDetector};

/// Which detector to run, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    Presence(PresenceConfig),
    Distance(DistanceConfig),
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig::Presence(PresenceConfig::default())
    }
}

/// The closed set of detectors a pipeline can run.
pub enum Detector {
    Presence(PresenceDetector),
    Distance(DistanceDetector),
}

impl Detector {
    /// Builds the detector for `sensor_id` and applies `artifact` if it
    /// still matches the session's config.
    pub fn new(
        sensor_id: SensorId,
        metadata: &SessionMetadata,
        config: &DetectorConfig,
        artifact: Option<Arc<CalibrationArtifact>>,
    ) -> ProcessorResult<Self> {
        if metadata.layout_for(sensor_id).is_none() {
            return Err(ProcessorError::InvalidInput(format!(
                "sensor {} is not part of the session",
                sensor_id
            )));
        }
        let mut detector = match config {
            DetectorConfig::Presence(config) => {
                Detector::Presence(PresenceDetector::new(sensor_id, metadata, config.clone())?)
            }
            DetectorConfig::Distance(config) => {
                Detector::Distance(DistanceDetector::new(sensor_id, metadata, config.clone())?)
            }
        };
        detector.recalibrate(artifact);
        Ok(detector)
    }

    fn inner(&self) -> &dyn Processor {
        match self {
            Detector::Presence(detector) => detector,
            Detector::Distance(detector) => detector,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Processor {
        match self {
            Detector::Presence(detector) => detector,
            Detector::Distance(detector) => detector,
        }
    }
}

impl Processor for Detector {
    fn sensor_id(&self) -> SensorId {
        self.inner().sensor_id()
    }

    fn update(&mut self, frame: &SweepFrame) -> ProcessorResult<DetectionResult> {
        self.inner_mut().update(frame)
    }

    fn reset_history(&mut self) {
        self.inner_mut().reset_history()
    }

    fn recalibrate(&mut self, artifact: Option<Arc<CalibrationArtifact>>) {
        self.inner_mut().recalibrate(artifact)
    }

    fn calibration_status(&self) -> CalibrationStatus {
        self.inner().calibration_status()
    }
}
