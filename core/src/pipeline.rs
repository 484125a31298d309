//! Routes frames from any source to one detector per sensor and publishes
//! the results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;

use crate::calibration::{CalibrationArtifact, CalibrationManager};
use crate::interface::{CalibrationStatus, DetectionResult, SensorId, SessionMetadata, StreamEvent};
use crate::prelude::{FrameSource, Processor, ProcessorError};
use crate::processing::{Detector, DetectorConfig};
use crate::telemetry::LogManager;

/// Latest-value channels for whoever displays pipeline output.
///
/// Backed by `tokio::sync::watch`, which needs no runtime on the sending
/// side; receivers may live in async code.
#[derive(Clone)]
pub struct ResultPublisher {
    detection: Arc<watch::Sender<Option<DetectionResult>>>,
    metadata: Arc<watch::Sender<Option<SessionMetadata>>>,
    calibration: Arc<watch::Sender<BTreeMap<SensorId, CalibrationStatus>>>,
}

impl Default for ResultPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultPublisher {
    pub fn new() -> Self {
        Self {
            detection: Arc::new(watch::channel(None).0),
            metadata: Arc::new(watch::channel(None).0),
            calibration: Arc::new(watch::channel(BTreeMap::new()).0),
        }
    }

    pub fn publish_detection(&self, result: &DetectionResult) {
        self.detection.send_replace(Some(result.clone()));
    }

    pub fn publish_metadata(&self, metadata: &SessionMetadata) {
        self.metadata.send_replace(Some(metadata.clone()));
    }

    pub fn publish_calibration(&self, sensor_id: SensorId, status: CalibrationStatus) {
        self.calibration.send_modify(|statuses| {
            statuses.insert(sensor_id, status);
        });
    }

    pub fn detection(&self) -> watch::Receiver<Option<DetectionResult>> {
        self.detection.subscribe()
    }

    pub fn metadata(&self) -> watch::Receiver<Option<SessionMetadata>> {
        self.metadata.subscribe()
    }

    pub fn calibration(&self) -> watch::Receiver<BTreeMap<SensorId, CalibrationStatus>> {
        self.calibration.subscribe()
    }

    pub fn latest_detection(&self) -> Option<DetectionResult> {
        self.detection.borrow().clone()
    }
}

/// What one pipeline step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Result(DetectionResult),
    /// History of `sensor_id`'s detector was reset because frames were lost.
    Reset { sensor_id: SensorId, dropped: u32 },
    EndOfStream,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub results: u64,
    pub resets: u64,
    pub skipped: u64,
}

pub struct Pipeline<S: FrameSource> {
    source: S,
    detectors: BTreeMap<SensorId, Detector>,
    publisher: Option<ResultPublisher>,
    logger: LogManager,
}

impl<S: FrameSource> Pipeline<S> {
    /// One detector of the given kind per sensor in the source's session,
    /// each calibrated from `calibration` if a matching artifact is stored.
    pub fn new(
        source: S,
        config: &DetectorConfig,
        calibration: &CalibrationManager,
    ) -> crate::Result<Self> {
        let metadata = source
            .metadata()
            .ok_or_else(|| ProcessorError::InvalidInput("source has no session metadata".into()))?;
        let sensor_config = metadata.sensor_config();
        let mut detectors = BTreeMap::new();
        for layout in &metadata.layouts {
            let (artifact, _) = calibration.lookup(layout.sensor_id, sensor_config);
            let detector = Detector::new(layout.sensor_id, metadata, config, artifact)?;
            detectors.insert(layout.sensor_id, detector);
        }
        Ok(Self::with_detectors(source, detectors))
    }

    pub fn with_detectors(source: S, detectors: BTreeMap<SensorId, Detector>) -> Self {
        let logger = LogManager::new("pipeline");
        logger.record(&format!("routing {} sensor(s)", detectors.len()));
        Self {
            source,
            detectors,
            publisher: None,
            logger,
        }
    }

    pub fn with_publisher(mut self, publisher: ResultPublisher) -> Self {
        if let Some(metadata) = self.source.metadata() {
            publisher.publish_metadata(metadata);
        }
        for (sensor_id, detector) in &self.detectors {
            publisher.publish_calibration(*sensor_id, detector.calibration_status());
        }
        self.publisher = Some(publisher);
        self
    }

    pub fn sensors(&self) -> Vec<SensorId> {
        self.detectors.keys().copied().collect()
    }

    pub fn detector(&self, sensor_id: SensorId) -> Option<&Detector> {
        self.detectors.get(&sensor_id)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// Swaps the artifact of one sensor's detector. History is kept.
    pub fn recalibrate(
        &mut self,
        sensor_id: SensorId,
        artifact: Option<Arc<CalibrationArtifact>>,
    ) -> crate::Result<CalibrationStatus> {
        let known = self.sensors();
        let detector = self
            .detectors
            .get_mut(&sensor_id)
            .ok_or(ProcessorError::ProcessorMismatch {
                expected: known,
                found: sensor_id,
            })?;
        detector.recalibrate(artifact);
        let status = detector.calibration_status();
        if let Some(publisher) = &self.publisher {
            publisher.publish_calibration(sensor_id, status);
        }
        Ok(status)
    }

    /// Pulls one event from the source and processes it.
    pub fn step(&mut self, timeout: Duration) -> crate::Result<PipelineEvent> {
        match self.source.next_event(timeout)? {
            StreamEvent::Frame(frame) => {
                let known = self.sensors();
                let detector = self.detectors.get_mut(&frame.sensor_id).ok_or(
                    ProcessorError::ProcessorMismatch {
                        expected: known,
                        found: frame.sensor_id,
                    },
                )?;
                let result = detector.update(&frame)?;
                if result.calibration_needed() && result.calibration == CalibrationStatus::Applied {
                    self.logger.anomaly(&format!(
                        "sensor {} requests recalibration at {} °C, applied artifact may be outdated",
                        result.sensor_id, result.frame.temperature
                    ));
                }
                if let Some(publisher) = &self.publisher {
                    publisher.publish_detection(&result);
                }
                Ok(PipelineEvent::Result(result))
            }
            StreamEvent::DroppedFrames { sensor_id, count } => {
                if let Some(detector) = self.detectors.get_mut(&sensor_id) {
                    detector.reset_history();
                }
                self.logger.anomaly(&format!(
                    "sensor {} lost {} frame(s), history reset",
                    sensor_id, count
                ));
                Ok(PipelineEvent::Reset {
                    sensor_id,
                    dropped: count,
                })
            }
            StreamEvent::EndOfStream => Ok(PipelineEvent::EndOfStream),
        }
    }

    /// Steps until the source ends, handing every result to `on_result`.
    /// Errors that only spoil one frame are logged and skipped; anything
    /// else, including a timeout, ends the run.
    pub fn run<F>(&mut self, timeout: Duration, mut on_result: F) -> crate::Result<PipelineSummary>
    where
        F: FnMut(&DetectionResult),
    {
        let mut summary = PipelineSummary::default();
        loop {
            match self.step(timeout) {
                Ok(PipelineEvent::Result(result)) => {
                    summary.results += 1;
                    on_result(&result);
                }
                Ok(PipelineEvent::Reset { .. }) => summary.resets += 1,
                Ok(PipelineEvent::EndOfStream) => break,
                Err(err) if err.is_recoverable() => {
                    summary.skipped += 1;
                    self.logger.anomaly(&format!("skipping frame: {}", err));
                }
                Err(err) => return Err(err),
            }
        }
        self.logger.record(&format!(
            "stream ended after {} result(s), {} reset(s), {} skipped",
            summary.results, summary.resets, summary.skipped
        ));
        Ok(summary)
    }
}
