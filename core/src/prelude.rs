use std::sync::Arc;
use std::time::Duration;

use crate::calibration::CalibrationArtifact;
use crate::interface::{CalibrationStatus, DetectionResult, SensorId, SessionMetadata, StreamEvent, SweepFrame};

/// Common error type for detector processing.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    #[error("no processor for sensor {found}, expected one of {expected:?}")]
    ProcessorMismatch { expected: Vec<SensorId>, found: SensorId },
    #[error("buffer exhaustion: {0}")]
    BufferExhaustion(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// A stateful detector bound to one sensor.
///
/// The output for a frame depends only on the processor's configuration, its
/// accumulated history and the frame itself.
pub trait Processor {
    fn sensor_id(&self) -> SensorId;
    fn update(&mut self, frame: &SweepFrame) -> ProcessorResult<DetectionResult>;
    /// Forget frame-to-frame history. Calibration is kept.
    fn reset_history(&mut self);
    fn recalibrate(&mut self, artifact: Option<Arc<CalibrationArtifact>>);
    fn calibration_status(&self) -> CalibrationStatus;
}

/// Anything that yields a stream of frames: a live session or a replayed record.
pub trait FrameSource {
    fn metadata(&self) -> Option<&SessionMetadata>;
    fn next_event(&mut self, timeout: Duration) -> crate::Result<StreamEvent>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn metadata(&self) -> Option<&SessionMetadata> {
        (**self).metadata()
    }

    fn next_event(&mut self, timeout: Duration) -> crate::Result<StreamEvent> {
        (**self).next_event(timeout)
    }
}
