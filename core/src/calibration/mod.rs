//! Per-sensor calibration: computing, validating and storing artifacts.

pub mod artifact;
pub mod manager;
pub mod store;

use crate::interface::SensorId;

pub use artifact::{CalibrationArtifact, CalibrationKind};
pub use manager::CalibrationManager;
pub use store::ArtifactStore;

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("insufficient data: {supplied} frames supplied, {required} required")]
    InsufficientData { required: usize, supplied: usize },
    #[error("frame from sensor {found} supplied to calibrate sensor {expected}")]
    SensorMismatch { expected: SensorId, found: SensorId },
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("artifact i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("artifact store lock poisoned")]
    Poisoned,
}
