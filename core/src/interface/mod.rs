//! Data exchanged between the module server, the session client and the detectors.

pub mod config;
pub mod detection;
pub mod frame;
pub mod metadata;

pub use config::{
    ConfigError, ConfigViolation, Prf, Profile, SensorConfig, SessionConfig, SubsweepConfig,
    APPROX_BASE_STEP_LENGTH_M,
};
pub use detection::{
    CalibrationStatus, DetectionOutput, DetectionResult, DistanceOutput, DistancePeak,
    PresenceOutput,
};
pub use frame::{FrameContext, SensorId, StreamEvent, SweepFrame};
pub use metadata::{FrameLayout, SessionMetadata, PROTOCOL_VERSION};
