//! Host-side client for a radar module server and the detector pipeline fed
//! by it.
//!
//! Frames come from a live [`session::Client`] over any [`transport`], or
//! from a [`record::RecordPlayer`] replaying a session file. Either way they
//! reach a [`pipeline::Pipeline`] that runs one calibration-aware detector
//! per sensor.

pub mod calibration;
pub mod error;
pub mod interface;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod protocol;
pub mod record;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use error::{Error, Result};
pub use interface::{DetectionResult, SensorConfig, SensorId, SessionConfig, SessionMetadata, StreamEvent, SweepFrame};
pub use pipeline::{Pipeline, PipelineEvent, ResultPublisher};
pub use prelude::{FrameSource, Processor};
pub use session::{Client, ClientConfig};
