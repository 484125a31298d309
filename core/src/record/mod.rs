//! Persisting and replaying session records.

pub mod format;
pub mod player;
pub mod recorder;
pub mod source;

pub use format::{RecordError, RecordResult};
pub use player::{Pacing, RecordPlayer, ReplayOptions};
pub use recorder::{RecordSummary, SessionRecorder, SharedRecorder};
pub use source::RecordingSource;
