use std::path::Path;
use std::time::Duration;

use crate::interface::{SessionMetadata, StreamEvent};
use crate::prelude::FrameSource;
use crate::record::format::{RecordError, RecordResult};
use crate::record::recorder::{RecordSummary, SessionRecorder, SharedRecorder};

/// Passes events through from `inner` while appending each one to a record.
pub struct RecordingSource<S: FrameSource> {
    inner: S,
    recorder: SharedRecorder,
}

impl<S: FrameSource> RecordingSource<S> {
    /// Starts a record at `path` from the metadata `inner` already negotiated.
    pub fn create(inner: S, path: impl AsRef<Path>) -> RecordResult<Self> {
        let metadata = inner.metadata().ok_or_else(|| {
            RecordError::InvalidFormat("source has no session metadata to record".into())
        })?;
        let recorder = SessionRecorder::create(path, metadata)?.into_shared();
        Ok(Self { inner, recorder })
    }

    pub fn with_recorder(inner: S, recorder: SharedRecorder) -> Self {
        Self { inner, recorder }
    }

    pub fn recorder(&self) -> SharedRecorder {
        self.recorder.clone()
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Seals the record and hands back the wrapped source.
    pub fn finalize(self) -> RecordResult<(S, RecordSummary)> {
        let summary = self.recorder.finalize()?;
        Ok((self.inner, summary))
    }
}

impl<S: FrameSource> FrameSource for RecordingSource<S> {
    fn metadata(&self) -> Option<&SessionMetadata> {
        self.inner.metadata()
    }

    fn next_event(&mut self, timeout: Duration) -> crate::Result<StreamEvent> {
        let event = self.inner.next_event(timeout)?;
        self.recorder.append_event(&event)?;
        Ok(event)
    }
}
