use std::sync::Mutex;

use serde::Serialize;

use crate::interface::FrameContext;

/// Counters for one session or pipeline, shared by reference.
pub struct MetricsRecorder {
    inner: Mutex<MetricsSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames: u64,
    pub dropped_frames: u64,
    pub resyncs: u64,
    pub errors: u64,
    pub saturated_frames: u64,
    pub delayed_frames: u64,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsSnapshot::default()),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut metrics) = self.inner.lock() {
            apply(&mut metrics);
        }
    }

    pub fn record_frame(&self) {
        self.update(|m| m.frames += 1);
    }

    pub fn record_dropped(&self, count: u32) {
        self.update(|m| m.dropped_frames += u64::from(count));
    }

    pub fn record_resyncs(&self, count: u64) {
        self.update(|m| m.resyncs += count);
    }

    pub fn record_context(&self, context: &FrameContext) {
        self.update(|m| {
            m.saturated_frames += u64::from(context.data_saturated);
            m.delayed_frames += u64::from(context.frame_delayed);
        });
    }

    pub fn record_error(&self) {
        self.update(|m| m.errors += 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|m| *m).unwrap_or_default()
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
