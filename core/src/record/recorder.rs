use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::interface::{SensorId, SessionMetadata, StreamEvent, SweepFrame};
use crate::record::format::{
    dropped_payload, encode_block, file_header, sweep_payload, BlockKind, RecordError, RecordResult,
};
use crate::telemetry::LogManager;

/// What a finalized record holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub path: PathBuf,
    pub frames: u64,
    pub dropped_events: u64,
}

/// Append-only writer of one session record.
///
/// Each block goes out whole and is flushed before the call returns, so a
/// crash leaves every earlier block readable.
pub struct SessionRecorder {
    writer: BufWriter<File>,
    path: PathBuf,
    frames: u64,
    dropped_events: u64,
    sealed: bool,
    failed: bool,
    logger: LogManager,
}

impl SessionRecorder {
    /// Creates the file and writes the header and metadata block.
    pub fn create(path: impl AsRef<Path>, metadata: &SessionMetadata) -> RecordResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut recorder = Self {
            writer: BufWriter::new(file),
            path,
            frames: 0,
            dropped_events: 0,
            sealed: false,
            failed: false,
            logger: LogManager::new("recorder"),
        };

        let json = serde_json::to_vec(metadata)
            .map_err(|err| RecordError::InvalidFormat(format!("metadata: {}", err)))?;
        recorder.writer.write_all(&file_header(metadata.protocol_version))?;
        recorder.write(BlockKind::Metadata, &json)?;
        recorder
            .logger
            .record(&format!("recording to {}", recorder.path.display()));
        Ok(recorder)
    }

    pub fn append_frame(&mut self, frame: &SweepFrame) -> RecordResult<()> {
        self.write(BlockKind::Sweep, &sweep_payload(frame))?;
        self.frames += 1;
        Ok(())
    }

    pub fn append_dropped(&mut self, sensor_id: SensorId, count: u32) -> RecordResult<()> {
        self.write(BlockKind::Dropped, &dropped_payload(sensor_id, count))?;
        self.dropped_events += 1;
        Ok(())
    }

    pub fn append_event(&mut self, event: &StreamEvent) -> RecordResult<()> {
        match event {
            StreamEvent::Frame(frame) => self.append_frame(frame),
            StreamEvent::DroppedFrames { sensor_id, count } => self.append_dropped(*sensor_id, *count),
            StreamEvent::EndOfStream => Ok(()),
        }
    }

    /// Writes the end marker and syncs the file. Later appends fail with `Sealed`.
    pub fn finalize(&mut self) -> RecordResult<RecordSummary> {
        let frame_count = self.frames.to_le_bytes();
        self.write(BlockKind::End, &frame_count)?;
        self.writer.get_ref().sync_all()?;
        self.sealed = true;
        self.logger.record(&format!(
            "sealed {} with {} frames",
            self.path.display(),
            self.frames
        ));
        Ok(self.summary())
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            path: self.path.clone(),
            frames: self.frames,
            dropped_events: self.dropped_events,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn into_shared(self) -> SharedRecorder {
        SharedRecorder {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    fn write(&mut self, kind: BlockKind, payload: &[u8]) -> RecordResult<()> {
        if self.sealed {
            return Err(RecordError::Sealed);
        }
        if self.failed {
            return Err(RecordError::WriteFailed);
        }
        // a block torn by a failed write must stay the last one in the file
        let written = self
            .writer
            .write_all(&encode_block(kind, payload))
            .and_then(|_| self.writer.flush());
        if let Err(err) = written {
            self.failed = true;
            self.logger.anomaly(&format!(
                "write to {} failed, recording stopped: {}",
                self.path.display(),
                err
            ));
            return Err(err.into());
        }
        Ok(())
    }
}

/// Recorder handle for several producers; appends are serialized.
#[derive(Clone)]
pub struct SharedRecorder {
    inner: Arc<Mutex<SessionRecorder>>,
}

impl SharedRecorder {
    fn with<R>(&self, apply: impl FnOnce(&mut SessionRecorder) -> RecordResult<R>) -> RecordResult<R> {
        let mut recorder = self.inner.lock().map_err(|_| RecordError::Poisoned)?;
        apply(&mut recorder)
    }

    pub fn append_frame(&self, frame: &SweepFrame) -> RecordResult<()> {
        self.with(|r| r.append_frame(frame))
    }

    pub fn append_dropped(&self, sensor_id: SensorId, count: u32) -> RecordResult<()> {
        self.with(|r| r.append_dropped(sensor_id, count))
    }

    pub fn append_event(&self, event: &StreamEvent) -> RecordResult<()> {
        self.with(|r| r.append_event(event))
    }

    pub fn finalize(&self) -> RecordResult<RecordSummary> {
        self.with(|r| r.finalize())
    }

    pub fn summary(&self) -> RecordResult<RecordSummary> {
        self.with(|r| Ok(r.summary()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{FrameLayout, SensorConfig, SubsweepConfig, PROTOCOL_VERSION};
    use num_complex::Complex;
    use std::thread;
    use tempfile::TempDir;

    fn metadata() -> SessionMetadata {
        let config = SensorConfig::single(SubsweepConfig {
            num_points: 2,
            ..Default::default()
        });
        SessionMetadata {
            protocol_version: PROTOCOL_VERSION,
            server_version: "test".into(),
            layouts: vec![FrameLayout::from_config(SensorId::new(1), &config)],
            config: config.into(),
            update_rate: 100.0,
            ticks_per_second: 1_000_000,
        }
    }

    fn frame(sequence: u32) -> SweepFrame {
        SweepFrame {
            sensor_id: SensorId::new(1),
            sequence,
            tick: u64::from(sequence) * 10_000,
            timestamp_us: u64::from(sequence) * 10_000,
            sweeps_per_frame: 1,
            sweep_len: 2,
            samples: vec![Complex::new(1, -1), Complex::new(sequence as i16, 0)],
            context: Default::default(),
        }
    }

    #[test]
    fn appends_after_finalize_fail() {
        let dir = TempDir::new().unwrap();
        let mut recorder = SessionRecorder::create(dir.path().join("s.swrc"), &metadata()).unwrap();
        recorder.append_frame(&frame(0)).unwrap();
        let summary = recorder.finalize().unwrap();
        assert_eq!(summary.frames, 1);
        assert!(matches!(recorder.append_frame(&frame(1)), Err(RecordError::Sealed)));
        assert!(matches!(recorder.finalize(), Err(RecordError::Sealed)));
    }

    #[test]
    fn appends_after_a_failed_write_are_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.swrc");
        let mut recorder = SessionRecorder::create(&path, &metadata()).unwrap();
        recorder.append_frame(&frame(0)).unwrap();

        // a read-only handle makes every further write fail
        recorder.writer = BufWriter::new(File::open(&path).unwrap());
        assert!(matches!(recorder.append_frame(&frame(1)), Err(RecordError::Io(_))));
        assert!(recorder.has_failed());
        assert!(matches!(recorder.append_frame(&frame(2)), Err(RecordError::WriteFailed)));
        assert!(matches!(recorder.finalize(), Err(RecordError::WriteFailed)));
        assert_eq!(recorder.summary().frames, 1);
    }

    #[test]
    fn shared_recorder_serializes_producers() {
        let dir = TempDir::new().unwrap();
        let shared = SessionRecorder::create(dir.path().join("s.swrc"), &metadata())
            .unwrap()
            .into_shared();

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        shared.append_frame(&frame(worker * 25 + i)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(shared.finalize().unwrap().frames, 100);
    }
}
