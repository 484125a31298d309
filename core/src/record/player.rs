use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::interface::{SessionMetadata, StreamEvent};
use crate::prelude::FrameSource;
use crate::record::format::{
    parse_dropped, parse_file_header, parse_sweep, read_block, BlockKind, BlockRead, RecordError,
    RecordResult, FILE_HEADER_SIZE,
};
use crate::session::SessionError;

/// How replayed frames are spaced in time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Pacing {
    /// Follow the recorded timestamps, scaled by `speed`.
    #[default]
    RealTime,
    AsFastAsPossible,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayOptions {
    pub pacing: Pacing,
    /// Playback speed multiplier for real-time pacing; 2.0 plays twice as fast.
    pub speed: f32,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            pacing: Pacing::RealTime,
            speed: 1.0,
        }
    }
}

impl ReplayOptions {
    pub fn as_fast_as_possible() -> Self {
        Self {
            pacing: Pacing::AsFastAsPossible,
            ..Default::default()
        }
    }
}

/// Replays a session record through the same pull interface as a live session.
pub struct RecordPlayer {
    reader: BufReader<File>,
    metadata: SessionMetadata,
    options: ReplayOptions,
    playback_start: Option<Instant>,
    first_timestamp_us: u64,
    due: Option<(Instant, StreamEvent)>,
    frames_read: u64,
    finished: bool,
}

impl RecordPlayer {
    pub fn open(path: impl AsRef<Path>, options: ReplayOptions) -> RecordResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; FILE_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let protocol_version = parse_file_header(&header)?;

        let metadata: SessionMetadata = match read_block(&mut reader)? {
            BlockRead::Block(BlockKind::Metadata, payload) => serde_json::from_slice(&payload)
                .map_err(|err| RecordError::InvalidFormat(format!("metadata: {}", err)))?,
            BlockRead::Block(kind, _) => {
                return Err(RecordError::InvalidFormat(format!(
                    "record starts with a {:?} block",
                    kind
                )))
            }
            BlockRead::Eof | BlockRead::Torn => {
                return Err(RecordError::TruncatedRecord { frames_read: 0 })
            }
        };
        if metadata.protocol_version != protocol_version {
            return Err(RecordError::InvalidFormat(
                "header and metadata disagree on protocol version".into(),
            ));
        }

        Ok(Self {
            reader,
            metadata,
            options,
            playback_start: None,
            first_timestamp_us: 0,
            due: None,
            frames_read: 0,
            finished: false,
        })
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Next recorded event, ignoring pacing.
    ///
    /// A record without its end marker yields every complete block and then
    /// `TruncatedRecord`.
    pub fn next_immediate(&mut self) -> RecordResult<StreamEvent> {
        if self.finished {
            return Ok(StreamEvent::EndOfStream);
        }
        match read_block(&mut self.reader)? {
            BlockRead::Block(BlockKind::Sweep, payload) => {
                let frame = parse_sweep(&payload, &self.metadata)?;
                self.frames_read += 1;
                Ok(StreamEvent::Frame(frame))
            }
            BlockRead::Block(BlockKind::Dropped, payload) => {
                let (sensor_id, count) = parse_dropped(&payload)?;
                Ok(StreamEvent::DroppedFrames { sensor_id, count })
            }
            BlockRead::Block(BlockKind::End, payload) => {
                let recorded = <[u8; 8]>::try_from(payload.as_slice())
                    .map(u64::from_le_bytes)
                    .map_err(|_| RecordError::InvalidFormat("end marker must be 8 bytes".into()))?;
                if recorded != self.frames_read {
                    return Err(RecordError::InvalidFormat(format!(
                        "end marker counts {} frames, record holds {}",
                        recorded, self.frames_read
                    )));
                }
                self.finished = true;
                Ok(StreamEvent::EndOfStream)
            }
            BlockRead::Block(BlockKind::Metadata, _) => Err(RecordError::InvalidFormat(
                "second metadata block".into(),
            )),
            BlockRead::Eof | BlockRead::Torn => Err(RecordError::TruncatedRecord {
                frames_read: self.frames_read,
            }),
        }
    }

    /// Next event, paced according to the replay options. Returns `None` if
    /// the event is not due within `timeout`; it is kept for the next call.
    pub fn next_paced(&mut self, timeout: Duration) -> RecordResult<Option<StreamEvent>> {
        let (due_at, event) = match self.due.take() {
            Some(pending) => pending,
            None => {
                let event = self.next_immediate()?;
                (self.due_time(&event), event)
            }
        };

        let now = Instant::now();
        if due_at > now {
            let wait = due_at - now;
            if wait > timeout {
                thread::sleep(timeout);
                self.due = Some((due_at, event));
                return Ok(None);
            }
            thread::sleep(wait);
        }
        Ok(Some(event))
    }

    fn due_time(&mut self, event: &StreamEvent) -> Instant {
        let now = Instant::now();
        let timestamp_us = match (self.options.pacing, event) {
            (Pacing::RealTime, StreamEvent::Frame(frame)) => frame.timestamp_us,
            _ => return now,
        };
        let Some(start) = self.playback_start else {
            self.playback_start = Some(now);
            self.first_timestamp_us = timestamp_us;
            return now;
        };
        let offset_us = timestamp_us.saturating_sub(self.first_timestamp_us) as f64;
        let speed = if self.options.speed > 0.0 {
            f64::from(self.options.speed)
        } else {
            1.0
        };
        start + Duration::from_micros((offset_us / speed) as u64)
    }
}

impl FrameSource for RecordPlayer {
    fn metadata(&self) -> Option<&SessionMetadata> {
        Some(&self.metadata)
    }

    fn next_event(&mut self, timeout: Duration) -> crate::Result<StreamEvent> {
        match self.next_paced(timeout)? {
            Some(event) => Ok(event),
            None => Err(SessionError::Timeout("replay pacing".into()).into()),
        }
    }
}
