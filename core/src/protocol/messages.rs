use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::interface::{FrameContext, SensorId, SessionConfig, SessionMetadata};
use crate::protocol::codec::{Frame, FrameKind, ProtocolError};

/// Size of the fixed part of a stream data payload.
pub const STREAM_HEADER_SIZE: usize = 12;

/// Host to server requests. Only one may be outstanding at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Hello { protocol_version: u16 },
    Configure { config: SessionConfig },
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub protocol_version: u16,
    pub server_version: String,
    pub sensors: Vec<SensorId>,
    pub ticks_per_second: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Hello(ServerInfo),
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidConfig,
    NotConfigured,
    NotStreaming,
    UnsupportedVersion,
    Internal,
    #[serde(other)]
    Unknown,
}

/// Error reported by the module server in reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Raw sweep payload as carried on the wire.
///
/// Layout (little-endian): sensor id u8, sequence u32, tick u32, context
/// flags u8, temperature i16, then interleaved i16 re/im pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    pub sensor_id: SensorId,
    pub sequence: u32,
    pub tick: u32,
    pub context: FrameContext,
    pub samples: Vec<Complex<i16>>,
}

impl StreamData {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + self.samples.len() * 4);
        write_stream_payload(
            &mut out,
            self.sensor_id,
            self.sequence,
            self.tick,
            &self.context,
            &self.samples,
        );
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < STREAM_HEADER_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "stream data of {} bytes is shorter than its header",
                payload.len()
            )));
        }
        let body = &payload[STREAM_HEADER_SIZE..];
        if body.len() % 4 != 0 {
            return Err(ProtocolError::Malformed(format!(
                "sample block of {} bytes is not a whole number of IQ pairs",
                body.len()
            )));
        }
        let samples = body
            .chunks_exact(4)
            .map(|pair| {
                Complex::new(
                    i16::from_le_bytes([pair[0], pair[1]]),
                    i16::from_le_bytes([pair[2], pair[3]]),
                )
            })
            .collect();

        Ok(Self {
            sensor_id: SensorId::new(payload[0]),
            sequence: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
            tick: u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]),
            context: FrameContext::from_flags(
                payload[9],
                i16::from_le_bytes([payload[10], payload[11]]),
            ),
            samples,
        })
    }
}

/// Appends a stream data payload without building an owned [`StreamData`].
pub fn write_stream_payload(
    out: &mut Vec<u8>,
    sensor_id: SensorId,
    sequence: u32,
    tick: u32,
    context: &FrameContext,
    samples: &[Complex<i16>],
) {
    out.push(sensor_id.get());
    out.extend_from_slice(&sequence.to_le_bytes());
    out.extend_from_slice(&tick.to_le_bytes());
    out.push(context.flags());
    out.extend_from_slice(&context.temperature.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.re.to_le_bytes());
        out.extend_from_slice(&sample.im.to_le_bytes());
    }
}

/// A decoded frame, typed by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Response(Response),
    ConfigAck(SessionMetadata),
    StreamData(StreamData),
    Error(ServerError),
    Heartbeat,
}

impl Message {
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        Ok(match frame.kind {
            FrameKind::Command => Message::Command(serde_json::from_slice(&frame.payload)?),
            FrameKind::Response => Message::Response(serde_json::from_slice(&frame.payload)?),
            FrameKind::ConfigAck => Message::ConfigAck(serde_json::from_slice(&frame.payload)?),
            FrameKind::StreamData => Message::StreamData(StreamData::from_payload(&frame.payload)?),
            FrameKind::Error => Message::Error(serde_json::from_slice(&frame.payload)?),
            FrameKind::Heartbeat => Message::Heartbeat,
        })
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(match self {
            Message::Command(command) => Frame::new(FrameKind::Command, serde_json::to_vec(command)?),
            Message::Response(response) => {
                Frame::new(FrameKind::Response, serde_json::to_vec(response)?)
            }
            Message::ConfigAck(metadata) => {
                Frame::new(FrameKind::ConfigAck, serde_json::to_vec(metadata)?)
            }
            Message::StreamData(data) => Frame::new(FrameKind::StreamData, data.to_payload()),
            Message::Error(error) => Frame::new(FrameKind::Error, serde_json::to_vec(error)?),
            Message::Heartbeat => Frame::heartbeat(),
        })
    }
}
