//! Session record layout.
//!
//! ```text
//! "SWRC" | format u16 | protocol u16                      file header
//! kind u8 | len u32 | crc16 u16 | payload[len]            block, repeated
//! ```
//!
//! All integers are little-endian. The first block is the session metadata,
//! the last one the end marker carrying the number of sweep blocks.

use std::io::{self, Read, Write};

use crate::interface::{SensorId, SessionMetadata, SweepFrame};
use crate::math::crc::Crc16;
use crate::protocol::messages::{write_stream_payload, StreamData, STREAM_HEADER_SIZE};

pub const MAGIC: [u8; 4] = *b"SWRC";
pub const FORMAT_VERSION: u16 = 1;
pub const FILE_HEADER_SIZE: usize = 8;
pub const BLOCK_HEADER_SIZE: usize = 7;
pub const MAX_BLOCK_PAYLOAD: usize = 16 << 20;

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("record i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("record ends without an end marker after {frames_read} frames")]
    TruncatedRecord { frames_read: u64 },
    #[error("invalid record: {0}")]
    InvalidFormat(String),
    #[error("record is already finalized")]
    Sealed,
    #[error("recorder stopped after an earlier write failed")]
    WriteFailed,
    #[error("recorder lock poisoned")]
    Poisoned,
}

pub type RecordResult<T> = Result<T, RecordError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Metadata = 0x01,
    Sweep = 0x02,
    Dropped = 0x03,
    End = 0xFF,
}

impl BlockKind {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Metadata),
            0x02 => Some(Self::Sweep),
            0x03 => Some(Self::Dropped),
            0xFF => Some(Self::End),
            _ => None,
        }
    }
}

pub fn file_header(protocol_version: u16) -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&protocol_version.to_le_bytes());
    header
}

/// Validates a file header and returns the protocol version it declares.
pub fn parse_file_header(header: &[u8; FILE_HEADER_SIZE]) -> RecordResult<u16> {
    if header[..4] != MAGIC {
        return Err(RecordError::InvalidFormat("bad magic".into()));
    }
    let format = u16::from_le_bytes([header[4], header[5]]);
    if format != FORMAT_VERSION {
        return Err(RecordError::InvalidFormat(format!(
            "unsupported format version {}",
            format
        )));
    }
    Ok(u16::from_le_bytes([header[6], header[7]]))
}

fn block_crc(kind: u8, len: [u8; 4], payload: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(&[kind]);
    crc.update(&len);
    crc.update(payload);
    crc.finish()
}

/// Serializes a whole block so it can be handed to the writer in one piece.
pub fn encode_block(kind: BlockKind, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u32).to_le_bytes();
    let crc = block_crc(kind as u8, len, payload);
    let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    block.push(kind as u8);
    block.extend_from_slice(&len);
    block.extend_from_slice(&crc.to_le_bytes());
    block.extend_from_slice(payload);
    block
}

pub fn write_block<W: Write>(writer: &mut W, kind: BlockKind, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_block(kind, payload))
}

/// Outcome of reading one block.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockRead {
    Block(BlockKind, Vec<u8>),
    /// The file ended exactly on a block boundary.
    Eof,
    /// The file ended inside a block.
    Torn,
}

pub fn read_block<R: Read>(reader: &mut R) -> RecordResult<BlockRead> {
    let mut header = [0u8; BLOCK_HEADER_SIZE];
    let got = read_fully(reader, &mut header)?;
    if got == 0 {
        return Ok(BlockRead::Eof);
    }
    if got < BLOCK_HEADER_SIZE {
        return Ok(BlockRead::Torn);
    }

    let kind = BlockKind::from_byte(header[0])
        .ok_or_else(|| RecordError::InvalidFormat(format!("unknown block kind {:#04x}", header[0])))?;
    let len_bytes = [header[1], header[2], header[3], header[4]];
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_BLOCK_PAYLOAD {
        return Err(RecordError::InvalidFormat(format!("block of {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    if read_fully(reader, &mut payload)? < len {
        return Ok(BlockRead::Torn);
    }
    let expected = u16::from_le_bytes([header[5], header[6]]);
    if block_crc(header[0], len_bytes, &payload) != expected {
        return Err(RecordError::InvalidFormat(format!("{:?} block fails its checksum", kind)));
    }
    Ok(BlockRead::Block(kind, payload))
}

/// Sweep block payload: timestamp_us u64, unwrapped tick u64, then the
/// frame's stream data payload exactly as it travels on the wire.
pub fn sweep_payload(frame: &SweepFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + STREAM_HEADER_SIZE + frame.samples.len() * 4);
    out.extend_from_slice(&frame.timestamp_us.to_le_bytes());
    out.extend_from_slice(&frame.tick.to_le_bytes());
    write_stream_payload(
        &mut out,
        frame.sensor_id,
        frame.sequence,
        frame.tick as u32,
        &frame.context,
        &frame.samples,
    );
    out
}

pub fn parse_sweep(payload: &[u8], metadata: &SessionMetadata) -> RecordResult<SweepFrame> {
    if payload.len() < 16 {
        return Err(RecordError::InvalidFormat("short sweep block".into()));
    }
    let mut word = [0u8; 8];
    word.copy_from_slice(&payload[..8]);
    let timestamp_us = u64::from_le_bytes(word);
    word.copy_from_slice(&payload[8..16]);
    let tick = u64::from_le_bytes(word);

    let data = StreamData::from_payload(&payload[16..])
        .map_err(|err| RecordError::InvalidFormat(err.to_string()))?;
    let layout = metadata.layout_for(data.sensor_id).ok_or_else(|| {
        RecordError::InvalidFormat(format!("sweep for unrecorded sensor {}", data.sensor_id))
    })?;
    if data.samples.len() != layout.frame_data_length() {
        return Err(RecordError::InvalidFormat(format!(
            "sweep of {} samples does not match the recorded layout",
            data.samples.len()
        )));
    }

    Ok(SweepFrame {
        sensor_id: data.sensor_id,
        sequence: data.sequence,
        tick,
        timestamp_us,
        sweeps_per_frame: layout.sweeps_per_frame,
        sweep_len: layout.sweep_data_length,
        samples: data.samples,
        context: data.context,
    })
}

pub fn dropped_payload(sensor_id: SensorId, count: u32) -> [u8; 5] {
    let mut out = [0u8; 5];
    out[0] = sensor_id.get();
    out[1..].copy_from_slice(&count.to_le_bytes());
    out
}

pub fn parse_dropped(payload: &[u8]) -> RecordResult<(SensorId, u32)> {
    match payload {
        [sensor, a, b, c, d] => Ok((SensorId::new(*sensor), u32::from_le_bytes([*a, *b, *c, *d]))),
        _ => Err(RecordError::InvalidFormat("dropped block must be 5 bytes".into())),
    }
}

/// Like `read_exact`, but reports how much was read before end of file.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
