//! Length-prefixed framing of the module-server byte stream.
//!
//! Every frame starts with a 9 byte header:
//! - 2 sync bytes (0xA5, 0x5A)
//! - 1 byte frame kind
//! - 4 bytes payload length (little-endian)
//! - 2 bytes CRC-16/CCITT-FALSE over kind, length and payload (little-endian)

use log::{debug, warn};

use crate::math::crc::Crc16;

pub const SYNC: [u8; 2] = [0xA5, 0x5A];
pub const HEADER_SIZE: usize = 9;
pub const MAX_PAYLOAD: usize = 1 << 20;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("invalid sync byte {0:#04x}")]
    InvalidSync(u8),
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    #[error("declared payload of {0} bytes exceeds the {} byte limit", MAX_PAYLOAD)]
    PayloadTooLarge(usize),
    #[error("checksum mismatch: header says {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Command = 0x01,
    Response = 0x02,
    ConfigAck = 0x03,
    StreamData = 0x04,
    Error = 0x05,
    Heartbeat = 0x06,
}

impl FrameKind {
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Response),
            0x03 => Some(Self::ConfigAck),
            0x04 => Some(Self::StreamData),
            0x05 => Some(Self::Error),
            0x06 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat, Vec::new())
    }
}

/// Outcome of a decode attempt on the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Frame { frame: Frame, consumed: usize },
    NeedMoreData,
}

fn checksum(kind: u8, len: [u8; 4], payload: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(&[kind]);
    crc.update(&len);
    crc.update(payload);
    crc.finish()
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let kind = frame.kind as u8;
    let len = (frame.payload.len() as u32).to_le_bytes();
    let crc = checksum(kind, len, &frame.payload);

    let mut out = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    out.extend_from_slice(&SYNC);
    out.push(kind);
    out.extend_from_slice(&len);
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Decodes the frame at the front of `buf`.
///
/// Returns `NeedMoreData` while the buffer holds a valid but incomplete
/// prefix. Errors mean the front of the buffer is not a frame; the caller
/// should discard up to [`resync_offset`] and try again.
pub fn decode(buf: &[u8]) -> Result<Decoded, ProtocolError> {
    for (index, &expected) in SYNC.iter().enumerate() {
        match buf.get(index) {
            None => return Ok(Decoded::NeedMoreData),
            Some(&byte) if byte != expected => return Err(ProtocolError::InvalidSync(byte)),
            Some(_) => {}
        }
    }
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::NeedMoreData);
    }

    let kind_byte = buf[2];
    let kind = FrameKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;
    let len_bytes = [buf[3], buf[4], buf[5], buf[6]];
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    let total = HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let expected = u16::from_le_bytes([buf[7], buf[8]]);
    let payload = &buf[HEADER_SIZE..total];
    let computed = checksum(kind_byte, len_bytes, payload);
    if expected != computed {
        return Err(ProtocolError::ChecksumMismatch { expected, computed });
    }

    Ok(Decoded::Frame {
        frame: Frame::new(kind, payload.to_vec()),
        consumed: total,
    })
}

/// Number of leading bytes to discard so the buffer starts at the next
/// plausible header. Always at least 1 for a non-empty buffer.
pub fn resync_offset(buf: &[u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    for start in 1..buf.len() {
        if buf[start] != SYNC[0] {
            continue;
        }
        match buf.get(start + 1) {
            Some(&next) if next == SYNC[1] => return start,
            None => return start,
            Some(_) => {}
        }
    }
    buf.len()
}

/// Accumulates transport bytes and hands out whole frames.
///
/// Corrupt data is skipped by resynchronizing on the next sync pair, so a
/// damaged frame costs only itself.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
    resyncs: u64,
    discarded: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match decode(&self.pending) {
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.pending.drain(..consumed);
                    return Some(frame);
                }
                Ok(Decoded::NeedMoreData) => return None,
                Err(err) => {
                    let skip = resync_offset(&self.pending);
                    warn!("resynchronizing after {} ({} bytes skipped)", err, skip);
                    self.pending.drain(..skip);
                    self.resyncs += 1;
                    self.discarded += skip as u64;
                }
            }
        }
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("dropping {} buffered bytes", self.pending.len());
        }
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new(FrameKind::Response, br#"{"kind":"ok"}"#.to_vec())
    }

    #[test]
    fn decode_reports_need_more_data_for_every_prefix() {
        let bytes = encode(&sample());
        for split in 0..bytes.len() {
            assert_eq!(decode(&bytes[..split]).unwrap(), Decoded::NeedMoreData);
        }
        match decode(&bytes).unwrap() {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame, sample());
                assert_eq!(consumed, bytes.len());
            }
            Decoded::NeedMoreData => panic!("expected a frame"),
        }
    }

    #[test]
    fn oversized_length_is_rejected_before_payload_arrives() {
        let mut bytes = encode(&sample());
        bytes[3..7].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_le_bytes());
        assert!(matches!(
            decode(&bytes[..HEADER_SIZE]),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn flipped_payload_bit_fails_checksum() {
        let mut bytes = encode(&sample());
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn resync_offset_finds_next_sync_pair() {
        assert_eq!(resync_offset(&[0x00, 0x11, 0xA5, 0x5A, 0x02]), 2);
        assert_eq!(resync_offset(&[0xA5, 0x5A, 0x00]), 3);
        assert_eq!(resync_offset(&[0x00, 0xA5]), 1);
        assert_eq!(resync_offset(&[]), 0);
    }

    #[test]
    fn frame_buffer_decodes_across_arbitrary_splits() {
        let frames = vec![sample(), Frame::heartbeat(), Frame::new(FrameKind::StreamData, vec![7; 300])];
        let bytes: Vec<u8> = frames.iter().flat_map(encode).collect();

        for chunk in [1, 2, 5, 9, 64] {
            let mut buffer = FrameBuffer::new();
            let mut decoded = Vec::new();
            for piece in bytes.chunks(chunk) {
                buffer.extend(piece);
                while let Some(frame) = buffer.next_frame() {
                    decoded.push(frame);
                }
            }
            assert_eq!(decoded, frames);
            assert_eq!(buffer.resyncs(), 0);
        }
    }

    #[test]
    fn frame_buffer_skips_corruption_and_recovers() {
        let mut corrupted = encode(&sample());
        corrupted[10] ^= 0xFF;
        let mut bytes = vec![0x13, 0x37];
        bytes.extend(corrupted);
        bytes.extend(encode(&Frame::heartbeat()));

        let mut buffer = FrameBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.next_frame(), Some(Frame::heartbeat()));
        assert!(buffer.resyncs() >= 2);
        assert!(buffer.is_empty());
    }
}
