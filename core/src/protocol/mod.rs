pub mod codec;
pub mod messages;

pub use codec::{decode, encode, resync_offset, Decoded, Frame, FrameBuffer, FrameKind, ProtocolError};
pub use messages::{
    write_stream_payload, Command, ErrorCode, Message, Response, ServerError, ServerInfo, StreamData,
};
