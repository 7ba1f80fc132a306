//! Frame codec for the upcall channel.
//!
//! Implements a [`tokio_util::codec`] `Decoder`/`Encoder` pair over the
//! fixed-header frame format described in the [module docs](super). The
//! payload length is validated against [`MAX_PAYLOAD_SIZE`] *before* any
//! allocation, so a corrupt or hostile length prefix cannot exhaust memory.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult};
use crate::store::OPAQUE_LIMIT;

/// Length of the fixed frame header: version, command, status, xid,
/// payload length.
pub const HEADER_LEN: usize = 12;

/// Largest payload any frame may carry: a length-prefixed client identity.
pub const MAX_PAYLOAD_SIZE: usize = 2 + OPAQUE_LIMIT;

/// A decoded frame, header fields plus the raw payload. Command and status
/// stay untyped here; [`super::messages`] gives them meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Protocol version the frame was sent under.
    pub version: u8,
    /// Command tag.
    pub command: u8,
    /// `0` in requests; `0` or a negative errno in replies.
    pub status: i16,
    /// Transaction id, echoed from request to reply.
    pub xid: u32,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Codec turning the upcall byte stream into [`RawFrame`]s and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpcallCodec;

impl UpcallCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for UpcallCodec {
    type Item = RawFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<RawFrame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Payload length sits in the last four header bytes; validate it
        // before reserving or splitting anything.
        let payload_len =
            u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total_len = HEADER_LEN + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let version = header.get_u8();
        let command = header.get_u8();
        let status = header.get_i16();
        let xid = header.get_u32();
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(RawFrame {
            version,
            command,
            status,
            xid,
            payload,
        }))
    }
}

impl Encoder<RawFrame> for UpcallCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> ProtocolResult<()> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.version);
        dst.put_u8(frame.command);
        dst.put_i16(frame.status);
        dst.put_u32(frame.xid);
        #[allow(clippy::cast_possible_truncation)] // bounded above
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
