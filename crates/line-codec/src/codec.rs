//! Framing codec
//!
//! `decode` pulls at most one frame off the front of a caller-owned buffer.
//! A partial frame leaves the buffer untouched and yields
//! [`DecodeOutcome::Incomplete`]; the next read appends to the same buffer.
//! Malformed frames are reported, never acted upon: deciding whether to drop
//! the message or the connection belongs to the signaling loop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{CodecError, Result};
use crate::message::{
    CallAction, CallReference, Capabilities, DtmfDigit, HangupCause, LineMessage, MessageId,
    ResetKind,
};

/// Length word plus reserved word
pub const HEADER_LEN: usize = 8;

/// Largest accepted value of the length word (message id + body)
pub const MAX_FRAME_LENGTH: usize = 4096;

const MIN_FRAME_LENGTH: usize = 4;

/// Result of one decode attempt
#[derive(Debug)]
pub enum DecodeOutcome {
    Message(LineMessage),
    Incomplete,
    Malformed(CodecError),
}

/// Item produced by [`LineCodec`] when used with `Framed`
///
/// Recoverable malformed frames are items rather than stream errors so the
/// stream stays usable after them.
#[derive(Debug)]
pub enum Inbound {
    Message(LineMessage),
    Malformed(CodecError),
}

/// Decode one frame from the front of `buf`
pub fn decode(buf: &mut BytesMut) -> DecodeOutcome {
    if buf.len() < HEADER_LEN {
        return DecodeOutcome::Incomplete;
    }

    let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let reserved = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if !(MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH).contains(&length) {
        return DecodeOutcome::Malformed(CodecError::InvalidLength(length));
    }
    if reserved != 0 {
        return DecodeOutcome::Malformed(CodecError::ReservedNotZero(reserved));
    }

    let total = HEADER_LEN + length;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return DecodeOutcome::Incomplete;
    }

    buf.advance(HEADER_LEN);
    let mut frame = buf.split_to(length).freeze();
    let raw_id = frame.get_u32_le();

    let Some(id) = MessageId::from_u32(raw_id) else {
        return DecodeOutcome::Malformed(CodecError::UnknownMessage(raw_id));
    };

    match parse_body(id, &mut frame) {
        Ok(message) => {
            trace!("Decoded {} ({} byte body)", id.name(), length - MIN_FRAME_LENGTH);
            DecodeOutcome::Message(message)
        }
        Err(e) => DecodeOutcome::Malformed(e),
    }
}

/// Encode a message into a standalone frame
pub fn encode(message: &LineMessage) -> Result<Bytes> {
    let mut dst = BytesMut::new();
    encode_into(message, &mut dst)?;
    Ok(dst.freeze())
}

/// Append the frame for `message` to `dst`
pub fn encode_into(message: &LineMessage, dst: &mut BytesMut) -> Result<()> {
    let mut body = BytesMut::with_capacity(64);
    write_body(message, &mut body)?;

    let length = MIN_FRAME_LENGTH + body.len();
    if length > MAX_FRAME_LENGTH {
        return Err(CodecError::FrameTooLarge(length));
    }

    dst.reserve(HEADER_LEN + length);
    dst.put_u32_le(length as u32);
    dst.put_u32_le(0);
    dst.put_u32_le(message.id() as u32);
    dst.extend_from_slice(&body);
    Ok(())
}

/// Decoder that owns its buffer, for transports that hand over raw chunks
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes without attempting a decode
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Append `chunk` and try to decode one message
    pub fn decode_chunk(&mut self, chunk: &[u8]) -> DecodeOutcome {
        self.feed(chunk);
        self.next_buffered()
    }

    /// Try to decode one message from what is already buffered
    pub fn next_buffered(&mut self) -> DecodeOutcome {
        decode(&mut self.buf)
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Drop everything buffered, used after a fatal desync
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// `tokio_util` codec for device connections
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl LineCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for LineCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        match crate::codec::decode(src) {
            DecodeOutcome::Message(message) => Ok(Some(Inbound::Message(message))),
            DecodeOutcome::Incomplete => Ok(None),
            DecodeOutcome::Malformed(e) if e.is_fatal() => Err(e),
            DecodeOutcome::Malformed(e) => Ok(Some(Inbound::Malformed(e))),
        }
    }
}

impl Encoder<LineMessage> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: LineMessage, dst: &mut BytesMut) -> Result<()> {
        encode_into(&item, dst)
    }
}

fn write_body(message: &LineMessage, out: &mut BytesMut) -> Result<()> {
    match message {
        LineMessage::KeepAlive { timestamp } | LineMessage::KeepAliveAck { timestamp } => {
            out.put_u64_le(*timestamp);
        }
        LineMessage::Register { device_id, device_name, capabilities } => {
            out.put_u32_le(*device_id);
            put_string(out, device_name)?;
            out.put_u32_le(capabilities.to_wire());
        }
        LineMessage::RegisterAck { keepalive_secs } => out.put_u32_le(*keepalive_secs),
        LineMessage::RegisterReject { reason } => put_string(out, reason)?,
        LineMessage::Unregister | LineMessage::UnregisterAck => {}
        LineMessage::CallControl { call_ref, action, cause, party } => {
            out.put_u32_le(call_ref.0);
            out.put_u8(action.to_wire());
            out.put_u32_le(cause.0);
            put_string(out, party)?;
        }
        LineMessage::Dtmf { call_ref, digit, duration_ms } => {
            out.put_u32_le(call_ref.0);
            out.put_u8(digit.as_char() as u8);
            out.put_u32_le(*duration_ms);
        }
        LineMessage::MediaNegotiation { call_ref, address, port, codec, sample_rate, frame_ms } => {
            out.put_u32_le(call_ref.0);
            match address {
                IpAddr::V4(v4) => {
                    out.put_u8(4);
                    out.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    out.put_u8(6);
                    out.put_slice(&v6.octets());
                }
            }
            out.put_u16_le(*port);
            put_string(out, codec)?;
            out.put_u32_le(*sample_rate);
            out.put_u32_le(*frame_ms);
        }
        LineMessage::Reset { kind } => out.put_u8(kind.to_wire()),
    }
    Ok(())
}

fn put_string(out: &mut BytesMut, value: &str) -> Result<()> {
    let len = value.len();
    if len > MAX_FRAME_LENGTH {
        return Err(CodecError::FrameTooLarge(len));
    }
    out.put_u16_le(len as u16);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn parse_body(id: MessageId, frame: &mut Bytes) -> Result<LineMessage> {
    let mut r = BodyReader { buf: frame, message: id.name() };
    let message = match id {
        MessageId::KeepAlive => LineMessage::KeepAlive { timestamp: r.u64()? },
        MessageId::KeepAliveAck => LineMessage::KeepAliveAck { timestamp: r.u64()? },
        MessageId::Register => LineMessage::Register {
            device_id: r.u32()?,
            device_name: r.string("device_name")?,
            capabilities: Capabilities::from_wire(r.u32()?),
        },
        MessageId::RegisterAck => LineMessage::RegisterAck { keepalive_secs: r.u32()? },
        MessageId::RegisterReject => LineMessage::RegisterReject { reason: r.string("reason")? },
        MessageId::Unregister => LineMessage::Unregister,
        MessageId::UnregisterAck => LineMessage::UnregisterAck,
        MessageId::CallControl => LineMessage::CallControl {
            call_ref: CallReference(r.u32()?),
            action: CallAction::from_wire(r.u8()?)?,
            cause: HangupCause(r.u32()?),
            party: r.string("party")?,
        },
        MessageId::Dtmf => LineMessage::Dtmf {
            call_ref: CallReference(r.u32()?),
            digit: DtmfDigit::new(r.u8()? as char)?,
            duration_ms: r.u32()?,
        },
        MessageId::MediaNegotiation => LineMessage::MediaNegotiation {
            call_ref: CallReference(r.u32()?),
            address: r.ip()?,
            port: r.u16()?,
            codec: r.string("codec")?,
            sample_rate: r.u32()?,
            frame_ms: r.u32()?,
        },
        MessageId::Reset => LineMessage::Reset { kind: ResetKind::from_wire(r.u8()?)? },
    };
    // Trailing padding is tolerated; some firmware pads bodies to a fixed size.
    Ok(message)
}

struct BodyReader<'a> {
    buf: &'a mut Bytes,
    message: &'static str,
}

impl BodyReader<'_> {
    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                message: self.message,
                needed: n - self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn string(&mut self, field: &'static str) -> Result<String> {
        let len = self.u16()? as usize;
        self.need(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|e| CodecError::invalid(field, e.to_string()))
    }

    fn ip(&mut self) -> Result<IpAddr> {
        match self.u8()? {
            4 => {
                self.need(4)?;
                let mut octets = [0u8; 4];
                self.buf.copy_to_slice(&mut octets);
                Ok(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            6 => {
                self.need(16)?;
                let mut octets = [0u8; 16];
                self.buf.copy_to_slice(&mut octets);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            family => Err(CodecError::invalid("address", format!("unknown family {}", family))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(id: u32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le((4 + body.len()) as u32);
        buf.put_u32_le(0);
        buf.put_u32_le(id);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_header_only_is_incomplete() {
        let mut buf = BytesMut::from(&[12u8, 0, 0][..]);
        assert!(matches!(decode(&mut buf), DecodeOutcome::Incomplete));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_oversized_length_is_fatal_and_not_consumed() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1 << 20);
        buf.put_u32_le(0);
        match decode(&mut buf) {
            DecodeOutcome::Malformed(e) => assert!(e.is_fatal()),
            other => panic!("expected malformed, got {:?}", other),
        }
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn test_unknown_id_consumes_frame_and_recovers() {
        let mut buf = frame_with(0x7777, &[1, 2, 3]);
        let keepalive = encode(&LineMessage::KeepAlive { timestamp: 9 }).unwrap();
        buf.extend_from_slice(&keepalive);

        match decode(&mut buf) {
            DecodeOutcome::Malformed(CodecError::UnknownMessage(0x7777)) => {}
            other => panic!("expected unknown message, got {:?}", other),
        }
        match decode(&mut buf) {
            DecodeOutcome::Message(LineMessage::KeepAlive { timestamp: 9 }) => {}
            other => panic!("expected keepalive, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncated_body_is_recoverable() {
        // CallControl with only the call reference present
        let mut buf = frame_with(MessageId::CallControl as u32, &[7, 0, 0, 0]);
        match decode(&mut buf) {
            DecodeOutcome::Malformed(e) => {
                assert!(!e.is_fatal());
                assert!(matches!(e, CodecError::Truncated { message: "CallControl", .. }));
            }
            other => panic!("expected truncated, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_trailing_padding_tolerated() {
        let mut body = Vec::new();
        body.extend_from_slice(&60u32.to_le_bytes());
        body.extend_from_slice(&[0, 0, 0, 0]);
        let mut buf = frame_with(MessageId::RegisterAck as u32, &body);
        assert!(matches!(
            decode(&mut buf),
            DecodeOutcome::Message(LineMessage::RegisterAck { keepalive_secs: 60 })
        ));
    }

    #[test]
    fn test_framed_codec_surfaces_recoverable_errors_as_items() {
        let mut codec = LineCodec::new();
        let mut buf = frame_with(MessageId::Reset as u32, &[9]);
        match Decoder::decode(&mut codec, &mut buf) {
            Ok(Some(Inbound::Malformed(CodecError::InvalidField { field: "reset", .. }))) => {}
            other => panic!("unexpected {:?}", other),
        }

        let mut bad = BytesMut::new();
        bad.put_u32_le(2);
        bad.put_u32_le(0);
        assert!(Decoder::decode(&mut codec, &mut bad).is_err());
    }

    #[test]
    fn test_oversized_string_rejected_on_encode() {
        let reason = "x".repeat(MAX_FRAME_LENGTH);
        assert!(matches!(
            encode(&LineMessage::RegisterReject { reason }),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
