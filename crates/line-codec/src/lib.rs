//! Wire protocol for line-oriented telephony devices
//!
//! This crate models the signaling vocabulary spoken between the endpoint
//! adapter and its devices (IP handsets and softphone companion processes)
//! and provides the framing codec used on every device connection.
//!
//! Frames use Skinny-style little-endian framing:
//!
//! ```text
//! +----------------+----------------+----------------+----------------------+
//! | length: u32 LE | reserved: u32  | message id u32 | body (length-4 bytes)|
//! +----------------+----------------+----------------+----------------------+
//! ```
//!
//! ## Decoding a byte stream
//!
//! ```rust
//! use rvoip_line_codec::{encode, DecodeOutcome, LineMessage, StreamDecoder};
//!
//! let frame = encode(&LineMessage::KeepAlive { timestamp: 42 }).unwrap();
//! let (head, tail) = frame.split_at(5);
//!
//! let mut decoder = StreamDecoder::new();
//! assert!(matches!(decoder.decode_chunk(head), DecodeOutcome::Incomplete));
//! match decoder.decode_chunk(tail) {
//!     DecodeOutcome::Message(msg) => assert_eq!(msg, LineMessage::KeepAlive { timestamp: 42 }),
//!     other => panic!("unexpected outcome: {:?}", other),
//! }
//! ```

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{decode, encode, encode_into, DecodeOutcome, Inbound, LineCodec, StreamDecoder};
pub use codec::{HEADER_LEN, MAX_FRAME_LENGTH};
pub use error::{CodecError, Result};
pub use message::{
    CallAction, CallReference, Capabilities, DtmfDigit, HangupCause, LineMessage, MessageId,
    ResetKind,
};
