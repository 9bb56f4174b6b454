use std::net::SocketAddr;
use std::time::Duration;

use rvoip_line_codec::CodecError;
use thiserror::Error;

/// Errors raised by device transports
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream desynchronized: {0}")]
    Desync(CodecError),

    #[error("Failed to encode message: {0}")]
    Encode(CodecError),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("No frame received within {0:?}")]
    Timeout(Duration),
}

impl Error {
    fn from_codec(e: CodecError, encoding: bool) -> Self {
        match e {
            CodecError::Io(io) => Error::Io(io),
            other if encoding => Error::Encode(other),
            other => Error::Desync(other),
        }
    }

    pub(crate) fn from_decode(e: CodecError) -> Self {
        Self::from_codec(e, false)
    }

    pub(crate) fn from_encode(e: CodecError) -> Self {
        Self::from_codec(e, true)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
