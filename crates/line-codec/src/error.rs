//! Error types for the line codec

use thiserror::Error;

/// Errors produced while framing or parsing device messages
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame length {0} outside accepted bounds")]
    InvalidLength(usize),

    #[error("Reserved header word is {0:#x}, expected 0")]
    ReservedNotZero(u32),

    #[error("Unknown message id {0:#06x}")]
    UnknownMessage(u32),

    #[error("Message {message} truncated: needed {needed} more bytes")]
    Truncated { message: &'static str, needed: usize },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Message too large to encode: {0} bytes")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the byte stream can no longer be trusted to be frame-aligned.
    ///
    /// Recoverable errors consumed exactly one frame; the next frame starts
    /// at the current buffer position.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidLength(_) | CodecError::ReservedNotZero(_) | CodecError::Io(_)
        )
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CodecError::InvalidField { field, reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
