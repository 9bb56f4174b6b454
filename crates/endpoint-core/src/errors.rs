//! Error types for the endpoint adapter
//!
//! Faults stay local to the device that raised them. Registry and
//! origination failures are typed outcomes so callers can fall back without
//! parsing strings.

use std::time::Duration;

use rvoip_line_codec::CodecError;
use thiserror::Error;

use crate::channel::ChannelPhase;

/// Top-level endpoint error
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("Interface {slot} expired after {silent:?} without traffic")]
    Expired { slot: String, silent: Duration },

    #[error("Transport fault: {0}")]
    TransportFault(#[from] rvoip_line_transport::Error),

    #[error("Invalid configuration for interface {slot}: {reason}")]
    ConfigInvalid { slot: String, reason: String },

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Session runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EndpointError {
    pub(crate) fn config(slot: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            slot: slot.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EndpointError>;

/// Outcome of a failed registry reservation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("interface {0} not found")]
    NotFound(String),

    #[error("interface {0} is busy")]
    Busy(String),
}

/// Call-leg state machine errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelPhase, to: ChannelPhase },

    #[error("channel has no active media")]
    NotActive,

    #[error("channel hung up")]
    HungUp,

    #[error("media path error: {0}")]
    Media(#[from] std::io::Error),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors reported by a session runtime
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session rejected: {0}")]
    Rejected(String),
}

/// Typed origination outcome
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OriginateError {
    #[error("interface {0} is busy")]
    Busy(String),

    #[error("no interface matches {0}")]
    NotFound(String),

    #[error("cannot build caller profile: {0}")]
    NoProfile(String),

    #[error("interface {0} is unavailable")]
    Unavailable(String),

    #[error("device did not acknowledge within {0:?}")]
    Timeout(Duration),
}

impl From<RegistryError> for OriginateError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Busy(slot) => Self::Busy(slot),
            RegistryError::NotFound(slot) => Self::NotFound(slot),
        }
    }
}
