//! Device message model
//!
//! Every message exchanged with a device falls in one of four categories:
//! registration/keepalive, call control, DTMF, and media endpoint
//! negotiation. A `Reset` message lets the adapter ask a device to restart
//! or shut down.

use std::fmt;
use std::net::IpAddr;

use crate::error::{CodecError, Result};

/// Numeric message identifiers used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    KeepAlive = 0x0000,
    Register = 0x0001,
    Dtmf = 0x0003,
    Unregister = 0x0027,
    RegisterAck = 0x0081,
    RegisterReject = 0x009D,
    Reset = 0x009F,
    KeepAliveAck = 0x0100,
    MediaNegotiation = 0x0105,
    CallControl = 0x0111,
    UnregisterAck = 0x0118,
}

impl MessageId {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0000 => Some(Self::KeepAlive),
            0x0001 => Some(Self::Register),
            0x0003 => Some(Self::Dtmf),
            0x0027 => Some(Self::Unregister),
            0x0081 => Some(Self::RegisterAck),
            0x009D => Some(Self::RegisterReject),
            0x009F => Some(Self::Reset),
            0x0100 => Some(Self::KeepAliveAck),
            0x0105 => Some(Self::MediaNegotiation),
            0x0111 => Some(Self::CallControl),
            0x0118 => Some(Self::UnregisterAck),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::KeepAlive => "KeepAlive",
            Self::Register => "Register",
            Self::Dtmf => "Dtmf",
            Self::Unregister => "Unregister",
            Self::RegisterAck => "RegisterAck",
            Self::RegisterReject => "RegisterReject",
            Self::Reset => "Reset",
            Self::KeepAliveAck => "KeepAliveAck",
            Self::MediaNegotiation => "MediaNegotiation",
            Self::CallControl => "CallControl",
            Self::UnregisterAck => "UnregisterAck",
        }
    }
}

/// Device-scoped call identifier carried by call-control, DTMF and media
/// messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallReference(pub u32);

impl fmt::Display for CallReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Capabilities advertised by a device at registration
///
/// Packed into a single word only on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub audio: bool,
    pub video: bool,
    pub dtmf_out_of_band: bool,
    pub hold: bool,
    pub linear_audio: bool,
}

impl Capabilities {
    const AUDIO: u32 = 1 << 0;
    const VIDEO: u32 = 1 << 1;
    const DTMF_OOB: u32 = 1 << 2;
    const HOLD: u32 = 1 << 3;
    const LINEAR: u32 = 1 << 4;

    pub fn to_wire(self) -> u32 {
        let mut word = 0;
        if self.audio {
            word |= Self::AUDIO;
        }
        if self.video {
            word |= Self::VIDEO;
        }
        if self.dtmf_out_of_band {
            word |= Self::DTMF_OOB;
        }
        if self.hold {
            word |= Self::HOLD;
        }
        if self.linear_audio {
            word |= Self::LINEAR;
        }
        word
    }

    /// Unknown bits are ignored so newer devices still register.
    pub fn from_wire(word: u32) -> Self {
        Self {
            audio: word & Self::AUDIO != 0,
            video: word & Self::VIDEO != 0,
            dtmf_out_of_band: word & Self::DTMF_OOB != 0,
            hold: word & Self::HOLD != 0,
            linear_audio: word & Self::LINEAR != 0,
        }
    }
}

/// Call-control verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallAction {
    Offer,
    Ring,
    Answer,
    Hold,
    Resume,
    Hangup,
}

impl CallAction {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Offer => 1,
            Self::Ring => 2,
            Self::Answer => 3,
            Self::Hold => 4,
            Self::Resume => 5,
            Self::Hangup => 6,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Offer),
            2 => Ok(Self::Ring),
            3 => Ok(Self::Answer),
            4 => Ok(Self::Hold),
            5 => Ok(Self::Resume),
            6 => Ok(Self::Hangup),
            other => Err(CodecError::invalid("action", format!("unknown call action {}", other))),
        }
    }
}

/// Termination cause, Q.850 numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HangupCause(pub u32);

impl HangupCause {
    pub const NONE: HangupCause = HangupCause(0);
    pub const NORMAL_CLEARING: HangupCause = HangupCause(16);
    pub const USER_BUSY: HangupCause = HangupCause(17);
    pub const NO_ANSWER: HangupCause = HangupCause(19);
    pub const CALL_REJECTED: HangupCause = HangupCause(21);
    pub const DESTINATION_OUT_OF_ORDER: HangupCause = HangupCause(27);
    pub const NORMAL_TEMPORARY_FAILURE: HangupCause = HangupCause(41);
    pub const RECOVERY_ON_TIMER_EXPIRE: HangupCause = HangupCause(102);

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "NONE",
            16 => "NORMAL_CLEARING",
            17 => "USER_BUSY",
            19 => "NO_ANSWER",
            21 => "CALL_REJECTED",
            27 => "DESTINATION_OUT_OF_ORDER",
            41 => "NORMAL_TEMPORARY_FAILURE",
            102 => "RECOVERY_ON_TIMER_EXPIRE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for HangupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// A single keypad digit: `0-9`, `*`, `#` or `A-D`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DtmfDigit(char);

impl DtmfDigit {
    pub fn new(digit: char) -> Result<Self> {
        let digit = digit.to_ascii_uppercase();
        match digit {
            '0'..='9' | '*' | '#' | 'A'..='D' => Ok(Self(digit)),
            other => Err(CodecError::invalid("digit", format!("{:?} is not a DTMF digit", other))),
        }
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a `Reset` asks the device to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Restart,
    Shutdown,
}

impl ResetKind {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Restart => 1,
            Self::Shutdown => 2,
        }
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Restart),
            2 => Ok(Self::Shutdown),
            other => Err(CodecError::invalid("reset", format!("unknown reset kind {}", other))),
        }
    }
}

/// A decoded device message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMessage {
    /// Liveness probe, either direction
    KeepAlive { timestamp: u64 },
    KeepAliveAck { timestamp: u64 },

    /// Device announces itself
    Register {
        device_id: u32,
        device_name: String,
        capabilities: Capabilities,
    },
    RegisterAck { keepalive_secs: u32 },
    RegisterReject { reason: String },
    Unregister,
    UnregisterAck,

    /// Call-control verb for one call reference. `party` carries the called
    /// number on outbound offers and the calling number on inbound offers.
    CallControl {
        call_ref: CallReference,
        action: CallAction,
        cause: HangupCause,
        party: String,
    },

    Dtmf {
        call_ref: CallReference,
        digit: DtmfDigit,
        duration_ms: u32,
    },

    /// Where and how the device sends/receives audio for a call
    MediaNegotiation {
        call_ref: CallReference,
        address: IpAddr,
        port: u16,
        codec: String,
        sample_rate: u32,
        frame_ms: u32,
    },

    Reset { kind: ResetKind },
}

impl LineMessage {
    pub fn id(&self) -> MessageId {
        match self {
            Self::KeepAlive { .. } => MessageId::KeepAlive,
            Self::KeepAliveAck { .. } => MessageId::KeepAliveAck,
            Self::Register { .. } => MessageId::Register,
            Self::RegisterAck { .. } => MessageId::RegisterAck,
            Self::RegisterReject { .. } => MessageId::RegisterReject,
            Self::Unregister => MessageId::Unregister,
            Self::UnregisterAck => MessageId::UnregisterAck,
            Self::CallControl { .. } => MessageId::CallControl,
            Self::Dtmf { .. } => MessageId::Dtmf,
            Self::MediaNegotiation { .. } => MessageId::MediaNegotiation,
            Self::Reset { .. } => MessageId::Reset,
        }
    }

    /// Call reference for call-scoped messages
    pub fn call_ref(&self) -> Option<CallReference> {
        match self {
            Self::CallControl { call_ref, .. }
            | Self::Dtmf { call_ref, .. }
            | Self::MediaNegotiation { call_ref, .. } => Some(*call_ref),
            _ => None,
        }
    }

    pub fn call_control(call_ref: CallReference, action: CallAction) -> Self {
        Self::CallControl {
            call_ref,
            action,
            cause: HangupCause::NONE,
            party: String::new(),
        }
    }

    pub fn hangup(call_ref: CallReference, cause: HangupCause) -> Self {
        Self::CallControl {
            call_ref,
            action: CallAction::Hangup,
            cause,
            party: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_ignore_unknown_bits() {
        let caps = Capabilities::from_wire(0xFFFF_FF00 | 0b10101);
        assert!(caps.audio);
        assert!(!caps.video);
        assert!(caps.dtmf_out_of_band);
        assert!(!caps.hold);
        assert!(caps.linear_audio);
        assert_eq!(caps.to_wire(), 0b10101);
    }

    #[test]
    fn test_dtmf_digit_validation() {
        assert_eq!(DtmfDigit::new('a').unwrap().as_char(), 'A');
        assert_eq!(DtmfDigit::new('#').unwrap().as_char(), '#');
        assert!(DtmfDigit::new('E').is_err());
        assert!(DtmfDigit::new(' ').is_err());
    }

    #[test]
    fn test_message_id_lookup() {
        assert_eq!(MessageId::from_u32(0x0111), Some(MessageId::CallControl));
        assert_eq!(MessageId::from_u32(0x0999), None);
        assert_eq!(LineMessage::Unregister.id(), MessageId::Unregister);
    }
}
