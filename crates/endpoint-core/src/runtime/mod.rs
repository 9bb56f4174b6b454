//! Session runtime interface
//!
//! The session runtime is the call-processing system the adapter plugs into.
//! It owns generic session lifecycle, routing and media handling; the adapter
//! only creates sessions, reports channel state, passes DTMF and hands over a
//! [`FrameBridge`] once media is ready.
//!
//! Instead of installing callbacks on a channel, a leg subscribes to its
//! session at creation and receives [`RuntimeEvent`]s on a channel until it
//! unsubscribes at destruction.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rvoip_line_codec::{DtmfDigit, HangupCause};

use crate::channel::FrameBridge;
use crate::config::SlotConfig;
use crate::errors::RuntimeError;

pub mod memory;

pub use memory::MemoryRuntime;

/// `source` field of every caller profile built by the adapter
pub const PROFILE_SOURCE: &str = "rvoip-endpoint";

/// Correlation token naming one runtime session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(pub String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
        }
    }
}

/// Channel state as reported to the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Routing,
    RingReady,
    Answered,
    Held,
    ExchangeMedia,
    HungUp(HangupCause),
}

/// Who is calling whom, and where the runtime should route the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerProfile {
    pub caller_id_name: String,
    pub caller_id_number: String,
    pub destination_number: String,
    pub dialplan: String,
    pub context: String,
    pub source: String,
    pub channel_name: String,
    pub network_addr: Option<IpAddr>,
}

impl CallerProfile {
    /// Profile for a call offered by the device
    pub fn inbound(slot: &SlotConfig, dialect: &str, calling: &str, network_addr: Option<IpAddr>) -> Self {
        let routing = &slot.routing;
        let caller_id_number = if calling.is_empty() {
            routing.caller_id_number.clone()
        } else {
            calling.to_string()
        };
        Self {
            caller_id_name: routing.caller_id_name.clone(),
            caller_id_number,
            destination_number: routing.destination.clone(),
            dialplan: routing.dialplan.clone(),
            context: routing.context.clone(),
            source: PROFILE_SOURCE.to_string(),
            channel_name: format!("{}/{}", dialect, slot.name),
            network_addr,
        }
    }

    /// Profile for a call placed through the slot towards `destination`
    pub fn outbound(slot: &SlotConfig, dialect: &str, destination: &str) -> Self {
        let routing = &slot.routing;
        Self {
            caller_id_name: routing.caller_id_name.clone(),
            caller_id_number: routing.caller_id_number.clone(),
            destination_number: destination.to_string(),
            dialplan: routing.dialplan.clone(),
            context: routing.context.clone(),
            source: PROFILE_SOURCE.to_string(),
            channel_name: format!("{}/{}/{}", dialect, slot.name, destination),
            network_addr: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEvent {
    pub digit: DtmfDigit,
    pub duration: Duration,
}

impl DtmfEvent {
    pub fn new(digit: DtmfDigit, duration: Duration) -> Self {
        Self { digit, duration }
    }
}

/// Forced teardown signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Hang the leg up
    Kill,
    /// Interrupt a blocked frame read
    Break,
}

/// Indications the runtime sends to a subscribed leg
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Kill(KillSignal),
    /// Runtime answered an inbound call
    Answer,
    /// DTMF generated by the runtime for the device
    SendDtmf(DtmfEvent),
    /// Runtime cleared the call
    Hangup(HangupCause),
}

/// Receiver half handed to a subscribing leg
pub type RuntimeSubscription = mpsc::UnboundedReceiver<RuntimeEvent>;

#[async_trait]
pub trait SessionRuntime: Send + Sync {
    async fn create_session(
        &self,
        direction: CallDirection,
        profile: CallerProfile,
    ) -> Result<SessionToken, RuntimeError>;

    /// Forget a session; unknown tokens are ignored
    async fn destroy_session(&self, token: &SessionToken);

    async fn set_channel_state(&self, token: &SessionToken, state: ChannelState) -> Result<(), RuntimeError>;

    async fn channel_state(&self, token: &SessionToken) -> Option<ChannelState>;

    async fn caller_profile(&self, token: &SessionToken) -> Option<CallerProfile>;

    async fn set_caller_profile(&self, token: &SessionToken, profile: CallerProfile) -> Result<(), RuntimeError>;

    /// Queue a digit received from the device
    async fn queue_dtmf(&self, token: &SessionToken, event: DtmfEvent) -> Result<(), RuntimeError>;

    async fn dequeue_dtmf(&self, token: &SessionToken) -> Option<DtmfEvent>;

    /// Register for events on a session
    fn subscribe(&self, token: &SessionToken) -> Result<RuntimeSubscription, RuntimeError>;

    fn unsubscribe(&self, token: &SessionToken);

    /// Hand the runtime the frame read/write pair for an active leg
    async fn attach_media(&self, token: &SessionToken, bridge: FrameBridge) -> Result<(), RuntimeError>;
}
