//! Telephony endpoint adapter core
//!
//! Binds a fleet of signaling devices (IP handsets and softphones reached
//! through a companion process) to a call-session runtime. The crate holds
//! the parts that coordinate concurrently connected devices:
//!
//! - [`registry`]: the slot table with atomic busy/idle reservation
//! - [`signaling`]: one loop per device driving registration, keepalive and
//!   call control
//! - [`channel`]: the call-leg state machine and the frame bridge handed to
//!   the runtime
//! - [`originate`]: outbound call allocation
//! - [`lifecycle`]: startup, supervision and bounded shutdown
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rvoip_endpoint_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EndpointConfig::new("office")
//!     .with_listen("0.0.0.0:2000".parse()?)
//!     .with_interface(InterfaceConfig::handset(1, "lobby"));
//!
//! let endpoint = Endpoint::start(config, Arc::new(MemoryRuntime::new())).await?;
//! match endpoint.originate("lobby/5551212", Duration::from_secs(30)).await {
//!     Ok(token) => println!("calling as {}", token),
//!     Err(OriginateError::Busy(slot)) => println!("{} is busy", slot),
//!     Err(e) => println!("failed: {}", e),
//! }
//! endpoint.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod dialect;
pub mod errors;
pub mod lifecycle;
pub mod logging;
pub mod media;
pub mod originate;
pub mod registry;
pub mod runtime;
pub mod signaling;
pub mod stats;

pub use channel::{CallLeg, ChannelPhase, FrameBridge, LegFlagSet};
pub use config::{EndpointConfig, InterfaceConfig, SlotConfig};
pub use errors::{EndpointError, OriginateError, RegistryError, Result};
pub use lifecycle::{Endpoint, ShutdownReport};
pub use registry::{InterfaceRegistry, SlotHealth, SlotId, SlotSelector, SlotSnapshot, ANY_SLOT};
pub use runtime::{KillSignal, MemoryRuntime, SessionRuntime, SessionToken};
pub use signaling::LoopState;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::channel::{ChannelPhase, FrameBridge};
    pub use crate::config::{EndpointConfig, InterfaceConfig};
    pub use crate::dialect::DialectKind;
    pub use crate::errors::{EndpointError, OriginateError};
    pub use crate::lifecycle::{Endpoint, ShutdownReport};
    pub use crate::media::{CodecDescriptor, Frame, MediaConnector, MediaPath};
    pub use crate::registry::{SlotHealth, SlotSelector};
    pub use crate::runtime::{
        CallDirection, CallerProfile, ChannelState, KillSignal, MemoryRuntime, RuntimeEvent, SessionRuntime,
        SessionToken,
    };
    pub use crate::signaling::LoopState;
}
