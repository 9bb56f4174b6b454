//! Device dialects
//!
//! Devices differ in how they are reached, how they are asked to shut down
//! and how strictly their input is policed. The signaling loop only depends on
//! the [`Dialect`] capability set below.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rvoip_line_codec::{LineMessage, ResetKind};

/// Configured device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// IP handset connecting to the shared listener
    Handset,
    /// Desktop softphone reached through its companion process
    Softphone,
}

impl DialectKind {
    /// Whether devices of this kind connect to the shared listener
    pub fn uses_shared_listener(self) -> bool {
        matches!(self, Self::Handset)
    }
}

/// What to do with a malformed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Drop the frame; give up on the connection after this many in a row
    DropMessage { max_consecutive: u32 },
    /// Tear down the connection on the first malformed frame
    DropConnection,
}

impl MalformedPolicy {
    /// Whether the `consecutive`-th malformed frame in a row ends the connection
    pub fn disconnects_after(self, consecutive: u32) -> bool {
        match self {
            Self::DropMessage { max_consecutive } => consecutive > max_consecutive,
            Self::DropConnection => true,
        }
    }
}

pub trait Dialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Message asking the peer to shut down, sent when the endpoint stops
    fn shutdown_request(&self) -> Option<LineMessage>;

    /// Whether DTMF generated by the runtime is echoed to the device
    fn mirrors_dtmf(&self) -> bool;

    fn malformed_policy(&self) -> MalformedPolicy;
}

#[derive(Debug, Default)]
pub struct HandsetDialect;

impl Dialect for HandsetDialect {
    fn name(&self) -> &'static str {
        "handset"
    }

    fn shutdown_request(&self) -> Option<LineMessage> {
        Some(LineMessage::Reset {
            kind: ResetKind::Restart,
        })
    }

    fn mirrors_dtmf(&self) -> bool {
        false
    }

    fn malformed_policy(&self) -> MalformedPolicy {
        MalformedPolicy::DropMessage { max_consecutive: 5 }
    }
}

#[derive(Debug, Default)]
pub struct SoftphoneDialect;

impl Dialect for SoftphoneDialect {
    fn name(&self) -> &'static str {
        "softphone"
    }

    fn shutdown_request(&self) -> Option<LineMessage> {
        Some(LineMessage::Reset {
            kind: ResetKind::Shutdown,
        })
    }

    fn mirrors_dtmf(&self) -> bool {
        true
    }

    fn malformed_policy(&self) -> MalformedPolicy {
        MalformedPolicy::DropConnection
    }
}

pub fn dialect_for(kind: DialectKind) -> Arc<dyn Dialect> {
    match kind {
        DialectKind::Handset => Arc::new(HandsetDialect),
        DialectKind::Softphone => Arc::new(SoftphoneDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_policy_threshold() {
        let policy = HandsetDialect.malformed_policy();
        assert!(!policy.disconnects_after(1));
        assert!(!policy.disconnects_after(5));
        assert!(policy.disconnects_after(6));
        assert!(SoftphoneDialect.malformed_policy().disconnects_after(1));
    }

    #[test]
    fn test_shutdown_requests_differ() {
        assert_eq!(
            dialect_for(DialectKind::Handset).shutdown_request(),
            Some(LineMessage::Reset { kind: ResetKind::Restart })
        );
        assert_eq!(
            dialect_for(DialectKind::Softphone).shutdown_request(),
            Some(LineMessage::Reset { kind: ResetKind::Shutdown })
        );
    }
}
