//! Outbound call allocation
//!
//! An origination target is `selector/destination`, where the selector is
//! either an interface name or the literal `ANY`. The allocator reserves the
//! slot atomically, hands the reservation to the slot's signaling loop and
//! waits for the device to acknowledge the call.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dialect::dialect_for;
use crate::errors::OriginateError;
use crate::registry::{InterfaceRegistry, SlotHealth, SlotId, SlotSelector};
use crate::runtime::{CallerProfile, SessionToken};
use crate::signaling::{LoopCommand, OutboundRequest};
use crate::stats::EndpointStats;

/// Parsed `selector/destination` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateTarget {
    pub selector: SlotSelector,
    pub destination: String,
}

impl OriginateTarget {
    pub fn parse(target: &str) -> Result<Self, OriginateError> {
        let (selector, destination) = target
            .split_once('/')
            .ok_or_else(|| OriginateError::NoProfile(format!("{:?} is not selector/destination", target)))?;
        if selector.is_empty() {
            return Err(OriginateError::NoProfile(format!("{:?} has no interface", target)));
        }
        if destination.is_empty() {
            return Err(OriginateError::NoProfile(format!("{:?} has no destination", target)));
        }
        Ok(Self {
            selector: SlotSelector::parse(selector),
            destination: destination.to_string(),
        })
    }
}

impl FromStr for OriginateTarget {
    type Err = OriginateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OriginateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.selector, self.destination)
    }
}

/// Places outbound calls on behalf of the session runtime
#[derive(Clone)]
pub struct Originator {
    registry: Arc<InterfaceRegistry>,
    loops: Arc<HashMap<SlotId, mpsc::Sender<LoopCommand>>>,
    stats: Arc<EndpointStats>,
}

impl Originator {
    pub fn new(
        registry: Arc<InterfaceRegistry>,
        loops: Arc<HashMap<SlotId, mpsc::Sender<LoopCommand>>>,
        stats: Arc<EndpointStats>,
    ) -> Self {
        Self { registry, loops, stats }
    }

    /// Place a call to `target`, waiting up to `timeout` for the device
    pub async fn originate(&self, target: &str, timeout: Duration) -> Result<SessionToken, OriginateError> {
        let result = match OriginateTarget::parse(target) {
            Ok(target) => self.originate_to(&target, timeout).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(token) => info!("Originated {} as session {}", target, token),
            Err(e) => {
                self.stats.record_outbound_failed();
                warn!("Origination to {} failed: {}", target, e);
            }
        }
        result
    }

    async fn originate_to(&self, target: &OriginateTarget, timeout: Duration) -> Result<SessionToken, OriginateError> {
        let handle = self.registry.reserve(&target.selector)?;
        let slot = Arc::clone(handle.slot());

        if slot.health() != SlotHealth::Registered {
            self.registry.release(&handle);
            return Err(OriginateError::Unavailable(slot.name().to_string()));
        }
        let Some(commands) = self.loops.get(&slot.id()) else {
            self.registry.release(&handle);
            return Err(OriginateError::Unavailable(slot.name().to_string()));
        };

        let config = slot.config();
        let profile = CallerProfile::outbound(config, dialect_for(config.dialect).name(), &target.destination);
        let leg = handle.leg();
        let held = handle.clone();
        let (reply, acknowledged) = oneshot::channel();
        debug!(slot = slot.id(), "Handing {} to interface {}", target, slot.name());

        let request = OutboundRequest { handle, profile, reply };
        if let Err(mpsc::error::SendError(command)) = commands.send(LoopCommand::Originate(request)).await {
            if let LoopCommand::Originate(request) = command {
                self.registry.release(&request.handle);
            }
            return Err(OriginateError::Unavailable(slot.name().to_string()));
        }

        match tokio::time::timeout(timeout, acknowledged).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(OriginateError::Unavailable(slot.name().to_string())),
            Err(_) => {
                if commands.send(LoopCommand::CancelOriginate(leg)).await.is_err() {
                    self.registry.release(&held);
                }
                Err(OriginateError::Timeout(timeout))
            }
        }
    }
}
