//! Interface registry
//!
//! The table of configured device slots. Occupancy of each slot is a single
//! atomic word holding the occupying leg id (zero when idle), so reservation
//! and release are one compare-and-swap each and unrelated slots never
//! contend on a shared lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SlotConfig;
use crate::dialect::DialectKind;
use crate::errors::RegistryError;

/// Stable slot identifier from configuration
pub type SlotId = u32;

/// Sentinel selector text for "any idle slot"
pub const ANY_SLOT: &str = "ANY";

/// Identifier of the call leg occupying a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegId(u64);

impl LegId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leg-{}", self.0)
    }
}

/// Registration status of the device behind a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotHealth {
    /// No device has registered yet
    Absent = 0,
    Registered = 1,
    /// The device went silent past its keepalive threshold
    Expired = 2,
    /// The signaling loop stopped on a transport fault
    Faulted = 3,
}

impl SlotHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Registered,
            2 => Self::Expired,
            3 => Self::Faulted,
            _ => Self::Absent,
        }
    }
}

/// How a caller picks a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSelector {
    Id(SlotId),
    Name(String),
    /// First idle slot with a registered device, in configured order
    Any,
}

impl SlotSelector {
    /// `ANY` selects any idle slot, anything else is an exact name
    pub fn parse(text: &str) -> Self {
        if text == ANY_SLOT {
            Self::Any
        } else {
            Self::Name(text.to_string())
        }
    }
}

impl fmt::Display for SlotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{}", id),
            Self::Name(name) => f.write_str(name),
            Self::Any => f.write_str(ANY_SLOT),
        }
    }
}

/// One configured device slot
#[derive(Debug)]
pub struct InterfaceSlot {
    config: SlotConfig,
    occupant: AtomicU64,
    health: AtomicU8,
    reservations: AtomicU64,
    releases: AtomicU64,
    forced_idle: AtomicU64,
}

impl InterfaceSlot {
    fn new(config: SlotConfig) -> Self {
        Self {
            config,
            occupant: AtomicU64::new(0),
            health: AtomicU8::new(SlotHealth::Absent as u8),
            reservations: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            forced_idle: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SlotId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    pub fn health(&self) -> SlotHealth {
        SlotHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    pub fn occupant(&self) -> Option<LegId> {
        match self.occupant.load(Ordering::Acquire) {
            0 => None,
            leg => Some(LegId(leg)),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.occupant().is_none()
    }
}

/// Proof of a successful reservation
///
/// Releasing through a handle only clears the slot if the slot is still held
/// by the same leg, so a stale handle can never free someone else's call.
#[derive(Debug, Clone)]
pub struct SlotHandle {
    slot: Arc<InterfaceSlot>,
    leg: LegId,
}

impl SlotHandle {
    pub fn slot(&self) -> &Arc<InterfaceSlot> {
        &self.slot
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot.id()
    }

    pub fn leg(&self) -> LegId {
        self.leg
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub name: String,
    pub dialect: DialectKind,
    pub health: SlotHealth,
    pub occupant: Option<LegId>,
    pub reservations: u64,
    pub releases: u64,
    pub forced_idle: u64,
}

impl SlotSnapshot {
    pub fn is_idle(&self) -> bool {
        self.occupant.is_none()
    }
}

/// Table of all configured slots
#[derive(Debug)]
pub struct InterfaceRegistry {
    slots: Vec<Arc<InterfaceSlot>>,
    by_id: HashMap<SlotId, usize>,
    by_name: HashMap<String, usize>,
    next_leg: AtomicU64,
}

impl InterfaceRegistry {
    /// Build the registry from validated slots, keeping configured order
    pub fn new(configs: Vec<SlotConfig>) -> Self {
        let mut slots = Vec::with_capacity(configs.len());
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();

        for config in configs {
            if by_id.contains_key(&config.id) || by_name.contains_key(&config.name) {
                warn!("Ignoring duplicate interface {} ({})", config.id, config.name);
                continue;
            }
            by_id.insert(config.id, slots.len());
            by_name.insert(config.name.clone(), slots.len());
            slots.push(Arc::new(InterfaceSlot::new(config)));
        }

        Self {
            slots,
            by_id,
            by_name,
            next_leg: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Arc<InterfaceSlot>> {
        self.slots.iter()
    }

    pub fn slot(&self, id: SlotId) -> Option<&Arc<InterfaceSlot>> {
        self.by_id.get(&id).map(|i| &self.slots[*i])
    }

    pub fn slot_by_name(&self, name: &str) -> Option<&Arc<InterfaceSlot>> {
        self.by_name.get(name).map(|i| &self.slots[*i])
    }

    /// Reserve a slot for a new call leg
    ///
    /// An explicit selector fails with `Busy` when the slot is occupied and
    /// never falls back to another slot. `Any` skips slots whose device is
    /// not registered.
    pub fn reserve(&self, selector: &SlotSelector) -> Result<SlotHandle, RegistryError> {
        match selector {
            SlotSelector::Id(id) => {
                let slot = self
                    .slot(*id)
                    .ok_or_else(|| RegistryError::NotFound(format!("#{}", id)))?;
                self.claim(slot)
            }
            SlotSelector::Name(name) => {
                let slot = self
                    .slot_by_name(name)
                    .ok_or_else(|| RegistryError::NotFound(name.clone()))?;
                self.claim(slot)
            }
            SlotSelector::Any => self
                .slots
                .iter()
                .filter(|slot| slot.health() == SlotHealth::Registered)
                .find_map(|slot| self.claim(slot).ok())
                .ok_or_else(|| RegistryError::NotFound(ANY_SLOT.to_string())),
        }
    }

    fn claim(&self, slot: &Arc<InterfaceSlot>) -> Result<SlotHandle, RegistryError> {
        let leg = LegId(self.next_leg.fetch_add(1, Ordering::Relaxed));
        match slot
            .occupant
            .compare_exchange(0, leg.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                slot.reservations.fetch_add(1, Ordering::Relaxed);
                debug!(slot = slot.id(), "Reserved interface {} for {}", slot.name(), leg);
                Ok(SlotHandle {
                    slot: Arc::clone(slot),
                    leg,
                })
            }
            Err(_) => Err(RegistryError::Busy(slot.name().to_string())),
        }
    }

    /// Return a reserved slot to idle
    ///
    /// Idempotent: releasing an idle slot, or releasing with a handle whose
    /// leg no longer occupies the slot, changes nothing. Returns whether this
    /// call freed the slot.
    pub fn release(&self, handle: &SlotHandle) -> bool {
        let slot = &handle.slot;
        match slot
            .occupant
            .compare_exchange(handle.leg.0, 0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                slot.releases.fetch_add(1, Ordering::Relaxed);
                debug!(slot = slot.id(), "Released interface {} from {}", slot.name(), handle.leg);
                true
            }
            Err(0) => false,
            Err(current) => {
                debug!(
                    slot = slot.id(),
                    "Ignoring stale release of {} by {}: held by leg-{}",
                    slot.name(),
                    handle.leg,
                    current
                );
                false
            }
        }
    }

    /// Clear a slot regardless of its occupant
    ///
    /// Returns the evicted leg. When several callers race, exactly one of
    /// them observes `Some`.
    pub fn force_idle(&self, id: SlotId) -> Option<LegId> {
        let slot = self.slot(id)?;
        match slot.occupant.swap(0, Ordering::AcqRel) {
            0 => None,
            leg => {
                slot.releases.fetch_add(1, Ordering::Relaxed);
                slot.forced_idle.fetch_add(1, Ordering::Relaxed);
                warn!(slot = id, "Forced interface {} to idle, evicting leg-{}", slot.name(), leg);
                Some(LegId(leg))
            }
        }
    }

    /// Force every slot idle; returns how many were occupied
    pub fn release_all(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| self.force_idle(slot.id()).is_some())
            .count()
    }

    pub fn set_health(&self, id: SlotId, health: SlotHealth) {
        if let Some(slot) = self.slot(id) {
            let previous = SlotHealth::from_u8(slot.health.swap(health as u8, Ordering::AcqRel));
            if previous != health {
                debug!(slot = id, "Interface {} health {:?} -> {:?}", slot.name(), previous, health);
            }
        }
    }

    pub fn lookup(&self, id: SlotId) -> Result<SlotSnapshot, RegistryError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| RegistryError::NotFound(format!("#{}", id)))?;
        Ok(SlotSnapshot {
            id: slot.id(),
            name: slot.name().to_string(),
            dialect: slot.config.dialect,
            health: slot.health(),
            occupant: slot.occupant(),
            reservations: slot.reservations.load(Ordering::Relaxed),
            releases: slot.releases.load(Ordering::Relaxed),
            forced_idle: slot.forced_idle.load(Ordering::Relaxed),
        })
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .filter_map(|slot| self.lookup(slot.id()).ok())
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn test_registry(names: &[&str]) -> InterfaceRegistry {
    use crate::config::{EndpointConfig, InterfaceConfig};

    let mut config = EndpointConfig::new("test").with_listen("127.0.0.1:2000".parse().unwrap());
    for (i, name) in names.iter().enumerate() {
        config = config.with_interface(InterfaceConfig::handset(i as u32 + 1, *name));
    }
    InterfaceRegistry::new(config.validate().slots)
}
