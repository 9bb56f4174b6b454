//! Endpoint configuration
//!
//! Configuration is a TOML document with one `[endpoint]` table and one
//! `[[interface]]` table per device slot.
//!
//! ## Example
//!
//! ```toml
//! [endpoint]
//! name = "branch-office"
//! listen = "0.0.0.0:2000"
//! shutdown_grace_ms = 2000
//!
//! [logging]
//! level = "debug"
//! spans = true
//!
//! [[interface]]
//! id = 1
//! name = "lobby"
//! dialect = "handset"
//! keepalive_secs = 30
//! context = "lobby"
//!
//! [[interface]]
//! id = 2
//! name = "desk"
//! dialect = "softphone"
//! companion = "127.0.0.1:7400"
//! ```
//!
//! Loading never fails because of a single bad slot. [`EndpointConfig::validate`]
//! returns the usable slots together with one `ConfigInvalid` error per slot
//! that was skipped.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use rvoip_line_codec::Capabilities;

use crate::dialect::DialectKind;
use crate::errors::{EndpointError, Result};
use crate::logging::LoggingConfig;
use crate::media::CodecDescriptor;
use crate::registry::SlotId;

/// Name given to slots configured without one
pub const UNNAMED_SLOT: &str = "N/A";

/// Complete endpoint configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub endpoint: EndpointSettings,

    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Profile name used in logs and caller profiles
    pub name: String,

    /// Shared listener for handset devices
    pub listen: Option<SocketAddr>,

    /// Upper bound for slot identifiers
    pub max_interfaces: u32,

    pub shutdown_grace_ms: u64,
    pub restart_delay_ms: u64,
    pub max_restarts: u32,

    /// Codec assumed when a device negotiates media without naming one
    pub default_codec: CodecDescriptor,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            name: "rvoip-endpoint".to_string(),
            listen: None,
            max_interfaces: 64,
            shutdown_grace_ms: 2000,
            restart_delay_ms: 1000,
            max_restarts: 3,
            default_codec: CodecDescriptor::default(),
        }
    }
}

impl EndpointSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// Capability flags as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    pub audio: bool,
    pub video: bool,
    pub dtmf_out_of_band: bool,
    pub hold: bool,
    pub linear_audio: bool,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
            dtmf_out_of_band: true,
            hold: true,
            linear_audio: true,
        }
    }
}

impl From<CapabilityConfig> for Capabilities {
    fn from(c: CapabilityConfig) -> Self {
        Capabilities {
            audio: c.audio,
            video: c.video,
            dtmf_out_of_band: c.dtmf_out_of_band,
            hold: c.hold,
            linear_audio: c.linear_audio,
        }
    }
}

/// One `[[interface]]` table, as written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub id: SlotId,
    pub name: Option<String>,
    pub dialect: DialectKind,

    /// Address of the companion process (softphone dialect)
    pub companion: Option<SocketAddr>,

    pub device_name: Option<String>,
    pub capabilities: CapabilityConfig,

    pub keepalive_secs: u32,
    /// Missed keepalive intervals tolerated before the slot expires
    pub expiry_factor: u32,

    pub registration_timeout_ms: u64,
    pub registration_retry_ms: u64,
    pub max_registration_attempts: u32,

    /// Local address for media sockets
    pub media_bind: IpAddr,

    pub dialplan: String,
    pub context: String,
    pub destination: String,
    pub caller_id_name: Option<String>,
    pub caller_id_number: Option<String>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            id: 0,
            name: None,
            dialect: DialectKind::Handset,
            companion: None,
            device_name: None,
            capabilities: CapabilityConfig::default(),
            keepalive_secs: 30,
            expiry_factor: 2,
            registration_timeout_ms: 5000,
            registration_retry_ms: 1000,
            max_registration_attempts: 10,
            media_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dialplan: "XML".to_string(),
            context: "default".to_string(),
            destination: "5000".to_string(),
            caller_id_name: None,
            caller_id_number: None,
        }
    }
}

impl InterfaceConfig {
    /// Handset slot reached through the shared listener
    pub fn handset(id: SlotId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Softphone slot dialled at `companion`
    pub fn softphone(id: SlotId, name: impl Into<String>, companion: SocketAddr) -> Self {
        Self {
            id,
            name: Some(name.into()),
            dialect: DialectKind::Softphone,
            companion: Some(companion),
            ..Default::default()
        }
    }

    pub fn with_keepalive(mut self, secs: u32, expiry_factor: u32) -> Self {
        self.keepalive_secs = secs;
        self.expiry_factor = expiry_factor;
        self
    }

    pub fn with_registration(mut self, timeout_ms: u64, retry_ms: u64, attempts: u32) -> Self {
        self.registration_timeout_ms = timeout_ms;
        self.registration_retry_ms = retry_ms;
        self.max_registration_attempts = attempts;
        self
    }

    pub fn with_media_bind(mut self, addr: IpAddr) -> Self {
        self.media_bind = addr;
        self
    }

    pub fn with_caller_id(mut self, name: impl Into<String>, number: impl Into<String>) -> Self {
        self.caller_id_name = Some(name.into());
        self.caller_id_number = Some(number.into());
        self
    }
}

/// Dial-plan routing hints carried into caller profiles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHints {
    pub dialplan: String,
    pub context: String,
    /// Destination used for inbound calls
    pub destination: String,
    pub caller_id_name: String,
    pub caller_id_number: String,
}

/// A validated slot definition
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub id: SlotId,
    pub name: String,
    pub dialect: DialectKind,
    pub companion: Option<SocketAddr>,
    pub device_name: String,
    pub capabilities: Capabilities,
    pub keepalive_secs: u32,
    /// Silence longer than this expires the slot
    pub expiry: Duration,
    pub registration_timeout: Duration,
    pub registration_retry: Duration,
    pub max_registration_attempts: u32,
    pub media_bind: IpAddr,
    pub routing: RoutingHints,
}

/// Slots that passed validation, plus the reasons the others were skipped
#[derive(Debug, Default)]
pub struct ValidatedConfig {
    pub slots: Vec<SlotConfig>,
    pub rejected: Vec<EndpointError>,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            endpoint: EndpointSettings {
                name: name.into(),
                ..Default::default()
            },
            interfaces: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.endpoint.listen = Some(addr);
        self
    }

    pub fn with_interface(mut self, interface: InterfaceConfig) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.endpoint.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_restarts(mut self, max_restarts: u32, delay: Duration) -> Self {
        self.endpoint.max_restarts = max_restarts;
        self.endpoint.restart_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| EndpointError::config("<document>", e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| EndpointError::config(path.display().to_string(), e.to_string()))
    }

    /// Check every slot, keeping the valid ones in configured order
    pub fn validate(&self) -> ValidatedConfig {
        let mut validated = ValidatedConfig::default();
        let mut ids = HashSet::new();
        let mut names = HashSet::new();

        for interface in &self.interfaces {
            match self.validate_interface(interface, &ids, &names) {
                Ok(slot) => {
                    ids.insert(slot.id);
                    names.insert(slot.name.clone());
                    validated.slots.push(slot);
                }
                Err(e) => validated.rejected.push(e),
            }
        }

        validated
    }

    fn validate_interface(
        &self,
        interface: &InterfaceConfig,
        ids: &HashSet<SlotId>,
        names: &HashSet<String>,
    ) -> Result<SlotConfig> {
        let label = interface
            .name
            .clone()
            .unwrap_or_else(|| format!("#{}", interface.id));

        if interface.id == 0 || interface.id > self.endpoint.max_interfaces {
            return Err(EndpointError::config(
                label,
                format!("id must be between 1 and {}", self.endpoint.max_interfaces),
            ));
        }
        if ids.contains(&interface.id) {
            return Err(EndpointError::config(label, format!("duplicate id {}", interface.id)));
        }

        let name = match interface.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                warn!("Interface {} has no name, using {}", interface.id, UNNAMED_SLOT);
                UNNAMED_SLOT.to_string()
            }
        };
        if names.contains(&name) {
            return Err(EndpointError::config(label, format!("duplicate name {}", name)));
        }

        match interface.dialect {
            DialectKind::Softphone if interface.companion.is_none() => {
                return Err(EndpointError::config(label, "softphone interface requires a companion address"));
            }
            DialectKind::Handset if self.endpoint.listen.is_none() => {
                return Err(EndpointError::config(label, "handset interface requires [endpoint] listen"));
            }
            _ => {}
        }

        if interface.keepalive_secs == 0 || interface.expiry_factor == 0 {
            return Err(EndpointError::config(label, "keepalive_secs and expiry_factor must be positive"));
        }
        if interface.max_registration_attempts == 0 {
            return Err(EndpointError::config(label, "max_registration_attempts must be positive"));
        }

        let expiry = Duration::from_secs(u64::from(interface.keepalive_secs) * u64::from(interface.expiry_factor));

        Ok(SlotConfig {
            id: interface.id,
            device_name: interface.device_name.clone().unwrap_or_else(|| name.clone()),
            dialect: interface.dialect,
            companion: interface.companion,
            capabilities: interface.capabilities.into(),
            keepalive_secs: interface.keepalive_secs,
            expiry,
            registration_timeout: Duration::from_millis(interface.registration_timeout_ms),
            registration_retry: Duration::from_millis(interface.registration_retry_ms),
            max_registration_attempts: interface.max_registration_attempts,
            media_bind: interface.media_bind,
            routing: RoutingHints {
                dialplan: interface.dialplan.clone(),
                context: interface.context.clone(),
                destination: interface.destination.clone(),
                caller_id_name: interface.caller_id_name.clone().unwrap_or_else(|| name.clone()),
                caller_id_number: interface
                    .caller_id_number
                    .clone()
                    .unwrap_or_else(|| "0000000000".to_string()),
            },
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen() -> SocketAddr {
        "127.0.0.1:2000".parse().unwrap()
    }

    #[test]
    fn test_parse_toml_document() {
        let config = EndpointConfig::from_toml_str(
            r#"
            [endpoint]
            name = "branch"
            listen = "127.0.0.1:2000"

            [[interface]]
            id = 1
            name = "lobby"
            keepalive_secs = 10
            context = "lobby"

            [[interface]]
            id = 2
            name = "desk"
            dialect = "softphone"
            companion = "127.0.0.1:7400"
            capabilities = { video = true }

            [logging]
            level = "debug"
            file_info = true
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.name, "branch");
        assert_eq!(config.endpoint.max_interfaces, 64);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.file_info && !config.logging.json);
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[1].dialect, DialectKind::Softphone);
        assert!(config.interfaces[1].capabilities.video);
        assert!(config.interfaces[1].capabilities.audio);

        let validated = config.validate();
        assert!(validated.rejected.is_empty());
        assert_eq!(validated.slots[0].expiry, Duration::from_secs(20));
        assert_eq!(validated.slots[0].routing.context, "lobby");
        assert_eq!(validated.slots[0].routing.dialplan, "XML");
        assert_eq!(validated.slots[1].routing.context, "default");
    }

    #[test]
    fn test_bad_slots_are_skipped() {
        let config = EndpointConfig::new("test")
            .with_listen(listen())
            .with_interface(InterfaceConfig::handset(1, "a"))
            .with_interface(InterfaceConfig::handset(0, "zero"))
            .with_interface(InterfaceConfig::handset(65, "too-big"))
            .with_interface(InterfaceConfig::handset(1, "dup-id"))
            .with_interface(InterfaceConfig::handset(2, "a"))
            .with_interface(InterfaceConfig {
                id: 3,
                name: Some("soft".into()),
                dialect: DialectKind::Softphone,
                ..Default::default()
            })
            .with_interface(InterfaceConfig::handset(4, "b"));

        let validated = config.validate();
        let names: Vec<_> = validated.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(validated.rejected.len(), 5);
        assert!(validated
            .rejected
            .iter()
            .all(|e| matches!(e, EndpointError::ConfigInvalid { .. })));
    }

    #[test]
    fn test_handset_requires_listener() {
        let validated = EndpointConfig::new("test")
            .with_interface(InterfaceConfig::handset(1, "a"))
            .validate();
        assert!(validated.slots.is_empty());
        assert_eq!(validated.rejected.len(), 1);
    }

    #[test]
    fn test_missing_name_defaults() {
        let validated = EndpointConfig::new("test")
            .with_listen(listen())
            .with_interface(InterfaceConfig {
                id: 7,
                ..Default::default()
            })
            .validate();
        assert_eq!(validated.slots[0].name, UNNAMED_SLOT);
        assert_eq!(validated.slots[0].routing.caller_id_name, UNNAMED_SLOT);
    }
}
