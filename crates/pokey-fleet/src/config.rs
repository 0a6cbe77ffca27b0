//! Fleet controller configuration.
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration:
//!
//! ```yaml
//! poll_interval_ms: 13
//! static_address: "10.0.0.54:20055"
//! devices:
//!   - serial: 22961
//!     grid_map: "0,0 1,0 2,0 lasergate"
//! init:
//!   - name: hello
//!     address: "10.0.0.54:20055"
//! ```

use std::path::Path;
use std::time::Duration;

use pokey_protocol::DEVICE_PORT;
use serde::{Deserialize, Serialize};

use crate::error::FleetResult;

/// Static configuration for one device, applied at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial number.
    pub serial: u16,
    /// Grid map text, see [`GridMap`](crate::GridMap).
    #[serde(default)]
    pub grid_map: Option<String>,
    /// Start with the device ignored.
    #[serde(default)]
    pub ignored: Option<bool>,
}

/// A pre-provisioned channel opened at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitChannel {
    /// Connection name.
    pub name: String,
    /// Device address as `host:port`.
    pub address: String,
}

/// Fleet controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Interval between discovery broadcasts.
    pub discovery_interval_ms: u64,
    /// Interval between poll cycles.
    pub poll_interval_ms: u64,
    /// Broadcast discovery requests at startup.
    pub discovery_enabled: bool,
    /// Poll devices at startup.
    pub poll_enabled: bool,
    /// Down time after which a pin counts as stuck.
    pub stuck_threshold_secs: f64,
    /// Age after which a peeked event reads as empty.
    pub peek_expiry_ms: u64,
    /// Age of the last reply after which a device is reported stale.
    pub stale_after_secs: u64,
    /// TCP port devices listen on.
    pub device_port: u16,
    /// Destination of discovery requests.
    pub broadcast_address: String,
    /// Local address of the broadcast socket.
    pub broadcast_bind: String,
    /// Address reserved for the static bootup channel.
    pub static_address: String,
    /// Delay before reconnecting a dropped device connection.
    pub reconnect_interval_ms: u64,
    /// Close a device's previous connection when its address changes.
    pub close_replaced_connections: bool,
    /// Per-device settings.
    pub devices: Vec<DeviceConfig>,
    /// Channels opened at startup.
    pub init: Vec<InitChannel>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            discovery_interval_ms: 2000,
            poll_interval_ms: 13,
            discovery_enabled: true,
            poll_enabled: true,
            stuck_threshold_secs: 2.0,
            peek_expiry_ms: 1000,
            stale_after_secs: 5,
            device_port: DEVICE_PORT,
            broadcast_address: format!("255.255.255.255:{}", DEVICE_PORT),
            broadcast_bind: "0.0.0.0:0".to_string(),
            static_address: format!("10.0.0.54:{}", DEVICE_PORT),
            reconnect_interval_ms: 1000,
            close_replaced_connections: true,
            devices: Vec::new(),
            init: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> FleetResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> FleetResult<Self> {
        if text.trim().is_empty() {
            return Ok(FleetConfig::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn peek_expiry(&self) -> Duration {
        Duration::from_millis(self.peek_expiry_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.discovery_interval(), Duration::from_millis(2000));
        assert_eq!(config.poll_interval(), Duration::from_millis(13));
        assert_eq!(config.peek_expiry(), Duration::from_millis(1000));
        assert_eq!(config.stuck_threshold_secs, 2.0);
        assert_eq!(config.static_address, "10.0.0.54:20055");
        assert_eq!(config.broadcast_address, "255.255.255.255:20055");
        assert!(config.close_replaced_connections);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(FleetConfig::from_yaml_str("").unwrap(), FleetConfig::default());
        assert_eq!(FleetConfig::from_yaml_str("{}").unwrap(), FleetConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let yaml = r#"
poll_interval_ms: 20
discovery_enabled: false
devices:
  - serial: 22961
    grid_map: "0,0 1,0 lasergate"
  - serial: 7
    ignored: true
init:
  - name: hello
    address: "10.0.0.54:20055"
"#;
        let config = FleetConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.poll_interval_ms, 20);
        assert!(!config.discovery_enabled);
        assert_eq!(config.discovery_interval_ms, 2000);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].grid_map.as_deref(), Some("0,0 1,0 lasergate"));
        assert_eq!(config.devices[1].ignored, Some(true));
        assert_eq!(config.init[0].name, "hello");
    }

    #[test]
    fn test_invalid_document() {
        assert!(FleetConfig::from_yaml_str("poll_interval_ms: soon").is_err());
    }
}
