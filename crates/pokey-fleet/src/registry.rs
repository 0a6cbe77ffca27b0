//! The set of known devices, keyed by serial number.
//!
//! The registry lock covers lookups and inserts only. Each device sits behind
//! its own lock, so a poll reply for one device never waits on another, and
//! no lock is held while the transport is called.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use pokey_metrics::{metric_defs, DeviceLabels};
use pokey_protocol::DiscoveryReply;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::device::Device;
use crate::error::{FleetError, FleetResult};
use crate::pins::StuckPin;
use crate::transport::{ConnectionId, Transport};

/// A device shared between the registry and its users.
pub type SharedDevice = Arc<Mutex<Device>>;

/// What a discovery reply did to the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Known device, same address, already connected.
    Unchanged,
    /// A connection was opened. `replaced` is the connection it superseded.
    Connected {
        connection: ConnectionId,
        replaced: Option<ConnectionId>,
    },
    /// The device answers on the static address and is reached through the
    /// static channel instead.
    StaticAddress,
    /// The device is ignored.
    Ignored,
}

/// Connected devices against non-ignored devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub connected: usize,
    pub total: usize,
}

/// Stuck pins of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckReport {
    pub serial: u16,
    pub pins: Vec<StuckPin>,
}

/// All known devices.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u16, SharedDevice>>,
    /// Which device each bound connection belongs to.
    connections: Mutex<HashMap<ConnectionId, u16>>,
    stuck_threshold: f64,
}

impl DeviceRegistry {
    pub fn new(stuck_threshold: f64) -> Self {
        DeviceRegistry {
            devices: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            stuck_threshold,
        }
    }

    pub fn find(&self, serial: u16) -> Option<SharedDevice> {
        self.devices.lock().get(&serial).cloned()
    }

    /// Find the device reached through `connection`.
    pub fn find_by_connection(&self, connection: &ConnectionId) -> Option<SharedDevice> {
        let serial = *self.connections.lock().get(connection)?;
        self.find(serial)
    }

    /// Point a device at `connection`, or at nothing, keeping the connection
    /// index in step. Returns the connection the device used before.
    pub fn bind_connection(
        &self,
        device: &SharedDevice,
        connection: Option<ConnectionId>,
    ) -> Option<ConnectionId> {
        let mut device = device.lock();
        let serial = device.serial();
        let previous = std::mem::replace(&mut device.connection, connection.clone());

        let mut index = self.connections.lock();
        if let Some(old) = &previous {
            if index.get(old) == Some(&serial) {
                index.remove(old);
            }
        }
        if let Some(connection) = connection {
            index.insert(connection, serial);
        }
        previous
    }

    pub fn find_by_address(&self, address: &str) -> Option<SharedDevice> {
        self.list()
            .into_iter()
            .find(|device| device.lock().address == address)
    }

    /// Find a device, creating it if absent. Repeated calls return the same
    /// instance.
    pub fn find_or_create(&self, serial: u16) -> SharedDevice {
        self.devices
            .lock()
            .entry(serial)
            .or_insert_with(|| Arc::new(Mutex::new(Device::new(serial, self.stuck_threshold))))
            .clone()
    }

    /// Snapshot of every device handle, ordered by serial.
    pub fn list(&self) -> Vec<SharedDevice> {
        let mut entries: Vec<(u16, SharedDevice)> = self
            .devices
            .lock()
            .iter()
            .map(|(serial, device)| (*serial, device.clone()))
            .collect();
        entries.sort_by_key(|(serial, _)| *serial);
        entries.into_iter().map(|(_, device)| device).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// Set the ignored flag, creating the device if absent. Returns the
    /// previous value.
    pub fn set_ignored(&self, serial: u16, ignored: bool) -> bool {
        let device = self.find_or_create(serial);
        let mut device = device.lock();
        std::mem::replace(&mut device.ignored, ignored)
    }

    /// Reconcile a discovery reply with the registry and open a connection
    /// when the device moved or has none.
    pub fn handle_discovery(
        &self,
        reply: &DiscoveryReply,
        transport: &dyn Transport,
        config: &FleetConfig,
    ) -> FleetResult<DiscoveryOutcome> {
        if reply.version.is_empty() {
            return Err(FleetError::InvalidDiscovery(format!(
                "pokey {} reported no version",
                reply.serial
            )));
        }
        if reply.address.parse::<SocketAddr>().is_err() {
            return Err(FleetError::InvalidDiscovery(format!(
                "pokey {} reported address '{}'",
                reply.serial, reply.address
            )));
        }

        let device = self.find_or_create(reply.serial);
        let (changes, moved, needs_connection, ignored, summary) = {
            let mut device = device.lock();
            let mut changes = Vec::new();
            if device.protocol_version != reply.version {
                device.protocol_version = reply.version.clone();
                changes.push("version");
            }
            if device.dhcp_enabled != reply.dhcp_enabled {
                device.dhcp_enabled = reply.dhcp_enabled;
                changes.push("dhcp");
            }
            let moved = device.address != reply.address;
            if moved {
                device.address = reply.address.clone();
                changes.push("address");
            }
            device.last_seen = Some(Utc::now());
            let needs_connection = moved || device.connection.is_none();
            (changes, moved, needs_connection, device.ignored, device.to_string())
        };

        if !changes.is_empty() {
            info!(serial = reply.serial, changed = ?changes, host = %reply.host_address, "{}", summary);
        }
        if !needs_connection {
            return Ok(DiscoveryOutcome::Unchanged);
        }
        if reply.address == config.static_address {
            info!(
                serial = reply.serial,
                address = %reply.address,
                "pokey is on the static address, not creating a connection"
            );
            if moved {
                self.retire_connection(&device, transport, config);
            }
            return Ok(DiscoveryOutcome::StaticAddress);
        }
        if ignored {
            if moved {
                self.retire_connection(&device, transport, config);
            }
            return Ok(DiscoveryOutcome::Ignored);
        }

        let connection = self.allocate_connection_id(reply.serial, transport);
        if let Err(e) = transport.create_connection(&connection, &reply.address) {
            // Leave the device unbound so the next discovery retries.
            self.retire_connection(&device, transport, config);
            return Err(e.into());
        }
        let previous = self.bind_connection(&device, Some(connection.clone()));

        let labels = DeviceLabels::new(reply.serial).to_labels();
        metrics::counter!(metric_defs::CONNECTIONS_CREATED.name, &labels).increment(1);
        info!(serial = reply.serial, connection = %connection, address = %reply.address, "created pokey connection");

        if let Some(old) = &previous {
            metrics::counter!(metric_defs::CONNECTIONS_REPLACED.name, &labels).increment(1);
            close_stale(reply.serial, old, transport, config);
        }

        Ok(DiscoveryOutcome::Connected {
            connection,
            replaced: previous,
        })
    }

    /// Unbind a device from its connection and close it if configured.
    fn retire_connection(&self, device: &SharedDevice, transport: &dyn Transport, config: &FleetConfig) {
        let serial = device.lock().serial();
        if let Some(old) = self.bind_connection(device, None) {
            info!(serial, connection = %old, "pokey left its connection's address");
            close_stale(serial, &old, transport, config);
        }
    }

    /// Connection id for a device: `pokey<serial>`, suffixed when taken.
    fn allocate_connection_id(&self, serial: u16, transport: &dyn Transport) -> ConnectionId {
        let existing = transport.connection_ids();
        let base = format!("pokey{}", serial);
        let mut candidate = ConnectionId::new(base.clone());
        let mut suffix = 1;
        while existing.contains(&candidate) {
            candidate = ConnectionId::new(format!("{}_{}", base, suffix));
            suffix += 1;
        }
        candidate
    }

    /// Connected devices against non-ignored devices.
    pub fn connection_summary(&self, transport: &dyn Transport) -> ConnectionSummary {
        let mut summary = ConnectionSummary {
            connected: 0,
            total: 0,
        };
        for device in self.list() {
            let connection = {
                let device = device.lock();
                if device.ignored {
                    continue;
                }
                device.connection.clone()
            };
            summary.total += 1;
            if connection.is_some_and(|c| transport.is_connected(&c)) {
                summary.connected += 1;
            }
        }
        summary
    }

    /// Devices with at least one stuck pin.
    pub fn stuck_report(&self) -> Vec<StuckReport> {
        self.list()
            .into_iter()
            .filter_map(|device| {
                let device = device.lock();
                let pins = device.pins.stuck_pins();
                (!pins.is_empty()).then(|| StuckReport {
                    serial: device.serial(),
                    pins,
                })
            })
            .collect()
    }
}

fn close_stale(serial: u16, old: &ConnectionId, transport: &dyn Transport, config: &FleetConfig) {
    if !config.close_replaced_connections {
        return;
    }
    match transport.close_connection(old) {
        Ok(()) => debug!(serial, connection = %old, "closed replaced connection"),
        Err(e) => warn!(serial, connection = %old, "failed to close replaced connection: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    fn reply(serial: u16, address: &str) -> DiscoveryReply {
        DiscoveryReply {
            user_id: 0x31,
            version: "33.52".to_string(),
            serial,
            dhcp_enabled: false,
            address: address.to_string(),
            host_address: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn test_find_or_create_identity() {
        let registry = DeviceRegistry::new(2.0);
        assert!(registry.find(99).is_none());

        let a = registry.find_or_create(42);
        let b = registry.find_or_create(42);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.find(42).unwrap(), &a));
    }

    #[test]
    fn test_set_ignored_returns_previous() {
        let registry = DeviceRegistry::new(2.0);
        assert!(!registry.set_ignored(7, true));
        assert!(registry.set_ignored(7, false));
        assert!(!registry.find(7).unwrap().lock().ignored);
    }

    #[test]
    fn test_discovery_creates_connection() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        let outcome = registry
            .handle_discovery(&reply(22961, "10.0.0.5:20055"), &transport, &config)
            .unwrap();
        let connection = ConnectionId::new("pokey22961");
        assert_eq!(
            outcome,
            DiscoveryOutcome::Connected {
                connection: connection.clone(),
                replaced: None
            }
        );
        assert_eq!(transport.address_of(&connection).as_deref(), Some("10.0.0.5:20055"));
        assert!(Arc::ptr_eq(
            &registry.find_by_connection(&connection).unwrap(),
            &registry.find(22961).unwrap()
        ));

        // Same reply again: nothing to do.
        let outcome = registry
            .handle_discovery(&reply(22961, "10.0.0.5:20055"), &transport, &config)
            .unwrap();
        assert_eq!(outcome, DiscoveryOutcome::Unchanged);
    }

    #[test]
    fn test_address_change_replaces_connection() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        registry
            .handle_discovery(&reply(5, "10.0.0.5:20055"), &transport, &config)
            .unwrap();
        let outcome = registry
            .handle_discovery(&reply(5, "10.0.0.9:20055"), &transport, &config)
            .unwrap();

        assert_eq!(
            outcome,
            DiscoveryOutcome::Connected {
                connection: ConnectionId::new("pokey5_1"),
                replaced: Some(ConnectionId::new("pokey5")),
            }
        );
        assert_eq!(transport.closed(), vec![ConnectionId::new("pokey5")]);
        assert_eq!(transport.connection_ids(), vec![ConnectionId::new("pokey5_1")]);
        assert!(registry.find_by_address("10.0.0.9:20055").is_some());
        assert!(registry.find_by_address("10.0.0.5:20055").is_none());
    }

    #[test]
    fn test_replaced_connection_kept_when_configured() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig {
            close_replaced_connections: false,
            ..FleetConfig::default()
        };

        registry
            .handle_discovery(&reply(5, "10.0.0.5:20055"), &transport, &config)
            .unwrap();
        registry
            .handle_discovery(&reply(5, "10.0.0.9:20055"), &transport, &config)
            .unwrap();
        assert!(transport.closed().is_empty());
        assert_eq!(transport.connection_ids().len(), 2);
    }

    #[test]
    fn test_static_and_ignored_devices_get_no_connection() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        let outcome = registry
            .handle_discovery(&reply(1, "10.0.0.54:20055"), &transport, &config)
            .unwrap();
        assert_eq!(outcome, DiscoveryOutcome::StaticAddress);

        registry.set_ignored(2, true);
        let outcome = registry
            .handle_discovery(&reply(2, "10.0.0.6:20055"), &transport, &config)
            .unwrap();
        assert_eq!(outcome, DiscoveryOutcome::Ignored);
        assert_eq!(registry.find(2).unwrap().lock().address, "10.0.0.6:20055");

        assert!(transport.connection_ids().is_empty());
    }

    #[test]
    fn test_invalid_discovery_changes_nothing() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        let mut bad = reply(3, "not an address");
        assert!(registry.handle_discovery(&bad, &transport, &config).is_err());
        bad.address = "10.0.0.3:20055".to_string();
        bad.version.clear();
        assert!(registry.handle_discovery(&bad, &transport, &config).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connection_summary() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::disconnected();
        let config = FleetConfig::default();

        registry
            .handle_discovery(&reply(10, "10.0.0.10:20055"), &transport, &config)
            .unwrap();
        registry
            .handle_discovery(&reply(11, "10.0.0.11:20055"), &transport, &config)
            .unwrap();
        registry.set_ignored(12, true);

        transport.set_connected(&ConnectionId::new("pokey10"), true);
        assert_eq!(
            registry.connection_summary(&transport),
            ConnectionSummary {
                connected: 1,
                total: 2
            }
        );
    }

    #[test]
    fn test_bind_connection_updates_index() {
        let registry = DeviceRegistry::new(2.0);
        let device = registry.find_or_create(8);
        let first = ConnectionId::new("pokey8");
        let second = ConnectionId::new("pokey8_1");

        assert_eq!(registry.bind_connection(&device, Some(first.clone())), None);
        assert!(registry.find_by_connection(&first).is_some());

        assert_eq!(registry.bind_connection(&device, Some(second.clone())), Some(first.clone()));
        assert!(registry.find_by_connection(&first).is_none());
        assert!(Arc::ptr_eq(&registry.find_by_connection(&second).unwrap(), &device));

        assert_eq!(registry.bind_connection(&device, None), Some(second.clone()));
        assert!(registry.find_by_connection(&second).is_none());
        assert!(device.lock().connection.is_none());
    }

    #[test]
    fn test_move_while_ignored_drops_old_connection() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        registry
            .handle_discovery(&reply(5, "10.0.0.5:20055"), &transport, &config)
            .unwrap();
        registry.set_ignored(5, true);
        let outcome = registry
            .handle_discovery(&reply(5, "10.0.0.9:20055"), &transport, &config)
            .unwrap();

        assert_eq!(outcome, DiscoveryOutcome::Ignored);
        assert!(registry.find(5).unwrap().lock().connection.is_none());
        assert!(registry.find_by_connection(&ConnectionId::new("pokey5")).is_none());
        assert_eq!(transport.closed(), vec![ConnectionId::new("pokey5")]);
    }

    #[test]
    fn test_failed_connect_is_retried() {
        let registry = DeviceRegistry::new(2.0);
        let transport = MemoryTransport::new();
        let config = FleetConfig::default();

        transport.set_refuse_connections(true);
        assert!(registry
            .handle_discovery(&reply(4, "10.0.0.4:20055"), &transport, &config)
            .is_err());
        assert!(registry.find(4).unwrap().lock().connection.is_none());

        transport.set_refuse_connections(false);
        let outcome = registry
            .handle_discovery(&reply(4, "10.0.0.4:20055"), &transport, &config)
            .unwrap();
        assert!(matches!(outcome, DiscoveryOutcome::Connected { .. }));
    }
}
