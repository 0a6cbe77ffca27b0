//! The fleet: registry, latch and transport wired together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use pokey_metrics::{metric_defs, DeviceLabels};
use pokey_protocol::{Command, DeviceStateReply, DiscoveryReply, Message, RawReply};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::device::DeviceSnapshot;
use crate::error::{FleetError, FleetResult};
use crate::grid::{GridCoord, GridMap};
use crate::latch::EventLatch;
use crate::registry::{ConnectionSummary, DeviceRegistry, DiscoveryOutcome, StuckReport};
use crate::transport::{ConnectionId, InboundReply, Transport};

/// Aggregate fleet status for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetStatus {
    #[serde(flatten)]
    pub connections: ConnectionSummary,
    pub stuck: Vec<StuckReport>,
}

/// Everything the schedulers and the reply dispatcher operate on.
pub struct Fleet {
    config: FleetConfig,
    registry: DeviceRegistry,
    latch: Arc<EventLatch>,
    transport: Arc<dyn Transport>,
    /// Static channels by address.
    static_channels: Mutex<HashMap<String, ConnectionId>>,
}

impl Fleet {
    pub fn new(config: FleetConfig, transport: Arc<dyn Transport>, latch: Arc<EventLatch>) -> Self {
        Fleet {
            registry: DeviceRegistry::new(config.stuck_threshold_secs),
            config,
            latch,
            transport,
            static_channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn latch(&self) -> &Arc<EventLatch> {
        &self.latch
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Apply configured devices and open configured static channels.
    pub fn bootstrap(&self) -> FleetResult<()> {
        for device in &self.config.devices {
            if let Some(map) = &device.grid_map {
                self.set_grid_map(device.serial, map)?;
            }
            if let Some(ignored) = device.ignored {
                self.registry.set_ignored(device.serial, ignored);
            }
        }
        for channel in &self.config.init {
            self.init_device(&channel.name, &channel.address)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Route a decoded reply to its handler.
    pub fn on_reply(&self, reply: InboundReply) {
        match &reply.message {
            Message::Discovery(discovery) => self.handle_discovery_reply(discovery),
            Message::DeviceState(state) => self.handle_poll_reply(&reply.connection, state),
            Message::Reply(raw) => self.log_unknown_reply(&reply.connection, raw),
        }
    }

    fn handle_discovery_reply(&self, reply: &DiscoveryReply) {
        let reply = &self.on_device_port(reply);
        match self.registry.handle_discovery(reply, self.transport.as_ref(), &self.config) {
            Ok(DiscoveryOutcome::StaticAddress) => {
                metrics::counter!(metric_defs::DISCOVERY_REPLIES.name, &DeviceLabels::new(reply.serial).to_labels())
                    .increment(1);
                self.bind_static_channel(reply);
            }
            Ok(_) => {
                metrics::counter!(metric_defs::DISCOVERY_REPLIES.name, &DeviceLabels::new(reply.serial).to_labels())
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!(metric_defs::DISCOVERY_REJECTED.name).increment(1);
                warn!("discovery reply rejected: {}", e);
            }
        }
    }

    /// Broadcast replies carry the address only; devices listen on the
    /// configured port.
    fn on_device_port(&self, reply: &DiscoveryReply) -> DiscoveryReply {
        let mut reply = reply.clone();
        if let Ok(mut address) = reply.address.parse::<SocketAddr>() {
            address.set_port(self.config.device_port);
            reply.address = address.to_string();
        }
        reply
    }

    /// Attach a device on the static address to the static channel opened
    /// for that address, if there is one.
    fn bind_static_channel(&self, reply: &DiscoveryReply) {
        let Some(channel) = self.static_channels.lock().get(&reply.address).cloned() else {
            return;
        };
        if !self.transport.connection_ids().contains(&channel) {
            debug!(connection = %channel, "static channel is gone");
            self.static_channels.lock().remove(&reply.address);
            return;
        }
        let Some(device) = self.registry.find(reply.serial) else {
            return;
        };
        let bound = device.lock().connection.as_ref() == Some(&channel);
        if !bound {
            info!(serial = reply.serial, connection = %channel, "pokey bound to static channel");
            self.registry.bind_connection(&device, Some(channel));
        }
    }

    fn handle_poll_reply(&self, connection: &ConnectionId, reply: &DeviceStateReply) {
        let started = Instant::now();
        let Some(device) = self.registry.find_by_connection(connection) else {
            debug!(connection = %connection, "device state from unknown connection");
            return;
        };

        let (serial, coordinate, stuck) = {
            let mut device = device.lock();
            device.last_seen = Some(Utc::now());
            let coordinate = device.pins.update_pins(&reply.pins, started);
            (device.serial(), coordinate, device.pins.stuck_pins().len())
        };

        let labels = DeviceLabels::new(serial).to_labels();
        metrics::counter!(metric_defs::POLL_REPLIES.name, &labels).increment(1);
        metrics::gauge!(metric_defs::STUCK_PINS.name, &labels).set(stuck as f64);
        if !reply.checksum_valid {
            metrics::counter!(metric_defs::CHECKSUM_FAILURES.name, &labels).increment(1);
        }

        match coordinate {
            GridCoord::Invalid => {}
            GridCoord::LaserGate => {
                metrics::counter!(metric_defs::LASER_GATE_EVENTS.name, &labels).increment(1);
                debug!(serial, "laser gate");
                self.latch.push_coordinate(coordinate);
            }
            GridCoord::Cell { .. } => {
                metrics::counter!(metric_defs::GRID_EVENTS.name, &labels).increment(1);
                debug!(serial, %coordinate, "grid event");
                self.latch.push_coordinate(coordinate);
            }
        }

        metrics::histogram!(metric_defs::POLL_HANDLE_TIME.name)
            .record(started.elapsed().as_micros() as f64);
    }

    fn log_unknown_reply(&self, connection: &ConnectionId, raw: &RawReply) {
        metrics::counter!(metric_defs::UNKNOWN_REPLIES.name).increment(1);
        info!(
            connection = %connection,
            command = %raw.command,
            request_id = raw.request_id,
            checksum_valid = raw.checksum_valid,
            "unhandled reply: {}",
            raw.hex_dump()
        );
    }

    // ------------------------------------------------------------------
    // Scheduled work
    // ------------------------------------------------------------------

    /// Broadcast one discovery request and refresh fleet gauges.
    pub fn discovery_cycle(&self) {
        match Command::Discover.encode() {
            Ok(request) => match self.transport.broadcast(&request) {
                Ok(()) => metrics::counter!(metric_defs::DISCOVERY_BROADCASTS.name).increment(1),
                Err(e) => warn!("discovery broadcast failed: {}", e),
            },
            Err(e) => warn!("cannot encode discovery request: {}", e),
        }

        let summary = self.registry.connection_summary(self.transport.as_ref());
        metrics::gauge!(metric_defs::FLEET_DEVICES.name).set(summary.total as f64);
        metrics::gauge!(metric_defs::FLEET_CONNECTED.name).set(summary.connected as f64);
    }

    /// Send one device state request to every connected, non-ignored device.
    /// Returns the number of requests sent.
    pub fn poll_cycle(&self) -> usize {
        let mut sent = 0;
        for device in self.registry.list() {
            let (serial, connection) = {
                let device = device.lock();
                match (&device.connection, device.ignored) {
                    (Some(connection), false) => (device.serial(), connection.clone()),
                    _ => continue,
                }
            };
            if !self.transport.is_connected(&connection) {
                continue;
            }

            let request = match Command::GetDeviceState.encode() {
                Ok(request) => request,
                Err(e) => {
                    warn!("cannot encode poll request: {}", e);
                    return sent;
                }
            };
            match self.transport.send(&connection, &request) {
                Ok(()) => {
                    sent += 1;
                    metrics::counter!(metric_defs::POLL_REQUESTS_SENT.name, &DeviceLabels::new(serial).to_labels())
                        .increment(1);
                }
                Err(e) => debug!(serial, connection = %connection, "poll not sent: {}", e),
            }
        }
        sent
    }

    // ------------------------------------------------------------------
    // Operator operations
    // ------------------------------------------------------------------

    /// Replace a device's grid map. The map is parsed in full before it is
    /// applied. Returns the number of mapped pins.
    pub fn set_grid_map(&self, serial: u16, text: &str) -> FleetResult<usize> {
        let map = GridMap::parse(text)?;
        let count = map.len();
        let device = self.registry.find_or_create(serial);
        device.lock().pins.set_grid_map(map);
        info!(serial, pins = count, "grid map set");
        Ok(count)
    }

    /// Set a device's ignored flag. Returns the previous value.
    pub fn set_ignored(&self, serial: u16, ignored: bool) -> bool {
        let previous = self.registry.set_ignored(serial, ignored);
        info!(serial, ignored, previous, "ignore flag set");
        previous
    }

    /// Open a static channel named `name` to `address` and ask the device
    /// for its meta data.
    pub fn init_device(&self, name: &str, address: &str) -> FleetResult<ConnectionId> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(FleetError::InvalidAddress(address.to_string()));
        }
        let connection = ConnectionId::new(name);
        self.transport.create_connection(&connection, address)?;
        self.static_channels
            .lock()
            .insert(address.to_string(), connection.clone());

        if let Some(device) = self.registry.find_by_address(address) {
            let unbound = device.lock().connection.is_none();
            if unbound {
                self.registry.bind_connection(&device, Some(connection.clone()));
            }
        }

        let request = Command::GetDeviceMeta.encode()?;
        self.transport.send(&connection, &request)?;
        info!(connection = %connection, address, "added static channel");
        Ok(connection)
    }

    /// Feed `count` made-up discovery replies through discovery handling.
    pub fn inject_fake_discoveries<R: Rng>(&self, count: usize, rng: &mut R) -> usize {
        let mut accepted = 0;
        for _ in 0..count {
            let reply = DiscoveryReply {
                user_id: rng.gen(),
                version: "33.52".to_string(),
                serial: rng.gen_range(1..u16::MAX),
                dhcp_enabled: rng.gen_bool(0.5),
                address: format!(
                    "10.{}.{}.{}:{}",
                    rng.gen_range(1..255u8),
                    rng.gen_range(0..255u8),
                    rng.gen_range(1..255u8),
                    self.config.device_port
                ),
                host_address: "10.0.0.1".to_string(),
            };
            if self
                .registry
                .handle_discovery(&reply, self.transport.as_ref(), &self.config)
                .is_ok()
            {
                accepted += 1;
            }
        }
        info!(count, accepted, "injected fake discoveries");
        accepted
    }

    /// Reportable state of every device.
    pub fn device_snapshots(&self) -> Vec<DeviceSnapshot> {
        let now = Utc::now();
        let stale_after = self.config.stale_after();
        self.registry
            .list()
            .into_iter()
            .map(|device| {
                let device = device.lock();
                let connected = device
                    .connection
                    .as_ref()
                    .is_some_and(|c| self.transport.is_connected(c));
                device.snapshot(connected, now, stale_after)
            })
            .collect()
    }

    pub fn status(&self) -> FleetStatus {
        FleetStatus {
            connections: self.registry.connection_summary(self.transport.as_ref()),
            stuck: self.registry.stuck_report(),
        }
    }
}
