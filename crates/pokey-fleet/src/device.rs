//! One physical Pokey unit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pins::{PinEngine, StuckPin};
use crate::transport::ConnectionId;

/// A device known to the fleet, identified by serial number.
#[derive(Debug, Clone)]
pub struct Device {
    serial: u16,
    /// Address as `host:port`. Empty until the first discovery reply.
    pub address: String,
    /// Connection used to reach the device.
    pub connection: Option<ConnectionId>,
    /// Firmware version string from discovery.
    pub protocol_version: String,
    pub dhcp_enabled: bool,
    /// Operator flag. Ignored devices get no connection and no polls.
    pub ignored: bool,
    /// Time of the last reply from the device.
    pub last_seen: Option<DateTime<Utc>>,
    /// Pin states and grid map.
    pub pins: PinEngine,
}

impl Device {
    pub fn new(serial: u16, stuck_threshold: f64) -> Self {
        Device {
            serial,
            address: String::new(),
            connection: None,
            protocol_version: String::new(),
            dhcp_enabled: false,
            ignored: false,
            last_seen: None,
            pins: PinEngine::new(stuck_threshold),
        }
    }

    pub fn serial(&self) -> u16 {
        self.serial
    }

    /// Whether nothing has been heard from the device for `stale_after`.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.last_seen {
            Some(seen) => now - seen > stale_after,
            None => true,
        }
    }

    /// Copy out the reportable state.
    pub fn snapshot(
        &self,
        connected: bool,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> DeviceSnapshot {
        DeviceSnapshot {
            serial: self.serial,
            address: self.address.clone(),
            connection: self.connection.clone(),
            protocol_version: self.protocol_version.clone(),
            dhcp_enabled: self.dhcp_enabled,
            ignored: self.ignored,
            connected,
            last_seen: self.last_seen,
            stale: self.is_stale(now, stale_after),
            grid_map: self.pins.grid_map().to_string(),
            stuck_pins: self.pins.stuck_pins(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pokey {} address={} version={} dhcp={} ignored={} connection={}",
            self.serial,
            self.address,
            self.protocol_version,
            self.dhcp_enabled,
            self.ignored,
            self.connection.as_ref().map(|c| c.as_str()).unwrap_or("none"),
        )
    }
}

/// Point-in-time copy of a device for reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub serial: u16,
    pub address: String,
    pub connection: Option<ConnectionId>,
    pub protocol_version: String,
    pub dhcp_enabled: bool,
    pub ignored: bool,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub stale: bool,
    pub grid_map: String,
    pub stuck_pins: Vec<StuckPin>,
}

impl fmt::Display for DeviceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.serial,
            if self.address.is_empty() { "-" } else { self.address.as_str() },
            if self.connected { "connected" } else { "disconnected" },
        )?;
        if self.ignored {
            f.write_str(" ignored")?;
        }
        match self.last_seen {
            Some(seen) if self.stale => write!(f, " stale since {}", seen.format("%H:%M:%S"))?,
            Some(_) => {}
            None => f.write_str(" never seen")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        let mut device = Device::new(42, 2.0);
        let now = Utc::now();
        let window = chrono::Duration::seconds(5);
        assert!(device.is_stale(now, window));

        device.last_seen = Some(now - chrono::Duration::seconds(2));
        assert!(!device.is_stale(now, window));

        device.last_seen = Some(now - chrono::Duration::seconds(6));
        assert!(device.is_stale(now, window));
    }

    #[test]
    fn test_snapshot_and_display() {
        let mut device = Device::new(22961, 2.0);
        device.address = "10.0.0.5:20055".to_string();
        device.connection = Some(ConnectionId::new("pokey22961"));
        device.last_seen = Some(Utc::now());

        let snapshot = device.snapshot(true, Utc::now(), chrono::Duration::seconds(5));
        assert_eq!(snapshot.serial, 22961);
        assert!(!snapshot.stale);
        assert_eq!(snapshot.to_string(), "22961 10.0.0.5:20055 connected");
        assert!(device.to_string().contains("connection=pokey22961"));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["connection"], "pokey22961");
    }
}
