//! Metric declarations for the Pokey fleet controller.
//!
//! Every metric the controller records is a [`Metric`] constant in
//! [`metric_defs`]. Recording goes through the `metrics` facade, so nothing
//! is collected unless a recorder is installed (see the `prometheus`
//! feature). Device-scoped metrics carry a single `serial` label built with
//! [`DeviceLabels`].
//!
//! ```rust,ignore
//! use pokey_metrics::{metric_defs, DeviceLabels};
//!
//! let labels = DeviceLabels::new(22961).to_labels();
//! metrics::counter!(metric_defs::POLL_REQUESTS_SENT.name, &labels).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Label key on device-scoped metrics.
pub const SERIAL_LABEL: &str = "serial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One metric the controller records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub kind: MetricKind,
    pub description: &'static str,
    pub unit: Unit,
    /// Recorded with a [`SERIAL_LABEL`] label.
    pub per_device: bool,
}

impl Metric {
    const fn new(kind: MetricKind, name: &'static str, description: &'static str) -> Self {
        Metric {
            name,
            kind,
            description,
            unit: Unit::Count,
            per_device: false,
        }
    }

    const fn per_device(mut self) -> Self {
        self.per_device = true;
        self
    }

    const fn in_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Register the description and unit with the installed recorder.
    pub fn describe(&self) {
        let (name, unit, description) = (self.name, self.unit, self.description);
        match self.kind {
            MetricKind::Counter => describe_counter!(name, unit, description),
            MetricKind::Gauge => describe_gauge!(name, unit, description),
            MetricKind::Histogram => describe_histogram!(name, unit, description),
        }
    }
}

const fn counter(name: &'static str, description: &'static str) -> Metric {
    Metric::new(MetricKind::Counter, name, description)
}

const fn gauge(name: &'static str, description: &'static str) -> Metric {
    Metric::new(MetricKind::Gauge, name, description)
}

const fn histogram(name: &'static str, description: &'static str) -> Metric {
    Metric::new(MetricKind::Histogram, name, description)
}

/// Every metric the fleet controller records.
pub mod metric_defs {
    use super::{counter, gauge, histogram, Metric, Unit};

    // Discovery

    pub const DISCOVERY_BROADCASTS: Metric =
        counter("pokey.discovery.broadcasts", "Discovery requests broadcast");
    pub const DISCOVERY_REPLIES: Metric =
        counter("pokey.discovery.replies", "Discovery replies accepted").per_device();
    pub const DISCOVERY_REJECTED: Metric =
        counter("pokey.discovery.rejected", "Discovery replies rejected as malformed");
    /// Broadcast frames from firmware with no known layout.
    pub const FRAMES_IGNORED: Metric =
        counter("pokey.frames.ignored", "Frames consumed without producing a message");

    // Connections

    pub const CONNECTIONS_CREATED: Metric =
        counter("pokey.connections.created", "Device connections created").per_device();
    pub const CONNECTIONS_REPLACED: Metric = counter(
        "pokey.connections.replaced",
        "Device connections replaced after an address change",
    )
    .per_device();

    // Polling

    pub const POLL_REQUESTS_SENT: Metric =
        counter("pokey.poll.requests_sent", "Device state requests sent").per_device();
    pub const POLL_REPLIES: Metric =
        counter("pokey.poll.replies", "Device state replies handled").per_device();
    pub const CHECKSUM_FAILURES: Metric = counter(
        "pokey.poll.checksum_failures",
        "Replies whose header checksum did not match",
    )
    .per_device();
    pub const UNKNOWN_REPLIES: Metric =
        counter("pokey.replies.unknown", "Replies with no dedicated handler");
    pub const POLL_HANDLE_TIME: Metric = histogram(
        "pokey.poll.handle_time_us",
        "Time taken to handle one device state reply",
    )
    .in_unit(Unit::Microseconds);

    // Events

    pub const GRID_EVENTS: Metric =
        counter("pokey.events.grid", "Grid coordinate events published").per_device();
    pub const LASER_GATE_EVENTS: Metric =
        counter("pokey.events.laser_gate", "Laser gate events published").per_device();
    pub const STUCK_PINS: Metric =
        gauge("pokey.pins.stuck", "Pins currently filtered as stuck").per_device();

    // Fleet

    pub const FLEET_DEVICES: Metric = gauge("pokey.fleet.devices", "Known devices");
    pub const FLEET_CONNECTED: Metric =
        gauge("pokey.fleet.connected", "Devices with a connected transport");

    pub const ALL: &[Metric] = &[
        DISCOVERY_BROADCASTS,
        DISCOVERY_REPLIES,
        DISCOVERY_REJECTED,
        FRAMES_IGNORED,
        CONNECTIONS_CREATED,
        CONNECTIONS_REPLACED,
        POLL_REQUESTS_SENT,
        POLL_REPLIES,
        CHECKSUM_FAILURES,
        UNKNOWN_REPLIES,
        POLL_HANDLE_TIME,
        GRID_EVENTS,
        LASER_GATE_EVENTS,
        STUCK_PINS,
        FLEET_DEVICES,
        FLEET_CONNECTED,
    ];
}

/// Labels identifying a device.
///
/// ```rust
/// use pokey_metrics::DeviceLabels;
///
/// assert_eq!(DeviceLabels::new(22961).to_labels(), [("serial", "22961".to_string())]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DeviceLabels {
    pub serial: u16,
}

impl DeviceLabels {
    pub fn new(serial: u16) -> Self {
        Self { serial }
    }

    /// Label array accepted by the `metrics` macros.
    pub fn to_labels(&self) -> [(&'static str, String); 1] {
        [(SERIAL_LABEL, self.serial.to_string())]
    }
}

/// Describe every metric. Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Serve Prometheus metrics on `addr`.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_labels() {
        assert_eq!(DeviceLabels::new(42).to_labels(), [("serial", "42".to_string())]);
        assert_eq!(DeviceLabels::new(u16::MAX).to_labels()[0].1, "65535");
    }

    #[test]
    fn test_metric_definitions() {
        use metric_defs::*;

        assert_eq!(POLL_REQUESTS_SENT.kind, MetricKind::Counter);
        assert!(POLL_REQUESTS_SENT.per_device);
        assert_eq!(STUCK_PINS.kind, MetricKind::Gauge);
        assert_eq!(POLL_HANDLE_TIME.kind, MetricKind::Histogram);
        assert_eq!(POLL_HANDLE_TIME.unit, Unit::Microseconds);
        assert_eq!(FLEET_DEVICES.unit, Unit::Count);
        assert!(!FLEET_DEVICES.per_device);
    }

    #[test]
    fn test_metric_names_unique_and_namespaced() {
        let mut names: Vec<&str> = metric_defs::ALL.iter().map(|m| m.name).collect();
        assert!(names.iter().all(|name| name.starts_with("pokey.")));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
