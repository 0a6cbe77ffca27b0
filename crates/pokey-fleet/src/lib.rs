//! Fleet controller for networked Pokey I/O units.
//!
//! Devices are found by UDP broadcast, connected over TCP and polled for
//! their pin state on a short fixed interval. Pin states are run through a
//! per-device stuck pin filter and grid map, and the resulting grid and laser
//! gate events land in an [`EventLatch`] that operators pop or peek.
//!
//! ```text
//! discovery task --request--> Transport --replies--> dispatcher --> DeviceRegistry
//! poll task -----request--> Transport --replies--> dispatcher --> PinEngine --> EventLatch
//! ```
//!
//! The [`Transport`] trait is the only contact with the network;
//! [`TokioTransport`] implements it over tokio sockets.

pub mod config;
pub mod device;
pub mod error;
pub mod fleet;
pub mod grid;
pub mod latch;
pub mod net;
pub mod operator;
pub mod pins;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod transport;

pub use config::{DeviceConfig, FleetConfig, InitChannel};
pub use device::{Device, DeviceSnapshot};
pub use error::{FleetError, FleetResult};
pub use fleet::{Fleet, FleetStatus};
pub use grid::{GridCoord, GridMap, MAX_PINS};
pub use latch::EventLatch;
pub use net::{TokioTransport, TransportOptions};
pub use operator::{OperatorCommand, OperatorReply};
pub use pins::{PinEngine, PinState, StuckPin};
pub use registry::{ConnectionSummary, DeviceRegistry, DiscoveryOutcome, SharedDevice, StuckReport};
pub use scheduler::PeriodicTask;
pub use service::FleetService;
pub use transport::{
    ConnectionId, InboundReply, MemoryTransport, Transport, TransportError, BROADCAST_CONNECTION,
};
