//! Error types for the fleet controller.

use pokey_protocol::ProtocolError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by fleet operations.
#[derive(Error, Debug)]
pub enum FleetError {
    /// A grid map entry could not be parsed.
    #[error("grid map entry {index} is malformed: '{token}' (expected x,y, lasergate or -)")]
    GridMapEntry { index: usize, token: String },

    /// A grid map names more pins than a device can hold.
    #[error("grid map has {count} entries, at most {max} pins are supported")]
    GridMapTooLong { count: usize, max: usize },

    /// A serial number argument was not a 16-bit unsigned integer.
    #[error("invalid serial '{0}'")]
    InvalidSerial(String),

    /// A discovery reply was missing required fields.
    #[error("invalid discovery reply: {0}")]
    InvalidDiscovery(String),

    /// An address could not be parsed as `host:port`.
    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    /// An operator command line could not be parsed.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Reading the configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file was not valid YAML for [`FleetConfig`](crate::FleetConfig).
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Protocol-level failure, e.g. encoding an unsupported command.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;
