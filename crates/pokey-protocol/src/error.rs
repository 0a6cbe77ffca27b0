//! Protocol error types.

use thiserror::Error;

use crate::Command;

/// Errors that can occur when working with the Pokey protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command has no wire encoding.
    ///
    /// Only `GetDeviceMeta`, `GetDeviceState` and `Discover` can be sent. Asking
    /// for anything else is a programming or configuration error.
    #[error("command {0} cannot be encoded")]
    UnsupportedCommand(Command),

    /// Frame is shorter than its layout requires.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Expected minimum length.
        expected: usize,
        /// Actual length received.
        actual: usize,
    },
}
