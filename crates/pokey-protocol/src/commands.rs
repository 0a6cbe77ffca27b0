//! Commands that can be sent to a Pokey device.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::constants::*;
use crate::error::ProtocolError;

/// Process-wide request id counter. Wraps at 256.
static REQUEST_COUNTER: AtomicU8 = AtomicU8::new(0);

/// Take the next request id.
pub fn next_request_id() -> u8 {
    REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Symbolic commands of the Pokey protocol.
///
/// The wire code is a single byte. `Discover`, `UnknownReply` and `Invalid`
/// are not real device commands; they exist so that every decoded message
/// and every outgoing request maps onto one closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Anything unrecognised.
    Invalid,
    /// A reply that decoded but carried no known payload.
    UnknownReply,
    /// Broadcast discovery request.
    Discover,
    /// Read device meta data.
    GetDeviceMeta,
    /// Read the user id.
    GetUserId,
    /// Read the digital input state of every pin.
    GetDeviceState,
}

impl Command {
    /// The wire code for this command.
    pub fn code(&self) -> u8 {
        match self {
            Command::Invalid => CMD_INVALID,
            Command::UnknownReply => CMD_UNKNOWN_REPLY,
            Command::Discover => CMD_DISCOVER,
            Command::GetDeviceMeta => CMD_GET_DEVICE_META,
            Command::GetUserId => CMD_GET_USER_ID,
            Command::GetDeviceState => CMD_GET_DEVICE_STATE,
        }
    }

    /// Map a command byte from a reply frame.
    ///
    /// Only real device codes are recognised; everything else is `Invalid`.
    pub fn from_code(code: u8) -> Command {
        match code {
            CMD_GET_DEVICE_META => Command::GetDeviceMeta,
            CMD_GET_USER_ID => Command::GetUserId,
            CMD_GET_DEVICE_STATE => Command::GetDeviceState,
            _ => Command::Invalid,
        }
    }

    /// The command name used at text boundaries (logs, operator replies).
    pub fn name(&self) -> &'static str {
        match self {
            Command::Invalid => "Invalid",
            Command::UnknownReply => "UnknownReply",
            Command::Discover => "Discover",
            Command::GetDeviceMeta => "GetDeviceMeta",
            Command::GetUserId => "GetUserId",
            Command::GetDeviceState => "GetDeviceState",
        }
    }

    /// Encode this command for transmission, taking the next request id.
    ///
    /// `Discover` encodes to the single discovery byte. `GetDeviceMeta` and
    /// `GetDeviceState` encode to a 64-byte frame. Anything else fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Command::Discover => Ok(vec![DISCOVER_PROBE]),
            Command::GetDeviceMeta | Command::GetDeviceState => {
                Ok(self.encode_with_request_id(next_request_id()))
            }
            other => Err(ProtocolError::UnsupportedCommand(*other)),
        }
    }

    /// Build a request frame with an explicit request id and zero parameters.
    pub fn encode_with_request_id(&self, request_id: u8) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_SIZE);
        frame.push(REQUEST_MARKER);
        frame.push(self.code());
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.push(request_id);
        let checksum = calculate_checksum(&frame);
        frame.push(checksum);
        frame.resize(FRAME_SIZE, 0);
        frame
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sum of the first seven header bytes, modulo 256.
///
/// Frames shorter than seven bytes are summed as far as they go.
pub fn calculate_checksum(header: &[u8]) -> u8 {
    header
        .iter()
        .take(CHECKSUMMED_HEADER_SIZE)
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}
