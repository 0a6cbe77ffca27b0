//! Protocol constants
//!
//! These constants define the frame markers, command codes, and sizes used by
//! the Pokey network protocol.

// ============================================================================
// Frame Markers
// ============================================================================

/// First byte of every request frame (host → device).
pub const REQUEST_MARKER: u8 = 0xBB;
/// First byte of every unicast reply frame (device → host).
pub const REPLY_MARKER: u8 = 0xAA;
/// The single byte broadcast to ask devices to announce themselves.
pub const DISCOVER_PROBE: u8 = 0xFF;

// ============================================================================
// Command Codes
// ============================================================================

/// Read device meta data (serial number, firmware version).
pub const CMD_GET_DEVICE_META: u8 = 0x00;
/// Read the user id.
pub const CMD_GET_USER_ID: u8 = 0x03;
/// Read the digital input state of every pin.
pub const CMD_GET_DEVICE_STATE: u8 = 0xCC;

/// Code used for the discovery request. Not a real device command.
pub const CMD_DISCOVER: u8 = 0xFD;
/// Code used for replies that were decoded but not understood. Not a real device command.
pub const CMD_UNKNOWN_REPLY: u8 = 0xFE;
/// Code used for anything unrecognised. Not a real device command.
pub const CMD_INVALID: u8 = 0xFF;

// ============================================================================
// Sizes
// ============================================================================

/// Size of every unicast frame, request or reply.
pub const FRAME_SIZE: usize = 64;
/// Size of the unicast frame header.
pub const HEADER_SIZE: usize = 8;
/// Size of the unicast frame payload.
pub const PAYLOAD_SIZE: usize = FRAME_SIZE - HEADER_SIZE;
/// Number of header bytes covered by the checksum.
pub const CHECKSUMMED_HEADER_SIZE: usize = 7;

/// Offset of the command code in a unicast frame.
pub const OFFSET_COMMAND: usize = 1;
/// Offset of the request id in a unicast frame.
pub const OFFSET_REQUEST_ID: usize = 6;
/// Offset of the checksum in a unicast frame.
pub const OFFSET_CHECKSUM: usize = 7;

/// Number of digital pins reported in a device state reply.
pub const PIN_COUNT: usize = 55;

/// Size of the legacy broadcast reply.
pub const BROADCAST_LEGACY_SIZE: usize = 14;
/// Size of the extended broadcast reply.
pub const BROADCAST_EXTENDED_SIZE: usize = 19;

/// TCP port every device listens on. Appended to discovered addresses.
pub const DEVICE_PORT: u16 = 20055;
