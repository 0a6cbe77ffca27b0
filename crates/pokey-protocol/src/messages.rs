//! Messages decoded from a Pokey device.

use std::fmt;

use crate::commands::{calculate_checksum, Command};
use crate::constants::*;
use crate::error::ProtocolError;
use crate::layout::*;

/// Digital input state of every pin, as reported by a device state reply.
///
/// Pin `i` is bit `i % 8` of payload byte `i / 8`. A set bit means the pin
/// reads "down".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMask([bool; PIN_COUNT]);

impl PinMask {
    /// A mask with every pin up.
    pub fn empty() -> Self {
        PinMask([false; PIN_COUNT])
    }

    /// Build a mask from explicit pin states.
    pub fn new(pins: [bool; PIN_COUNT]) -> Self {
        PinMask(pins)
    }

    /// Build a mask with the listed pins down.
    pub fn with_down(pins: &[usize]) -> Self {
        let mut mask = PinMask::empty();
        for &pin in pins {
            mask.set(pin, true);
        }
        mask
    }

    /// Extract the mask from a device state reply frame.
    pub fn from_frame(frame: &[u8; FRAME_SIZE]) -> Self {
        let mut pins = [false; PIN_COUNT];
        for (i, pin) in pins.iter_mut().enumerate() {
            *pin = frame[HEADER_SIZE + i / 8] & (1 << (i % 8)) != 0;
        }
        PinMask(pins)
    }

    /// Write the mask into the payload of a frame.
    pub fn write_to_frame(&self, frame: &mut [u8; FRAME_SIZE]) {
        for (i, down) in self.0.iter().enumerate() {
            let byte = &mut frame[HEADER_SIZE + i / 8];
            if *down {
                *byte |= 1 << (i % 8);
            } else {
                *byte &= !(1 << (i % 8));
            }
        }
    }

    /// Whether pin `index` reads down. Out of range pins read up.
    pub fn is_down(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    /// Set a pin. Out of range pins are ignored.
    pub fn set(&mut self, index: usize, down: bool) {
        if let Some(pin) = self.0.get_mut(index) {
            *pin = down;
        }
    }

    /// Iterate pin states in index order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().copied()
    }

    /// Indices of the pins currently down.
    pub fn down_pins(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, down)| **down)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of pins in the mask.
    pub fn len(&self) -> usize {
        PIN_COUNT
    }

    /// Always false; a mask has a fixed number of pins.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for PinMask {
    fn default() -> Self {
        PinMask::empty()
    }
}

/// Renders as one `0`/`1` character per pin.
impl fmt::Display for PinMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for down in self.0 {
            f.write_str(if down { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// Reply to a `GetDeviceState` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStateReply {
    /// Request id echoed by the device.
    pub request_id: u8,
    /// Whether the header checksum matched.
    pub checksum_valid: bool,
    /// Pin states.
    pub pins: PinMask,
}

/// A unicast reply without a dedicated decoder. Kept whole for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// Command code mapped onto the symbolic set.
    pub command: Command,
    /// Request id echoed by the device.
    pub request_id: u8,
    /// Whether the header checksum matched.
    pub checksum_valid: bool,
    /// The complete frame.
    pub data: [u8; FRAME_SIZE],
}

impl RawReply {
    /// The frame as space separated upper-case hex, e.g. `AA 00 ...`.
    pub fn hex_dump(&self) -> String {
        self.data
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A device announcing itself in reply to a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    /// User id byte.
    pub user_id: u8,
    /// Firmware version as `"major.minor"`.
    pub version: String,
    /// Device serial number.
    pub serial: u16,
    /// Whether the device uses DHCP.
    pub dhcp_enabled: bool,
    /// Device address as `host:port`.
    pub address: String,
    /// Address of the host the device is configured to talk to. Diagnostic only.
    pub host_address: String,
}

/// A decoded message from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Pin states from a poll.
    DeviceState(DeviceStateReply),
    /// Any other unicast reply.
    Reply(RawReply),
    /// A broadcast discovery reply.
    Discovery(DiscoveryReply),
}

impl Message {
    /// The symbolic command this message answers.
    pub fn command(&self) -> Command {
        match self {
            Message::DeviceState(_) => Command::GetDeviceState,
            Message::Reply(raw) => raw.command,
            Message::Discovery(_) => Command::Discover,
        }
    }

    /// Decode a complete unicast reply frame.
    ///
    /// Checksum failures are logged and reported in the message but never
    /// stop decoding.
    pub fn decode_reply(frame: &[u8; FRAME_SIZE]) -> Message {
        let request_id = frame[OFFSET_REQUEST_ID];
        let code = frame[OFFSET_COMMAND];
        let command = Command::from_code(code);

        let checksum_valid = calculate_checksum(frame) == frame[OFFSET_CHECKSUM];
        if !checksum_valid {
            log::warn!(
                "Pokey checksum failed on request {} command: {} ({})",
                request_id,
                code,
                command
            );
        }

        match command {
            Command::GetDeviceState => Message::DeviceState(DeviceStateReply {
                request_id,
                checksum_valid,
                pins: PinMask::from_frame(frame),
            }),
            _ => Message::Reply(RawReply {
                command,
                request_id,
                checksum_valid,
                data: *frame,
            }),
        }
    }

    /// Decode a complete broadcast reply in a known layout.
    pub fn decode_discovery(
        data: &[u8],
        layout: BroadcastLayout,
    ) -> Result<Message, ProtocolError> {
        if data.len() < layout.frame_size() {
            return Err(ProtocolError::FrameTooShort {
                expected: layout.frame_size(),
                actual: data.len(),
            });
        }

        Ok(Message::Discovery(DiscoveryReply {
            user_id: data[BROADCAST_OFFSET_USER_ID],
            version: render_version(data),
            serial: layout.serial(data),
            dhcp_enabled: data[BROADCAST_OFFSET_DHCP] != 0,
            address: format!("{}:{}", render_ipv4(data, BROADCAST_OFFSET_ADDRESS), DEVICE_PORT),
            host_address: render_ipv4(data, BROADCAST_OFFSET_HOST_ADDRESS),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_mask_frame_round_trip() {
        let pattern: Vec<usize> = (0..PIN_COUNT).filter(|i| i % 3 == 0 || *i == 54).collect();
        let mask = PinMask::with_down(&pattern);

        let mut frame = [0u8; FRAME_SIZE];
        mask.write_to_frame(&mut frame);
        assert_eq!(PinMask::from_frame(&frame), mask);
        assert_eq!(PinMask::from_frame(&frame).down_pins(), pattern);
    }

    #[test]
    fn test_pin_mask_bit_layout() {
        let mut frame = [0u8; FRAME_SIZE];
        frame[HEADER_SIZE] = 0b0000_1000;
        frame[HEADER_SIZE + 1] = 0b0000_0001;
        let mask = PinMask::from_frame(&frame);
        assert_eq!(mask.down_pins(), vec![3, 8]);
    }

    #[test]
    fn test_pin_mask_text() {
        let mask = PinMask::with_down(&[0, 2]);
        let text = mask.to_string();
        assert_eq!(text.len(), PIN_COUNT);
        assert!(text.starts_with("101000"));
        assert_eq!(text.matches('1').count(), 2);
    }

    #[test]
    fn test_raw_reply_hex_dump() {
        let mut data = [0u8; FRAME_SIZE];
        data[0] = REPLY_MARKER;
        data[1] = 0x0A;
        let raw = RawReply {
            command: Command::Invalid,
            request_id: 0,
            checksum_valid: false,
            data,
        };
        let dump = raw.hex_dump();
        assert!(dump.starts_with("AA 0A 00"));
        assert_eq!(dump.split(' ').count(), FRAME_SIZE);
    }

    #[test]
    fn test_decode_discovery_too_short() {
        let data = [0u8; 10];
        assert_eq!(
            Message::decode_discovery(&data, BroadcastLayout::Legacy),
            Err(ProtocolError::FrameTooShort { expected: 14, actual: 10 })
        );
    }
}
