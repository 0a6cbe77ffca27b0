//! Broadcast reply layouts.
//!
//! Devices announce themselves with a short UDP reply whose layout depends on
//! the firmware. Bytes 3 and 4 carry the firmware version, rendered here as
//! `"major.minor"` decimal text, and that text selects the layout:
//!
//! | Version | Size | Serial                          |
//! |---------|------|---------------------------------|
//! | `33.52` | 14   | bytes 1..=2, big-endian         |
//! | `49.13` | 19   | bytes 14..=15, little-endian    |
//! | `48.0`  | 19   | bytes 14..=15, little-endian    |
//!
//! Adding a firmware means adding a row to [`KNOWN_LAYOUTS`].

use crate::constants::*;

/// Offset of the user id in a broadcast reply.
pub const BROADCAST_OFFSET_USER_ID: usize = 0;
/// Offset of the version major byte.
pub const BROADCAST_OFFSET_VERSION_MAJOR: usize = 3;
/// Offset of the version minor byte.
pub const BROADCAST_OFFSET_VERSION_MINOR: usize = 4;
/// Offset of the device IPv4 address (4 bytes).
pub const BROADCAST_OFFSET_ADDRESS: usize = 5;
/// Offset of the DHCP flag.
pub const BROADCAST_OFFSET_DHCP: usize = 9;
/// Offset of the host IPv4 address (4 bytes).
pub const BROADCAST_OFFSET_HOST_ADDRESS: usize = 10;

/// Wire layout of a broadcast reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastLayout {
    /// 14-byte reply, serial big-endian at bytes 1..=2.
    Legacy,
    /// 19-byte reply, serial little-endian at bytes 14..=15.
    Extended,
}

/// Firmware versions with a known layout.
pub const KNOWN_LAYOUTS: &[(&str, BroadcastLayout)] = &[
    ("33.52", BroadcastLayout::Legacy),
    ("49.13", BroadcastLayout::Extended),
    ("48.0", BroadcastLayout::Extended),
];

impl BroadcastLayout {
    /// Look up the layout for a rendered version string.
    pub fn for_version(version: &str) -> Option<BroadcastLayout> {
        KNOWN_LAYOUTS
            .iter()
            .find(|(known, _)| *known == version)
            .map(|(_, layout)| *layout)
    }

    /// Total size of a reply in this layout.
    pub fn frame_size(&self) -> usize {
        match self {
            BroadcastLayout::Legacy => BROADCAST_LEGACY_SIZE,
            BroadcastLayout::Extended => BROADCAST_EXTENDED_SIZE,
        }
    }

    /// Read the serial number. `data` must hold at least [`Self::frame_size`] bytes.
    pub fn serial(&self, data: &[u8]) -> u16 {
        match self {
            BroadcastLayout::Legacy => u16::from_be_bytes([data[1], data[2]]),
            BroadcastLayout::Extended => u16::from_le_bytes([data[14], data[15]]),
        }
    }
}

/// Render the version bytes of a broadcast reply as `"major.minor"`.
pub fn render_version(data: &[u8]) -> String {
    format!(
        "{}.{}",
        data[BROADCAST_OFFSET_VERSION_MAJOR], data[BROADCAST_OFFSET_VERSION_MINOR]
    )
}

/// Render four bytes starting at `offset` as a dotted IPv4 address.
pub fn render_ipv4(data: &[u8], offset: usize) -> String {
    format!(
        "{}.{}.{}.{}",
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_versions() {
        assert_eq!(BroadcastLayout::for_version("33.52"), Some(BroadcastLayout::Legacy));
        assert_eq!(BroadcastLayout::for_version("49.13"), Some(BroadcastLayout::Extended));
        assert_eq!(BroadcastLayout::for_version("48.0"), Some(BroadcastLayout::Extended));
        assert_eq!(BroadcastLayout::for_version("48.00"), None);
        assert_eq!(BroadcastLayout::for_version("1.0"), None);
    }

    #[test]
    fn test_serial_byte_order() {
        let mut data = [0u8; BROADCAST_EXTENDED_SIZE];
        data[1] = 0x59;
        data[2] = 0xB1;
        data[14] = 0xB1;
        data[15] = 0x59;
        assert_eq!(BroadcastLayout::Legacy.serial(&data), 22961);
        assert_eq!(BroadcastLayout::Extended.serial(&data), 22961);
    }

    #[test]
    fn test_render() {
        let data = [0x31, 0, 0, 33, 52, 10, 0, 0, 5, 1, 192, 168, 1, 20];
        assert_eq!(render_version(&data), "33.52");
        assert_eq!(render_ipv4(&data, BROADCAST_OFFSET_ADDRESS), "10.0.0.5");
        assert_eq!(render_ipv4(&data, BROADCAST_OFFSET_HOST_ADDRESS), "192.168.1.20");
    }
}
