//! Shared helpers for fleet integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pokey_fleet::{ConnectionId, EventLatch, Fleet, FleetConfig, InboundReply, MemoryTransport};
use pokey_protocol::{
    calculate_checksum, DecodeResult, FrameCodec, PinMask, CMD_GET_DEVICE_STATE, FRAME_SIZE,
    OFFSET_CHECKSUM, OFFSET_COMMAND, OFFSET_REQUEST_ID, REPLY_MARKER,
};

/// A fleet on an in-memory transport.
pub fn memory_fleet(config: FleetConfig) -> (Arc<Fleet>, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let latch = Arc::new(EventLatch::new(config.peek_expiry()));
    let fleet = Arc::new(Fleet::new(config, transport.clone(), latch));
    (fleet, transport)
}

/// 14-byte broadcast reply from firmware 33.52.
pub fn legacy_broadcast(serial: u16, address: [u8; 4], dhcp: bool) -> Vec<u8> {
    let serial = serial.to_be_bytes();
    vec![
        0x31, serial[0], serial[1], 33, 52,
        address[0], address[1], address[2], address[3],
        dhcp as u8,
        10, 0, 0, 1,
    ]
}

/// 19-byte broadcast reply from firmware 49.13.
pub fn extended_broadcast(serial: u16, address: [u8; 4]) -> Vec<u8> {
    let serial = serial.to_le_bytes();
    vec![
        0x02, 0, 0, 49, 13,
        address[0], address[1], address[2], address[3],
        1,
        10, 0, 0, 1,
        serial[0], serial[1], 0, 0, 0,
    ]
}

/// 64-byte device state reply with the given pins down.
pub fn state_reply(request_id: u8, down: &[usize]) -> Vec<u8> {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = REPLY_MARKER;
    frame[OFFSET_COMMAND] = CMD_GET_DEVICE_STATE;
    frame[OFFSET_REQUEST_ID] = request_id;
    frame[OFFSET_CHECKSUM] = calculate_checksum(&frame);
    PinMask::with_down(down).write_to_frame(&mut frame);
    frame.to_vec()
}

/// Decode `bytes` as if they arrived on `connection` and hand every message
/// to the fleet. Returns the number of messages delivered.
pub fn feed(fleet: &Fleet, connection: &str, bytes: &[u8]) -> usize {
    let mut codec = FrameCodec::new();
    codec.push(bytes);
    let mut delivered = 0;
    loop {
        match codec.decode() {
            DecodeResult::Success(message) => {
                fleet.on_reply(InboundReply::new(ConnectionId::new(connection), message));
                delivered += 1;
            }
            DecodeResult::Ignore => continue,
            DecodeResult::Waiting | DecodeResult::Error(_) => return delivered,
        }
    }
}
