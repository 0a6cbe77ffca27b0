//! Pokey Network Protocol
//!
//! This crate provides types and utilities for talking to Pokey networked I/O
//! devices. Devices speak two wire formats:
//!
//! - **Unicast frames** (TCP, host ↔ device): fixed 64-byte frames. Requests
//!   start with `0xBB`, replies with `0xAA`. Each frame has an 8-byte header
//!   carrying the command code, four parameter bytes, a request id and a
//!   checksum, followed by 56 payload bytes.
//! - **Broadcast replies** (UDP, device → host): 14 or 19 byte announcements
//!   whose layout depends on the firmware version the device reports.
//!
//! # Protocol Overview
//!
//! ```text
//! +------+-----+----+----+----+----+--------+----------+----------------+
//! | 0xBB | cmd | p2 | p3 | p4 | p5 | req_id | checksum | payload[0..56] |
//! +------+-----+----+----+----+----+--------+----------+----------------+
//! ```
//!
//! The checksum is the sum of the first seven header bytes modulo 256. A
//! checksum mismatch on a reply is logged but does not stop the reply from
//! being decoded.
//!
//! # Example
//!
//! ```rust,ignore
//! use pokey_protocol::{Command, DecodeResult, FrameCodec};
//!
//! // Build a poll request
//! let frame = Command::GetDeviceState.encode()?;
//!
//! // Feed bytes from the socket and decode replies
//! let mut codec = FrameCodec::new();
//! codec.push(&received);
//! while let DecodeResult::Success(message) = codec.decode() {
//!     println!("{:?}", message);
//! }
//! ```

mod commands;
mod constants;
mod error;
mod frame;
mod layout;
mod messages;

pub use commands::*;
pub use constants::*;
pub use error::*;
pub use frame::*;
pub use layout::*;
pub use messages::*;
