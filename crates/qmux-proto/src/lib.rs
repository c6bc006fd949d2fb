//! QMUX wire codec: frame envelope, TLV engine, and the Message object.
//!
//! This crate is the bit-exact serialization layer beneath the device and
//! proxy crates. It knows the QMUX envelope and TLV records and nothing
//! about per-service semantics.
//!
//! A QMUX frame on the wire:
//!
//! ```text
//! | 0x01 | length LE u16 | flags u8 | service u8 | cid u8 |
//! | msg-flags u8 | tid (u8 ctl / LE u16 other) | message-id LE u16 |
//! | tlv-length LE u16 | TLVs... |
//! ```
//!
//! `length` counts every byte after the marker, so a complete frame is
//! `1 + length` bytes. The control service (id 0) carries an 8-bit
//! transaction id; every other service a 16-bit little-endian one.
//!
//! Everything here is pure functions over byte buffers. Reassembly of a
//! byte stream into frames is [`FrameReader`]; a decoded (or
//! in-construction) frame with freeze semantics and an O(1) TLV index is
//! [`Message`].

mod errors;
mod frame;
mod message;
mod service;
mod tlv;
pub mod trace;

pub use errors::{FrameError, Result};
pub use frame::{Decoded, Frame, FrameReader, MAX_FRAME_SIZE, QMUX_MARKER, decode_one};
pub use message::{Message, QmiProtocolError, QmiResult};
pub use service::{MessageType, Service};
pub use tlv::{StringPrefix, Tlv, TLV_HEADER_SIZE};

/// Broadcast client id. Indications addressed here fan out to every
/// client of the service.
pub const BROADCAST_CID: u8 = 0xFF;
