//! QMUX device layer.
//!
//! This crate owns everything between the pure codec
//! ([`qmux_proto`]) and a caller holding a per-service handle:
//!
//! - [`Transport`]: the byte channel beneath a device — a character
//!   device, or a stream socket to the proxy;
//! - [`Device`]: owns one transport, drives its read loop, matches
//!   responses to outstanding transactions, fans out indications, and
//!   arbitrates client-id allocation through the control service;
//! - [`Client`]: a thin handle scoped to one (service, cid) pair.
//!
//! A device is shared: cloning is cheap and every clone talks to the
//! same underlying channel. Clients hold a device clone; the device
//! holds only an id-keyed subscriber table back, so dropping a client
//! detaches it without reference cycles.

mod client;
pub mod ctl;
mod device;
mod error;
mod transport;

pub use client::Client;
pub use device::{
    CidAllocation, Device, DeviceOptions, OpenFlags, ReleaseFlags, DEFAULT_PROXY_SOCKET,
};
pub use error::DeviceError;
pub use transport::{CdcWdmTransport, StreamTransport, Transport, connect_abstract};
