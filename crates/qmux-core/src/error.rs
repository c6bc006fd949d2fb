//! Device-layer error taxonomy.

use std::io;

use qmux_proto::{FrameError, QmiProtocolError};
use thiserror::Error;

/// Errors surfaced by devices, clients, and transports.
///
/// The fatality rules: `Framing` and `TransportLost` kill the device —
/// every pending waiter receives the error and the device moves to
/// closed. `Protocol` and `Timeout` are per-command and leave other
/// in-flight work untouched.
#[derive(Debug, Error, Clone)]
pub enum DeviceError {
    /// The byte stream lost framing. There is no safe resync point on a
    /// length-prefixed binary stream, so this is fatal to the device.
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    /// The modem answered with a non-zero result TLV. Returned to the
    /// caller; inspection is the caller's job.
    #[error("protocol error: {0}")]
    Protocol(QmiProtocolError),

    /// The underlying channel is gone or a write failed. Fatal to the
    /// device.
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// The operation deadline elapsed before a response arrived.
    #[error("operation timed out")]
    Timeout,

    /// The caller withdrew the operation, or the device was closed with
    /// the transaction still in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation issued against a closed or closing device, or a frozen
    /// message.
    #[error("wrong state: {0}")]
    WrongState(&'static str),

    /// File permissions denied the open, or the proxy rejected our
    /// credentials.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The channel is held exclusively by another process.
    #[error("device busy: {0}")]
    Busy(String),

    /// The operation is not allowed in the current mode.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The bounded outbound queue is full; the command failed rather
    /// than buffering without bound.
    #[error("outbound queue full")]
    Backpressure,
}

impl From<QmiProtocolError> for DeviceError {
    fn from(error: QmiProtocolError) -> Self {
        Self::Protocol(error)
    }
}

impl DeviceError {
    /// Classify an open/connect failure.
    pub(crate) fn from_open(error: &io::Error) -> Self {
        if error.kind() == io::ErrorKind::PermissionDenied {
            return Self::Permission(error.to_string());
        }
        if error.raw_os_error() == Some(libc::EBUSY) {
            return Self::Busy(error.to_string());
        }
        Self::TransportLost(error.to_string())
    }

    /// Classify an I/O failure on an established channel.
    pub(crate) fn from_io(error: &io::Error) -> Self {
        Self::TransportLost(error.to_string())
    }
}
