//! Proxy error types.

use std::fmt;

use qmux_core::DeviceError;
use qmux_proto::FrameError;

/// Errors that can occur in the proxy.
#[derive(Debug)]
pub enum ProxyError {
    /// Configuration error (bad socket name, invalid allowed user).
    ///
    /// Fatal at startup. Fix configuration and restart.
    Config(String),

    /// Transport/socket error (bind failure, accept failure, broken
    /// session socket).
    ///
    /// May be transient (one session) or fatal (listener gone). Check
    /// the message for which.
    Transport(String),

    /// Protocol error (malformed client frame, handshake violation).
    ///
    /// Fatal for that session; the proxy keeps serving other clients.
    Protocol(String),

    /// Error from the device layer beneath a proxied path.
    Device(DeviceError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Device(err) => write!(f, "device error: {err}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DeviceError> for ProxyError {
    fn from(err: DeviceError) -> Self {
        Self::Device(err)
    }
}

impl From<FrameError> for ProxyError {
    fn from(err: FrameError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl ProxyError {
    /// Categorical exit code for the daemon.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Transport(_) => 3,
            Self::Protocol(_) => 4,
            Self::Device(_) => 5,
        }
    }
}
