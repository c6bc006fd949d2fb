//! QMUX multiplexing proxy.
//!
//! Lets N independent processes share one modem control channel. The
//! server listens on an abstract unix socket, gates connections on peer
//! credentials, and binds each session to a pooled device via the
//! proxy-internal handshake. From there it forwards requests, routes
//! responses and indications back by CID ownership, serializes
//! control-service traffic, and keeps CIDs reclaimable across client
//! restarts.
//!
//! # Components
//!
//! - [`Server`]: listener, credential gate, accept loop
//! - [`DevicePool`] / [`ProxyDevice`]: per-path device state, CID
//!   ownership, disowned pool, CTL lane
//! - session module: handshake + per-connection frame loop

mod error;
mod pool;
mod session;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use error::ProxyError;
pub use pool::{CdcWdmOpener, DeviceOpener, DevicePool, ProxyDevice, SessionId};
use tokio::net::UnixListener;

/// Default abstract socket name, shared with the client library.
pub const DEFAULT_SOCKET_NAME: &str = qmux_core::DEFAULT_PROXY_SOCKET;

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Abstract socket name to listen on.
    pub socket_name: String,
    /// Additional uid allowed to connect. Root and the proxy's own uid
    /// are always allowed.
    pub allowed_uid: Option<u32>,
    /// Exit after the proxy has served zero clients for this long.
    /// `None` runs forever.
    pub empty_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { socket_name: DEFAULT_SOCKET_NAME.to_string(), allowed_uid: None, empty_timeout: None }
    }
}

/// The proxy server: a listener plus the device pool behind it.
pub struct Server {
    listener: UnixListener,
    pool: Arc<DevicePool>,
    config: ProxyConfig,
    clients: Arc<AtomicU64>,
}

impl Server {
    /// Bind the listener with the production cdc-wdm opener.
    pub fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        Self::bind_with_opener(config, Box::new(CdcWdmOpener))
    }

    /// Bind the listener with a custom device opener (tests substitute
    /// an in-memory modem).
    pub fn bind_with_opener(
        config: ProxyConfig,
        opener: Box<dyn DeviceOpener>,
    ) -> Result<Self, ProxyError> {
        use std::os::linux::net::SocketAddrExt;

        let addr = std::os::unix::net::SocketAddr::from_abstract_name(
            config.socket_name.as_bytes(),
        )
        .map_err(|e| ProxyError::Config(format!("bad socket name: {e}")))?;
        let listener = std::os::unix::net::UnixListener::bind_addr(&addr)
            .map_err(|e| ProxyError::Config(format!("binding '{}': {e}", config.socket_name)))?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        tracing::info!(socket = %config.socket_name, "proxy listening");

        Ok(Self {
            listener,
            pool: DevicePool::new(opener),
            config,
            clients: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> u64 {
        self.clients.load(Ordering::Relaxed)
    }

    /// Accept and serve sessions until an accept error, or until the
    /// empty timeout (if configured) expires with no clients.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let mut next_session: SessionId = 1;
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));
        let mut idle_since = tokio::time::Instant::now();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _addr) = accepted?;
                    self.accept_one(stream, next_session);
                    next_session += 1;
                    idle_since = tokio::time::Instant::now();
                },

                _ = idle_check.tick() => {
                    let Some(limit) = self.config.empty_timeout else { continue };
                    if self.client_count() > 0 {
                        idle_since = tokio::time::Instant::now();
                    } else if idle_since.elapsed() >= limit {
                        tracing::info!("no clients for {limit:?}; exiting");
                        return Ok(());
                    }
                },
            }
        }
    }

    fn accept_one(&self, stream: tokio::net::UnixStream, session_id: SessionId) {
        // Peer credentials are checked before any bytes are read;
        // disallowed uids never reach the handshake.
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read peer credentials; rejecting");
                return;
            },
        };
        if !user_allowed(uid, self.config.allowed_uid) {
            tracing::warn!(uid, session = session_id, "connection from disallowed uid rejected");
            return;
        }

        tracing::debug!(uid, session = session_id, "client connected");
        let pool = Arc::clone(&self.pool);
        let clients = Arc::clone(&self.clients);
        clients.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = session::run_session(stream, session_id, pool).await {
                tracing::warn!(session = session_id, error = %e, "session ended with error");
            }
            clients.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// Whether a peer uid may use the proxy: root always, the proxy's own
/// uid always, plus the one configured uid.
fn user_allowed(uid: u32, allowed: Option<u32>) -> bool {
    uid == 0 || uid == process_uid() || Some(uid) == allowed
}

/// Effective uid of the proxy process.
fn process_uid() -> u32 {
    // SAFETY: geteuid cannot fail and touches no memory.
    #[allow(unsafe_code)]
    unsafe {
        libc::geteuid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_always_allowed() {
        assert!(user_allowed(0, None));
        assert!(user_allowed(0, Some(1000)));
    }

    #[test]
    fn own_uid_is_always_allowed() {
        assert!(user_allowed(process_uid(), None));
    }

    #[test]
    fn configured_uid_is_allowed() {
        assert!(user_allowed(1042, Some(1042)));
    }

    #[test]
    fn other_uids_are_rejected() {
        let stranger = process_uid().wrapping_add(1).max(1);
        assert!(!user_allowed(stranger, None));
        assert!(!user_allowed(stranger, Some(stranger.wrapping_add(1).max(1))));
    }
}
