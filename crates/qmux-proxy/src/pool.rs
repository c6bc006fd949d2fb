//! Device pool: one proxied device per canonical path, with CID
//! ownership tracking across session lifetimes.
//!
//! A [`ProxyDevice`] is the server side of one modem channel. It runs
//! the same single-I/O-task shape as the library device, but below
//! transaction matching: non-control frames pass through verbatim and
//! are routed back by (service, cid) ownership, while control frames
//! are funneled through a serialized CTL lane that rewrites transaction
//! ids onto the proxy's own 8-bit counter.
//!
//! Ownership state survives its session: on disconnect, a session's
//! CIDs move into the disowned pool, from which a later session on the
//! same path reclaims them by simply using them. Disowned entries die
//! with the device.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use qmux_core::ctl::{
    MESSAGE_CTL_ALLOCATE_CID, MESSAGE_CTL_RELEASE_CID, TLV_CTL_ALLOCATION_INFO,
    parse_allocation_info,
};
use qmux_core::{CdcWdmTransport, Transport};
use qmux_proto::{
    BROADCAST_CID, FrameReader, Message, MessageType, QmiProtocolError, Service, trace,
};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::ProxyError;

/// Identifies one accepted client connection.
pub type SessionId = u64;

/// How long the proxy waits for the modem to answer a forwarded CTL
/// request before synthesizing an error response for the session.
const CTL_JOB_TIMEOUT: Duration = Duration::from_secs(10);

/// Depth of the queue toward the modem.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Opens the backing transport for a canonical device path.
///
/// The production opener talks to the cdc-wdm character device; tests
/// substitute an in-memory modem.
#[async_trait]
pub trait DeviceOpener: Send + Sync + 'static {
    /// Open the channel at `path`.
    async fn open(&self, path: &Path) -> io::Result<Box<dyn Transport>>;
}

/// Production opener for cdc-wdm character devices.
pub struct CdcWdmOpener;

#[async_trait]
impl DeviceOpener for CdcWdmOpener {
    async fn open(&self, path: &Path) -> io::Result<Box<dyn Transport>> {
        CdcWdmTransport::open(path).map(|t| Box::new(t) as Box<dyn Transport>)
    }
}

struct CtlJob {
    session: SessionId,
    message: Message,
}

struct DeviceState {
    sessions: HashMap<SessionId, mpsc::Sender<Vec<u8>>>,
    /// Who owns each live (service, cid).
    owned: HashMap<(u8, u8), SessionId>,
    /// CIDs whose session disconnected without releasing. Keyed by
    /// (service, cid); the path key is implicit in the device.
    disowned: HashSet<(u8, u8)>,
    /// The one CTL transaction on the wire, if any.
    ctl_pending: Option<(u8, oneshot::Sender<Message>)>,
    /// Submitted-but-not-finished CTL jobs, queue included.
    ctl_jobs: usize,
    next_ctl_tid: u8,
    failed: bool,
}

/// Server side of one modem channel, shared by every session on its
/// path.
pub struct ProxyDevice {
    path: PathBuf,
    outbound: mpsc::Sender<Vec<u8>>,
    ctl: mpsc::Sender<CtlJob>,
    state: Mutex<DeviceState>,
    shutdown: watch::Sender<bool>,
    /// Flips to false on fatal failure; sessions watch it so a dead
    /// modem disconnects them immediately.
    health: watch::Sender<bool>,
}

impl ProxyDevice {
    fn spawn(path: PathBuf, transport: Box<dyn Transport>, pool: Weak<DevicePool>) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (ctl_tx, ctl_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, _health_rx) = watch::channel(true);

        let device = Arc::new(Self {
            path,
            outbound: outbound_tx,
            ctl: ctl_tx,
            state: Mutex::new(DeviceState {
                sessions: HashMap::new(),
                owned: HashMap::new(),
                disowned: HashSet::new(),
                ctl_pending: None,
                ctl_jobs: 0,
                next_ctl_tid: 1,
                failed: false,
            }),
            shutdown: shutdown_tx,
            health: health_tx,
        });

        tokio::spawn(device_io_loop(Arc::downgrade(&device), transport, outbound_rx, shutdown_rx));
        tokio::spawn(ctl_loop(Arc::downgrade(&device), ctl_rx, pool));

        device
    }

    /// The canonical path this device serves.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn attach_session(
        &self,
        id: SessionId,
        sender: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), ProxyError> {
        let mut state = self.state();
        if state.failed {
            return Err(ProxyError::Transport("device has failed".to_string()));
        }
        state.sessions.insert(id, sender);
        Ok(())
    }

    /// Detach a session, moving its owned CIDs into the disowned pool
    /// instead of releasing them to the modem. Short client restarts
    /// pick them back up through [`ProxyDevice::forward`].
    pub(crate) fn detach_session(&self, id: SessionId) {
        let mut state = self.state();
        state.sessions.remove(&id);
        let released: Vec<(u8, u8)> = state
            .owned
            .iter()
            .filter(|&(_, &owner)| owner == id)
            .map(|(&key, _)| key)
            .collect();
        for key in released {
            state.owned.remove(&key);
            state.disowned.insert(key);
            tracing::debug!(
                path = %self.path.display(),
                service = key.0,
                cid = key.1,
                "cid disowned on session disconnect"
            );
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state();
        state.sessions.is_empty() && state.ctl_jobs == 0
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.state().failed
    }

    pub(crate) fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    pub(crate) fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Watch that resolves when the device fails.
    pub(crate) fn health_watch(&self) -> watch::Receiver<bool> {
        self.health.subscribe()
    }

    /// Queue a session's CTL frame onto the serialized lane.
    pub(crate) async fn submit_ctl(
        &self,
        session: SessionId,
        message: Message,
    ) -> Result<(), ProxyError> {
        {
            let mut state = self.state();
            if state.failed {
                return Err(ProxyError::Transport("device has failed".to_string()));
            }
            state.ctl_jobs += 1;
        }
        if self.ctl.send(CtlJob { session, message }).await.is_err() {
            self.state().ctl_jobs -= 1;
            return Err(ProxyError::Transport("device is shutting down".to_string()));
        }
        Ok(())
    }

    /// Forward a non-control session frame to the modem, settling CID
    /// ownership first.
    ///
    /// A (service, cid) the session does not own is looked up in the
    /// disowned pool and re-owned on hit — the restarted-client reclaim
    /// path. An entirely unknown pair is tracked implicitly: the proxy
    /// itself may have restarted underneath a client that still holds a
    /// valid CID.
    pub(crate) async fn forward(
        &self,
        session: SessionId,
        message: &Message,
    ) -> Result<(), ProxyError> {
        let key = (message.service().0, message.cid());
        {
            let mut state = self.state();
            if state.failed {
                return Err(ProxyError::Transport("device has failed".to_string()));
            }
            match state.owned.get(&key) {
                Some(&owner) if owner == session => {},
                Some(&owner) => {
                    tracing::warn!(
                        service = key.0,
                        cid = key.1,
                        owner,
                        session,
                        "frame for a cid owned by another session; forwarding without re-owning"
                    );
                },
                None => {
                    if state.disowned.remove(&key) {
                        tracing::debug!(
                            service = key.0,
                            cid = key.1,
                            session,
                            "disowned cid reclaimed"
                        );
                    } else {
                        tracing::debug!(
                            service = key.0,
                            cid = key.1,
                            session,
                            "untracked cid adopted"
                        );
                    }
                    state.owned.insert(key, session);
                },
            }
        }

        let bytes = message.to_bytes()?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| ProxyError::Transport("device is shutting down".to_string()))
    }

    /// Run one CTL job: rewrite the transaction id, put the request on
    /// the wire, wait for the matching response, restore the client's
    /// id, and apply allocate/release bookkeeping.
    async fn run_ctl_job(&self, job: CtlJob) {
        let client_tid = job.message.transaction_id();
        let message_id = job.message.message_id();

        // Releases leave the owned set (and the disowned pool) at
        // forward time; the cid is gone from the session's view whether
        // or not the modem ends up honoring it.
        if message_id == MESSAGE_CTL_RELEASE_CID {
            if let Some(tlv) = job.message.tlv(TLV_CTL_ALLOCATION_INFO) {
                let raw = tlv.bytes();
                if raw.len() >= 2 {
                    let key = (raw[0], raw[1]);
                    let mut state = self.state();
                    state.owned.remove(&key);
                    state.disowned.remove(&key);
                    drop(state);
                    tracing::debug!(
                        path = %self.path.display(),
                        service = key.0,
                        cid = key.1,
                        "cid released"
                    );
                }
            }
        }

        let (device_tid, waiter) = {
            let mut state = self.state();
            let tid = loop {
                let tid = state.next_ctl_tid;
                state.next_ctl_tid = state.next_ctl_tid.wrapping_add(1);
                if tid != 0 {
                    break tid;
                }
            };
            let (tx, rx) = oneshot::channel();
            state.ctl_pending = Some((tid, tx));
            (tid, rx)
        };

        let mut wire_frame = job.message.frame().clone();
        wire_frame.transaction_id = u16::from(device_tid);

        let response = match wire_frame.to_bytes() {
            Err(e) => {
                tracing::warn!(error = %e, "failed to re-encode ctl frame");
                None
            },
            Ok(bytes) => {
                if self.outbound.send(bytes).await.is_err() {
                    None
                } else {
                    match tokio::time::timeout(CTL_JOB_TIMEOUT, waiter).await {
                        Ok(Ok(response)) => Some(response),
                        Ok(Err(_device_failed)) => None,
                        Err(_elapsed) => {
                            tracing::warn!(
                                path = %self.path.display(),
                                message_id,
                                "ctl transaction timed out"
                            );
                            None
                        },
                    }
                }
            },
        };

        let to_session = match response {
            Some(response) => {
                self.apply_ctl_bookkeeping(&job, &response);
                let mut frame = response.into_frame();
                frame.transaction_id = client_tid;
                frame.to_bytes()
            },
            None => {
                let mut synthesized =
                    Message::response(Service::CTL, 0, client_tid, message_id);
                match synthesized.push_error_result(QmiProtocolError::Internal) {
                    Ok(()) => synthesized.to_bytes(),
                    Err(e) => Err(e),
                }
            },
        };

        let sender = self.state().sessions.get(&job.session).cloned();
        match (to_session, sender) {
            (Ok(bytes), Some(sender)) => {
                if sender.try_send(bytes).is_err() {
                    tracing::warn!(session = job.session, "session queue full; ctl response dropped");
                }
            },
            (Ok(_), None) => {
                tracing::debug!(session = job.session, "session gone before ctl response");
            },
            (Err(e), _) => {
                tracing::warn!(error = %e, "failed to encode ctl response");
            },
        }

        let mut state = self.state();
        state.ctl_pending = None;
        state.ctl_jobs -= 1;
    }

    /// Record a successful allocation in the ownership tables.
    fn apply_ctl_bookkeeping(&self, job: &CtlJob, response: &Message) {
        if job.message.message_id() != MESSAGE_CTL_ALLOCATE_CID {
            return;
        }
        if !matches!(response.result(), Ok(Ok(()))) {
            return;
        }
        if let Ok((service, cid)) = parse_allocation_info(response) {
            let key = (service.0, cid);
            let mut state = self.state();
            state.disowned.remove(&key);
            state.owned.insert(key, job.session);
            tracing::debug!(
                path = %self.path.display(),
                service = key.0,
                cid = key.1,
                session = job.session,
                "cid allocated"
            );
        }
    }

    /// Route one inbound modem frame to the sessions entitled to it.
    fn route_inbound(&self, message: &Message) {
        match message.message_type() {
            MessageType::Response if message.service().is_ctl() => {
                let waiter = {
                    let mut state = self.state();
                    let matches = state
                        .ctl_pending
                        .as_ref()
                        .is_some_and(|(tid, _)| u16::from(*tid) == message.transaction_id());
                    if matches { state.ctl_pending.take().map(|(_, tx)| tx) } else { None }
                };
                if let Some(waiter) = waiter {
                    let _ = waiter.send(message.clone());
                } else {
                    tracing::warn!(
                        tid = message.transaction_id(),
                        "ctl response matches no pending transaction; dropped"
                    );
                }
            },

            MessageType::Response => {
                let key = (message.service().0, message.cid());
                let sender = {
                    let state = self.state();
                    state.owned.get(&key).and_then(|owner| state.sessions.get(owner)).cloned()
                };
                match (sender, message.to_bytes()) {
                    (Some(sender), Ok(bytes)) => {
                        if sender.try_send(bytes).is_err() {
                            tracing::warn!(
                                service = key.0,
                                cid = key.1,
                                "session queue full; response dropped"
                            );
                        }
                    },
                    (None, _) => {
                        tracing::warn!(
                            service = key.0,
                            cid = key.1,
                            "response for an unowned cid; dropped"
                        );
                    },
                    (_, Err(e)) => {
                        tracing::warn!(error = %e, "failed to re-encode response");
                    },
                }
            },

            MessageType::Indication => {
                let targets: Vec<mpsc::Sender<Vec<u8>>> = {
                    let state = self.state();
                    if message.service().is_ctl() {
                        // Control indications (e.g. sync) concern every
                        // session on the device.
                        state.sessions.values().cloned().collect()
                    } else {
                        let mut owners: Vec<SessionId> = state
                            .owned
                            .iter()
                            .filter(|&(&(service, cid), _)| {
                                service == message.service().0
                                    && (cid == message.cid()
                                        || message.cid() == BROADCAST_CID
                                        || cid == BROADCAST_CID)
                            })
                            .map(|(_, &owner)| owner)
                            .collect();
                        owners.sort_unstable();
                        owners.dedup();
                        owners
                            .iter()
                            .filter_map(|owner| state.sessions.get(owner))
                            .cloned()
                            .collect()
                    }
                };
                match message.to_bytes() {
                    Ok(bytes) => {
                        for sender in targets {
                            if sender.try_send(bytes.clone()).is_err() {
                                tracing::warn!("session queue full; indication dropped");
                            }
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to re-encode indication");
                    },
                }
            },

            MessageType::Request => {
                tracing::warn!(
                    service = %message.service(),
                    message_id = message.message_id(),
                    "unexpected request from the modem; dropped"
                );
            },
        }
    }

    /// Fatal device failure: every session on this device is
    /// disconnected, its disowned CIDs are dropped, and a fresh
    /// handshake will open a fresh device.
    fn fail(&self) {
        let mut state = self.state();
        if state.failed {
            return;
        }
        state.failed = true;
        let sessions = state.sessions.len();
        state.sessions.clear();
        state.owned.clear();
        state.disowned.clear();
        state.ctl_pending = None;
        drop(state);
        let _ = self.health.send(false);
        tracing::warn!(
            path = %self.path.display(),
            sessions,
            "device failed; all sessions disconnected"
        );
    }
}

async fn device_io_loop(
    device: Weak<ProxyDevice>,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let tracing_frames = std::env::var_os("QMUX_TRACE").is_some();
    let mut reader = FrameReader::new();
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            queued = outbound.recv() => {
                let Some(bytes) = queued else { break };
                if tracing_frames {
                    tracing::debug!(direction = "sent", frame = %trace::str_hex(&bytes, ':'));
                }
                if let Err(e) = transport.send(&bytes).await {
                    tracing::warn!(error = %e, "modem write failed");
                    fail_weak(&device);
                    break;
                }
            },

            read = transport.recv(&mut buf) => {
                match read {
                    Ok(0) => {
                        tracing::warn!("modem channel closed");
                        fail_weak(&device);
                        break;
                    },
                    Ok(_) => {
                        let chunk = buf.split();
                        if tracing_frames {
                            tracing::debug!(direction = "received", frame = %trace::str_hex(&chunk, ':'));
                        }
                        if let Err(e) = pump(&device, &mut reader, &chunk) {
                            tracing::warn!(error = %e, "framing error on modem channel");
                            fail_weak(&device);
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "modem read failed");
                        fail_weak(&device);
                        break;
                    },
                }
            },
        }
    }
}

fn pump(
    device: &Weak<ProxyDevice>,
    reader: &mut FrameReader,
    chunk: &[u8],
) -> Result<(), qmux_proto::FrameError> {
    reader.extend(chunk)?;
    while let Some(frame) = reader.next_frame()? {
        let Some(device) = device.upgrade() else { return Ok(()) };
        device.route_inbound(&Message::from_frame(frame));
    }
    Ok(())
}

fn fail_weak(device: &Weak<ProxyDevice>) {
    if let Some(device) = device.upgrade() {
        device.fail();
    }
}

/// Serializes CTL jobs: at most one allocate/release on the wire per
/// device, preserving the single-owner CTL invariant the modem
/// enforces.
async fn ctl_loop(
    device: Weak<ProxyDevice>,
    mut jobs: mpsc::Receiver<CtlJob>,
    pool: Weak<DevicePool>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(device) = device.upgrade() else { break };
        device.run_ctl_job(job).await;

        // A ctl job finishing after the last session left is the other
        // edge where the device can become unreferenced.
        if device.is_idle() {
            if let Some(pool) = pool.upgrade() {
                let path = device.path().to_path_buf();
                drop(device);
                pool.release_if_idle(&path).await;
            }
        }
    }
}

/// The server's pool of proxied devices, one per canonical path.
pub struct DevicePool {
    opener: Box<dyn DeviceOpener>,
    devices: tokio::sync::Mutex<HashMap<PathBuf, Arc<ProxyDevice>>>,
    weak_self: Mutex<Weak<DevicePool>>,
}

impl DevicePool {
    /// Create a pool over the given opener.
    pub fn new(opener: Box<dyn DeviceOpener>) -> Arc<Self> {
        let pool = Arc::new(Self {
            opener,
            devices: tokio::sync::Mutex::new(HashMap::new()),
            weak_self: Mutex::new(Weak::new()),
        });
        *pool.weak_self() = Arc::downgrade(&pool);
        pool
    }

    fn weak_self(&self) -> MutexGuard<'_, Weak<DevicePool>> {
        match self.weak_self.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Look up the device on `canonical`, opening the underlying
    /// channel if no live device exists yet.
    pub async fn open_or_get(&self, canonical: &Path) -> Result<Arc<ProxyDevice>, ProxyError> {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get(canonical) {
            if device.is_alive() {
                return Ok(Arc::clone(device));
            }
            devices.remove(canonical);
        }

        let transport = self.opener.open(canonical).await.map_err(|e| {
            ProxyError::Transport(format!("opening {}: {e}", canonical.display()))
        })?;
        let weak = self.weak_self().clone();
        let device = ProxyDevice::spawn(canonical.to_path_buf(), transport, weak);
        devices.insert(canonical.to_path_buf(), Arc::clone(&device));
        tracing::info!(path = %canonical.display(), "device opened");
        Ok(device)
    }

    /// Close and drop the device on `path` if nothing references it:
    /// no session attached and no CTL transaction in flight. Disowned
    /// CIDs die with it.
    pub async fn release_if_idle(&self, path: &Path) {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get(path) {
            if device.is_idle() || !device.is_alive() {
                device.close();
                devices.remove(path);
                tracing::info!(path = %path.display(), "device closed");
            }
        }
    }

    /// Total sessions attached across all devices.
    pub async fn session_count(&self) -> usize {
        let devices = self.devices.lock().await;
        devices.values().map(|d| d.session_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_device() -> Arc<ProxyDevice> {
        let (outbound_tx, _outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (ctl_tx, _ctl_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (health_tx, _health_rx) = watch::channel(true);
        Arc::new(ProxyDevice {
            path: PathBuf::from("/dev/cdc-wdm0"),
            outbound: outbound_tx,
            ctl: ctl_tx,
            state: Mutex::new(DeviceState {
                sessions: HashMap::new(),
                owned: HashMap::new(),
                disowned: HashSet::new(),
                ctl_pending: None,
                ctl_jobs: 0,
                next_ctl_tid: 1,
                failed: false,
            }),
            shutdown: shutdown_tx,
            health: health_tx,
        })
    }

    fn session_sender() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        mpsc::channel(64)
    }

    #[tokio::test]
    async fn detach_moves_owned_cids_into_disowned_pool() {
        let device = test_device();
        let (tx, _rx) = session_sender();
        device.attach_session(1, tx).unwrap();
        device.state().owned.insert((2, 1), 1);

        device.detach_session(1);

        let state = device.state();
        assert!(state.owned.is_empty());
        assert!(state.disowned.contains(&(2, 1)));
    }

    #[tokio::test]
    async fn forward_reclaims_disowned_cids() {
        let device = test_device();
        let (tx, _rx) = session_sender();
        device.attach_session(7, tx).unwrap();
        device.state().disowned.insert((2, 1));

        let message = Message::request(Service::DMS, 1, 0x0025);
        device.forward(7, &message).await.unwrap();

        let state = device.state();
        assert_eq!(state.owned.get(&(2, 1)), Some(&7));
        assert!(state.disowned.is_empty());
    }

    #[tokio::test]
    async fn forward_adopts_untracked_cids() {
        let device = test_device();
        let (tx, _rx) = session_sender();
        device.attach_session(7, tx).unwrap();

        let message = Message::request(Service::DMS, 9, 0x0025);
        device.forward(7, &message).await.unwrap();

        assert_eq!(device.state().owned.get(&(2, 9)), Some(&7));
    }

    #[tokio::test]
    async fn forward_does_not_steal_owned_cids() {
        let device = test_device();
        let (tx1, _rx1) = session_sender();
        let (tx2, _rx2) = session_sender();
        device.attach_session(1, tx1).unwrap();
        device.attach_session(2, tx2).unwrap();
        device.state().owned.insert((2, 1), 1);

        let message = Message::request(Service::DMS, 1, 0x0025);
        device.forward(2, &message).await.unwrap();

        assert_eq!(device.state().owned.get(&(2, 1)), Some(&1));
    }

    #[tokio::test]
    async fn release_clears_owned_and_disowned_at_forward_time() {
        use qmux_core::ctl::release_cid_request;

        let device = test_device();
        device.state().owned.insert((2, 1), 1);
        device.state().disowned.insert((2, 2));
        device.state().ctl_jobs = 2;

        // The outbound receiver is gone in this fixture, so the job
        // fails on the wire; removal still happens at forward time.
        let request = release_cid_request(Service::DMS, 1).unwrap();
        device.run_ctl_job(CtlJob { session: 1, message: request }).await;
        let request = release_cid_request(Service::DMS, 2).unwrap();
        device.run_ctl_job(CtlJob { session: 1, message: request }).await;

        let state = device.state();
        assert!(state.owned.is_empty());
        assert!(state.disowned.is_empty());
    }

    #[tokio::test]
    async fn allocate_bookkeeping_records_the_owner() {
        use qmux_core::ctl::allocate_cid_request;

        let device = test_device();
        device.state().disowned.insert((2, 5));

        let request = allocate_cid_request(Service::DMS).unwrap();
        let mut response = Message::response(Service::CTL, 0, 1, MESSAGE_CTL_ALLOCATE_CID);
        response.push_success_result().unwrap();
        response
            .push_tlv(qmux_proto::Tlv::new(TLV_CTL_ALLOCATION_INFO, vec![0x02, 0x05]).unwrap())
            .unwrap();
        device.apply_ctl_bookkeeping(&CtlJob { session: 9, message: request }, &response);

        let state = device.state();
        assert_eq!(state.owned.get(&(2, 5)), Some(&9));
        assert!(state.disowned.is_empty());
    }

    #[tokio::test]
    async fn failed_device_rejects_sessions_and_forwards() {
        let device = test_device();
        device.fail();

        let (tx, _rx) = session_sender();
        assert!(device.attach_session(1, tx).is_err());
        let message = Message::request(Service::DMS, 1, 0x0025);
        assert!(device.forward(1, &message).await.is_err());
    }

    #[tokio::test]
    async fn indication_routing_honors_ownership_and_broadcast() {
        let device = test_device();
        let (tx1, mut rx1) = session_sender();
        let (tx2, mut rx2) = session_sender();
        device.attach_session(1, tx1).unwrap();
        device.attach_session(2, tx2).unwrap();
        device.state().owned.insert((2, 1), 1);
        device.state().owned.insert((2, 2), 2);

        // Targeted: only session 2.
        device.route_inbound(&Message::indication(Service::DMS, 2, 0x0100));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());

        // Broadcast: both, one copy each.
        device.route_inbound(&Message::indication(Service::DMS, BROADCAST_CID, 0x0101));
        assert!(rx1.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }
}
