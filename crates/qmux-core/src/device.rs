//! The Device: one transport, one read loop, transaction matching, CID
//! arbitration.
//!
//! A device runs a single I/O task that multiplexes a bounded outbound
//! queue against transport reads. Commands are submitted from any task;
//! each gets a fresh transaction id and a oneshot waiter parked in the
//! pending table until the matching response, the deadline, or device
//! failure. Indications fan out through an id-keyed subscriber table to
//! the clients entitled to see them.
//!
//! Failure semantics are deliberately blunt: a write error or a framing
//! error kills the device. Resync on a length-prefixed binary protocol
//! is unsafe, so every pending waiter is failed and the device goes to
//! `Closed`, where all further operations return `WrongState`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::BytesMut;
use qmux_proto::{BROADCAST_CID, FrameReader, Message, MessageType, Service, trace};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    client::Client,
    ctl::{self, ServiceVersion},
    error::DeviceError,
    transport::{CdcWdmTransport, StreamTransport, Transport, connect_abstract},
};

/// Default abstract socket name the proxy listens on.
pub const DEFAULT_PROXY_SOCKET: &str = "qmi-proxy";

/// Transaction id used for the proxy handshake. Chosen by the client;
/// nothing else is in flight on a fresh proxy socket.
const PROXY_OPEN_TID: u16 = 0xFF;

/// Depth of the bounded outbound queue between command submitters and
/// the writer lane. A full queue fails the command with `Backpressure`.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Per-client indication queue depth. A subscriber that stops draining
/// loses indications (with a diagnostic) rather than stalling the read
/// loop.
const INDICATION_QUEUE_DEPTH: usize = 16;

/// Flags for [`Device::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// No special behavior.
    pub const NONE: Self = Self(0);
    /// Reach the device through the proxy instead of opening the
    /// character device directly.
    pub const PROXY: Self = Self(1 << 0);
    /// Send a CTL SYNC after the channel is up, flushing stale modem
    /// state left by a previous owner.
    pub const SYNC: Self = Self(1 << 1);
    /// Probe the control service's version list after open.
    pub const VERSION_INFO: Self = Self(1 << 2);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Flags for [`Device::release_client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReleaseFlags(u8);

impl ReleaseFlags {
    /// Release the CID back to the modem (the default).
    pub const NONE: Self = Self(0);
    /// Leave the CID allocated so the next process can reclaim it
    /// through the proxy. Power-user flag.
    pub const NO_RELEASE_CID: Self = Self(1 << 0);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// How [`Device::allocate_client`] obtains its CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidAllocation {
    /// Run CTL ALLOCATE_CID and take whatever the modem grants.
    Automatic,
    /// Use a CID the caller asserts is already allocated — the proxy
    /// reclaim path after a client restart. No wire operation runs.
    Reclaim(u8),
}

/// Tunables for [`Device::open_with`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Abstract socket name of the proxy, for `OpenFlags::PROXY` opens.
    pub proxy_socket: String,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self { proxy_socket: DEFAULT_PROXY_SOCKET.to_string() }
    }
}

/// Lifecycle of a device. `Opening` exists only inside
/// [`Device::open`]; a `Device` value is first observable in `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

/// Waiter half of one pending transaction.
type CommandWaiter = oneshot::Receiver<Result<Message, DeviceError>>;

struct PendingTransaction {
    cid: u8,
    waiter: oneshot::Sender<Result<Message, DeviceError>>,
}

struct Subscriber {
    id: u64,
    service: Service,
    cid: u8,
    sender: mpsc::Sender<Message>,
}

impl Subscriber {
    /// Indication entitlement: exact (service, cid) match, a broadcast
    /// indication (cid 0xFF) to any client of the service, or a client
    /// registered at the broadcast cid seeing everything on its
    /// service.
    fn wants(&self, message: &Message) -> bool {
        self.service == message.service()
            && (self.cid == message.cid()
                || message.cid() == BROADCAST_CID
                || self.cid == BROADCAST_CID)
    }
}

struct Shared {
    state: State,
    /// Keyed by (service, transaction id); the stored cid completes the
    /// match.
    pending: HashMap<(u8, u16), PendingTransaction>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
    next_tid: u16,
    next_ctl_tid: u8,
    versions: Vec<ServiceVersion>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: State::Open,
            pending: HashMap::new(),
            subscribers: Vec::new(),
            next_subscriber_id: 1,
            next_tid: 1,
            next_ctl_tid: 1,
            versions: Vec::new(),
        }
    }
}

struct Inner {
    path: PathBuf,
    shared: Mutex<Shared>,
    outbound: mpsc::Sender<Vec<u8>>,
    /// Linearizes CTL allocate/release: at most one on the wire per
    /// device. Deployed firmwares misbehave under interleaved CTL.
    ctl_gate: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    /// The pending/subscriber tables are small and never held across an
    /// await; a poisoned lock just means a panicking test thread, and
    /// the state is still consistent.
    fn shared(&self) -> MutexGuard<'_, Shared> {
        match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn allocate_tid(shared: &mut Shared, service: Service) -> u16 {
        if service.is_ctl() {
            loop {
                let tid = shared.next_ctl_tid;
                shared.next_ctl_tid = shared.next_ctl_tid.wrapping_add(1);
                if tid != 0 && !shared.pending.contains_key(&(service.0, u16::from(tid))) {
                    return u16::from(tid);
                }
            }
        } else {
            loop {
                let tid = shared.next_tid;
                shared.next_tid = shared.next_tid.wrapping_add(1);
                if tid != 0 && !shared.pending.contains_key(&(service.0, tid)) {
                    return tid;
                }
            }
        }
    }

    /// Stamp a transaction id, freeze, encode, and park a waiter.
    fn begin_transaction(
        &self,
        mut message: Message,
    ) -> Result<(Vec<u8>, (u8, u16), CommandWaiter), DeviceError> {
        if !message.is_request() {
            return Err(DeviceError::WrongState("only requests carry transactions"));
        }

        let (tx, rx) = oneshot::channel();
        let service = message.service();
        let cid = message.cid();

        let mut shared = self.shared();
        if shared.state != State::Open {
            return Err(DeviceError::WrongState("device is not open"));
        }
        let tid = Self::allocate_tid(&mut shared, service);
        message.set_transaction_id(tid)?;
        message.freeze();
        let bytes = message.to_bytes()?;

        let key = (service.0, tid);
        shared.pending.insert(key, PendingTransaction { cid, waiter: tx });
        drop(shared);

        Ok((bytes, key, rx))
    }

    fn dispatch_response(&self, message: Message) {
        let key = (message.service().0, message.transaction_id());
        let mut shared = self.shared();
        match shared.pending.remove(&key) {
            Some(pending) if pending.cid == message.cid() => {
                drop(shared);
                let _ = pending.waiter.send(Ok(message));
            },
            Some(pending) => {
                // Same tid on a different cid is not our transaction.
                shared.pending.insert(key, pending);
                drop(shared);
                tracing::warn!(
                    service = %message.service(),
                    cid = message.cid(),
                    tid = message.transaction_id(),
                    "response cid does not match the pending transaction; dropped"
                );
            },
            None => {
                drop(shared);
                tracing::warn!(
                    service = %message.service(),
                    tid = message.transaction_id(),
                    "response matches no pending transaction; dropped"
                );
            },
        }
    }

    fn dispatch_indication(&self, message: &Message) {
        let targets: Vec<mpsc::Sender<Message>> = {
            let shared = self.shared();
            shared
                .subscribers
                .iter()
                .filter(|s| s.wants(message))
                .map(|s| s.sender.clone())
                .collect()
        };
        for sender in targets {
            if sender.try_send(message.clone()).is_err() {
                tracing::warn!(
                    service = %message.service(),
                    cid = message.cid(),
                    "indication queue full or receiver gone; dropped"
                );
            }
        }
    }

    /// Fatal failure: fail every waiter, detach every subscriber, move
    /// to `Closed`.
    fn fail(&self, error: &DeviceError) {
        let pending: Vec<PendingTransaction> = {
            let mut shared = self.shared();
            shared.state = State::Closed;
            shared.subscribers.clear();
            shared.pending.drain().map(|(_, p)| p).collect()
        };
        if !pending.is_empty() {
            tracing::warn!(path = %self.path.display(), %error, waiters = pending.len(), "device failed");
        }
        for p in pending {
            let _ = p.waiter.send(Err(error.clone()));
        }
    }
}

/// Removes the pending entry unless the transaction reached a terminal
/// state first. Dropping a command future mid-flight (caller
/// cancellation) prunes its waiter here; a response that lands later is
/// dropped by the dispatcher with a diagnostic.
struct TransactionGuard<'a> {
    inner: &'a Inner,
    key: (u8, u16),
    armed: bool,
}

impl TransactionGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.shared().pending.remove(&self.key);
        }
    }
}

/// Handle to one open QMUX channel.
///
/// Cloning is cheap; clones share the channel. The device is destroyed
/// when the last clone (and the last [`Client`] holding one) drops.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl Device {
    /// Open the channel at `path` and return a ready device.
    ///
    /// With [`OpenFlags::PROXY`], connects to the proxy's abstract
    /// socket and performs the handshake naming `path`; the proxy owns
    /// the actual character device. Without it, opens `path` directly.
    ///
    /// The timeout covers the whole open sequence, including the
    /// optional SYNC and version probe.
    pub async fn open(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        Self::open_with(path, flags, DeviceOptions::default(), timeout).await
    }

    /// [`Device::open`] with explicit options.
    pub async fn open_with(
        path: impl AsRef<Path>,
        flags: OpenFlags,
        options: DeviceOptions,
        timeout: Duration,
    ) -> Result<Self, DeviceError> {
        tokio::time::timeout(timeout, Self::open_inner(path.as_ref(), flags, options))
            .await
            .map_err(|_| DeviceError::Timeout)?
    }

    async fn open_inner(
        path: &Path,
        flags: OpenFlags,
        options: DeviceOptions,
    ) -> Result<Self, DeviceError> {
        let mut reader = FrameReader::new();

        let transport: Box<dyn Transport> = if flags.contains(OpenFlags::PROXY) {
            let stream = connect_abstract(&options.proxy_socket)
                .await
                .map_err(|e| DeviceError::from_open(&e))?;
            let mut transport = StreamTransport::new(stream);
            proxy_handshake(&mut transport, path, &mut reader).await?;
            Box::new(transport)
        } else {
            Box::new(CdcWdmTransport::open(path).map_err(|e| DeviceError::from_open(&e))?)
        };

        let device = Self::spawn(path.to_path_buf(), transport, reader);

        if flags.contains(OpenFlags::SYNC) {
            device.sync(Duration::from_secs(5)).await?;
        }
        if flags.contains(OpenFlags::VERSION_INFO) {
            device.load_version_info(Duration::from_secs(5)).await?;
        }

        Ok(device)
    }

    /// Build a device over an already-connected transport.
    ///
    /// No handshake runs; the transport must already carry raw QMUX.
    /// This is the seam for custom channels and for tests that stand in
    /// for a modem with an in-memory duplex.
    #[must_use]
    pub fn from_transport(path: impl Into<PathBuf>, transport: Box<dyn Transport>) -> Self {
        Self::spawn(path.into(), transport, FrameReader::new())
    }

    fn spawn(path: PathBuf, transport: Box<dyn Transport>, reader: FrameReader) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            path,
            shared: Mutex::new(Shared::new()),
            outbound: outbound_tx,
            ctl_gate: tokio::sync::Mutex::new(()),
            shutdown: shutdown_tx,
        });
        tokio::spawn(io_loop(Arc::downgrade(&inner), transport, outbound_rx, shutdown_rx, reader));
        Self { inner }
    }

    /// The path this device was opened on.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Whether the device is still serving commands.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.shared().state == State::Open
    }

    /// Send a request and await its matching response.
    ///
    /// The message gets a fresh transaction id and is frozen. A
    /// response matches on (service, cid, transaction id). Dropping the
    /// returned future withdraws the transaction; a response arriving
    /// after the deadline or after withdrawal is dropped with a
    /// diagnostic.
    pub async fn command(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, DeviceError> {
        let (bytes, key, rx) = self.inner.begin_transaction(message)?;
        let mut guard = TransactionGuard { inner: &self.inner, key, armed: true };

        match self.inner.outbound.try_send(bytes) {
            Ok(()) => {},
            Err(mpsc::error::TrySendError::Full(_)) => return Err(DeviceError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(DeviceError::WrongState("device is closed"));
            },
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            },
            Ok(Err(_closed)) => {
                guard.disarm();
                Err(DeviceError::TransportLost("device shut down".to_string()))
            },
            Err(_elapsed) => {
                tracing::warn!(service = key.0, tid = key.1, "command timed out");
                Err(DeviceError::Timeout)
            },
        }
    }

    /// Allocate a per-service client.
    ///
    /// `CidAllocation::Automatic` runs CTL ALLOCATE_CID (serialized per
    /// device). `CidAllocation::Reclaim` skips the wire entirely for a
    /// CID the caller asserts is already owned — how a restarted
    /// process picks its CIDs back up through the proxy.
    pub async fn allocate_client(
        &self,
        service: Service,
        allocation: CidAllocation,
        timeout: Duration,
    ) -> Result<Client, DeviceError> {
        if service.is_ctl() {
            return Err(DeviceError::Unsupported("the control service has no allocatable cids"));
        }

        let cid = match allocation {
            CidAllocation::Reclaim(0) => {
                return Err(DeviceError::Unsupported("reclaim requires a concrete cid"));
            },
            CidAllocation::Reclaim(cid) => cid,
            CidAllocation::Automatic => {
                let _gate = self.inner.ctl_gate.lock().await;
                let response = self.command(ctl::allocate_cid_request(service)?, timeout).await?;
                ctl::check_result(&response)?;
                let (granted, cid) = ctl::parse_allocation_info(&response)?;
                if granted != service {
                    tracing::warn!(
                        requested = %service,
                        granted = %granted,
                        "modem granted a cid for a different service"
                    );
                }
                cid
            },
        };

        let (id, rx) = self.register_subscriber(service, cid)?;
        tracing::debug!(service = %service, cid, "client allocated");
        Ok(Client::new(self.clone(), service, cid, id, rx))
    }

    /// Release a client.
    ///
    /// Sends CTL RELEASE_CID unless `NO_RELEASE_CID` is set, in which
    /// case the CID stays allocated for the next process to reclaim.
    pub async fn release_client(
        &self,
        client: Client,
        flags: ReleaseFlags,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let service = client.service();
        let cid = client.cid();
        // Dropping the handle detaches its indication subscription.
        drop(client);

        if flags.contains(ReleaseFlags::NO_RELEASE_CID) {
            tracing::debug!(service = %service, cid, "client released, cid left allocated");
            return Ok(());
        }

        let _gate = self.inner.ctl_gate.lock().await;
        let response = self.command(ctl::release_cid_request(service, cid)?, timeout).await?;
        ctl::check_result(&response)?;
        tracing::debug!(service = %service, cid, "cid released");
        Ok(())
    }

    /// CTL SYNC: tell the modem to drop state left by a previous owner.
    pub async fn sync(&self, timeout: Duration) -> Result<(), DeviceError> {
        let _gate = self.inner.ctl_gate.lock().await;
        let response = self.command(ctl::sync_request(), timeout).await?;
        ctl::check_result(&response)
    }

    /// Fetch and cache the control service's per-service version list.
    pub async fn load_version_info(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ServiceVersion>, DeviceError> {
        let _gate = self.inner.ctl_gate.lock().await;
        let response = self.command(ctl::version_info_request(), timeout).await?;
        ctl::check_result(&response)?;
        let versions = ctl::parse_version_list(&response)?;
        self.inner.shared().versions = versions.clone();
        Ok(versions)
    }

    /// Cached version entry for a service, if the probe ran.
    #[must_use]
    pub fn version_of(&self, service: Service) -> Option<ServiceVersion> {
        self.inner.shared().versions.iter().copied().find(|v| v.service == service)
    }

    /// Close the device.
    ///
    /// Refuses new commands immediately, waits up to `timeout` for
    /// in-flight transactions to drain, then forcibly fails survivors
    /// with `Cancelled` and releases the channel. Close itself cannot
    /// be cancelled; it runs to completion or to its deadline.
    pub async fn close(&self, timeout: Duration) -> Result<(), DeviceError> {
        {
            let mut shared = self.inner.shared();
            match shared.state {
                State::Open => shared.state = State::Closing,
                State::Closing => return Err(DeviceError::WrongState("device is closing")),
                State::Closed => return Err(DeviceError::WrongState("device is closed")),
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.shared().pending.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let survivors: Vec<PendingTransaction> = {
            let mut shared = self.inner.shared();
            shared.state = State::Closed;
            shared.subscribers.clear();
            shared.pending.drain().map(|(_, p)| p).collect()
        };
        let survivor_count = survivors.len();
        for p in survivors {
            let _ = p.waiter.send(Err(DeviceError::Cancelled));
        }
        if survivor_count > 0 {
            tracing::warn!(
                path = %self.inner.path.display(),
                survivors = survivor_count,
                "close deadline hit with transactions in flight"
            );
        }

        let _ = self.inner.shutdown.send(true);
        Ok(())
    }

    fn register_subscriber(
        &self,
        service: Service,
        cid: u8,
    ) -> Result<(u64, mpsc::Receiver<Message>), DeviceError> {
        let mut shared = self.inner.shared();
        if shared.state != State::Open {
            return Err(DeviceError::WrongState("device is not open"));
        }
        let (tx, rx) = mpsc::channel(INDICATION_QUEUE_DEPTH);
        let id = shared.next_subscriber_id;
        shared.next_subscriber_id += 1;
        shared.subscribers.push(Subscriber { id, service, cid, sender: tx });
        Ok((id, rx))
    }

    pub(crate) fn deregister_subscriber(&self, id: u64) {
        self.inner.shared().subscribers.retain(|s| s.id != id);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared();
        f.debug_struct("Device")
            .field("path", &self.inner.path)
            .field("state", &shared.state)
            .field("pending", &shared.pending.len())
            .field("subscribers", &shared.subscribers.len())
            .finish()
    }
}

/// Whether `QMUX_TRACE` is set: hex-dump every frame at debug level.
fn frame_tracing_enabled() -> bool {
    std::env::var_os("QMUX_TRACE").is_some()
}

async fn io_loop(
    inner: Weak<Inner>,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    mut reader: FrameReader,
) {
    let tracing_frames = frame_tracing_enabled();
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        tokio::select! {
            // Fires on close() and when the last device handle drops.
            _ = shutdown.changed() => break,

            queued = outbound.recv() => {
                let Some(bytes) = queued else { break };
                if tracing_frames {
                    tracing::debug!(direction = "sent", frame = %trace::str_hex(&bytes, ':'));
                }
                if let Err(e) = transport.send(&bytes).await {
                    fail_weak(&inner, &DeviceError::from_io(&e));
                    break;
                }
            },

            read = transport.recv(&mut buf) => {
                match read {
                    Ok(0) => {
                        fail_weak(&inner, &DeviceError::TransportLost("end of stream".to_string()));
                        break;
                    },
                    Ok(_) => {
                        let chunk = buf.split();
                        if tracing_frames {
                            tracing::debug!(direction = "received", frame = %trace::str_hex(&chunk, ':'));
                        }
                        if let Err(e) = pump(&inner, &mut reader, &chunk) {
                            fail_weak(&inner, &DeviceError::Framing(e));
                            break;
                        }
                    },
                    Err(e) => {
                        fail_weak(&inner, &DeviceError::from_io(&e));
                        break;
                    },
                }
            },
        }
    }
}

/// Feed a chunk through the reassembler and route every complete frame.
fn pump(
    inner: &Weak<Inner>,
    reader: &mut FrameReader,
    chunk: &[u8],
) -> Result<(), qmux_proto::FrameError> {
    reader.extend(chunk)?;
    while let Some(frame) = reader.next_frame()? {
        let Some(inner) = inner.upgrade() else { return Ok(()) };
        let message = Message::from_frame(frame);
        match message.message_type() {
            MessageType::Indication => inner.dispatch_indication(&message),
            MessageType::Response => inner.dispatch_response(message),
            MessageType::Request => {
                tracing::warn!(
                    service = %message.service(),
                    message_id = message.message_id(),
                    "unexpected request from the wire; dropped"
                );
            },
        }
    }
    Ok(())
}

fn fail_weak(inner: &Weak<Inner>, error: &DeviceError) {
    if let Some(inner) = inner.upgrade() {
        inner.fail(error);
    }
}

/// Client side of the proxy handshake: send the internal open request
/// naming the device path, wait for a successful result.
async fn proxy_handshake(
    transport: &mut StreamTransport<UnixStream>,
    path: &Path,
    reader: &mut FrameReader,
) -> Result<(), DeviceError> {
    let mut request = ctl::internal_proxy_open_request(path)?;
    request.set_transaction_id(PROXY_OPEN_TID)?;
    request.freeze();
    transport.send(&request.to_bytes()?).await.map_err(|e| DeviceError::from_io(&e))?;

    let mut buf = BytesMut::with_capacity(256);
    loop {
        let n = transport.recv(&mut buf).await.map_err(|e| DeviceError::from_io(&e))?;
        if n == 0 {
            // The proxy's credential gate closes the connection before
            // reading any bytes.
            return Err(DeviceError::Permission("proxy rejected the connection".to_string()));
        }
        let chunk = buf.split();
        reader.extend(&chunk).map_err(DeviceError::Framing)?;
        while let Some(frame) = reader.next_frame().map_err(DeviceError::Framing)? {
            let message = Message::from_frame(frame);
            if message.service().is_ctl()
                && message.message_id() == ctl::MESSAGE_CTL_INTERNAL_PROXY_OPEN
                && message.is_response()
            {
                return ctl::check_result(&message);
            }
            tracing::debug!(
                message_id = message.message_id(),
                "unexpected frame before handshake response; ignored"
            );
        }
    }
}
