//! One accepted client connection: handshake, then frame service.
//!
//! The wire a session speaks is plain QMUX with one addition: its first
//! frame must be the proxy-internal open request (service 0, message
//! 0xFF00) naming the device path. After a successful handshake, every
//! control frame is intercepted onto the device's serialized CTL lane
//! and everything else passes through with ownership bookkeeping.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::BytesMut;
use qmux_core::ctl::{MESSAGE_CTL_INTERNAL_PROXY_OPEN, TLV_PROXY_OPEN_PATH};
use qmux_proto::{FrameReader, Message, QmiProtocolError, Service, StringPrefix};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::{
    error::ProxyError,
    pool::{DevicePool, ProxyDevice, SessionId},
};

/// Depth of the session's outbound queue; the writer task drains it.
const SESSION_QUEUE_DEPTH: usize = 64;

/// Serve one accepted connection until it disconnects or errors.
pub(crate) async fn run_session(
    stream: UnixStream,
    session_id: SessionId,
    pool: Arc<DevicePool>,
) -> Result<(), ProxyError> {
    let (read_half, write_half) = stream.into_split();
    let (to_session, from_device) = mpsc::channel::<Vec<u8>>(SESSION_QUEUE_DEPTH);
    let writer = tokio::spawn(writer_loop(write_half, from_device));

    let mut reader = SessionReader::new(read_half);

    let result = serve(&mut reader, session_id, &pool, &to_session).await;

    // Writer drains whatever is queued (a handshake error reply, a
    // final response) once the channel closes.
    drop(to_session);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    result
}

async fn serve(
    reader: &mut SessionReader,
    session_id: SessionId,
    pool: &Arc<DevicePool>,
    to_session: &mpsc::Sender<Vec<u8>>,
) -> Result<(), ProxyError> {
    let device = handshake(reader, session_id, pool, to_session).await?;
    device.attach_session(session_id, to_session.clone())?;

    let served = serve_frames(reader, session_id, &device).await;

    device.detach_session(session_id);
    pool.release_if_idle(device.path()).await;
    tracing::info!(session = session_id, "session closed");
    served
}

/// Read the internal open request, resolve its path, and bind the
/// session to a pooled device. Replies on the session socket either
/// way, reusing the request's transaction id.
async fn handshake(
    reader: &mut SessionReader,
    session_id: SessionId,
    pool: &Arc<DevicePool>,
    to_session: &mpsc::Sender<Vec<u8>>,
) -> Result<Arc<ProxyDevice>, ProxyError> {
    let Some(message) = reader.next_message().await? else {
        return Err(ProxyError::Transport("session closed before handshake".to_string()));
    };

    if !message.service().is_ctl()
        || !message.is_request()
        || message.message_id() != MESSAGE_CTL_INTERNAL_PROXY_OPEN
    {
        return Err(ProxyError::Protocol(format!(
            "expected proxy open request, got service {} message {:#06x}",
            message.service(),
            message.message_id()
        )));
    }
    let tid = message.transaction_id();

    let opened = open_requested_device(&message, pool).await;

    let mut reply = Message::response(Service::CTL, 0, tid, MESSAGE_CTL_INTERNAL_PROXY_OPEN);
    match &opened {
        Ok(_) => reply.push_success_result()?,
        Err(_) => reply.push_error_result(QmiProtocolError::Internal)?,
    }
    if to_session.send(reply.to_bytes()?).await.is_err() {
        return Err(ProxyError::Transport("session closed during handshake".to_string()));
    }

    let device = opened?;
    tracing::info!(
        session = session_id,
        path = %device.path().display(),
        "session handshake complete"
    );
    Ok(device)
}

async fn open_requested_device(
    message: &Message,
    pool: &Arc<DevicePool>,
) -> Result<Arc<ProxyDevice>, ProxyError> {
    let path = message
        .tlv_required(TLV_PROXY_OPEN_PATH)
        .and_then(|tlv| tlv.read_string(StringPrefix::None))
        .map_err(|e| ProxyError::Protocol(format!("bad device path tlv: {e}")))?;
    // Paths arrive NUL-padded from some clients.
    let path = PathBuf::from(path.trim_end_matches('\0'));

    // Resolve symlinks so two names for one device share one Device.
    let canonical = tokio::fs::canonicalize(&path)
        .await
        .map_err(|e| ProxyError::Config(format!("cannot resolve {}: {e}", path.display())))?;

    pool.open_or_get(&canonical).await
}

/// Post-handshake frame loop. Ends on client disconnect, on a session
/// error, or as soon as the device beneath it fails.
async fn serve_frames(
    reader: &mut SessionReader,
    session_id: SessionId,
    device: &Arc<ProxyDevice>,
) -> Result<(), ProxyError> {
    let mut health = device.health_watch();
    if !*health.borrow() {
        return Err(ProxyError::Transport("device failed".to_string()));
    }
    loop {
        let message = tokio::select! {
            message = reader.next_message() => message?,
            _ = health.changed() => {
                return Err(ProxyError::Transport("device failed".to_string()));
            },
        };
        let Some(message) = message else {
            return Ok(());
        };

        if message.service().is_ctl() {
            if message.message_id() == MESSAGE_CTL_INTERNAL_PROXY_OPEN {
                return Err(ProxyError::Protocol("repeated proxy open request".to_string()));
            }
            device.submit_ctl(session_id, message).await?;
        } else {
            device.forward(session_id, &message).await?;
        }
    }
}

/// Frame-at-a-time reader over the session socket.
struct SessionReader {
    half: OwnedReadHalf,
    reader: FrameReader,
    buf: BytesMut,
}

impl SessionReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self { half, reader: FrameReader::new(), buf: BytesMut::with_capacity(8192) }
    }

    /// Next frame, or `None` on clean disconnect.
    async fn next_message(&mut self) -> Result<Option<Message>, ProxyError> {
        loop {
            if let Some(frame) = self.reader.next_frame()? {
                return Ok(Some(Message::from_frame(frame)));
            }
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            let chunk = self.buf.split();
            self.reader.extend(&chunk)?;
        }
    }
}

async fn writer_loop(mut half: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(bytes) = frames.recv().await {
        if let Err(e) = half.write_all(&bytes).await {
            tracing::debug!(error = %e, "session write failed");
            break;
        }
    }
}
