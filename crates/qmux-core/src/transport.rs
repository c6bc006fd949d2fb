//! Transports: the byte channels beneath a device.
//!
//! A transport is anything that can carry QMUX frames in both
//! directions: the cdc-wdm character device itself, or a stream socket
//! to the proxy. The trait keeps the device loop independent of which
//! one it got, and lets tests substitute an in-memory duplex.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// A bidirectional byte channel carrying QMUX frames.
///
/// `send` must deliver the whole buffer or fail; `recv` appends
/// whatever the channel has ready onto `buf` and returns the byte
/// count, with zero meaning end-of-stream. Both are cancel-safe at
/// their await points: a cancelled `recv` has consumed nothing.
#[async_trait]
pub trait Transport: Send {
    /// Write one encoded frame to the channel.
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Read available bytes, appending to `buf`. Returns 0 at
    /// end-of-stream.
    async fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize>;
}

/// Character-device transport for cdc-wdm control channels.
///
/// The device is opened non-blocking and driven through readiness
/// notifications. Each read returns at most one kernel-buffered
/// message; the frame reader upstream handles coalescing and splits.
pub struct CdcWdmTransport {
    fd: AsyncFd<std::fs::File>,
}

impl CdcWdmTransport {
    /// Open the character device at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self { fd: AsyncFd::new(file)? })
    }
}

#[async_trait]
impl Transport for CdcWdmTransport {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let mut guard = self.fd.writable().await?;
            let attempt = guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(&bytes[written..])
            });
            match attempt {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {},
            }
        }
        Ok(())
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let mut chunk = [0u8; 4096];
            let attempt = guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(&mut chunk)
            });
            match attempt {
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                },
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => {},
            }
        }
    }
}

/// Transport over any async byte stream.
///
/// Wraps the proxy client's unix socket in production and
/// `tokio::io::duplex` halves in tests.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        self.stream.read_buf(buf).await
    }
}

/// Connect to an abstract-namespace unix socket.
///
/// The proxy listens on an abstract name (no filesystem node), which
/// tokio's path-based connect cannot address; we go through std's
/// abstract-name support and hand the socket to tokio afterwards.
pub async fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}
