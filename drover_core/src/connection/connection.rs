//! This module provides an abstraction over TCP and Unix-domain streams using Tokio.
//!
//! The `Connection` enum encapsulates either a TCP stream or a Unix socket
//! stream. Application worker processes listen on either kind of endpoint, so
//! consumers of this module can proxy to a worker without caring which one it
//! chose at spawn time.
//!
//! By separating the connection from buffering, users of this module can choose
//! to apply buffering (e.g., via `tokio::io::BufReader` or `tokio::io::BufWriter`)
//! as necessary in their application.

use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};

use super::fdlog;

/// Represents a stream which is either a TCP connection or a Unix-domain
/// socket connection.
pub enum Connection {
    /// A TCP connection.
    Tcp(TcpStream),
    /// A Unix-domain socket connection.
    Unix(UnixStream),
}

impl Connection {
    /// Wraps an accepted or connected TCP stream, registering it with the
    /// fd-lifecycle log.
    ///
    /// # Arguments
    ///
    /// * `stream` - A `TcpStream` representing the underlying connection.
    /// * `purpose` - Short human-readable tag recorded in the fd audit log.
    pub fn new_tcp(stream: TcpStream, purpose: &str) -> Self {
        fdlog::log_open(stream.as_raw_fd(), purpose);
        Connection::Tcp(stream)
    }

    /// Wraps a connected Unix-domain stream, registering it with the
    /// fd-lifecycle log.
    pub fn new_unix(stream: UnixStream, purpose: &str) -> Self {
        fdlog::log_open(stream.as_raw_fd(), purpose);
        Connection::Unix(stream)
    }

    /// The raw descriptor underneath, for audit logging.
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Connection::Tcp(stream) => stream.as_raw_fd(),
            Connection::Unix(stream) => stream.as_raw_fd(),
        }
    }

    /// The credentials of the peer process, when the underlying transport
    /// carries them (Unix sockets only).
    pub fn peer_uid(&self) -> Option<u32> {
        match self {
            Connection::Tcp(_) => None,
            Connection::Unix(stream) => stream.peer_cred().ok().map(|cred| cred.uid()),
        }
    }

    /// Splits the connection into separate read and write halves.
    ///
    /// Note: This uses `tokio::io::split` to separate the underlying stream.
    /// The returned halves can be used concurrently in separate tasks. The
    /// descriptor is logged as closed when both halves have been dropped.
    pub fn split(self) -> (ReadHalf<Self>, WriteHalf<Self>) {
        io::split(self)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        fdlog::log_close(self.raw_fd());
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    /// Shuts down the write direction only. This is the half-close signal the
    /// session worker protocol uses to mark end-of-request.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
