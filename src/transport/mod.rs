//! Transports for reaching the engine.
//!
//! A transport is a [`tower::Service`] which accepts an [`Endpoint`] and returns a
//! connected, bidirectional stream. Three are provided:
//! - [`UnixTransport`](unix::UnixTransport): unix domain sockets.
//! - `npipe::NamedPipeTransport`: windows named pipes, only built on windows.
//! - [`TcpTransport`](tcp::TcpTransport): TCP, optionally wrapped in TLS.
//!
//! The local adapters implement [`Socket`], the small set of socket-like
//! operations (timeouts, half-close, close) the client relies on. Operations
//! that only make sense for network sockets, such as `bind`, are rejected.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use camino::Utf8PathBuf;
use pin_project::pin_project;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::Service;

pub mod npipe;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
mod timeout;
pub mod unix;

pub(crate) use self::timeout::Deadline;
use self::npipe::PipeName;

/// The address a transport should connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A unix domain socket path.
    Unix(Utf8PathBuf),

    /// A TCP host and port.
    Tcp {
        /// Host name or IP address.
        host: Box<str>,
        /// Port number.
        port: u16,
    },

    /// A windows named pipe.
    NamedPipe(PipeName),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{path}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::NamedPipe(name) => write!(f, "npipe://{}", name.as_str().replace('\\', "/")),
        }
    }
}

/// A socket operation did not complete in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum SocketTimeout {
    /// Establishing the connection timed out.
    #[error("connect timed out")]
    Connect,

    /// No data arrived within the read timeout.
    #[error("read timed out")]
    Read,

    /// The peer did not accept data within the write timeout.
    #[error("write timed out")]
    Write,
}

impl From<SocketTimeout> for io::Error {
    fn from(timeout: SocketTimeout) -> Self {
        io::Error::new(io::ErrorKind::TimedOut, timeout)
    }
}

/// Socket options which may be set on a transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketOption {
    /// Timeout for each read. `None` waits forever.
    ReadTimeout(Option<Duration>),

    /// Timeout for each write. `None` waits forever.
    WriteTimeout(Option<Duration>),

    /// Disable Nagle's algorithm.
    NoDelay(bool),

    /// TCP keepalive interval.
    KeepAlive(Option<Duration>),

    /// Linger on close.
    Linger(Option<Duration>),

    /// Send buffer size.
    SendBufferSize(usize),

    /// Receive buffer size.
    ReceiveBufferSize(usize),
}

pub(crate) fn unsupported(operation: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{operation} is not supported by this socket"),
    )
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

/// Socket-like operations shared by the local transports.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {
    /// Set a socket option. Options the transport does not understand are rejected
    /// with [`io::ErrorKind::Unsupported`].
    fn set_option(&mut self, option: SocketOption) -> io::Result<()>;

    /// Current read timeout.
    fn read_timeout(&self) -> Option<Duration>;

    /// Current write timeout.
    fn write_timeout(&self) -> Option<Duration>;

    /// Set the read timeout.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_option(SocketOption::ReadTimeout(timeout))
    }

    /// Set the write timeout.
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_option(SocketOption::WriteTimeout(timeout))
    }

    /// Stop reading: every later read returns end-of-stream. Writing is unaffected.
    fn shutdown_input(&mut self) -> io::Result<()>;

    /// Has the input half been shut down?
    fn is_input_shutdown(&self) -> bool;

    /// Close the socket. Later reads and writes fail with [`io::ErrorKind::NotConnected`].
    ///
    /// Closing twice is not an error.
    fn close(&mut self) -> io::Result<()>;

    /// Has the socket been closed?
    fn is_closed(&self) -> bool;

    /// Local sockets have no local address to bind.
    fn bind(&mut self, _local: std::net::SocketAddr) -> io::Result<()> {
        Err(unsupported("bind"))
    }
}

/// A service which connects to an [`Endpoint`].
///
/// This is implemented for every [`tower::Service`] with a suitable signature.
pub trait Transport: Clone + Send + Sync + 'static {
    /// The connected stream type.
    type IO: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Error returned when connecting fails.
    type Error: Into<crate::BoxError>;

    /// Future returned by [`connect`](Transport::connect).
    type Future: Future<Output = Result<Self::IO, <Self as Transport>::Error>> + Send + 'static;

    /// Connect to the endpoint.
    fn connect(&mut self, endpoint: Endpoint) -> <Self as Transport>::Future;

    /// Poll the transport to see if it is ready to accept a new connection.
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Transport>::Error>>;
}

impl<T, IO> Transport for T
where
    T: Service<Endpoint, Response = IO>,
    T: Clone + Send + Sync + 'static,
    T::Error: Into<crate::BoxError>,
    T::Future: Send + 'static,
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type IO = IO;
    type Error = T::Error;
    type Future = T::Future;

    fn connect(&mut self, endpoint: Endpoint) -> <Self as Service<Endpoint>>::Future {
        self.call(endpoint)
    }

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Service<Endpoint>>::Error>> {
        Service::poll_ready(self, cx)
    }
}

#[derive(Debug)]
#[pin_project(project = DockerStreamProjection)]
enum DockerStreamCore {
    Unix(#[pin] unix::UnixSocket),

    Tcp(#[pin] tokio::net::TcpStream),

    #[cfg(feature = "tls")]
    Tls(#[pin] Box<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>),

    #[cfg(windows)]
    NamedPipe(#[pin] npipe::NamedPipeSocket<npipe::PlatformPipe>),
}

/// Dispatching wrapper over the stream types the built-in transports produce.
#[derive(Debug)]
#[pin_project]
pub struct DockerStream {
    #[pin]
    inner: DockerStreamCore,
}

macro_rules! dispatch_core {
    (pin $stream:ident.$method:ident($($args:expr),*)) => {
        match $stream.project().inner.project() {
            DockerStreamProjection::Unix(stream) => stream.$method($($args),*),
            DockerStreamProjection::Tcp(stream) => stream.$method($($args),*),
            #[cfg(feature = "tls")]
            DockerStreamProjection::Tls(stream) => stream.$method($($args),*),
            #[cfg(windows)]
            DockerStreamProjection::NamedPipe(stream) => stream.$method($($args),*),
        }
    };
}

impl DockerStream {
    /// Apply the read timeout. Only local transports carry read timeouts; for TCP
    /// this is a no-op.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match &mut self.inner {
            DockerStreamCore::Unix(socket) => socket.set_read_timeout(timeout),
            #[cfg(windows)]
            DockerStreamCore::NamedPipe(socket) => socket.set_read_timeout(timeout),
            _ => {
                tracing::trace!("read timeout ignored for tcp stream");
                Ok(())
            }
        }
    }

    /// Name of the transport carrying this stream.
    pub fn transport(&self) -> &'static str {
        match &self.inner {
            DockerStreamCore::Unix(_) => "unix",
            DockerStreamCore::Tcp(_) => "tcp",
            #[cfg(feature = "tls")]
            DockerStreamCore::Tls(_) => "tls",
            #[cfg(windows)]
            DockerStreamCore::NamedPipe(_) => "npipe",
        }
    }
}

impl AsyncRead for DockerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch_core!(pin self.poll_read(cx, buf))
    }
}

impl AsyncWrite for DockerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        dispatch_core!(pin self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch_core!(pin self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        dispatch_core!(pin self.poll_shutdown(cx))
    }
}

impl From<unix::UnixSocket> for DockerStream {
    fn from(stream: unix::UnixSocket) -> Self {
        Self {
            inner: DockerStreamCore::Unix(stream),
        }
    }
}

impl From<tokio::net::TcpStream> for DockerStream {
    fn from(stream: tokio::net::TcpStream) -> Self {
        Self {
            inner: DockerStreamCore::Tcp(stream),
        }
    }
}

#[cfg(feature = "tls")]
impl From<tokio_rustls::client::TlsStream<tokio::net::TcpStream>> for DockerStream {
    fn from(stream: tokio_rustls::client::TlsStream<tokio::net::TcpStream>) -> Self {
        Self {
            inner: DockerStreamCore::Tls(Box::new(stream)),
        }
    }
}

#[cfg(windows)]
impl From<npipe::NamedPipeSocket<npipe::PlatformPipe>> for DockerStream {
    fn from(stream: npipe::NamedPipeSocket<npipe::PlatformPipe>) -> Self {
        Self {
            inner: DockerStreamCore::NamedPipe(stream),
        }
    }
}
