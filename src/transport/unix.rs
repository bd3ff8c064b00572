//! Unix domain socket transport.
//!
//! [`UnixSocket`] routes all I/O through `tokio::net::UnixStream`; there is no
//! network stack underneath, so there is nothing to bind and no socket options
//! beyond the read and write timeouts. [`UnixTransport`] is the [`tower::Service`]
//! that dials a socket path for the client's connection layer.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{trace, Instrument};

use super::{not_connected, unsupported, Deadline, Endpoint, Socket, SocketOption, SocketTimeout};
use crate::BoxFuture;

/// A connected unix domain socket with read and write timeouts.
pub struct UnixSocket {
    stream: Option<tokio::net::UnixStream>,
    path: Utf8PathBuf,
    read: Deadline,
    write: Deadline,
    input_shutdown: bool,
}

impl fmt::Debug for UnixSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnixSocket")
            .field("path", &self.path)
            .field("closed", &self.stream.is_none())
            .field("read_timeout", &self.read.timeout())
            .finish()
    }
}

impl UnixSocket {
    /// Connect to the socket at `path`, giving up after `timeout`.
    pub async fn connect(
        path: impl AsRef<Utf8Path>,
        timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let path = path.as_ref();
        let connecting = tokio::net::UnixStream::connect(path.as_std_path());

        let stream = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| io::Error::from(SocketTimeout::Connect))??,
            None => connecting.await?,
        };

        trace!(%path, "unix socket connected");
        Ok(Self::new(stream, path.to_owned()))
    }

    /// Wrap an already connected stream.
    pub fn new(stream: tokio::net::UnixStream, path: Utf8PathBuf) -> Self {
        Self {
            stream: Some(stream),
            path,
            read: Deadline::new(SocketTimeout::Read),
            write: Deadline::new(SocketTimeout::Write),
            input_shutdown: false,
        }
    }

    /// The path this socket was connected to.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn stream(&mut self) -> io::Result<&mut tokio::net::UnixStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Socket for UnixSocket {
    fn set_option(&mut self, option: SocketOption) -> io::Result<()> {
        match option {
            SocketOption::ReadTimeout(timeout) => self.read.set_timeout(timeout),
            SocketOption::WriteTimeout(timeout) => self.write.set_timeout(timeout),
            other => return Err(unsupported(&format!("{other:?}"))),
        }
        Ok(())
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.read.timeout()
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.write.timeout()
    }

    fn shutdown_input(&mut self) -> io::Result<()> {
        self.stream()?;
        self.input_shutdown = true;
        Ok(())
    }

    fn is_input_shutdown(&self) -> bool {
        self.input_shutdown
    }

    fn close(&mut self) -> io::Result<()> {
        if self.stream.take().is_some() {
            trace!(path = %self.path, "unix socket closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl AsyncRead for UnixSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.input_shutdown {
            return Poll::Ready(Ok(()));
        }
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        this.read.poll_read(stream, cx, buf)
    }
}

impl AsyncWrite for UnixSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        this.write.poll_write(stream, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        let Some(stream) = this.stream.as_mut() else {
            return Poll::Ready(Err(not_connected()));
        };
        this.write.poll_flush(stream, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Configuration for unix socket connections.
#[derive(Debug, Clone, Default)]
pub struct UnixTransportConfig {
    /// How long to wait for the socket to accept the connection.
    pub connect_timeout: Option<Duration>,

    /// Read timeout applied to every new socket.
    pub read_timeout: Option<Duration>,
}

/// Transport which dials [`Endpoint::Unix`] addresses.
#[derive(Debug, Clone, Default)]
pub struct UnixTransport {
    config: Arc<UnixTransportConfig>,
}

impl UnixTransport {
    /// Create a new unix transport.
    pub fn new(config: UnixTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &UnixTransportConfig {
        &self.config
    }
}

impl tower::Service<Endpoint> for UnixTransport {
    type Response = UnixSocket;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<UnixSocket, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let Endpoint::Unix(path) = endpoint else {
            let error = io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unix transport cannot connect to {endpoint}"),
            );
            return Box::pin(std::future::ready(Err(error)));
        };

        let config = self.config.clone();
        let span = tracing::trace_span!("unix", path = %path);
        Box::pin(
            async move {
                let mut socket = UnixSocket::connect(&path, config.connect_timeout).await?;
                socket.set_read_timeout(config.read_timeout)?;
                Ok(socket)
            }
            .instrument(span),
        )
    }
}
