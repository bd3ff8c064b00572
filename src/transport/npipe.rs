//! Windows named pipe transport.
//!
//! Named pipes are handles, not sockets: there is no address to bind, no file
//! cursor to seek, and no half-close in the protocol itself. [`NamedPipeSocket`]
//! layers those socket semantics on top of any asynchronous pipe handle. Every
//! read and write is issued against the handle's current position, and each one
//! is awaited against its own deadline.
//!
//! On Windows the handle is a [`tokio::net::windows::named_pipe::NamedPipeClient`]
//! and `NamedPipeTransport` dials it. The transport only exists there; elsewhere
//! the socket layer is still available over any `AsyncRead + AsyncWrite`.

use std::fmt;
use std::io;
use std::pin::Pin;
#[cfg(windows)]
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::{unsupported, Deadline, Socket, SocketOption, SocketTimeout};
#[cfg(windows)]
use super::Endpoint;
#[cfg(windows)]
use crate::BoxFuture;

/// The pipe name was not of the form `\\server\pipe\name`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pipe name {name:?}: {reason}")]
pub struct InvalidPipeName {
    name: String,
    reason: &'static str,
}

impl InvalidPipeName {
    fn new(name: &str, reason: &'static str) -> Self {
        Self {
            name: name.to_owned(),
            reason,
        }
    }
}

/// A validated UNC pipe name, e.g. `\\.\pipe\docker_engine`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipeName(Box<str>);

impl PipeName {
    /// Validate a pipe name.
    ///
    /// ```
    /// # use dockerdriver::transport::npipe::PipeName;
    /// assert!(PipeName::parse(r"\\.\pipe\docker_engine").is_ok());
    /// assert!(PipeName::parse(r"\\.\PIPE\docker\engine").is_ok());
    /// assert!(PipeName::parse(r"\\.\share\docker_engine").is_err());
    /// assert!(PipeName::parse(r"\\.\pipe\\docker").is_err());
    /// ```
    pub fn parse(name: &str) -> Result<Self, InvalidPipeName> {
        if name.contains('/') {
            return Err(InvalidPipeName::new(name, "forward slashes are not allowed"));
        }

        let Some(rest) = name.strip_prefix(r"\\") else {
            return Err(InvalidPipeName::new(name, r"must start with \\"));
        };

        let mut segments = rest.split('\\');
        match segments.next() {
            Some(server) if !server.is_empty() => {}
            _ => return Err(InvalidPipeName::new(name, "missing server")),
        }

        match segments.next() {
            Some(pipe) if pipe.eq_ignore_ascii_case("pipe") => {}
            _ => return Err(InvalidPipeName::new(name, r"expected \pipe\ after the server")),
        }

        let mut count = 0;
        for segment in segments {
            if segment.is_empty() {
                return Err(InvalidPipeName::new(name, "empty path segment"));
            }
            count += 1;
        }
        if count == 0 {
            return Err(InvalidPipeName::new(name, "missing pipe name"));
        }

        Ok(Self(name.into()))
    }

    /// The pipe name as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for PipeName {
    type Err = InvalidPipeName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// The platform pipe client handle.
#[cfg(windows)]
pub type PlatformPipe = tokio::net::windows::named_pipe::NamedPipeClient;

/// A named pipe handle behaving as a socket.
pub struct NamedPipeSocket<P> {
    pipe: Option<P>,
    name: PipeName,
    read: Deadline,
    write: Deadline,
    input_shutdown: bool,
    output_shutdown: bool,
}

impl<P> fmt::Debug for NamedPipeSocket<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedPipeSocket")
            .field("name", &self.name)
            .field("closed", &self.pipe.is_none())
            .field("input_shutdown", &self.input_shutdown)
            .field("output_shutdown", &self.output_shutdown)
            .finish()
    }
}

impl<P> NamedPipeSocket<P> {
    /// Wrap an open pipe handle.
    pub fn new(pipe: P, name: PipeName) -> Self {
        Self {
            pipe: Some(pipe),
            name,
            read: Deadline::new(SocketTimeout::Read),
            write: Deadline::new(SocketTimeout::Write),
            input_shutdown: false,
            output_shutdown: false,
        }
    }

    /// The pipe this socket is connected to.
    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Stop writing: later writes fail with [`io::ErrorKind::BrokenPipe`].
    /// Reading is unaffected.
    pub fn shutdown_output(&mut self) -> io::Result<()> {
        if self.pipe.is_none() {
            return Err(super::not_connected());
        }
        self.output_shutdown = true;
        Ok(())
    }

    /// Has the output half been shut down?
    pub fn is_output_shutdown(&self) -> bool {
        self.output_shutdown
    }

    /// Pipes cannot listen for connections.
    pub fn listen(&mut self) -> io::Result<()> {
        Err(unsupported("listen"))
    }
}

#[cfg(windows)]
impl NamedPipeSocket<PlatformPipe> {
    /// Open the named pipe, retrying while all pipe instances are busy.
    pub async fn connect(name: PipeName, timeout: Option<Duration>) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ClientOptions;

        const ERROR_PIPE_BUSY: i32 = 231;
        const BUSY_RETRY: Duration = Duration::from_millis(50);

        let opening = async {
            loop {
                match ClientOptions::new().open(name.as_str()) {
                    Ok(client) => break Ok(client),
                    Err(error) if error.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                        trace!(pipe = %name, "pipe busy, retrying");
                        tokio::time::sleep(BUSY_RETRY).await;
                    }
                    Err(error) => break Err(error),
                }
            }
        };

        let pipe = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, opening)
                .await
                .map_err(|_| io::Error::from(SocketTimeout::Connect))??,
            None => opening.await?,
        };

        trace!(pipe = %name, "named pipe connected");
        Ok(Self::new(pipe, name))
    }
}

impl<P> Socket for NamedPipeSocket<P>
where
    P: AsyncRead + AsyncWrite + Send + Unpin,
{
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
        if self.pipe.is_none() {
            return Err(super::not_connected());
        }
        self.input_shutdown = true;
        Ok(())
    }

    fn is_input_shutdown(&self) -> bool {
        self.input_shutdown
    }

    fn close(&mut self) -> io::Result<()> {
        if self.pipe.take().is_some() {
            trace!(pipe = %self.name, "named pipe closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pipe.is_none()
    }
}

impl<P> AsyncRead for NamedPipeSocket<P>
where
    P: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.input_shutdown {
            return Poll::Ready(Ok(()));
        }
        let Some(pipe) = this.pipe.as_mut() else {
            return Poll::Ready(Err(super::not_connected()));
        };
        this.read.poll_read(pipe, cx, buf)
    }
}

impl<P> AsyncWrite for NamedPipeSocket<P>
where
    P: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();
        if this.output_shutdown {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe output has been shut down",
            )));
        }
        let Some(pipe) = this.pipe.as_mut() else {
            return Poll::Ready(Err(super::not_connected()));
        };
        this.write.poll_write(pipe, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if this.output_shutdown {
            return Poll::Ready(Ok(()));
        }
        match this.pipe.as_mut() {
            Some(pipe) => this.write.poll_flush(pipe, cx),
            None => Poll::Ready(Err(super::not_connected())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        if this.output_shutdown {
            return Poll::Ready(Ok(()));
        }
        let Some(pipe) = this.pipe.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match this.write.poll_flush(pipe, cx) {
            Poll::Ready(Ok(())) => {
                this.output_shutdown = true;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Configuration for named pipe connections.
#[cfg(windows)]
#[derive(Debug, Clone, Default)]
pub struct NamedPipeTransportConfig {
    /// How long to keep retrying a busy pipe.
    pub connect_timeout: Option<Duration>,

    /// Read timeout applied to every new pipe.
    pub read_timeout: Option<Duration>,
}

/// Transport which opens [`Endpoint::NamedPipe`] addresses.
#[cfg(windows)]
#[derive(Debug, Clone, Default)]
pub struct NamedPipeTransport {
    config: Arc<NamedPipeTransportConfig>,
}

#[cfg(windows)]
impl NamedPipeTransport {
    /// Create a new named pipe transport.
    pub fn new(config: NamedPipeTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The transport configuration.
    pub fn config(&self) -> &NamedPipeTransportConfig {
        &self.config
    }
}

#[cfg(windows)]
impl tower::Service<Endpoint> for NamedPipeTransport {
    type Response = NamedPipeSocket<PlatformPipe>;
    type Error = io::Error;
    type Future = BoxFuture<'static, Result<Self::Response, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let Endpoint::NamedPipe(name) = endpoint else {
            return Box::pin(std::future::ready(Err(wrong_endpoint(&endpoint))));
        };

        let config = self.config.clone();
        Box::pin(async move {
            let mut pipe = NamedPipeSocket::connect(name, config.connect_timeout).await?;
            pipe.set_read_timeout(config.read_timeout)?;
            Ok(pipe)
        })
    }
}

#[cfg(windows)]
fn wrong_endpoint(endpoint: &Endpoint) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("named pipe transport cannot connect to {endpoint}"),
    )
}
