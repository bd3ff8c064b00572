//! TCP transport, optionally wrapped in TLS.
//!
//! [`TcpTransport`] resolves the endpoint host, tries each address in turn, and
//! hands back a [`DockerStream`]. When configured with a [`rustls::ClientConfig`]
//! (feature `tls`) the stream is wrapped in a TLS session before it is returned.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument};

use super::{DockerStream, Endpoint, SocketTimeout};
use crate::BoxFuture;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Timeout for each connection attempt.
    pub connect_timeout: Option<Duration>,

    /// Idle time before TCP keepalive probes are sent.
    pub keep_alive_timeout: Option<Duration>,

    /// Set `TCP_NODELAY`.
    pub nodelay: bool,

    /// Send buffer size.
    pub send_buffer_size: Option<usize>,

    /// Receive buffer size.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Transport which dials [`Endpoint::Tcp`] addresses.
#[derive(Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,

    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("TcpTransport");
        dbg.field("config", &self.config);
        #[cfg(feature = "tls")]
        dbg.field("tls", &self.tls.is_some());
        dbg.finish()
    }
}

impl TcpTransport {
    /// Create a plain TCP transport.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Wrap every connection in TLS using this client configuration.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// The transport configuration.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TcpConnectionError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(TcpConnectionError::msg("dns resolution"))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            let span = tracing::trace_span!("connect", %addr);
            match self.attempt(addr).instrument(span).await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    trace!(%addr, %error, "tcp connection attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TcpConnectionError::new(format!("no addresses found for {host}"))))
    }

    async fn attempt(&self, addr: SocketAddr) -> Result<TcpStream, TcpConnectionError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(TcpConnectionError::msg("tcp open error"))?;

        self.apply_options(&socket);

        let connecting = socket.connect(addr);
        let stream = match self.config.connect_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result,
                Err(_) => {
                    trace!(?timeout, "connection timed out");
                    Err(SocketTimeout::Connect.into())
                }
            },
            None => connecting.await,
        }
        .map_err(TcpConnectionError::msg("tcp connect error"))?;

        if let Err(error) = stream.set_nodelay(self.config.nodelay) {
            warn!("tcp set_nodelay error: {}", error);
        }

        Ok(stream)
    }

    fn apply_options(&self, socket: &TcpSocket) {
        let _guard = tracing::trace_span!("socket_options").entered();
        let sock = socket2::SockRef::from(socket);

        if let Some(time) = self.config.keep_alive_timeout {
            let keepalive = socket2::TcpKeepalive::new().with_time(time);
            if let Err(error) = sock.set_tcp_keepalive(&keepalive) {
                warn!("tcp set_keepalive error: {}", error);
            }
        }

        if let Some(size) = self.config.send_buffer_size {
            if let Err(error) = sock.set_send_buffer_size(size) {
                warn!("tcp set_send_buffer_size error: {}", error);
            }
        }

        if let Some(size) = self.config.recv_buffer_size {
            if let Err(error) = sock.set_recv_buffer_size(size) {
                warn!("tcp set_recv_buffer_size error: {}", error);
            }
        }
    }

    #[cfg(feature = "tls")]
    async fn handshake(
        config: Arc<rustls::ClientConfig>,
        host: &str,
        stream: TcpStream,
    ) -> Result<DockerStream, TcpConnectionError> {
        let domain = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(TcpConnectionError::msg("invalid tls server name"))?;

        let stream = tokio_rustls::TlsConnector::from(config)
            .connect(domain, stream)
            .await
            .map_err(TcpConnectionError::msg("tls handshake"))?;
        trace!("tls handshake complete");
        Ok(stream.into())
    }
}

impl tower::Service<Endpoint> for TcpTransport {
    type Response = DockerStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Result<DockerStream, TcpConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let Endpoint::Tcp { host, port } = endpoint else {
            return Box::pin(std::future::ready(Err(TcpConnectionError::new(format!(
                "tcp transport cannot connect to {endpoint}"
            )))));
        };

        let transport = self.clone();
        let span = tracing::trace_span!("tcp", %host, %port);
        Box::pin(
            async move {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let stream = transport.connect(host, port).await?;
                if let Ok(peer) = stream.peer_addr() {
                    trace!(peer.addr = %peer, "tcp connected");
                }

                #[cfg(feature = "tls")]
                if let Some(config) = transport.tls.clone() {
                    return Self::handshake(config, host, stream).await;
                }

                Ok(stream.into())
            }
            .instrument(span),
        )
    }
}

/// Connecting over TCP failed.
#[derive(Debug, Error)]
pub struct TcpConnectionError {
    message: String,
    #[source]
    source: Option<crate::BoxError>,
}

impl TcpConnectionError {
    fn new<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            source: None,
        }
    }

    fn msg<S, E>(message: S) -> impl FnOnce(E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        move |error| Self {
            message: message.into(),
            source: Some(error.into()),
        }
    }
}

impl fmt::Display for TcpConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref source) = self.source {
            write!(f, "{}: {}", self.message, source)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl From<TcpConnectionError> for io::Error {
    fn from(error: TcpConnectionError) -> Self {
        io::Error::new(io::ErrorKind::ConnectionRefused, error)
    }
}
