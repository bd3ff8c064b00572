//! Docker Engine client.
//!
//! The [`Client`] owns a transport, a pool of idle HTTP/1.1 connections, and
//! the API version every request is prefixed with. Requests are described by an
//! [`Invocation`] and sent through one of four shapes:
//!
//! 1. [`Client::invoke`] parses the whole response body as one JSON document.
//! 2. [`Client::invoke_multi_document`] yields consecutive JSON documents lazily.
//! 3. [`Client::invoke_stream`] exposes the raw response body as an `AsyncRead`.
//! 4. [`Client::invoke_void`] discards the body.
//!
//! Thin typed helpers for common engine endpoints live in [`containers`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::HeaderValue;
use parking_lot::RwLock;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt as _};
use tracing::{debug, trace};

use crate::config::{ConfigError, ConnectionDescriptor};
use crate::error::Error;
use crate::transport::tcp::{TcpTransport, TcpTransportConfig};
use crate::transport::unix::{UnixTransport, UnixTransportConfig};
use crate::transport::{DockerStream, Endpoint, Transport};
use crate::version::ApiVersion;
use crate::{BoxError, BoxFuture};

mod conn;
pub mod containers;
mod documents;
mod invoke;
pub mod negotiate;
pub(crate) mod pool;

pub use self::conn::HandshakeError;
pub use self::containers::{AttachOptions, LogOptions};
pub use self::documents::DocumentStream;
pub use self::invoke::{Invocation, ResponseReader};
pub use self::pool::Config as PoolConfig;

use self::pool::{Pool, Pooled};

type BoxTransport = BoxCloneSyncService<Endpoint, DockerStream, BoxError>;

/// A client for one Docker engine.
///
/// Cloning is cheap; clones share the connection pool, the negotiated version
/// and the closed flag.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    transport: BoxTransport,
    endpoint: Endpoint,
    pool: Pool,
    version: RwLock<ApiVersion>,
    closed: AtomicBool,
    host: HeaderValue,
    user_agent: HeaderValue,
    read_timeout: Option<Duration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("version", &*self.inner.version.read())
            .field("pool", &self.inner.pool)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Build a client for the engine described by `descriptor`.
    ///
    /// No connection is made until the first request. The client uses the
    /// descriptor's API version as is; see [`Client::open`] to negotiate one.
    pub fn new(descriptor: ConnectionDescriptor) -> Result<Self, ConfigError> {
        descriptor.validate()?;

        match descriptor.endpoint() {
            Endpoint::Unix(_) => {
                let transport = UnixTransport::new(UnixTransportConfig {
                    connect_timeout: descriptor.connect_timeout(),
                    read_timeout: None,
                });
                Self::with_transport(descriptor, transport)
            }
            Endpoint::Tcp { .. } => {
                let transport = TcpTransport::new(TcpTransportConfig {
                    connect_timeout: descriptor.connect_timeout(),
                    ..Default::default()
                });

                #[cfg(feature = "tls")]
                let transport = match descriptor.tls() {
                    Some(options) => transport.with_tls(Arc::new(
                        crate::transport::tls::client_config(options)?,
                    )),
                    None => transport,
                };

                #[cfg(not(feature = "tls"))]
                if descriptor.is_tls() {
                    return Err(ConfigError::TlsUnavailable);
                }

                Self::with_transport(descriptor, transport)
            }
            #[cfg(windows)]
            Endpoint::NamedPipe(_) => {
                use crate::transport::npipe::{NamedPipeTransport, NamedPipeTransportConfig};

                let transport = NamedPipeTransport::new(NamedPipeTransportConfig {
                    connect_timeout: descriptor.connect_timeout(),
                    read_timeout: None,
                });
                Self::with_transport(descriptor, transport)
            }
            #[cfg(not(windows))]
            Endpoint::NamedPipe(_) => Err(ConfigError::NamedPipeUnavailable),
        }
    }

    /// Build a client which dials the descriptor's endpoint through `transport`.
    pub fn with_transport<T>(
        descriptor: ConnectionDescriptor,
        transport: T,
    ) -> Result<Self, ConfigError>
    where
        T: Transport,
        T::IO: Into<DockerStream>,
    {
        descriptor.validate()?;

        let host = descriptor.host_header();
        let host = HeaderValue::from_str(&host).map_err(|_| ConfigError::InvalidHeader {
            header: "host",
            value: host,
        })?;

        let user_agent = descriptor
            .user_agent()
            .unwrap_or(concat!("dockerdriver/", env!("CARGO_PKG_VERSION")));
        let user_agent =
            HeaderValue::from_str(user_agent).map_err(|_| ConfigError::InvalidHeader {
                header: "user-agent",
                value: user_agent.to_owned(),
            })?;

        let endpoint = descriptor.endpoint();
        debug!(%endpoint, version = %descriptor.api_version(), "client created");

        Ok(Self {
            inner: Arc::new(ClientRef {
                transport: BoxCloneSyncService::new(Connector(transport)),
                endpoint,
                pool: Pool::new(descriptor.pool().clone()),
                version: RwLock::new(descriptor.api_version().clone()),
                closed: AtomicBool::new(false),
                host,
                user_agent,
                read_timeout: descriptor.read_timeout(),
            }),
        })
    }

    /// Build a client, negotiate the API version with the engine, and pin the
    /// result on the client.
    pub async fn open(descriptor: ConnectionDescriptor) -> Result<Self, Error> {
        let requested = descriptor.api_version().clone();
        let client = Self::new(descriptor)?;
        let version = negotiate::negotiate_version(&client, requested).await?;
        client.set_api_version(version);
        Ok(client)
    }

    /// The API version requests are sent with.
    pub fn api_version(&self) -> ApiVersion {
        self.inner.version.read().clone()
    }

    /// Change the API version requests are sent with.
    pub fn set_api_version(&self, version: ApiVersion) {
        debug!(%version, "api version pinned");
        *self.inner.version.write() = version;
    }

    /// The engine endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Number of idle connections held by the pool.
    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle()
    }

    /// Close the client.
    ///
    /// Idle connections are dropped and every later call fails with
    /// [`Error::Closed`]. Connections held by open streams are closed when those
    /// streams are. Closing twice is harmless.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            trace!("client already closed");
            return;
        }
        self.inner.pool.close();
        debug!(endpoint = %self.inner.endpoint, "client closed");
    }

    /// Has [`Client::close`] been called?
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn host(&self) -> &HeaderValue {
        &self.inner.host
    }

    pub(crate) fn user_agent(&self) -> &HeaderValue {
        &self.inner.user_agent
    }

    /// Check out an idle connection, or dial a new one.
    pub(crate) async fn connection(&self) -> Result<Pooled, Error> {
        self.ensure_open()?;

        while let Some(mut pooled) = self.inner.pool.checkout() {
            let Some(sender) = pooled.connection() else {
                continue;
            };

            match sender.ready().await {
                Ok(()) => return Ok(pooled),
                Err(error) => {
                    trace!(%error, "idle connection unusable");
                    pooled.discard();
                }
            }
        }

        trace!(endpoint = %self.inner.endpoint, "connecting");
        let mut stream = self
            .inner
            .transport
            .clone()
            .oneshot(self.inner.endpoint.clone())
            .await
            .map_err(Error::processing)?;
        stream.set_read_timeout(self.inner.read_timeout)?;

        let sender = conn::handshake(stream).await.map_err(Error::processing)?;

        // The client may have been closed while dialing.
        self.ensure_open()?;
        Ok(self.inner.pool.pooled(sender))
    }
}

/// Adapts any [`Transport`] to the boxed service the client stores.
#[derive(Debug, Clone)]
struct Connector<T>(T);

impl<T> Service<Endpoint> for Connector<T>
where
    T: Transport,
    T::IO: Into<DockerStream>,
{
    type Response = DockerStream;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<DockerStream, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Transport::poll_ready(&mut self.0, cx).map_err(Into::into)
    }

    fn call(&mut self, endpoint: Endpoint) -> Self::Future {
        let future = self.0.connect(endpoint);
        Box::pin(async move { future.await.map(Into::into).map_err(Into::into) })
    }
}
