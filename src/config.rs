//! Connection descriptors.
//!
//! A [`ConnectionDescriptor`] says where the engine lives and how to talk to it:
//! the transport (unix socket, TCP, named pipe), TLS settings, pool sizing,
//! timeouts and the API version to request. Descriptors are plain values; they
//! are validated when parsed and consumed when the [`Client`](crate::Client) is built.
//!
//! Accepted connection URIs:
//! - `unix:///var/run/docker.sock`
//! - `tcp://host[:port]` (port defaults to 2375, or 2376 with TLS); `http://` and
//!   `https://` are accepted as plain and TLS aliases.
//! - `npipe:////./pipe/docker_engine`, or a raw pipe path such as `\\.\pipe\docker_engine`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::client::PoolConfig;
use crate::transport::npipe::{InvalidPipeName, PipeName};
use crate::transport::Endpoint;
use crate::version::ApiVersion;

/// Default engine port without TLS.
pub const DEFAULT_PORT: u16 = 2375;

/// Default engine port with TLS.
pub const DEFAULT_TLS_PORT: u16 = 2376;

#[cfg(not(windows))]
const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";

#[cfg(windows)]
const DEFAULT_HOST: &str = "npipe:////./pipe/docker_engine";

/// The descriptor could not be used to build a client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The connection string could not be parsed.
    #[error("invalid connection uri {uri:?}: {reason}")]
    InvalidUri {
        /// The offending connection string.
        uri: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// The scheme is not one of `unix`, `tcp` or `npipe`.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The URI contained a component its scheme does not allow.
    #[error("{scheme} uri must not contain a {component}")]
    UnexpectedComponent {
        /// The URI scheme.
        scheme: &'static str,
        /// The component which is not allowed.
        component: &'static str,
    },

    /// Unix socket paths must be absolute.
    #[error("unix socket path must be absolute: {0}")]
    RelativePath(String),

    /// The named pipe address is not a valid pipe name.
    #[error(transparent)]
    InvalidPipeName(#[from] InvalidPipeName),

    /// TLS was requested for a transport which cannot carry it.
    #[error("tls is not supported on {0} connections")]
    TlsNotSupported(&'static str),

    /// TLS was requested, but this build has no TLS support.
    #[error("tls requested, but dockerdriver was built without the `tls` feature")]
    TlsUnavailable,

    /// TLS material could not be loaded.
    #[error("tls: {0}")]
    Tls(String),

    /// Named pipes are only available on windows.
    #[error("named pipes are not supported on this platform")]
    NamedPipeUnavailable,

    /// A header value (host or user agent) contains invalid characters.
    #[error("invalid {header} header: {value:?}")]
    InvalidHeader {
        /// The header name.
        header: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl ConfigError {
    fn uri(uri: &str, reason: &'static str) -> Self {
        ConfigError::InvalidUri {
            uri: uri.to_owned(),
            reason,
        }
    }
}

/// The transport family of a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Unix domain socket.
    Unix,

    /// TCP, optionally with TLS.
    Tcp,

    /// Windows named pipe.
    NamedPipe,
}

impl Scheme {
    /// The URI scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Unix => "unix",
            Scheme::Tcp => "tcp",
            Scheme::NamedPipe => "npipe",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the engine is listening.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// Path to a unix domain socket.
    Unix(Utf8PathBuf),

    /// TCP host, with an optional explicit port.
    Tcp {
        /// Host name or IP address.
        host: Box<str>,
        /// Port, if one was given.
        port: Option<u16>,
    },

    /// A named pipe.
    NamedPipe(PipeName),
}

impl Address {
    /// The scheme implied by this address.
    pub fn scheme(&self) -> Scheme {
        match self {
            Address::Unix(_) => Scheme::Unix,
            Address::Tcp { .. } => Scheme::Tcp,
            Address::NamedPipe(_) => Scheme::NamedPipe,
        }
    }
}

/// TLS settings for TCP connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// Check that the server certificate matches the host name.
    pub verify_hostname: bool,

    /// PEM bundle of trusted CAs. Platform roots are used when absent.
    pub ca_file: Option<PathBuf>,

    /// PEM client certificate chain.
    pub cert_file: Option<PathBuf>,

    /// PEM client private key.
    pub key_file: Option<PathBuf>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_hostname: true,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

impl TlsOptions {
    /// Load `ca.pem`, `cert.pem` and `key.pem` from a docker certificate directory.
    pub fn from_cert_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let existing = |name: &str| Some(path.join(name)).filter(|file| file.exists());
        Self {
            verify_hostname: true,
            ca_file: existing("ca.pem"),
            cert_file: existing("cert.pem"),
            key_file: existing("key.pem"),
        }
    }

    /// Disable or enable hostname verification.
    pub fn with_verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }
}

/// Everything needed to reach an engine.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    address: Address,
    tls: Option<TlsOptions>,
    pool: PoolConfig,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    api_version: ApiVersion,
    user_agent: Option<String>,
}

impl ConnectionDescriptor {
    fn new(address: Address) -> Self {
        Self {
            address,
            tls: None,
            pool: PoolConfig::default(),
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            api_version: ApiVersion::Default,
            user_agent: None,
        }
    }

    /// Connect to a unix domain socket at an absolute path.
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.as_str().starts_with('/') {
            return Err(ConfigError::RelativePath(path.into_string()));
        }
        Ok(Self::new(Address::Unix(path)))
    }

    /// Connect over TCP. Without a port, the docker default for the TLS setting is used.
    pub fn tcp(host: impl Into<Box<str>>, port: Option<u16>) -> Self {
        Self::new(Address::Tcp {
            host: host.into(),
            port,
        })
    }

    /// Connect to a windows named pipe.
    pub fn named_pipe(name: PipeName) -> Self {
        Self::new(Address::NamedPipe(name))
    }

    /// Parse a connection URI.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        if uri.starts_with(r"\\") {
            return Ok(Self::named_pipe(PipeName::parse(uri)?));
        }

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigError::uri(uri, "missing scheme"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "unix" => parse_unix(uri, rest),
            "tcp" | "http" => parse_tcp(uri, rest).map(|address| Self::new(address)),
            "https" => {
                parse_tcp(uri, rest).map(|address| Self::new(address).with_tls(Default::default()))
            }
            "npipe" => parse_npipe(rest),
            other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
        }
    }

    /// Build a descriptor from the standard docker environment variables:
    /// `DOCKER_HOST`, `DOCKER_TLS_VERIFY`, `DOCKER_CERT_PATH` and `DOCKER_API_VERSION`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let host = lookup("DOCKER_HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned());
        let mut descriptor = Self::parse(&host)?;

        let verify = lookup("DOCKER_TLS_VERIFY").is_some_and(|value| value != "0");
        let cert_path = lookup("DOCKER_CERT_PATH");

        if verify || cert_path.is_some() {
            if descriptor.scheme() == Scheme::Tcp {
                let tls = match cert_path {
                    Some(path) => TlsOptions::from_cert_path(path),
                    None => TlsOptions::default(),
                };
                descriptor = descriptor.with_tls(tls.with_verify_hostname(verify));
            } else {
                tracing::debug!(
                    scheme = %descriptor.scheme(),
                    "ignoring docker tls environment for a local transport"
                );
            }
        }

        if let Some(version) = lookup("DOCKER_API_VERSION") {
            descriptor = descriptor.with_api_version(ApiVersion::parse(&version));
        }

        Ok(descriptor)
    }
}

impl ConnectionDescriptor {
    /// Use TLS with the given options.
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Disable TLS.
    pub fn without_tls(mut self) -> Self {
        self.tls = None;
        self
    }

    /// Use the provided connection pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Maximum number of idle connections kept in the pool.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool.max_idle = size;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout applied to local (unix, named pipe) connections.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Request a specific API version.
    pub fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = version;
        self
    }

    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl ConnectionDescriptor {
    /// The transport family.
    pub fn scheme(&self) -> Scheme {
        self.address.scheme()
    }

    /// The address of the engine.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// TLS settings, if TLS is enabled.
    pub fn tls(&self) -> Option<&TlsOptions> {
        self.tls.as_ref()
    }

    /// Is TLS enabled?
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connection pool configuration.
    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Read timeout for local connections.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// The requested API version.
    pub fn api_version(&self) -> &ApiVersion {
        &self.api_version
    }

    /// The configured user agent.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// The endpoint to dial, with default ports applied.
    pub fn endpoint(&self) -> Endpoint {
        match &self.address {
            Address::Unix(path) => Endpoint::Unix(path.clone()),
            Address::Tcp { host, port } => Endpoint::Tcp {
                host: host.clone(),
                port: port.unwrap_or(if self.is_tls() {
                    DEFAULT_TLS_PORT
                } else {
                    DEFAULT_PORT
                }),
            },
            Address::NamedPipe(name) => Endpoint::NamedPipe(name.clone()),
        }
    }

    /// The value of the `Host` header sent with each request.
    pub(crate) fn host_header(&self) -> String {
        match self.endpoint() {
            Endpoint::Tcp { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
            _ => "docker".to_owned(),
        }
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.scheme() {
            Scheme::Unix | Scheme::NamedPipe if self.is_tls() => {
                Err(ConfigError::TlsNotSupported(self.scheme().as_str()))
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for ConnectionDescriptor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionDescriptor::parse(s)
    }
}

fn reject_query_and_fragment(
    uri: &str,
    rest: &str,
    scheme: &'static str,
) -> Result<(), ConfigError> {
    if rest.contains('?') {
        return Err(ConfigError::UnexpectedComponent {
            scheme,
            component: "query",
        });
    }
    if rest.contains('#') {
        return Err(ConfigError::UnexpectedComponent {
            scheme,
            component: "fragment",
        });
    }
    if rest.is_empty() {
        return Err(ConfigError::uri(uri, "empty address"));
    }
    Ok(())
}

fn parse_unix(uri: &str, rest: &str) -> Result<ConnectionDescriptor, ConfigError> {
    reject_query_and_fragment(uri, rest, "unix")?;

    if !rest.starts_with('/') {
        let authority = rest.split('/').next().unwrap_or_default();
        let component = if authority.contains(':') { "port" } else { "host" };
        return Err(ConfigError::UnexpectedComponent {
            scheme: "unix",
            component,
        });
    }

    ConnectionDescriptor::unix(rest)
}

fn parse_tcp(uri: &str, rest: &str) -> Result<Address, ConfigError> {
    reject_query_and_fragment(uri, rest, "tcp")?;

    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    if !path.is_empty() && path != "/" {
        return Err(ConfigError::UnexpectedComponent {
            scheme: "tcp",
            component: "path",
        });
    }

    if authority.contains('@') {
        return Err(ConfigError::UnexpectedComponent {
            scheme: "tcp",
            component: "user-info",
        });
    }

    let authority: http::uri::Authority = authority
        .parse()
        .map_err(|_| ConfigError::uri(uri, "invalid host"))?;

    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ConfigError::uri(uri, "missing host"));
    }

    Ok(Address::Tcp {
        host: host.into(),
        port: authority.port_u16(),
    })
}

fn parse_npipe(rest: &str) -> Result<ConnectionDescriptor, ConfigError> {
    if rest.contains('?') || rest.contains('#') {
        return Err(ConfigError::UnexpectedComponent {
            scheme: "npipe",
            component: if rest.contains('?') { "query" } else { "fragment" },
        });
    }

    let name = rest.replace('/', r"\");
    Ok(ConnectionDescriptor::named_pipe(PipeName::parse(&name)?))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn unix_uri() {
        let descriptor: ConnectionDescriptor = "unix:///var/run/docker.sock".parse().unwrap();
        assert_eq!(descriptor.scheme(), Scheme::Unix);
        assert_eq!(
            descriptor.endpoint(),
            Endpoint::Unix("/var/run/docker.sock".into())
        );
        assert_eq!(descriptor.host_header(), "docker");
        descriptor.validate().unwrap();
    }

    #[test]
    fn unix_uri_rejects_host() {
        let err = ConnectionDescriptor::parse("unix://host/path").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                scheme: "unix",
                component: "host"
            }
        ));

        let err = ConnectionDescriptor::parse("unix://host:1234/path").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                component: "port",
                ..
            }
        ));

        let err = ConnectionDescriptor::parse("unix:///var/run/docker.sock?x=1").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                component: "query",
                ..
            }
        ));
    }

    #[test]
    fn tcp_uri() {
        let descriptor = ConnectionDescriptor::parse("tcp://1.2.3.4").unwrap();
        assert_eq!(
            descriptor.endpoint(),
            Endpoint::Tcp {
                host: "1.2.3.4".into(),
                port: 2375
            }
        );

        let descriptor = descriptor.with_tls(Default::default());
        assert_eq!(
            descriptor.endpoint(),
            Endpoint::Tcp {
                host: "1.2.3.4".into(),
                port: 2376
            }
        );

        let descriptor = ConnectionDescriptor::parse("tcp://example.com:9999/").unwrap();
        assert_eq!(descriptor.host_header(), "example.com:9999");

        let descriptor = ConnectionDescriptor::parse("tcp://[::1]:2375").unwrap();
        assert_eq!(descriptor.host_header(), "[::1]:2375");
    }

    #[test]
    fn tcp_uri_rejects_components() {
        let err = ConnectionDescriptor::parse("tcp://1.2.3.4:2375/extra").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                scheme: "tcp",
                component: "path"
            }
        ));

        let err = ConnectionDescriptor::parse("tcp://user@1.2.3.4:2375").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                component: "user-info",
                ..
            }
        ));

        let err = ConnectionDescriptor::parse("tcp://1.2.3.4#frag").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnexpectedComponent {
                component: "fragment",
                ..
            }
        ));
    }

    #[test]
    fn https_alias_enables_tls() {
        let descriptor = ConnectionDescriptor::parse("https://docker.example.com").unwrap();
        assert!(descriptor.is_tls());
        assert_eq!(descriptor.host_header(), "docker.example.com:2376");
    }

    #[test]
    fn npipe_uri() {
        let descriptor = ConnectionDescriptor::parse("npipe:////./pipe/docker_engine").unwrap();
        assert_eq!(descriptor.scheme(), Scheme::NamedPipe);
        let Endpoint::NamedPipe(name) = descriptor.endpoint() else {
            panic!("expected a named pipe endpoint");
        };
        assert_eq!(name.as_str(), r"\\.\pipe\docker_engine");

        let descriptor = ConnectionDescriptor::parse(r"\\.\pipe\docker_engine").unwrap();
        assert_eq!(descriptor.scheme(), Scheme::NamedPipe);

        assert!(ConnectionDescriptor::parse("npipe:////./notpipe/x").is_err());
    }

    #[test]
    fn local_transports_forbid_tls() {
        let descriptor = ConnectionDescriptor::parse("unix:///var/run/docker.sock")
            .unwrap()
            .with_tls(Default::default());
        assert!(matches!(
            descriptor.validate(),
            Err(ConfigError::TlsNotSupported("unix"))
        ));
    }

    #[test]
    fn unknown_scheme() {
        assert!(matches!(
            ConnectionDescriptor::parse("ssh://host"),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ConnectionDescriptor::parse("/var/run/docker.sock"),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn environment() {
        let env: HashMap<&str, &str> = [
            ("DOCKER_HOST", "tcp://10.0.0.1"),
            ("DOCKER_TLS_VERIFY", "1"),
            ("DOCKER_API_VERSION", "1.41"),
        ]
        .into_iter()
        .collect();

        let descriptor =
            ConnectionDescriptor::from_lookup(|name| env.get(name).map(|v| v.to_string()))
                .unwrap();

        assert!(descriptor.is_tls());
        assert!(descriptor.tls().unwrap().verify_hostname);
        assert_eq!(descriptor.api_version(), &ApiVersion::parse("1.41"));
        assert_eq!(
            descriptor.endpoint(),
            Endpoint::Tcp {
                host: "10.0.0.1".into(),
                port: 2376
            }
        );
    }

    #[test]
    fn environment_ignores_tls_for_unix() {
        let descriptor = ConnectionDescriptor::from_lookup(|name| match name {
            "DOCKER_HOST" => Some("unix:///tmp/docker.sock".into()),
            "DOCKER_TLS_VERIFY" => Some("1".into()),
            _ => None,
        })
        .unwrap();
        assert!(!descriptor.is_tls());
        descriptor.validate().unwrap();
    }
}
