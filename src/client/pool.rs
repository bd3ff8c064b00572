//! Idle connection pool.
//!
//! Engine connections are HTTP/1.1, so each one carries a single request at a
//! time and is never shared. A connection is checked out as a [`Pooled`] guard;
//! dropping the guard returns the connection to the idle set, as long as it is
//! still open, the pool has room, and the pool has not been closed.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::body::Body;

/// The request half of an HTTP/1.1 connection.
pub(crate) type Connection = hyper::client::conn::http1::SendRequest<Body>;

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of idle connections kept for reuse.
    pub max_idle: usize,

    /// How long a connection may sit idle before it is dropped.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_idle: 10,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl Config {
    /// Set the maximum number of idle connections. Zero disables pooling.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

struct Idle {
    at: Instant,
    connection: Connection,
}

impl Idle {
    fn is_expired(&self, timeout: Option<Duration>) -> bool {
        timeout.is_some_and(|timeout| self.at.elapsed() > timeout)
    }
}

struct PoolInner {
    config: Config,
    idle: Vec<Idle>,
    closed: bool,
}

impl PoolInner {
    fn push(&mut self, connection: Connection) {
        if self.closed {
            trace!("pool closed, dropping connection");
            return;
        }

        if self.idle.len() >= self.config.max_idle {
            trace!(max_idle = self.config.max_idle, "pool full, dropping connection");
            return;
        }

        trace!(idle = self.idle.len() + 1, "connection returned to pool");
        self.idle.push(Idle {
            at: Instant::now(),
            connection,
        });
    }

    fn pop(&mut self) -> Option<Connection> {
        while let Some(entry) = self.idle.pop() {
            if entry.connection.is_closed() {
                trace!("dropping closed idle connection");
                continue;
            }

            if entry.is_expired(self.config.idle_timeout) {
                trace!("dropping expired idle connection");
                continue;
            }

            return Some(entry.connection);
        }
        None
    }
}

/// Idle connections for a single engine.
#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<Mutex<PoolInner>>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pool")
            .field("config", &inner.config)
            .field("idle", &inner.idle.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                config,
                idle: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Take an idle connection, if one is available.
    pub(crate) fn checkout(&self) -> Option<Pooled> {
        let connection = self.inner.lock().pop()?;
        trace!("reusing idle connection");
        Some(self.pooled(connection))
    }

    /// Wrap a new connection so it returns to this pool when dropped.
    pub(crate) fn pooled(&self, connection: Connection) -> Pooled {
        Pooled {
            connection: Some(connection),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Drop every idle connection, and refuse any returned later.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let dropped = inner.idle.len();
        inner.idle.clear();
        trace!(dropped, "pool closed");
    }

    /// Number of idle connections.
    pub(crate) fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

/// A connection checked out of the pool.
///
/// Returned to the pool on drop. Use [`Pooled::discard`] for connections that
/// must not be reused.
pub(crate) struct Pooled {
    connection: Option<Connection>,
    pool: Weak<Mutex<PoolInner>>,
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("open", &self.connection.as_ref().map(|c| !c.is_closed()))
            .finish()
    }
}

impl Pooled {
    /// Close the connection instead of returning it to the pool.
    pub(crate) fn discard(mut self) {
        if self.connection.take().is_some() {
            trace!("connection discarded");
        }
    }

    pub(crate) fn connection(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if connection.is_closed() {
            trace!("closed connection not returned to pool");
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.lock().push(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper_util::rt::TokioIo;

    async fn connection() -> (Connection, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(client))
            .await
            .unwrap();
        tokio::spawn(conn);
        (sender, server)
    }

    #[tokio::test]
    async fn dropped_guard_returns_connection() {
        let pool = Pool::new(Config::default());
        let (sender, _server) = connection().await;

        drop(pool.pooled(sender));
        assert_eq!(pool.idle(), 1);

        let pooled = pool.checkout().expect("idle connection");
        assert_eq!(pool.idle(), 0);
        drop(pooled);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn discarded_connection_is_not_pooled() {
        let pool = Pool::new(Config::default());
        let (sender, _server) = connection().await;

        pool.pooled(sender).discard();
        assert_eq!(pool.idle(), 0);
        assert!(pool.checkout().is_none());
    }

    #[tokio::test]
    async fn pool_respects_max_idle() {
        let pool = Pool::new(Config::default().with_max_idle(1));
        let (first, _a) = connection().await;
        let (second, _b) = connection().await;

        let guards = (pool.pooled(first), pool.pooled(second));
        drop(guards);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_connections() {
        let pool = Pool::new(Config::default());
        let (first, _a) = connection().await;
        let (second, _b) = connection().await;

        drop(pool.pooled(first));
        let held = pool.pooled(second);

        pool.close();
        assert_eq!(pool.idle(), 0);
        drop(held);
        assert_eq!(pool.idle(), 0);
        assert!(pool.checkout().is_none());
    }

    #[tokio::test]
    async fn expired_connections_are_skipped() {
        let pool =
            Pool::new(Config::default().with_idle_timeout(Some(Duration::from_millis(10))));
        let (sender, _server) = connection().await;
        drop(pool.pooled(sender));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.checkout().is_none());
    }
}
