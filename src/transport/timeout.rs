//! Per-operation read/write deadlines for socket adapters.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use super::SocketTimeout;

/// A timeout which is armed when an operation first returns `Pending`,
/// and disarmed whenever the operation makes progress.
#[derive(Debug)]
pub(crate) struct Deadline {
    kind: SocketTimeout,
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn new(kind: SocketTimeout) -> Self {
        Self {
            kind,
            timeout: None,
            sleep: None,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|timeout| !timeout.is_zero());
        self.sleep = None;
    }

    pub(crate) fn reset(&mut self) {
        self.sleep = None;
    }

    /// Poll the deadline after the guarded operation returned `Pending`.
    fn poll_expired<T>(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<T>> {
        let Some(timeout) = self.timeout else {
            return Poll::Pending;
        };

        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));

        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.sleep = None;
                tracing::trace!(timeout = ?timeout, kind = %self.kind, "socket operation timed out");
                Poll::Ready(Err(self.kind.into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    pub(crate) fn poll_read<T>(
        &mut self,
        io: &mut T,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>>
    where
        T: AsyncRead + Unpin,
    {
        match Pin::new(io).poll_read(cx, buf) {
            Poll::Ready(result) => {
                self.reset();
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_expired(cx),
        }
    }

    pub(crate) fn poll_write<T>(
        &mut self,
        io: &mut T,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>>
    where
        T: AsyncWrite + Unpin,
    {
        match Pin::new(io).poll_write(cx, buf) {
            Poll::Ready(result) => {
                self.reset();
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_expired(cx),
        }
    }

    pub(crate) fn poll_flush<T>(&mut self, io: &mut T, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        T: AsyncWrite + Unpin,
    {
        match Pin::new(io).poll_flush(cx) {
            Poll::Ready(result) => {
                self.reset();
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_expired(cx),
        }
    }
}
