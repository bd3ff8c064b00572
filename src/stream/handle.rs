use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tracing::{debug, trace};

use super::demux::{Demultiplexer, Fragment, Mode};
use crate::error::Error;

/// The byte source behind a [`StreamHandle`].
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// The raw output channel of an upgraded [`StreamHandle`].
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// A container's stdio stream, as returned by `logs` and `attach`.
///
/// The handle owns the connection the stream arrived on. Closing it (or
/// dropping it) returns that connection to the pool when the response was read
/// to its end, and closes it otherwise.
pub struct StreamHandle {
    demux: Option<Demultiplexer<Source>>,
    sink: Option<Sink>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("demux", &self.demux)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl StreamHandle {
    /// Decode `source` according to `mode`, with no output channel.
    pub fn new<R>(source: R, mode: Mode) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            demux: Some(Demultiplexer::new(Box::new(source), mode)),
            sink: None,
        }
    }

    /// Attach an output channel, e.g. the write half of an upgraded connection.
    pub fn with_sink<W>(mut self, sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    /// The stream framing, or `None` once closed.
    pub fn mode(&self) -> Option<Mode> {
        self.demux.as_ref().map(Demultiplexer::mode)
    }

    /// The next fragment of output, or `None` once the stream has ended.
    ///
    /// Any unread bytes of the previous fragment are discarded first.
    pub async fn next_fragment(&mut self) -> Result<Option<Fragment<'_>>, Error> {
        let demux = self.demux.as_mut().ok_or(Error::Closed)?;
        Ok(demux.next_fragment().await?)
    }

    /// The raw channel to the container's stdin.
    ///
    /// Only upgraded streams have one; `None` once closed.
    pub fn output_sink(&mut self) -> Option<&mut Sink> {
        self.sink.as_mut()
    }

    /// Has the handle been closed?
    pub fn is_closed(&self) -> bool {
        self.demux.is_none()
    }

    /// Close the stream and release its connection.
    ///
    /// Closing twice is harmless, and failures are only logged.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        if let Some(mut sink) = self.sink.take() {
            if let Err(error) = sink.shutdown().await {
                debug!(%error, "failed to shut down stream output");
            }
        }

        if let Some(demux) = self.demux.take() {
            trace!(clean = demux.ended_cleanly(), "stream handle closed");
        }
    }
}
