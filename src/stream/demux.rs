use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt as _, ReadBuf};
use tracing::{trace, warn};

use super::bounded::{BoundedReader, Budget};
use super::frame::{Decoded, DecoderState, Ending, FrameDecoder, FrameHeader};
use super::handle::Source;
use super::Stdio;

/// How the engine framed the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The container has a TTY: the stream is raw output, with no headers.
    Composite,

    /// No TTY: every chunk carries an 8-byte header naming its stdio stream.
    Multiplexed,
}

impl Mode {
    /// The framing the engine uses for a container with or without a TTY.
    pub fn for_tty(tty: bool) -> Self {
        if tty {
            Mode::Composite
        } else {
            Mode::Multiplexed
        }
    }
}

/// Splits a stdio stream into [`Fragment`]s.
pub struct Demultiplexer<R> {
    source: R,
    mode: Mode,
    decoder: FrameDecoder,
    previous: Option<Budget>,
    ending: Option<Ending>,
    malformed: bool,
}

impl<R> fmt::Debug for Demultiplexer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("mode", &self.mode)
            .field("state", &self.decoder.state())
            .field("ending", &self.ending)
            .field("malformed", &self.malformed)
            .finish()
    }
}

impl<R> Demultiplexer<R> {
    /// Decode `source` according to `mode`.
    pub fn new(source: R, mode: Mode) -> Self {
        Self {
            source,
            mode,
            decoder: FrameDecoder::new(),
            previous: None,
            ending: None,
            malformed: false,
        }
    }

    /// The stream framing.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Has the whole source been read, ending on a frame boundary?
    ///
    /// Always false in composite mode, where the end of the single fragment is
    /// only visible to whoever reads it.
    pub fn ended_cleanly(&self) -> bool {
        !self.malformed && self.ending == Some(Ending::Clean)
    }

    /// Recover the source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R> Demultiplexer<R>
where
    R: AsyncRead + Unpin,
{
    /// The next fragment, or `None` once the stream has ended.
    ///
    /// Whatever the caller left unread of the previous fragment is discarded
    /// first, so decoding always resumes on a header boundary.
    pub async fn next_fragment(&mut self) -> io::Result<Option<Fragment<'_, R>>> {
        if self.mode == Mode::Composite {
            if self.decoder.state() == DecoderState::Finished {
                return Ok(None);
            }
            self.decoder.finish();
            return Ok(Some(Fragment::new(None, &mut self.source, u64::MAX)));
        }

        self.discard_previous().await?;

        let Some(header) = self.read_header().await? else {
            return Ok(None);
        };
        trace!(stdio = %header.stdio, length = header.length, "frame");

        let fragment = Fragment::new(
            Some(header.stdio),
            &mut self.source,
            u64::from(header.length),
        );
        self.previous = Some(fragment.budget().clone());
        Ok(Some(fragment))
    }

    async fn discard_previous(&mut self) -> io::Result<()> {
        let Some(budget) = self.previous.take() else {
            return Ok(());
        };

        let consumed = budget.consumed();
        let discarded = BoundedReader::with_budget(&mut self.source, budget)
            .exhaust_and_close()
            .await?;

        if discarded > 0 {
            trace!(discarded, "skipped unread fragment bytes");
        }
        self.decoder.consume_payload(consumed + discarded);
        Ok(())
    }

    async fn read_header(&mut self) -> io::Result<Option<FrameHeader>> {
        let mut scratch = [0u8; FrameHeader::SIZE];
        loop {
            let Some(needed) = self.decoder.header_bytes_needed() else {
                // Finished, or the source ended inside the previous payload.
                self.end();
                return Ok(None);
            };

            let n = self.source.read(&mut scratch[..needed]).await?;
            if n == 0 {
                self.end();
                return Ok(None);
            }

            let mut input = &scratch[..n];
            match self.decoder.decode(&mut input) {
                Ok(Decoded::Header(header)) => return Ok(Some(header)),
                Ok(Decoded::NeedMore) => continue,
                Ok(Decoded::Payload(_) | Decoded::Finished) => {
                    self.end();
                    return Ok(None);
                }
                Err(error) => {
                    self.malformed = true;
                    return Err(io::Error::new(io::ErrorKind::InvalidData, error));
                }
            }
        }
    }

    fn end(&mut self) {
        if self.ending.is_some() {
            return;
        }

        let ending = self.decoder.finish();
        match ending {
            Ending::Clean => trace!("stream ended"),
            Ending::TruncatedHeader(seen) => {
                warn!(seen, "stream ended inside a frame header");
            }
            Ending::TruncatedPayload(missing) => {
                warn!(missing, "stream ended inside a frame payload");
            }
        }
        self.ending = Some(ending);
    }
}

/// One frame's worth of a stdio stream.
///
/// Reading past the frame's payload reports end-of-stream. Fragments borrow the
/// stream they came from, so only one exists at a time.
pub struct Fragment<'a, R = Source> {
    stdio: Option<Stdio>,
    reader: BoundedReader<&'a mut R>,
}

impl<R> fmt::Debug for Fragment<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fragment")
            .field("stdio", &self.stdio)
            .field("budget", self.reader.budget())
            .finish()
    }
}

impl<'a, R> Fragment<'a, R> {
    fn new(stdio: Option<Stdio>, source: &'a mut R, capacity: u64) -> Self {
        Self {
            stdio,
            reader: BoundedReader::new(source, capacity),
        }
    }

    /// The stdio stream this fragment belongs to. `None` for TTY streams.
    pub fn stdio(&self) -> Option<Stdio> {
        self.stdio
    }

    /// Payload length, or `None` for an unbounded TTY stream.
    pub fn len(&self) -> Option<u64> {
        self.stdio.map(|_| self.reader.budget().capacity())
    }

    /// Is this an empty frame?
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Unread payload bytes, clamped to `usize`.
    pub fn available(&self) -> usize {
        self.reader.available()
    }

    /// A handle onto this fragment's read accounting.
    pub fn budget(&self) -> &Budget {
        self.reader.budget()
    }
}

impl<R> Fragment<'_, R>
where
    R: AsyncRead + Unpin,
{
    /// Read the rest of the fragment into a buffer.
    pub async fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.available().min(64 * 1024));
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl<R> AsyncRead for Fragment<'_, R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}
