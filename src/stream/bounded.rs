//! A reader which yields at most a fixed number of bytes from its source.
//!
//! The budget is shared: [`Budget`] is a cheap handle onto the same counters, so
//! one task may watch how much of a fragment remains while another drains it.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt as _, ReadBuf};

#[derive(Debug)]
struct BudgetState {
    capacity: u64,
    consumed: u64,
    closed: bool,
}

/// Shared accounting for a [`BoundedReader`].
#[derive(Debug, Clone)]
pub struct Budget {
    state: Arc<Mutex<BudgetState>>,
}

impl Budget {
    fn new(capacity: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BudgetState {
                capacity,
                consumed: 0,
                closed: false,
            })),
        }
    }

    /// Total bytes this reader may yield.
    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    /// Bytes yielded (or discarded) so far.
    pub fn consumed(&self) -> u64 {
        self.state.lock().consumed
    }

    /// Bytes not yet consumed. Zero once closed.
    pub fn remaining(&self) -> u64 {
        let state = self.state.lock();
        if state.closed {
            0
        } else {
            state.capacity - state.consumed
        }
    }

    /// Bytes not yet consumed, clamped to `usize`. Zero once closed.
    pub fn available(&self) -> usize {
        usize::try_from(self.remaining()).unwrap_or(usize::MAX)
    }

    /// Has the reader been closed?
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // Unlike `remaining`, ignores `closed`: the source still has to be skipped.
    fn unread(&self) -> u64 {
        let state = self.state.lock();
        state.capacity - state.consumed
    }

    fn consume(&self, n: u64) {
        let mut state = self.state.lock();
        state.consumed = state.consumed.saturating_add(n).min(state.capacity);
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Reads at most `capacity` bytes from the source, then reports end-of-stream.
///
/// Closing the reader does not close the source.
#[derive(Debug)]
pub struct BoundedReader<R> {
    source: R,
    budget: Budget,
}

impl<R> BoundedReader<R> {
    /// Bound `source` to `capacity` bytes.
    pub fn new(source: R, capacity: u64) -> Self {
        Self {
            source,
            budget: Budget::new(capacity),
        }
    }

    /// Bound `source` by an existing budget, continuing its accounting.
    pub(crate) fn with_budget(source: R, budget: Budget) -> Self {
        Self { source, budget }
    }

    /// A handle to this reader's budget.
    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Unread budget, clamped to `usize`. Zero once closed.
    pub fn available(&self) -> usize {
        self.budget.available()
    }

    /// Unread budget. Zero once closed.
    pub fn remaining(&self) -> u64 {
        self.budget.remaining()
    }

    /// Stop reading. Later reads report end-of-stream; the source is left as is.
    pub fn close(&mut self) {
        self.budget.close();
    }

    /// Has the reader been closed?
    pub fn is_closed(&self) -> bool {
        self.budget.is_closed()
    }

    /// The underlying source.
    pub fn get_ref(&self) -> &R {
        &self.source
    }

    /// Recover the source.
    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R> BoundedReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Discard whatever remains of the budget and close the reader.
    ///
    /// A reader closed earlier is still drained. On success the source is
    /// positioned exactly `capacity` bytes past where this reader started.
    /// Returns the number of bytes discarded, which is smaller than the unread
    /// budget only if the source ended first.
    pub async fn exhaust_and_close(&mut self) -> io::Result<u64> {
        let remaining = self.budget.unread();
        let result = if remaining == 0 {
            Ok(0)
        } else {
            tokio::io::copy(
                &mut (&mut self.source).take(remaining),
                &mut tokio::io::sink(),
            )
            .await
        };

        if let Ok(discarded) = result {
            self.budget.consume(discarded);
            if discarded < remaining {
                tracing::debug!(
                    discarded,
                    remaining,
                    "source ended before the budget was exhausted"
                );
            }
        }
        self.budget.close();
        result
    }
}

impl<R> AsyncRead for BoundedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let limit = this.budget.available().min(buf.remaining());
        if limit == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(limit));
        ready!(Pin::new(&mut this.source).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();

        buf.advance(n);
        this.budget.consume(n as u64);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt as _;

    #[tokio::test]
    async fn yields_at_most_capacity() {
        for (capacity, len) in [(0u64, 10usize), (4, 10), (10, 10), (16, 10)] {
            let data = vec![7u8; len];
            let mut reader = BoundedReader::new(&data[..], capacity);

            let mut out = Vec::new();
            reader.read_to_end(&mut out).await.unwrap();
            assert_eq!(out.len() as u64, capacity.min(len as u64));
        }
    }

    #[tokio::test]
    async fn available_tracks_reads() {
        let data = b"abcdefghij";
        let mut reader = BoundedReader::new(&data[..], 6);
        assert_eq!(reader.available(), 6);

        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.available(), 2);

        let budget = reader.budget().clone();
        assert_eq!(budget.consumed(), 4);

        reader.close();
        assert!(budget.is_closed());
        assert_eq!(budget.available(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhaust_positions_source_after_budget() {
        let data = b"0123456789";
        let mut source = &data[..];

        let mut reader = BoundedReader::new(&mut source, 7);
        let mut two = [0u8; 2];
        reader.read_exact(&mut two).await.unwrap();
        assert_eq!(reader.exhaust_and_close().await.unwrap(), 5);
        assert!(reader.is_closed());
        drop(reader);

        let mut rest = Vec::new();
        source.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"789");
    }

    #[tokio::test]
    async fn exhaust_after_close_still_skips() {
        let data = b"0123456789";
        let mut source = &data[..];

        let mut reader = BoundedReader::new(&mut source, 6);
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).await.unwrap();
        reader.close();
        assert_eq!(reader.remaining(), 0);

        assert_eq!(reader.exhaust_and_close().await.unwrap(), 5);
        assert_eq!(reader.budget().consumed(), 6);
        drop(reader);

        let mut rest = Vec::new();
        source.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"6789");
    }

    #[tokio::test]
    async fn shared_budget_continues_accounting() {
        let data = b"abcdefgh";
        let mut source = &data[..];

        let mut first = BoundedReader::new(&mut source, 5);
        let mut two = [0u8; 2];
        first.read_exact(&mut two).await.unwrap();
        let budget = first.budget().clone();
        drop(first);

        let mut resumed = BoundedReader::with_budget(&mut source, budget.clone());
        assert_eq!(resumed.exhaust_and_close().await.unwrap(), 3);
        assert!(budget.is_closed());
        assert_eq!(budget.consumed(), 5);
        drop(resumed);

        assert_eq!(source, b"fgh");
    }

    #[tokio::test]
    async fn exhaust_short_source() {
        let data = b"abc";
        let mut reader = BoundedReader::new(&data[..], 10);
        assert_eq!(reader.exhaust_and_close().await.unwrap(), 3);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn available_clamps_to_usize() {
        let reader = BoundedReader::new(tokio::io::empty(), u64::MAX);
        assert_eq!(reader.available() as u64, u64::MAX.min(usize::MAX as u64));
    }
}
