//! Request bodies, and an [`AsyncRead`] adapter for response bodies.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf as _, Bytes};
use http_body::Body as _;
use http_body_util::Full;
use tokio::io::{AsyncRead, ReadBuf};

use crate::BoxError;

/// An http request using [Body] as the body.
pub type Request = http::Request<Body>;

/// A request body: empty, or a single buffer.
///
/// Engine requests are either bodiless or carry a JSON document, so there is no
/// streaming variant.
#[derive(Debug, Default)]
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a new body from something which can be converted into [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            inner: InnerBody::Full(Full::new(data)),
        }
    }

    /// Serialize `value` as a JSON body.
    pub fn json<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: serde::Serialize + ?Sized,
    {
        serde_json::to_vec(value).map(Self::full)
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self::full(body)
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self::full(body)
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self::full(body)
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self::full(body)
    }
}

#[derive(Default)]
#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    #[default]
    Empty,
    Full(#[pin] Full<Bytes>),
}

impl fmt::Debug for InnerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(_) => f.debug_struct("Full").finish(),
        }
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        match self.project().inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(body) => body
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(Into::into))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(ref body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self.inner {
            InnerBody::Empty => http_body::SizeHint::with_exact(0),
            InnerBody::Full(ref body) => body.size_hint(),
        }
    }
}

/// Reads a response body as a byte stream.
///
/// Trailers are skipped. Body errors surface as [`io::Error`]s carrying the
/// original error.
#[pin_project::pin_project]
pub struct BodyReader<B = hyper::body::Incoming> {
    #[pin]
    body: B,
    chunk: Bytes,
    finished: bool,
}

impl<B> fmt::Debug for BodyReader<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("buffered", &self.chunk.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<B> BodyReader<B> {
    /// Read from `body`.
    pub fn new(body: B) -> Self {
        Self {
            body,
            chunk: Bytes::new(),
            finished: false,
        }
    }

    /// Has the whole body been read?
    pub fn is_finished(&self) -> bool {
        self.finished && self.chunk.is_empty()
    }
}

impl<B> AsyncRead for BodyReader<B>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.chunk.is_empty() {
                let n = this.chunk.len().min(buf.remaining());
                buf.put_slice(&this.chunk[..n]);
                this.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }

            if *this.finished {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.body.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        *this.chunk = data;
                    }
                }
                Some(Err(error)) => return Poll::Ready(Err(io::Error::other(error))),
                None => *this.finished = true,
            }
        }
    }
}
