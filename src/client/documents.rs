use std::fmt;
use std::marker::PhantomData;

use bytes::{Buf as _, BytesMut};
use futures_core::Stream;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use tracing::trace;

use super::pool::Pooled;
use crate::error::Error;

/// A lazy sequence of JSON documents read from a response body.
///
/// Documents may be newline delimited or simply concatenated, as the engine
/// does for progress streams like image pulls. The sequence ends when the
/// engine closes the body.
pub struct DocumentStream<T> {
    body: Option<Incoming>,
    buffer: BytesMut,
    connection: Option<Pooled>,
    finished: bool,
    documents: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for DocumentStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStream")
            .field("buffered", &self.buffer.len())
            .field("documents", &self.documents)
            .field("finished", &self.finished)
            .field("closed", &self.body.is_none())
            .finish()
    }
}

impl<T> DocumentStream<T> {
    pub(crate) fn new(body: Incoming, connection: Pooled) -> Self {
        Self {
            body: Some(body),
            buffer: BytesMut::new(),
            connection: Some(connection),
            finished: false,
            documents: 0,
            _marker: PhantomData,
        }
    }

    /// Has the stream been closed, or read to the end?
    pub fn is_closed(&self) -> bool {
        self.body.is_none()
    }

    /// Stop reading. Unread documents are discarded.
    ///
    /// Closing twice is harmless.
    pub fn close(&mut self) {
        self.buffer.clear();
        if self.body.take().is_none() {
            return;
        }
        self.release();
        trace!(documents = self.documents, "document stream closed");
    }

    fn release(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        if !self.finished {
            connection.discard();
        }
    }
}

impl<T> DocumentStream<T>
where
    T: DeserializeOwned,
{
    /// The next document, or `None` once the body has ended.
    pub async fn next(&mut self) -> Result<Option<T>, Error> {
        loop {
            if let Some(document) = self.parse()? {
                self.documents += 1;
                return Ok(Some(document));
            }

            if self.finished {
                return self.end();
            }

            let Some(body) = self.body.as_mut() else {
                return Ok(None);
            };

            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(error)) => {
                    self.close();
                    return Err(error.into());
                }
                None => self.finished = true,
            }
        }
    }

    /// Parse one complete document from the front of the buffer.
    fn parse(&mut self) -> Result<Option<T>, Error> {
        let (next, offset) = {
            let mut documents =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<T>();
            let next = documents.next();
            (next, documents.byte_offset())
        };

        match next {
            Some(Ok(document)) => {
                self.buffer.advance(offset);
                Ok(Some(document))
            }
            Some(Err(error)) if error.is_eof() => Ok(None),
            Some(Err(error)) => {
                self.close();
                Err(error.into())
            }
            None => {
                // Only whitespace remains.
                self.buffer.clear();
                Ok(None)
            }
        }
    }

    fn end(&mut self) -> Result<Option<T>, Error> {
        let trailing = self.buffer.len();
        self.close();
        if trailing > 0 {
            return Err(Error::processing(format!(
                "response body ended inside a document ({trailing} bytes unparsed)"
            )));
        }
        Ok(None)
    }

    /// Adapt into a [`Stream`] of documents.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Error>> {
        futures_util::stream::unfold(self, |mut documents| async move {
            match documents.next().await {
                Ok(Some(document)) => Some((Ok(document), documents)),
                Ok(None) => None,
                Err(error) => Some((Err(error), documents)),
            }
        })
    }
}

impl<T> Drop for DocumentStream<T> {
    fn drop(&mut self) {
        self.body = None;
        self.release();
    }
}
