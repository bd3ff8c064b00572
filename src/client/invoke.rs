use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, CONNECTION, CONTENT_TYPE, HOST, UPGRADE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace, Instrument as _};

use super::documents::DocumentStream;
use super::pool::Pooled;
use super::Client;
use crate::body::{Body, BodyReader, Request};
use crate::error::{Error, ErrorMap, InvocationError, InvocationErrorKind};
use crate::version::ApiVersion;

#[derive(Debug, Clone)]
enum VersionChoice {
    Client,
    Unversioned,
    Explicit(ApiVersion),
}

/// A request to the engine.
///
/// ```
/// # use dockerdriver::client::Invocation;
/// # use dockerdriver::InvocationErrorKind;
/// # use http::StatusCode;
/// let invocation = Invocation::post("/containers/web/stop")
///     .query("t", 5)
///     .on(StatusCode::NOT_MODIFIED, InvocationErrorKind::AlreadyStopped)
///     .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound);
/// assert_eq!(invocation.path_and_query(""), "/containers/web/stop?t=5");
/// ```
#[derive(Debug)]
pub struct Invocation {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Result<Bytes, serde_json::Error>>,
    headers: HeaderMap,
    errors: ErrorMap,
    version: VersionChoice,
    upgrade: bool,
}

impl Invocation {
    /// A request for `path`, relative to the version prefix.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
            errors: ErrorMap::new(),
            version: VersionChoice::Client,
            upgrade: false,
        }
    }

    /// A `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// A `POST` request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// A `DELETE` request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Append a query parameter. Keys and values are percent-encoded.
    pub fn query(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Append a query parameter if `value` is present.
    pub fn query_opt<V>(self, key: impl Into<String>, value: Option<V>) -> Self
    where
        V: fmt::Display,
    {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    /// Send `value` as the JSON request body.
    ///
    /// Serialization errors are reported when the invocation is sent.
    pub fn json<T>(mut self, value: &T) -> Self
    where
        T: Serialize + ?Sized,
    {
        self.body = Some(serde_json::to_vec(value).map(Bytes::from));
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Map a response status to an error kind.
    pub fn on(mut self, status: StatusCode, kind: InvocationErrorKind) -> Self {
        self.errors = self.errors.on(status, kind);
        self
    }

    /// Replace the status to error kind mapping.
    pub fn errors(mut self, errors: ErrorMap) -> Self {
        self.errors = errors;
        self
    }

    /// Send the request without a version prefix.
    pub fn unversioned(mut self) -> Self {
        self.version = VersionChoice::Unversioned;
        self
    }

    /// Send the request with a specific version prefix, instead of the client's.
    pub fn version(mut self, version: ApiVersion) -> Self {
        self.version = VersionChoice::Explicit(version);
        self
    }

    /// Ask the engine to upgrade the connection to a raw stream.
    pub fn upgrade(mut self) -> Self {
        self.upgrade = true;
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target under `prefix`, with the encoded query string.
    pub fn path_and_query(&self, prefix: &str) -> String {
        let mut target = format!("{prefix}{}", self.path);
        for (idx, (key, value)) in self.query.iter().enumerate() {
            target.push(if idx == 0 { '?' } else { '&' });
            target.push_str(&urlencoding::encode(key));
            target.push('=');
            target.push_str(&urlencoding::encode(value));
        }
        target
    }

    fn prefix(&self, client: &Client) -> String {
        match &self.version {
            VersionChoice::Client => client.api_version().path_prefix(),
            VersionChoice::Unversioned => String::new(),
            VersionChoice::Explicit(version) => version.path_prefix(),
        }
    }

    fn into_request(self, client: &Client) -> Result<(Request, Call), Error> {
        let target = self.path_and_query(&self.prefix(client));
        let uri = Uri::try_from(target.as_str()).map_err(Error::processing)?;

        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .header(HOST, client.host().clone())
            .header(USER_AGENT, client.user_agent().clone());

        if self.upgrade {
            builder = builder
                .header(CONNECTION, HeaderValue::from_static("Upgrade"))
                .header(UPGRADE, HeaderValue::from_static("tcp"));
        }

        let body = match self.body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Body::full(body?)
            }
            None => Body::empty(),
        };

        let mut request = builder.body(body).map_err(Error::processing)?;
        request.headers_mut().extend(self.headers);

        let call = Call {
            method: self.method,
            target,
            errors: self.errors,
        };
        Ok((request, call))
    }
}

/// What is needed to report a failed call.
#[derive(Debug)]
struct Call {
    method: Method,
    target: String,
    errors: ErrorMap,
}

impl Call {
    async fn validate(&self, response: Response<Incoming>) -> Result<Response<Incoming>, Error> {
        let status = response.status();
        if status.is_informational() || status.is_success() {
            return Ok(response);
        }

        let body = read_diagnostic(response.into_body()).await;
        let error = InvocationError::from_response(
            &self.method,
            &self.target,
            status,
            &body,
            &self.errors,
        );
        debug!(%status, kind = %error.kind(), "invocation failed");
        Err(error.into())
    }
}

/// Read an error response body, never failing.
///
/// Keeps whatever arrived before the body broke off.
async fn read_diagnostic(mut body: Incoming) -> String {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(data) = frame.into_data() {
                    collected.extend_from_slice(&data);
                }
            }
            Err(error) => {
                debug!(%error, captured = collected.len(), "error response body ended early");
                break;
            }
        }
    }
    String::from_utf8_lossy(&collected).trim().to_owned()
}

impl Client {
    /// Send an invocation, returning the validated response and the connection
    /// it arrived on.
    pub(crate) async fn send(
        &self,
        invocation: Invocation,
    ) -> Result<(Response<Incoming>, Pooled), Error> {
        self.ensure_open()?;
        let (request, call) = invocation.into_request(self)?;
        let span = tracing::debug_span!("invoke", method = %call.method, path = %call.target);

        async move {
            let mut pooled = self.connection().await?;
            let Some(sender) = pooled.connection() else {
                return Err(Error::Closed);
            };

            trace!("sending request");
            let response = match sender.send_request(request).await {
                Ok(response) => response,
                Err(error) => {
                    pooled.discard();
                    return Err(error.into());
                }
            };
            debug!(status = %response.status(), "response");

            let response = call.validate(response).await?;
            Ok((response, pooled))
        }
        .instrument(span)
        .await
    }

    /// Send an invocation and parse the response body as a single JSON document.
    ///
    /// The body is always read to the end, so the connection can be reused.
    pub async fn invoke<T>(&self, invocation: Invocation) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let (response, pooled) = self.send(invocation).await?;
        let body = response.into_body().collect().await?.to_bytes();
        drop(pooled);
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send an invocation where only success or failure matters.
    pub async fn invoke_void(&self, invocation: Invocation) -> Result<(), Error> {
        let (response, pooled) = self.send(invocation).await?;
        let body = response.into_body().collect().await?.to_bytes();
        trace!(discarded = body.len(), "response body discarded");
        drop(pooled);
        Ok(())
    }

    /// Send an invocation and read the response body as a byte stream.
    pub async fn invoke_stream(&self, invocation: Invocation) -> Result<ResponseReader, Error> {
        let (response, pooled) = self.send(invocation).await?;
        Ok(ResponseReader::new(response.into_body(), pooled))
    }

    /// Send an invocation whose response is a sequence of JSON documents.
    pub async fn invoke_multi_document<T>(
        &self,
        invocation: Invocation,
    ) -> Result<DocumentStream<T>, Error>
    where
        T: DeserializeOwned,
    {
        let (response, pooled) = self.send(invocation).await?;
        Ok(DocumentStream::new(response.into_body(), pooled))
    }
}

/// A response body being read as a byte stream.
///
/// The connection is returned to the pool if the body was read to the end
/// before the reader is dropped, and closed otherwise.
pub struct ResponseReader {
    reader: BodyReader,
    connection: Option<Pooled>,
}

impl fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseReader")
            .field("reader", &self.reader)
            .finish()
    }
}

impl ResponseReader {
    pub(crate) fn new(body: Incoming, connection: Pooled) -> Self {
        Self {
            reader: BodyReader::new(body),
            connection: Some(connection),
        }
    }

    /// Has the whole body been read?
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }
}

impl AsyncRead for ResponseReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if !self.reader.is_finished() {
                connection.discard();
            }
        }
    }
}
