//! Error taxonomy for engine invocations.
//!
//! Failures fall into a few broad groups:
//! - [`ConfigError`]: the connection descriptor is unusable. Raised when the client is built.
//! - [`Error::Processing`]: no usable response was obtained (connection failure, malformed body).
//! - [`Error::Invocation`]: the engine answered with a non-success status.
//! - [`Error::Closed`]: the client was closed before the call.
//! - [`Error::MalformedStream`]: a multiplexed stdio stream carried a bad frame header.
//! - [`Error::Timeout`]: a transport read, write or connect timed out.

use std::fmt;
use std::io;

use http::{Method, StatusCode};
use thiserror::Error;

use crate::config::ConfigError;
use crate::stream::frame::MalformedFrame;
use crate::transport::SocketTimeout;
use crate::BoxError;

/// Client error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection descriptor was invalid.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// No response could be obtained, or the response could not be processed.
    #[error("processing: {0}")]
    Processing(#[source] BoxError),

    /// The engine rejected the request.
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// The client has been closed.
    #[error("client is closed")]
    Closed,

    /// A multiplexed stream contained an invalid frame.
    #[error("malformed stream: {0}")]
    MalformedStream(#[from] MalformedFrame),

    /// A transport operation timed out.
    #[error("timeout: {0}")]
    Timeout(#[from] SocketTimeout),
}

impl Error {
    /// Classify an erased error, lifting timeouts and malformed frames out of the
    /// source chain so callers can match on them directly.
    pub(crate) fn processing<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        let error = error.into();
        if let Some(timeout) = find_in_chain::<SocketTimeout>(&*error) {
            return Error::Timeout(*timeout);
        }
        if let Some(frame) = find_in_chain::<MalformedFrame>(&*error) {
            return Error::MalformedStream(frame.clone());
        }
        Error::Processing(error)
    }

    /// The invocation error, if the engine answered with a failure status.
    pub fn as_invocation(&self) -> Option<&InvocationError> {
        match self {
            Error::Invocation(error) => Some(error),
            _ => None,
        }
    }

    /// The taxonomy tag of an invocation failure.
    pub fn invocation_kind(&self) -> Option<InvocationErrorKind> {
        self.as_invocation().map(InvocationError::kind)
    }

    /// Did the engine report that the target was not found?
    pub fn is_not_found(&self) -> bool {
        self.invocation_kind() == Some(InvocationErrorKind::NotFound)
    }

    /// Was this a transport timeout?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::processing(error)
    }
}

impl From<hyper::Error> for Error {
    fn from(error: hyper::Error) -> Self {
        Error::processing(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Processing(error.into())
    }
}

/// Walk an error's source chain looking for `T`.
///
/// `io::Error` hides its custom payload from `source()`, so it is unwrapped explicitly.
fn find_in_chain<'a, T>(error: &'a (dyn std::error::Error + 'static)) -> Option<&'a T>
where
    T: std::error::Error + 'static,
{
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(found) = error.downcast_ref::<T>() {
            return Some(found);
        }

        if let Some(inner) = error
            .downcast_ref::<io::Error>()
            .and_then(|io| io.get_ref())
        {
            if let Some(found) = find_in_chain::<T>(inner) {
                return Some(found);
            }
        }

        current = error.source();
    }
    None
}

/// Taxonomy tag for a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InvocationErrorKind {
    /// The request was malformed or had invalid parameters.
    BadRequest,

    /// The target container or image does not exist.
    NotFound,

    /// The request was not authorized, usually a registry credential problem.
    Unauthorized,

    /// The container was already stopped.
    AlreadyStopped,

    /// Any other failure.
    Failed,
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvocationErrorKind::BadRequest => "bad request",
            InvocationErrorKind::NotFound => "not found",
            InvocationErrorKind::Unauthorized => "unauthorized",
            InvocationErrorKind::AlreadyStopped => "already stopped",
            InvocationErrorKind::Failed => "invocation failed",
        };
        f.write_str(name)
    }
}

/// The engine answered with a status outside of 1xx/2xx.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    kind: InvocationErrorKind,
    status: StatusCode,
    message: String,
}

impl InvocationError {
    /// Build the error for a failed response, consulting the call's error map.
    pub(crate) fn from_response(
        method: &Method,
        path: &str,
        status: StatusCode,
        body: &str,
        map: &ErrorMap,
    ) -> Self {
        let message = format!(
            "{method} {path}: invocation failed with code {} -- {body}",
            status.as_u16()
        );
        let kind = map.kind(status).unwrap_or(InvocationErrorKind::Failed);
        Self {
            kind,
            status,
            message,
        }
    }

    /// The taxonomy tag.
    pub fn kind(&self) -> InvocationErrorKind {
        self.kind
    }

    /// The HTTP status the engine returned.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Human readable message, including any captured response body.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Per-call mapping from status codes to specialized error kinds.
///
/// Statuses without an entry fall back to [`InvocationErrorKind::Failed`].
///
/// ```
/// # use dockerdriver::error::ErrorMap;
/// # use dockerdriver::InvocationErrorKind;
/// # use http::StatusCode;
/// let map = ErrorMap::new()
///     .on(StatusCode::NOT_MODIFIED, InvocationErrorKind::AlreadyStopped)
///     .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound);
/// assert_eq!(map.kind(StatusCode::NOT_FOUND), Some(InvocationErrorKind::NotFound));
/// assert_eq!(map.kind(StatusCode::CONFLICT), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    entries: Vec<(StatusCode, InvocationErrorKind)>,
}

impl ErrorMap {
    /// An empty map, every failure is generic.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `status` to `kind`. Later entries win.
    pub fn on(mut self, status: StatusCode, kind: InvocationErrorKind) -> Self {
        self.entries.push((status, kind));
        self
    }

    /// Look up the specialized kind for `status`.
    pub fn kind(&self, status: StatusCode) -> Option<InvocationErrorKind> {
        self.entries
            .iter()
            .rev()
            .find(|(code, _)| *code == status)
            .map(|(_, kind)| *kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Into<BoxError>);

    #[test]
    fn invocation_message_format() {
        let map = ErrorMap::new().on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound);
        let error = InvocationError::from_response(
            &Method::POST,
            "/containers/abc/start",
            StatusCode::NOT_FOUND,
            "no such container",
            &map,
        );

        assert_eq!(error.kind(), InvocationErrorKind::NotFound);
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            error.message(),
            "POST /containers/abc/start: invocation failed with code 404 -- no such container"
        );
    }

    #[test]
    fn unmapped_status_is_generic() {
        let error = InvocationError::from_response(
            &Method::GET,
            "/version",
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
            &ErrorMap::default(),
        );
        assert_eq!(error.kind(), InvocationErrorKind::Failed);
    }

    #[test]
    fn timeouts_are_lifted_from_io_errors() {
        let io = io::Error::new(io::ErrorKind::TimedOut, SocketTimeout::Read);
        let error = Error::from(io);
        assert!(matches!(error, Error::Timeout(SocketTimeout::Read)));

        let io = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(Error::from(io), Error::Processing(_)));
    }

    #[test]
    fn malformed_frames_are_lifted() {
        let io = io::Error::new(io::ErrorKind::InvalidData, MalformedFrame::UnknownStdio(7));
        assert!(matches!(
            Error::from(io),
            Error::MalformedStream(MalformedFrame::UnknownStdio(7))
        ));
    }
}
