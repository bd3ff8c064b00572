//! HTTP/1.1 handshake over a transport stream.

use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{debug, trace, Instrument as _};

use super::pool::Connection;
use crate::transport::DockerStream;

/// The HTTP handshake on a fresh connection failed.
#[derive(Debug, Error)]
#[error("handshake: {0}")]
pub struct HandshakeError(#[source] hyper::Error);

/// Perform the HTTP/1.1 handshake and spawn the connection driver.
///
/// The driver keeps running after an upgrade, handing the raw stream to
/// whoever awaits `hyper::upgrade::on` for the response.
pub(crate) async fn handshake(stream: DockerStream) -> Result<Connection, HandshakeError> {
    let transport = stream.transport();
    trace!(transport, "handshake h1");

    let (sender, conn) = hyper::client::conn::http1::Builder::new()
        .handshake(TokioIo::new(stream))
        .await
        .map_err(HandshakeError)?;

    let span = tracing::trace_span!("connection", transport);
    tokio::spawn(
        async move {
            if let Err(error) = conn.with_upgrades().await {
                // Idle connections are expected to hit read timeouts or be
                // closed by the engine.
                debug!(%error, "h1 connection driver error");
            } else {
                trace!("connection closed");
            }
        }
        .instrument(span),
    );

    trace!("handshake complete");
    Ok(sender)
}
