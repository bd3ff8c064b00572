//! Typed entry points for common engine endpoints.
//!
//! Request and response documents are left as [`serde_json::Value`]; only the
//! fields the client itself needs (`Id`, `Config.Tty`) are read.

use http::StatusCode;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::documents::DocumentStream;
use super::invoke::{Invocation, ResponseReader};
use super::Client;
use crate::error::{Error, InvocationErrorKind};
use crate::stream::{Mode, StreamHandle};

/// Options for [`Client::logs`].
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Keep the stream open and follow new output.
    pub follow: bool,

    /// Include stdout.
    pub stdout: bool,

    /// Include stderr.
    pub stderr: bool,

    /// Prefix every line with a timestamp.
    pub timestamps: bool,

    /// Only return this many lines from the end of the log.
    pub tail: Option<u64>,

    /// Only return output since this unix timestamp.
    pub since: Option<i64>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: None,
            since: None,
        }
    }
}

impl LogOptions {
    /// Follow new output.
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    /// Only return the last `lines` lines.
    pub fn tail(mut self, lines: u64) -> Self {
        self.tail = Some(lines);
        self
    }
}

/// Options for [`Client::attach`].
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Stream output as it is produced.
    pub stream: bool,

    /// Replay the container's log first.
    pub logs: bool,

    /// Attach stdin. The handle's output sink writes to it.
    pub stdin: bool,

    /// Attach stdout.
    pub stdout: bool,

    /// Attach stderr.
    pub stderr: bool,

    /// Override the key sequence for detaching.
    pub detach_keys: Option<String>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            stream: true,
            logs: false,
            stdin: false,
            stdout: true,
            stderr: true,
            detach_keys: None,
        }
    }
}

impl AttachOptions {
    /// Attach stdin as well.
    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }
}

#[derive(Debug, Deserialize)]
struct Created {
    #[serde(rename = "Id")]
    id: String,
}

impl Client {
    /// Engine version information.
    pub async fn version(&self) -> Result<Value, Error> {
        self.invoke(Invocation::get("/version")).await
    }

    /// List containers. Stopped containers are included when `all` is set.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<Value>, Error> {
        self.invoke(Invocation::get("/containers/json").query("all", all))
            .await
    }

    /// Low-level information about a container.
    pub async fn inspect_container(&self, id: &str) -> Result<Value, Error> {
        self.invoke(
            Invocation::get(format!("/containers/{id}/json"))
                .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound),
        )
        .await
    }

    /// Create a container from `config`, returning its id.
    pub async fn create_container(&self, name: Option<&str>, config: &Value) -> Result<String, Error> {
        let created: Created = self
            .invoke(
                Invocation::post("/containers/create")
                    .query_opt("name", name)
                    .json(config)
                    .on(StatusCode::BAD_REQUEST, InvocationErrorKind::BadRequest)
                    .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound),
            )
            .await?;
        debug!(id = %created.id, "container created");
        Ok(created.id)
    }

    /// Start a container.
    pub async fn start_container(&self, id: &str) -> Result<(), Error> {
        self.invoke_void(
            Invocation::post(format!("/containers/{id}/start"))
                .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound),
        )
        .await
    }

    /// Stop a container, killing it after `timeout` seconds.
    pub async fn stop_container(&self, id: &str, timeout: Option<u32>) -> Result<(), Error> {
        self.invoke_void(
            Invocation::post(format!("/containers/{id}/stop"))
                .query_opt("t", timeout)
                .on(StatusCode::NOT_MODIFIED, InvocationErrorKind::AlreadyStopped)
                .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound),
        )
        .await
    }

    /// Restart a container, killing it after `timeout` seconds.
    pub async fn restart_container(&self, id: &str, timeout: Option<u32>) -> Result<(), Error> {
        self.invoke_void(
            Invocation::post(format!("/containers/{id}/restart"))
                .query_opt("t", timeout)
                .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound),
        )
        .await
    }

    /// Pull an image, yielding the engine's progress documents.
    pub async fn pull_image(
        &self,
        image: &str,
        tag: Option<&str>,
    ) -> Result<DocumentStream<Value>, Error> {
        self.invoke_multi_document(
            Invocation::post("/images/create")
                .query("fromImage", image)
                .query_opt("tag", tag)
                .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound)
                .on(StatusCode::UNAUTHORIZED, InvocationErrorKind::Unauthorized),
        )
        .await
    }

    /// A container's log output.
    pub async fn logs(&self, id: &str, options: LogOptions) -> Result<StreamHandle, Error> {
        let invocation = Invocation::get(format!("/containers/{id}/logs"))
            .query("follow", options.follow)
            .query("stdout", options.stdout)
            .query("stderr", options.stderr)
            .query("timestamps", options.timestamps)
            .query_opt("tail", options.tail)
            .query_opt("since", options.since);
        self.open_stream(id, invocation).await
    }

    /// Attach to a running container's stdio.
    pub async fn attach(&self, id: &str, options: AttachOptions) -> Result<StreamHandle, Error> {
        let invocation = Invocation::post(format!("/containers/{id}/attach"))
            .query("stream", options.stream)
            .query("logs", options.logs)
            .query("stdin", options.stdin)
            .query("stdout", options.stdout)
            .query("stderr", options.stderr)
            .query_opt("detachKeys", options.detach_keys);
        self.open_stream(id, invocation).await
    }

    /// The stream framing for a container, from its TTY setting.
    pub async fn stream_mode(&self, id: &str) -> Result<Mode, Error> {
        let inspect = self.inspect_container(id).await?;
        let tty = inspect
            .pointer("/Config/Tty")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Mode::for_tty(tty))
    }

    async fn open_stream(&self, id: &str, invocation: Invocation) -> Result<StreamHandle, Error> {
        let mode = self.stream_mode(id).await?;
        let invocation = invocation
            .upgrade()
            .on(StatusCode::NOT_FOUND, InvocationErrorKind::NotFound)
            .on(StatusCode::BAD_REQUEST, InvocationErrorKind::BadRequest);

        let (response, pooled) = self.send(invocation).await?;
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            debug!(container = id, ?mode, "connection upgraded to raw stream");
            let upgraded = hyper::upgrade::on(response).await?;
            // The upgraded stream leaves the pool for good.
            pooled.discard();
            let (source, sink) = tokio::io::split(TokioIo::new(upgraded));
            return Ok(StreamHandle::new(source, mode).with_sink(sink));
        }

        debug!(container = id, ?mode, status = %response.status(), "streaming response body");
        let reader = ResponseReader::new(response.into_body(), pooled);
        Ok(StreamHandle::new(reader, mode))
    }
}
