//! An in-process engine for integration tests.
//!
//! Serves a small slice of the engine API over a unix socket in a temporary
//! directory, using hyper's server connection API.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8PathBuf;
use dockerdriver::stream::{FrameHeader, Stdio};
use dockerdriver::{ApiVersion, ConnectionDescriptor};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

const SOCKET: &str = "docker.sock";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Encode one multiplexed frame.
pub fn frame(stdio: Stdio, payload: &[u8]) -> Vec<u8> {
    let mut bytes = FrameHeader::new(stdio, payload.len() as u32)
        .encode()
        .to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

/// A request the engine received.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub target: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub content_type: Option<String>,
}

impl Recorded {
    pub fn line(&self) -> String {
        format!("{} {}", self.method, self.target)
    }
}

#[derive(Debug, Clone, Default)]
struct Container {
    tty: bool,
    running: bool,
    logs: Vec<u8>,
}

#[derive(Debug)]
struct State {
    api_version: String,
    min_api_version: Option<String>,
    containers: Mutex<HashMap<String, Container>>,
    requests: Mutex<Vec<Recorded>>,
    connections: AtomicUsize,
    created: AtomicUsize,
}

pub struct FakeEngine {
    _dir: tempfile::TempDir,
    path: Utf8PathBuf,
    state: Arc<State>,
    server: JoinHandle<()>,
}

impl FakeEngine {
    pub fn start(api_version: &str, min_api_version: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join(SOCKET)).unwrap();
        let listener = UnixListener::bind(&path).unwrap();

        let state = Arc::new(State {
            api_version: api_version.to_owned(),
            min_api_version: min_api_version.map(str::to_owned),
            containers: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        });

        let server = tokio::spawn(serve(listener, state.clone()));
        Self {
            _dir: dir,
            path,
            state,
            server,
        }
    }

    pub fn with_container(self, id: &str, tty: bool, running: bool, logs: Vec<u8>) -> Self {
        self.state.containers.lock().insert(
            id.to_owned(),
            Container { tty, running, logs },
        );
        self
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::unix(self.path.clone()).unwrap()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.requests().iter().map(Recorded::line).collect()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Answers every request on every connection with the same canned bytes,
/// then hangs up. Useful for responses hyper's server would never produce.
pub struct RawEngine {
    _dir: tempfile::TempDir,
    path: Utf8PathBuf,
    server: JoinHandle<()>,
}

impl RawEngine {
    pub fn start(response: &'static [u8]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join(SOCKET)).unwrap();
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = stream.write_all(response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            _dir: dir,
            path,
            server,
        }
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::unix(self.path.clone()).unwrap()
    }
}

impl Drop for RawEngine {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve(listener: UnixListener, state: Arc<State>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        state.connections.fetch_add(1, Ordering::SeqCst);

        let state = state.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(state, req).await) }
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades();
            if let Err(error) = conn.await {
                tracing::debug!(%error, "fake engine connection error");
            }
        });
    }
}

fn reply(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn message(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    reply(status, json!({ "message": message.into() }))
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn split_version(path: &str) -> (Option<ApiVersion>, &str) {
    if let Some(rest) = path.strip_prefix("/v") {
        let end = rest.find('/').unwrap_or(rest.len());
        let version = &rest[..end];
        if version.starts_with(|c: char| c.is_ascii_digit()) {
            return (Some(ApiVersion::parse(version)), &rest[end..]);
        }
    }
    (None, path)
}

fn query(req: &Request<Incoming>) -> HashMap<String, String> {
    req.uri()
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| {
            (
                urlencoding::decode(key).unwrap().into_owned(),
                urlencoding::decode(value).unwrap().into_owned(),
            )
        })
        .collect()
}

fn header(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn route(state: Arc<State>, mut req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let uri_path = req.uri().path().to_owned();
    let params = query(&req);

    state.requests.lock().push(Recorded {
        method: method.clone(),
        target: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_default(),
        host: header(&req, "host"),
        user_agent: header(&req, "user-agent"),
        content_type: header(&req, "content-type"),
    });

    let (version, path) = split_version(&uri_path);
    if let Some(version) = version {
        if version > ApiVersion::parse(&state.api_version) {
            return message(
                StatusCode::BAD_REQUEST,
                format!(
                    "client version {version} is too new. Maximum supported API version is {}",
                    state.api_version
                ),
            );
        }
        if let Some(min) = &state.min_api_version {
            if version < ApiVersion::parse(min) {
                return message(
                    StatusCode::BAD_REQUEST,
                    format!(
                        "client version {version} is too old. Minimum supported API version is {min}"
                    ),
                );
            }
        }
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (&method, segments.as_slice()) {
        (&Method::GET, ["version"]) => {
            let mut report = json!({
                "Version": "24.0.7",
                "ApiVersion": state.api_version,
                "Os": "linux",
            });
            if let Some(min) = &state.min_api_version {
                report["MinAPIVersion"] = json!(min);
            }
            reply(StatusCode::OK, report)
        }

        (&Method::GET, ["containers", "json"]) => {
            let all = params.get("all").is_some_and(|all| all == "true");
            let containers = state.containers.lock();
            let mut listed: Vec<Value> = containers
                .iter()
                .filter(|(_, container)| all || container.running)
                .map(|(id, container)| {
                    json!({
                        "Id": id,
                        "State": if container.running { "running" } else { "exited" },
                    })
                })
                .collect();
            listed.sort_by(|a, b| a["Id"].as_str().cmp(&b["Id"].as_str()));
            reply(StatusCode::OK, Value::Array(listed))
        }

        (&Method::POST, ["containers", "create"]) => {
            let body = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(_) => return empty(StatusCode::INTERNAL_SERVER_ERROR),
            };
            let config: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let Some(image) = config.get("Image").and_then(Value::as_str) else {
                return message(StatusCode::BAD_REQUEST, "config must name an image");
            };
            if image.starts_with("missing") {
                return message(StatusCode::NOT_FOUND, format!("No such image: {image}"));
            }

            let n = state.created.fetch_add(1, Ordering::SeqCst);
            let id = params
                .get("name")
                .cloned()
                .unwrap_or_else(|| format!("c{n:04}"));
            let tty = config.get("Tty").and_then(Value::as_bool).unwrap_or(false);
            state.containers.lock().insert(
                id.clone(),
                Container {
                    tty,
                    ..Default::default()
                },
            );
            reply(StatusCode::CREATED, json!({ "Id": id, "Warnings": [] }))
        }

        (&Method::POST, ["images", "create"]) => {
            let image = params.get("fromImage").cloned().unwrap_or_default();
            if image.starts_with("private/") {
                return message(StatusCode::UNAUTHORIZED, "authentication required");
            }
            let tag = params.get("tag").cloned().unwrap_or_else(|| "latest".into());

            // Mixed framing: newline delimited, then concatenated.
            let body = format!(
                "{}\n{}{}\r\n",
                json!({ "status": format!("Pulling from {image}"), "id": tag }),
                json!({ "status": "Downloading", "progressDetail": { "current": 1, "total": 2 } }),
                json!({ "status": format!("Downloaded newer image for {image}:{tag}") }),
            );
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }

        (_, ["containers", id, action]) => {
            let id = (*id).to_owned();
            let action = (*action).to_owned();
            container_route(&state, &method, &id, &action, &params, &mut req)
        }

        _ => message(StatusCode::NOT_FOUND, "page not found"),
    }
}

fn container_route(
    state: &State,
    method: &Method,
    id: &str,
    action: &str,
    params: &HashMap<String, String>,
    req: &mut Request<Incoming>,
) -> Response<Full<Bytes>> {
    if id == "broken" {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "storage driver failed");
    }

    let mut containers = state.containers.lock();
    let Some(container) = containers.get_mut(id) else {
        return message(StatusCode::NOT_FOUND, format!("No such container: {id}"));
    };

    match (method, action) {
        (&Method::GET, "json") => reply(
            StatusCode::OK,
            json!({
                "Id": id,
                "State": { "Running": container.running },
                "Config": { "Tty": container.tty },
            }),
        ),
        (&Method::POST, "start") => {
            if container.running {
                return empty(StatusCode::NOT_MODIFIED);
            }
            container.running = true;
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::POST, "stop") => {
            if !container.running {
                return empty(StatusCode::NOT_MODIFIED);
            }
            container.running = false;
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::POST, "restart") => {
            container.running = true;
            empty(StatusCode::NO_CONTENT)
        }
        (&Method::GET, "logs") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from(container.logs.clone())))
            .unwrap(),
        (&Method::POST, "attach") => {
            let logs = container.logs.clone();
            let echo = params.get("stdin").is_some_and(|stdin| stdin == "true");
            let upgrade = hyper::upgrade::on(req);

            tokio::spawn(async move {
                let upgraded = match upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(error) => {
                        tracing::debug!(%error, "attach upgrade failed");
                        return;
                    }
                };
                let mut io = TokioIo::new(upgraded);
                if io.write_all(&logs).await.is_err() {
                    return;
                }

                if echo {
                    let mut input = Vec::new();
                    if io.read_to_end(&mut input).await.is_ok() && !input.is_empty() {
                        let _ = io.write_all(&frame(Stdio::Stdout, &input)).await;
                    }
                }
                let _ = io.shutdown().await;
            });

            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("Connection", "Upgrade")
                .header("Upgrade", "tcp")
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        _ => message(StatusCode::NOT_FOUND, "page not found"),
    }
}
