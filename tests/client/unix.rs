//! Client invocations against a fake engine on a unix socket.

use dockerdriver::client::Invocation;
use dockerdriver::{ApiVersion, Client, Error, InvocationErrorKind};
use futures_util::StreamExt as _;
use serde_json::{json, Value};

#[path = "../support/mod.rs"]
mod support;

use support::{FakeEngine, RawEngine};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::test]
async fn version_over_unix_socket() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", Some("1.12"));
    let client = Client::new(engine.descriptor())?;

    let version = client.version().await?;
    assert_eq!(version["ApiVersion"], "1.41");

    let requests = engine.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].line(), "GET /version");
    assert_eq!(requests[0].host.as_deref(), Some("docker"));
    assert!(requests[0]
        .user_agent
        .as_deref()
        .is_some_and(|ua| ua.starts_with("dockerdriver/")));

    Ok(())
}

#[tokio::test]
async fn requests_carry_the_client_version() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let descriptor = engine
        .descriptor()
        .with_api_version(ApiVersion::parse("1.40"))
        .with_user_agent("integration-test/1");
    let client = Client::new(descriptor)?;

    client.list_containers(true).await?;
    client
        .invoke_void(Invocation::get("/version").unversioned())
        .await?;

    let requests = engine.requests();
    assert_eq!(
        engine.lines(),
        ["GET /v1.40/containers/json?all=true", "GET /version"]
    );
    assert_eq!(requests[0].user_agent.as_deref(), Some("integration-test/1"));

    Ok(())
}

#[tokio::test]
async fn connections_are_reused() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;

    for _ in 0..3 {
        client.version().await?;
    }

    assert_eq!(engine.connections(), 1);
    assert_eq!(client.idle_connections(), 1);

    Ok(())
}

#[tokio::test]
async fn container_lifecycle() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;

    let id = client
        .create_container(Some("web"), &json!({ "Image": "alpine", "Tty": false }))
        .await?;
    assert_eq!(id, "web");

    let create = engine
        .requests()
        .into_iter()
        .find(|request| request.target.starts_with("/containers/create"))
        .expect("create request");
    assert_eq!(create.target, "/containers/create?name=web");
    assert_eq!(create.content_type.as_deref(), Some("application/json"));

    client.start_container(&id).await?;
    let running = client.list_containers(false).await?;
    assert_eq!(running.len(), 1);
    assert_eq!(running[0]["Id"], "web");

    client.stop_container(&id, Some(1)).await?;
    let error = client.stop_container(&id, None).await.unwrap_err();
    assert_eq!(
        error.invocation_kind(),
        Some(InvocationErrorKind::AlreadyStopped)
    );

    client.restart_container(&id, None).await?;
    let inspect = client.inspect_container(&id).await?;
    assert_eq!(inspect["State"]["Running"], true);

    Ok(())
}

#[tokio::test]
async fn errors_are_mapped() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;

    let error = client.start_container("missing").await.unwrap_err();
    assert!(error.is_not_found());
    let invocation = error.as_invocation().expect("invocation error");
    assert_eq!(invocation.status(), http::StatusCode::NOT_FOUND);
    assert_eq!(
        invocation.message(),
        r#"POST /containers/missing/start: invocation failed with code 404 -- {"message":"No such container: missing"}"#
    );

    let error = client
        .create_container(None, &json!({ "Cmd": ["true"] }))
        .await
        .unwrap_err();
    assert_eq!(error.invocation_kind(), Some(InvocationErrorKind::BadRequest));

    let error = client
        .create_container(None, &json!({ "Image": "missing/image" }))
        .await
        .unwrap_err();
    assert!(error.is_not_found());

    let error = client.restart_container("broken", None).await.unwrap_err();
    assert_eq!(error.invocation_kind(), Some(InvocationErrorKind::Failed));
    assert_eq!(
        error.as_invocation().map(|e| e.status()),
        Some(http::StatusCode::INTERNAL_SERVER_ERROR)
    );

    // Failed calls still leave the connection usable.
    assert_eq!(engine.connections(), 1);

    Ok(())
}

#[tokio::test]
async fn truncated_error_body_keeps_what_arrived() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = RawEngine::start(
        b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 100\r\n\r\npartial",
    );
    let client = Client::new(engine.descriptor())?;

    let error = client.version().await.unwrap_err();
    let invocation = error.as_invocation().expect("invocation error");
    assert_eq!(invocation.kind(), InvocationErrorKind::Failed);
    assert_eq!(invocation.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        invocation.message(),
        "GET /version: invocation failed with code 500 -- partial"
    );

    Ok(())
}

#[tokio::test]
async fn truncated_error_body_is_still_mapped() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = RawEngine::start(
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 64\r\n\r\n{\"message\":\"No such",
    );
    let client = Client::new(engine.descriptor())?;

    let error = client.inspect_container("web").await.unwrap_err();
    assert!(error.is_not_found());
    assert!(error
        .as_invocation()
        .is_some_and(|e| e.message().ends_with(r#"-- {"message":"No such"#)));

    Ok(())
}

#[tokio::test]
async fn error_body_cut_before_any_byte() -> Result<(), BoxError> {
    support::init_tracing();
    let engine =
        RawEngine::start(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 50\r\n\r\n");
    let client = Client::new(engine.descriptor())?;

    let error = client.version().await.unwrap_err();
    assert_eq!(error.invocation_kind(), Some(InvocationErrorKind::Failed));
    assert_eq!(
        error.as_invocation().map(|e| e.message().to_owned()).as_deref(),
        Some("GET /version: invocation failed with code 500 -- ")
    );

    Ok(())
}

#[tokio::test]
async fn pull_image_yields_documents() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;

    let mut progress = client.pull_image("library/alpine", Some("3.19")).await?;
    let mut statuses = Vec::new();
    while let Some(document) = progress.next().await? {
        statuses.push(document["status"].as_str().unwrap_or_default().to_owned());
    }
    assert_eq!(
        statuses,
        [
            "Pulling from library/alpine",
            "Downloading",
            "Downloaded newer image for library/alpine:3.19",
        ]
    );
    assert!(progress.next().await?.is_none());
    assert!(progress.is_closed());
    drop(progress);
    assert_eq!(client.idle_connections(), 1);

    let stream = client.pull_image("library/busybox", None).await?.into_stream();
    let documents: Vec<Result<Value, Error>> = stream.collect().await;
    assert_eq!(documents.len(), 3);
    assert!(documents.iter().all(Result::is_ok));

    let error = client.pull_image("private/app", None).await.unwrap_err();
    assert_eq!(
        error.invocation_kind(),
        Some(InvocationErrorKind::Unauthorized)
    );

    Ok(())
}

#[tokio::test]
async fn abandoned_document_stream_discards_connection() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;

    let mut progress = client.pull_image("library/alpine", None).await?;
    assert!(progress.next().await?.is_some());
    progress.close();
    progress.close();
    assert!(progress.next().await?.is_none());
    drop(progress);

    assert_eq!(client.idle_connections(), 0);
    client.version().await?;
    assert_eq!(engine.connections(), 2);

    Ok(())
}

#[tokio::test]
async fn closed_client_only_reports_closed() -> Result<(), BoxError> {
    support::init_tracing();
    let engine = FakeEngine::start("1.41", None);
    let client = Client::new(engine.descriptor())?;
    client.version().await?;
    assert_eq!(client.idle_connections(), 1);

    client.close();
    client.close();
    assert!(client.is_closed());
    assert_eq!(client.idle_connections(), 0);

    assert!(matches!(client.version().await, Err(Error::Closed)));
    assert!(matches!(
        client.start_container("web").await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        client.pull_image("library/alpine", None).await,
        Err(Error::Closed)
    ));
    assert!(matches!(
        client.logs("web", Default::default()).await,
        Err(Error::Closed)
    ));
    assert_eq!(client.idle_connections(), 0);
    assert_eq!(engine.requests().len(), 1);

    Ok(())
}

#[tokio::test]
async fn unreachable_engine_is_a_processing_error() -> Result<(), BoxError> {
    support::init_tracing();
    let dir = tempfile::tempdir()?;
    let path = camino::Utf8PathBuf::try_from(dir.path().join("absent.sock"))?;
    let client = Client::new(dockerdriver::ConnectionDescriptor::unix(path)?)?;

    let error = client.version().await.unwrap_err();
    assert!(matches!(error, Error::Processing(_)), "{error:?}");

    Ok(())
}
