//! API version negotiation.
//!
//! The engine reports the newest API version it speaks, and usually the oldest
//! one it still accepts. A client asking for something outside that window is
//! moved to the nearest bound.

use serde::Deserialize;
use tracing::{debug, info};

use super::invoke::Invocation;
use super::Client;
use crate::error::Error;
use crate::version::ApiVersion;

#[derive(Debug, Deserialize)]
struct VersionReport {
    #[serde(rename = "ApiVersion")]
    api_version: String,

    #[serde(rename = "MinAPIVersion", default)]
    min_api_version: Option<String>,
}

async fn fetch_report(client: &Client, invocation: Invocation) -> Result<VersionReport, Error> {
    client.invoke(invocation).await
}

/// Agree on an API version with the engine behind `client`.
///
/// For the default sentinel the engine's current version is adopted. A concrete
/// version is probed first; if the engine rejects the probe, the unversioned
/// endpoint is asked once instead. The result is not pinned on the client; see
/// [`Client::open`] for that.
pub async fn negotiate_version(client: &Client, requested: ApiVersion) -> Result<ApiVersion, Error> {
    let unversioned = || Invocation::get("/version").unversioned();

    let (report, fallback) = if requested.is_default() {
        (fetch_report(client, unversioned()).await?, false)
    } else {
        let probe = Invocation::get("/version").version(requested.clone());
        match fetch_report(client, probe).await {
            Ok(report) => (report, false),
            Err(Error::Closed) => return Err(Error::Closed),
            Err(error) => {
                debug!(%error, %requested, "version probe failed, asking without a version");
                (fetch_report(client, unversioned()).await?, true)
            }
        }
    };

    let current = ApiVersion::parse(&report.api_version);
    let minimum = report.min_api_version.as_deref().map(ApiVersion::parse);
    Ok(choose(requested, current, minimum, fallback))
}

fn choose(
    requested: ApiVersion,
    current: ApiVersion,
    minimum: Option<ApiVersion>,
    fallback: bool,
) -> ApiVersion {
    if requested.is_default() {
        debug!(%current, "using engine api version");
        return current;
    }

    if requested > current {
        info!(%requested, %current, "requested api version is newer than the engine's, using the engine's");
        return current;
    }

    if let Some(minimum) = minimum {
        if requested < minimum {
            info!(%requested, %minimum, "requested api version is older than the engine accepts, using its minimum");
            return minimum;
        }
    }

    if fallback {
        info!(%requested, %current, "engine rejected the requested api version, using the engine's");
        return current;
    }

    requested
}
