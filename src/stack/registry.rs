//! Package version lookup in the Elastic Package Registry.

use crate::client::{ResourceClient, ResourceRequest};
use crate::error::{Error, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const PRODUCTION_URL: &str = "https://epr.elastic.co";

const SNAPSHOT_SUFFIX: &str = "-SNAPSHOT";

#[derive(Debug, Clone, Deserialize)]
pub struct PackageRevision {
    pub name: String,
    pub version: String,
}

/// The single version of `package` compatible with a Kibana version.
pub async fn package_version(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    package: &str,
    stack_version: &str,
) -> Result<String> {
    let kibana_version = stack_version.trim_end_matches(SNAPSHOT_SUFFIX);
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("package", package)
        .append_pair("kibana.version", kibana_version)
        .finish();
    let resp = client
        .send(ctx, ResourceRequest::get(format!("/search?{}", query)))
        .await?
        .expect(&[200], &format!("could not search package {}", package))?;
    let revisions: Vec<PackageRevision> = resp.json()?;

    let matching: Vec<_> = revisions.into_iter().filter(|r| r.name == package).collect();
    match matching.as_slice() {
        [only] => {
            tracing::debug!(package, version = %only.version, "found package");
            Ok(only.version.clone())
        }
        found => Err(Error::Config(format!(
            "unexpected number of {} package versions for Kibana {} - found {} expected 1",
            package,
            stack_version,
            found.len()
        ))),
    }
}
