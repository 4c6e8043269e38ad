//! Exports logs of the local stack services for debugging.

use super::local_services::LocalServices;
use super::{ELASTIC_AGENT_SERVICE, FLEET_SERVER_SERVICE};
use crate::error::{Error, Result};
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Where agents and Fleet Server keep the logs not sent to stdout.
pub const AGENT_INTERNAL_LOGS: &str = "/usr/share/elastic-agent/state/data/logs";

#[derive(Clone)]
pub struct DumpOptions {
    pub profile: Profile,
    /// Directory the logs are copied to; without it they are only returned.
    pub output: Option<PathBuf>,
    /// Services to dump; empty means every local service.
    pub services: Vec<String>,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpResult {
    pub service_name: String,
    /// Set only when no output directory was given.
    pub logs: Vec<u8>,
    pub logs_file: Option<PathBuf>,
    pub internal_logs_dir: Option<PathBuf>,
}

/// Dumps the logs of the selected local services. Failures of single
/// services do not stop the others and are reported together.
pub async fn dump_local_logs(
    ctx: &CancellationToken,
    local: &LocalServices,
    options: &DumpOptions,
) -> Result<Vec<DumpResult>> {
    if let Some(output) = &options.output {
        tracing::debug!(location = %output.display(), "dumping Elastic stack data");
    }
    let services = local
        .service_names(ctx)
        .await
        .map_err(|e| e.context("failed to get local services"))?;
    if let Some(missing) = options.services.iter().find(|s| !services.contains(*s)) {
        return Err(Error::UnavailableStack(format!(
            "local service {} does not exist",
            missing
        )));
    }

    let logs_path = match &options.output {
        Some(output) => Some(recreate_logs_dir(output)?),
        None => None,
    };

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for service in &services {
        if !options.services.is_empty() && !options.services.contains(service) {
            continue;
        }
        tracing::debug!(service = %service, "dumping stack logs");
        match dump_service(ctx, local, service, options.since, logs_path.as_deref()).await {
            Ok(result) => results.push(result),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => errors.push(e),
        }
    }

    if let Some(err) = Error::from_many(errors) {
        return Err(err.context("failed to dump stack logs"));
    }
    Ok(results)
}

fn recreate_logs_dir(output: &Path) -> Result<PathBuf> {
    let logs_path = output.join("logs");
    match fs::remove_dir_all(&logs_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::Config(format!("can't remove output location: {}", e))),
    }
    fs::create_dir_all(&logs_path).map_err(|e| {
        Error::Config(format!(
            "can't create output location (path: {}): {}",
            logs_path.display(),
            e
        ))
    })?;
    Ok(logs_path)
}

async fn dump_service(
    ctx: &CancellationToken,
    local: &LocalServices,
    service: &str,
    since: Option<DateTime<Utc>>,
    logs_path: Option<&Path>,
) -> Result<DumpResult> {
    let content = local.logs(ctx, service, since).await?;
    let Some(logs_path) = logs_path else {
        return Ok(DumpResult {
            service_name: service.to_string(),
            logs: content,
            ..Default::default()
        });
    };

    let logs_file = logs_path.join(format!("{}.log", service));
    fs::write(&logs_file, &content)
        .map_err(|e| Error::from(e).context(format!("can't write log files for service {:?}", service)))?;

    let mut result = DumpResult {
        service_name: service.to_string(),
        logs_file: Some(logs_file),
        ..Default::default()
    };
    if service == ELASTIC_AGENT_SERVICE || service == FLEET_SERVER_SERVICE {
        let dir = logs_path.join(format!("{}-internal", service));
        local
            .project()
            .copy_from_service(ctx, service, AGENT_INTERNAL_LOGS, &dir)
            .await
            .map_err(|e| e.context(format!("can't copy internal logs for service {:?}", service)))?;
        result.internal_logs_dir = Some(dir);
    }
    Ok(result)
}
