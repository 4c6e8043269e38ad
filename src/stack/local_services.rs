//! Compose project of the services running on this machine.
//!
//! The compose provider runs the whole stack in it; the other providers use
//! it for the agent, and for Fleet Server or Logstash when those are
//! provisioned locally.

use super::certs::CertificateAuthority;
use super::resources::apply_remote_agent_resources;
use super::{
    compose_project_name, container_statuses, Options, ServiceStatus, StackConfig, PROFILE_STACK_PATH,
    READY_SERVICES_SUFFIX,
};
use crate::docker::{CommandOptions, ComposeDriver, ComposeFactory};
use crate::error::{Error, Result};
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Flags that make `down` leave nothing behind.
pub const DOWN_ARGS: [&str; 2] = ["--volumes", "--remove-orphans"];

#[derive(Clone)]
pub struct LocalServices {
    profile: Profile,
    compose_file: &'static str,
    factory: Arc<dyn ComposeFactory>,
}

impl LocalServices {
    pub fn new(profile: &Profile, compose_file: &'static str, factory: Arc<dyn ComposeFactory>) -> Self {
        LocalServices {
            profile: profile.clone(),
            compose_file,
            factory,
        }
    }

    pub fn compose_file(&self) -> PathBuf {
        self.profile.path(PROFILE_STACK_PATH).join(self.compose_file)
    }

    pub fn project(&self) -> Arc<dyn ComposeDriver> {
        self.factory
            .project(&compose_project_name(&self.profile), vec![self.compose_file()])
    }

    /// Builds and starts the project. With `agent_retry`, a failure caused
    /// only by the agent is retried once after that delay; any other failure
    /// is returned as is.
    pub async fn start(
        &self,
        ctx: &CancellationToken,
        opts: &CommandOptions,
        daemon_mode: bool,
        agent_retry: Option<Duration>,
    ) -> Result<()> {
        let project = self.project();
        project
            .build(ctx, opts)
            .await
            .map_err(|e| e.context("failed to build images for local services"))?;

        let mut up = opts.clone();
        if daemon_mode {
            up.extra_args.push("-d".to_string());
        }
        let Err(err) = project.up(ctx, &up).await else {
            return Ok(());
        };
        let Some(retry_delay) = agent_retry else {
            return Err(err.context("failed to start local services"));
        };
        if err.is_cancelled() || !self.only_agent_failed(ctx).await {
            return Err(err.context("failed to start local services"));
        }

        tracing::warn!(delay = ?retry_delay, "Elastic Agent failed to start, trying again");
        crate::poll::sleep_or_cancel(ctx, retry_delay).await?;
        project
            .up(ctx, &up)
            .await
            .map_err(|e| e.context("failed to start local services"))
    }

    async fn only_agent_failed(&self, ctx: &CancellationToken) -> bool {
        match self.status(ctx).await {
            Ok(statuses) => super::only_elastic_agent_failed(&statuses),
            Err(e) => {
                tracing::warn!(error = %e, "failed to check status of the stack after failure");
                false
            }
        }
    }

    /// Stops the project, removing its volumes.
    pub async fn destroy(&self, ctx: &CancellationToken, env: Vec<(String, String)>) -> Result<()> {
        let opts = CommandOptions {
            env,
            extra_args: DOWN_ARGS.iter().map(|s| s.to_string()).collect(),
            services: Vec::new(),
        };
        self.project()
            .down(ctx, &opts)
            .await
            .map_err(|e| e.context("failed to destroy local services"))
    }

    /// Status of every container except the readiness markers.
    pub async fn status(&self, ctx: &CancellationToken) -> Result<Vec<ServiceStatus>> {
        let containers = self.project().status(ctx).await?;
        Ok(container_statuses(&containers))
    }

    /// Compose services that have a container, without readiness markers.
    pub async fn service_names(&self, ctx: &CancellationToken) -> Result<Vec<String>> {
        let containers = self.project().status(ctx).await?;
        let mut names: Vec<String> = containers
            .into_iter()
            .map(|c| c.service)
            .filter(|s| !s.ends_with(READY_SERVICES_SUFFIX))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn logs(
        &self,
        ctx: &CancellationToken,
        service: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        let opts = CommandOptions {
            services: vec![service.to_string()],
            ..Default::default()
        };
        self.project()
            .logs(ctx, &opts, since)
            .await
            .map_err(|e| e.context(format!("can't fetch service logs (service: {})", service)))
    }

    /// Writes the agent files for a remote stack and starts the agent in the
    /// background.
    pub async fn start_remote_agent(
        &self,
        ctx: &CancellationToken,
        options: &Options,
        config: &StackConfig,
        authority: &dyn CertificateAuthority,
    ) -> Result<()> {
        apply_remote_agent_resources(options, config, self.compose_file, authority)
            .await
            .map_err(|e| e.context("could not initialize compose files for local agent"))?;
        self.start(ctx, &CommandOptions::default(), true, None)
            .await
            .map_err(|e| e.context("failed to start local agent"))
    }

    /// Fails with [`Error::UnavailableStack`] unless `service` has a container.
    pub async fn require_service(&self, ctx: &CancellationToken, service: &str) -> Result<()> {
        if self.service_names(ctx).await?.iter().any(|s| s == service) {
            Ok(())
        } else {
            Err(Error::UnavailableStack(format!(
                "local service {} does not exist",
                service
            )))
        }
    }
}
