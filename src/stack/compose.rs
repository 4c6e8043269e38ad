//! Provider running the whole stack locally under Docker Compose.

use super::dump::{dump_local_logs, DumpOptions, DumpResult};
use super::registry::PRODUCTION_URL;
use super::resources::apply_stack_resources;
use super::{
    print_user_config, with_dependent_services, with_is_ready_services, Backends, LocalServices, Options,
    Provider, ProviderAdapter, ServiceStatus, StackConfig, StackConfigStore, CA_CERT_FILE, COMPOSE_FILE,
};
use crate::docker::CommandOptions;
use crate::error::Result;
use crate::profile::Profile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pause before starting again when only the agent failed.
pub const AGENT_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct ComposeProvider {
    backends: Backends,
}

impl ComposeProvider {
    pub fn new(backends: Backends) -> Self {
        ComposeProvider { backends }
    }

    fn local(&self, profile: &Profile) -> LocalServices {
        self.backends.local_services(profile, COMPOSE_FILE)
    }

    fn command_options(&self, options: &Options) -> CommandOptions {
        CommandOptions {
            env: self.backends.compose_env(options),
            extra_args: Vec::new(),
            services: with_is_ready_services(with_dependent_services(&options.services)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ComposeProvider {
    fn name(&self) -> Provider {
        Provider::Compose
    }

    async fn boot_up(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        // Shown first, a foreground stack keeps the terminal busy.
        let config = StackConfig::local(&options.profile.path(CA_CERT_FILE));
        print_user_config(options.output.as_ref(), &config);

        options
            .output
            .message("Local package-registry will serve packages from these sources:");
        options.output.message(&format!("- Proxy to {}", PRODUCTION_URL));

        apply_stack_resources(options, self.backends.certificates.as_ref())
            .await
            .map_err(|e| e.context("creating stack files failed"))?;

        let opts = self.command_options(options);
        tracing::info!(
            project = %super::compose_project_name(&options.profile),
            services = ?opts.services,
            "starting stack"
        );
        self.local(&options.profile)
            .start(ctx, &opts, options.daemon_mode, Some(AGENT_RETRY_DELAY))
            .await
            .map_err(|e| e.context("running docker-compose failed"))?;

        StackConfigStore::new(&options.profile)
            .store(&config)
            .map_err(|e| e.context("failed to store config"))
    }

    async fn tear_down(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        self.local(&options.profile)
            .destroy(ctx, self.backends.compose_env(options))
            .await
            .map_err(|e| e.context("stopping docker containers failed"))
    }

    async fn update(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        self.local(&options.profile)
            .project()
            .pull(ctx, &self.command_options(options))
            .await
            .map_err(|e| e.context("failed updating the stack images"))
    }

    async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>> {
        dump_local_logs(ctx, &self.local(&options.profile), options)
            .await
            .map_err(|e| e.context("can't dump Elastic stack logs"))
    }

    async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>> {
        self.local(&options.profile).status(ctx).await
    }

    async fn service_logs(
        &self,
        ctx: &CancellationToken,
        profile: &Profile,
        service: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        self.local(profile).logs(ctx, service, since).await
    }
}
