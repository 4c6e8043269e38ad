//! Entry points of the stack commands.
//!
//! The provider of a profile is the one recorded in its stack config. A
//! different provider can only be used once the stack was torn down, which
//! removes the record.

use super::cloud::CloudProvider;
use super::compose::ComposeProvider;
use super::environment::EnvironmentProvider;
use super::serverless::ServerlessProvider;
use super::{Backends, DumpOptions, DumpResult, Options, Provider, ProviderAdapter, ServiceStatus, StackConfigStore};
use crate::error::{Error, Result};
use crate::profile::Profile;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

pub struct Lifecycle {
    backends: Backends,
}

/// Provider to use given the recorded one and the one asked for.
pub fn resolve_provider(stored: Option<Provider>, declared: Option<Provider>) -> Result<Provider> {
    match (stored, declared) {
        (Some(stored), Some(declared)) if stored != declared => Err(Error::Config(format!(
            "stack of this profile runs with provider {}, cannot use provider {}",
            stored, declared
        ))),
        (Some(provider), _) | (None, Some(provider)) => Ok(provider),
        (None, None) => Ok(Provider::default()),
    }
}

/// Sorts by name, keeping the first status of each service.
pub fn normalize_statuses(mut statuses: Vec<ServiceStatus>) -> Vec<ServiceStatus> {
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    statuses.dedup_by(|a, b| a.name == b.name);
    statuses
}

impl Lifecycle {
    pub fn new(backends: Backends) -> Self {
        Lifecycle { backends }
    }

    pub fn adapter(&self, provider: Provider) -> Box<dyn ProviderAdapter> {
        let backends = self.backends.clone();
        match provider {
            Provider::Compose => Box::new(ComposeProvider::new(backends)),
            Provider::Cloud => Box::new(CloudProvider::new(backends)),
            Provider::Serverless => Box::new(ServerlessProvider::new(backends)),
            Provider::Environment => Box::new(EnvironmentProvider::new(backends)),
        }
    }

    /// Provider of the profile's stack, checked against `declared`.
    pub fn provider_for(&self, profile: &Profile, declared: Option<Provider>) -> Result<Provider> {
        let stored = StackConfigStore::new(profile)
            .load()
            .map_err(|e| e.context("failed to load stack configuration"))?
            .provider;
        resolve_provider(stored, declared)
    }

    fn select(&self, profile: &Profile, declared: Option<Provider>) -> Result<Box<dyn ProviderAdapter>> {
        let provider = self.provider_for(profile, declared)?;
        tracing::debug!(profile = %profile.name(), provider = %provider, "selected stack provider");
        Ok(self.adapter(provider))
    }

    pub async fn boot_up(&self, ctx: &CancellationToken, options: &Options, declared: Option<Provider>) -> Result<()> {
        let adapter = self.select(&options.profile, declared)?;
        tracing::info!(
            provider = %adapter.name(),
            version = %options.stack_version,
            services = ?options.services,
            "booting up the stack"
        );
        adapter.boot_up(ctx, options).await
    }

    /// Tears the stack down; the stack config is removed only when every
    /// step succeeded, so a failed teardown can be retried.
    pub async fn tear_down(&self, ctx: &CancellationToken, options: &Options, declared: Option<Provider>) -> Result<()> {
        let adapter = self.select(&options.profile, declared)?;
        tracing::info!(provider = %adapter.name(), "tearing down the stack");
        adapter.tear_down(ctx, options).await?;
        StackConfigStore::new(&options.profile)
            .reset()
            .map_err(|e| e.context("failed to remove stack configuration"))
    }

    pub async fn update(&self, ctx: &CancellationToken, options: &Options, declared: Option<Provider>) -> Result<()> {
        self.select(&options.profile, declared)?.update(ctx, options).await
    }

    pub async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>> {
        self.select(&options.profile, None)?.dump(ctx, options).await
    }

    pub async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>> {
        let statuses = self.select(&options.profile, None)?.status(ctx, options).await?;
        Ok(normalize_statuses(statuses))
    }

    pub async fn service_logs(
        &self,
        ctx: &CancellationToken,
        profile: &Profile,
        service: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        self.select(profile, None)?
            .service_logs(ctx, profile, service, since)
            .await
    }
}
