//! Provider adopting an Elasticsearch and Kibana given through environment
//! variables. Fleet Server and the agent are started locally when the
//! adopted stack has no reachable Fleet Server of its own.

use super::compose::AGENT_RETRY_DELAY;
use super::dump::{dump_local_logs, DumpOptions, DumpResult};
use super::fleet;
use super::kibana::{service_version, KibanaClient};
use super::network::docker_internal_host;
use super::resources::{apply_local_resources, MANAGED_FLEET_SERVER_POLICY_ID};
use super::shellinit::{
    CA_CERT_ENV, ELASTICSEARCH_API_KEY_ENV, ELASTICSEARCH_HOST_ENV, ELASTICSEARCH_PASSWORD_ENV,
    ELASTICSEARCH_USERNAME_ENV, KIBANA_HOST_ENV,
};
use super::{
    Backends, LocalServices, Options, Provider, ProviderAdapter, ServiceStatus, StackConfig, StackConfigStore,
    COMPOSE_FILE, CONFIG_LOGSTASH_ENABLED, CONFIG_SELF_MONITOR_ENABLED, ELASTIC_AGENT_SERVICE,
    FLEET_SERVER_SERVICE, PARAM_FLEET_SERVER_MANAGED, PARAM_FLEET_URL, PARAM_LOCAL_STACK_VERSION,
};
use crate::docker::CommandOptions;
use crate::error::{Error, Result};
use crate::healthcheck::{ElasticsearchHealth, FleetServerStatus, HealthChecker, KibanaHealth};
use crate::profile::Profile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Fleet Server URL as seen by the local agent.
pub const LOCAL_FLEET_SERVER_URL: &str = "https://fleet-server:8220";

const UNKNOWN_VERSION: &str = "unknown";

pub struct EnvironmentProvider {
    backends: Backends,
}

impl EnvironmentProvider {
    pub fn new(backends: Backends) -> Self {
        EnvironmentProvider { backends }
    }

    fn local(&self, profile: &Profile) -> LocalServices {
        self.backends.local_services(profile, COMPOSE_FILE)
    }

    fn required_env(&self, key: &str) -> Result<String> {
        self.backends
            .env(key)
            .ok_or_else(|| Error::MissingEnv(key.to_string()))
    }

    /// Connection settings of the adopted stack.
    fn config_from_env(&self) -> Result<StackConfig> {
        Ok(StackConfig {
            provider: Some(Provider::Environment),
            elasticsearch_host: self.required_env(ELASTICSEARCH_HOST_ENV)?,
            kibana_host: self.required_env(KIBANA_HOST_ENV)?,
            elasticsearch_api_key: self.backends.env(ELASTICSEARCH_API_KEY_ENV).unwrap_or_default(),
            elasticsearch_username: self.backends.env(ELASTICSEARCH_USERNAME_ENV).unwrap_or_default(),
            elasticsearch_password: self.backends.env(ELASTICSEARCH_PASSWORD_ENV).unwrap_or_default(),
            ca_cert_file: self.backends.env(CA_CERT_ENV).unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn fleet_server_reachable(&self, ctx: &CancellationToken, config: &StackConfig, url: &str) -> bool {
        let Ok(client) = self.backends.stack_client(config, url) else {
            return false;
        };
        match FleetServerStatus::new(client).check(ctx).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "fleet server not reachable");
                false
            }
        }
    }

    /// Decides where agents enroll. A profile whose Fleet Server was started
    /// by this tool keeps it; otherwise the adopted stack's default Fleet
    /// Server is used when it answers, and a local one is set up when not.
    async fn setup_fleet(
        &self,
        ctx: &CancellationToken,
        kibana: &KibanaClient,
        options: &Options,
        config: &mut StackConfig,
        previously_managed: bool,
    ) -> Result<()> {
        let mut fleet_url = None;
        if !previously_managed {
            let discovered = match kibana.default_fleet_server_url(ctx).await {
                Ok(url) => url,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => return Err(e.context("failed to discover Fleet Server URL")),
            };
            if let Some(url) = discovered {
                if self.fleet_server_reachable(ctx, config, &url).await {
                    fleet_url = Some(url);
                }
            }
        }

        let url = match fleet_url {
            Some(url) => {
                tracing::debug!(url = %url, "using existing Fleet Server");
                url
            }
            None => {
                tracing::info!("setting up a local Fleet Server");
                config.set_param(PARAM_FLEET_SERVER_MANAGED, "true");
                fleet::ensure_fleet_server_host(ctx, kibana, options.profile.name(), LOCAL_FLEET_SERVER_URL).await?;
                let registry = self.backends.package_registry()?;
                fleet::create_fleet_server_policy(ctx, kibana, registry.as_ref(), &options.stack_version)
                    .await
                    .map_err(|e| e.context("failed to create agent policy for Fleet Server"))?;
                config.fleet_service_token = kibana
                    .create_fleet_service_token(ctx)
                    .await
                    .map_err(|e| e.context("failed to create service token for Fleet Server"))?;
                LOCAL_FLEET_SERVER_URL.to_string()
            }
        };
        config.set_param(PARAM_FLEET_URL, url);
        Ok(())
    }

    async fn elasticsearch_status(&self, ctx: &CancellationToken, config: &StackConfig) -> ServiceStatus {
        let client = match self.backends.elasticsearch(config) {
            Ok(client) => client,
            Err(e) => {
                return ServiceStatus::new(
                    "elasticsearch",
                    format!("unknown: failed to create client: {}", e),
                    UNKNOWN_VERSION,
                )
            }
        };
        let status = health_text(ElasticsearchHealth::new(client.clone()).check(ctx).await);
        let version = service_version(ctx, client.as_ref(), "/")
            .await
            .map(|v| v.display())
            .unwrap_or_else(|_| UNKNOWN_VERSION.to_string());
        ServiceStatus::new("elasticsearch", status, version)
    }

    async fn kibana_status(&self, ctx: &CancellationToken, config: &StackConfig) -> ServiceStatus {
        let client = match self.backends.kibana(config) {
            Ok(kibana) => kibana.inner().clone(),
            Err(e) => {
                return ServiceStatus::new(
                    "kibana",
                    format!("unknown: failed to create client: {}", e),
                    UNKNOWN_VERSION,
                )
            }
        };
        let status = health_text(KibanaHealth::new(client.clone()).check(ctx).await);
        let version = service_version(ctx, client.as_ref(), "/api/status")
            .await
            .map(|v| v.display())
            .unwrap_or_else(|_| UNKNOWN_VERSION.to_string());
        ServiceStatus::new("kibana", status, version)
    }

    async fn fleet_status(&self, ctx: &CancellationToken, config: &StackConfig) -> ServiceStatus {
        let Some(address) = config.param(PARAM_FLEET_URL) else {
            return ServiceStatus::new(FLEET_SERVER_SERVICE, "unknown address", UNKNOWN_VERSION);
        };
        let client = match self.backends.stack_client(config, address) {
            Ok(client) => client,
            Err(e) => return ServiceStatus::new(FLEET_SERVER_SERVICE, format!("unknown: {}", e), UNKNOWN_VERSION),
        };
        let status = match FleetServerStatus::new(client.clone()).check(ctx).await {
            Ok(()) => "healthy".to_string(),
            Err(e) => format!("unknown: {}", e),
        };
        let version = service_version(ctx, client.as_ref(), "/api/status")
            .await
            .ok()
            .map(|v| v.number)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| UNKNOWN_VERSION.to_string());
        ServiceStatus::new(FLEET_SERVER_SERVICE, status, version)
    }
}

fn health_text(result: Result<()>) -> String {
    match result {
        Ok(()) => "healthy".to_string(),
        Err(e) => format!("unhealthy: {}", e),
    }
}

fn is_managed(config: &StackConfig) -> bool {
    config.param(PARAM_FLEET_SERVER_MANAGED) == Some("true")
}

#[async_trait]
impl ProviderAdapter for EnvironmentProvider {
    fn name(&self) -> Provider {
        Provider::Environment
    }

    async fn boot_up(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        tracing::warn!("configuring a stack from environment variables is in technical preview");
        let store = StackConfigStore::new(&options.profile);
        let previous = store
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        let previously_managed = previous.provider() == Provider::Environment && is_managed(&previous);

        let mut config = self.config_from_env()?;
        config.set_param(PARAM_LOCAL_STACK_VERSION, options.stack_version.clone());
        let kibana = self
            .backends
            .kibana(&config)
            .map_err(|e| e.context("cannot create Kibana client"))?;

        self.setup_fleet(ctx, &kibana, options, &mut config, previously_managed)
            .await
            .map_err(|e| e.context("failed to setup Fleet"))?;
        store.store(&config)?;

        let logstash_enabled = options.setting_bool(CONFIG_LOGSTASH_ENABLED, false)?;
        if logstash_enabled {
            fleet::add_logstash_output(ctx, &kibana)
                .await
                .map_err(|e| e.context("failed to create logstash output"))?;
            config.output_id = fleet::FLEET_LOGSTASH_OUTPUT.to_string();
        } else {
            let internal_host = docker_internal_host(&config.elasticsearch_host);
            if internal_host != config.elasticsearch_host {
                fleet::add_elasticsearch_output(ctx, &kibana, &internal_host)
                    .await
                    .map_err(|e| e.context("failed to create elasticsearch output"))?;
                config.output_id = fleet::FLEET_ELASTICSEARCH_OUTPUT.to_string();
            }
        }
        store.store(&config)?;

        let self_monitor = options.setting_bool(CONFIG_SELF_MONITOR_ENABLED, false)?;
        let registry = self.backends.package_registry()?;
        let policy = fleet::create_agent_policy(
            ctx,
            &kibana,
            registry.as_ref(),
            &options.stack_version,
            &config.output_id,
            self_monitor,
        )
        .await
        .map_err(|e| e.context("failed to create agent policy"))?;
        if !config.elasticsearch_api_key.is_empty() {
            config.enrollment_token = kibana
                .enrollment_token_for_policy(ctx, &policy.id)
                .await
                .map_err(|e| e.context(format!("failed to get an enrollment token for policy {}", policy.name)))?;
        }

        apply_local_resources(options, &config, self.backends.certificates.as_ref())
            .await
            .map_err(|e| e.context("could not initialize compose files for local services"))?;
        let opts = CommandOptions {
            env: self.backends.compose_env(options),
            ..Default::default()
        };
        self.local(&options.profile)
            .start(ctx, &opts, options.daemon_mode, Some(AGENT_RETRY_DELAY))
            .await?;

        if logstash_enabled {
            fleet::update_logstash_output(ctx, &kibana, options.profile.root())
                .await
                .map_err(|e| e.context("cannot configure fleet output"))?;
        }

        store.store(&config)
    }

    async fn tear_down(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        let config = StackConfigStore::new(&options.profile)
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        let mut errors = Vec::new();

        if let Err(e) = self.local(&options.profile).destroy(ctx, Vec::new()).await {
            errors.push(e);
        }

        let kibana = match self.backends.kibana(&config) {
            Ok(kibana) => kibana,
            Err(e) => {
                errors.push(e.context("failed to create kibana client"));
                return Error::from_many(errors).map_or(Ok(()), Err);
            }
        };

        let mut policies = vec![fleet::MANAGED_AGENT_POLICY_ID];
        if is_managed(&config) {
            policies.push(MANAGED_FLEET_SERVER_POLICY_ID);
        }
        for policy in policies {
            if let Err(e) = fleet::force_unenroll_agents(ctx, &kibana, policy).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                errors.push(e.context(format!("failed to remove agents associated to policy {}", policy)));
                continue;
            }
            if let Err(e) = fleet::delete_policy(ctx, &kibana, policy).await {
                errors.push(e.context(format!("failed to delete policy {}", policy)));
            }
        }

        if !config.output_id.is_empty() {
            match kibana.remove_fleet_output(ctx, &config.output_id).await {
                Err(e) if !e.is_not_found() => {
                    errors.push(e.context(format!("failed to delete {} output", config.output_id)))
                }
                _ => {}
            }
        }

        Error::from_many(errors).map_or(Ok(()), Err)
    }

    async fn update(&self, _ctx: &CancellationToken, _options: &Options) -> Result<()> {
        Err(Error::NotImplemented {
            operation: "update",
            provider: "environment",
        })
    }

    async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>> {
        if options.services.iter().any(|s| s != ELASTIC_AGENT_SERVICE) {
            return Err(Error::NotImplemented {
                operation: "logs dump of services other than elastic-agent",
                provider: "environment",
            });
        }
        let local = self.local(&options.profile);
        local.require_service(ctx, ELASTIC_AGENT_SERVICE).await?;
        let options = DumpOptions {
            services: vec![ELASTIC_AGENT_SERVICE.to_string()],
            ..options.clone()
        };
        dump_local_logs(ctx, &local, &options).await
    }

    async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>> {
        let config = StackConfigStore::new(&options.profile)
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        let mut statuses = vec![
            self.elasticsearch_status(ctx, &config).await,
            self.kibana_status(ctx, &config).await,
        ];

        // A managed Fleet Server shows up among the local services.
        let managed = is_managed(&config);
        if !managed {
            statuses.push(self.fleet_status(ctx, &config).await);
        }

        let mut local = self
            .local(&options.profile)
            .status(ctx)
            .await
            .map_err(|e| e.context("cannot obtain status of local services"))?;
        if local.is_empty() {
            local.push(ServiceStatus::new(ELASTIC_AGENT_SERVICE, "missing", UNKNOWN_VERSION));
            if managed {
                local.push(ServiceStatus::new(FLEET_SERVER_SERVICE, "missing", UNKNOWN_VERSION));
            }
        }
        statuses.extend(local);
        Ok(statuses)
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
