//! Stack lifecycle.
//!
//! A stack is the set of Elastic services (Elasticsearch, Kibana, Fleet
//! Server, agents) used to test packages. It is backed by one of four
//! providers:
//!
//! - **compose**: everything runs locally under Docker Compose
//! - **cloud**: an Elastic Cloud deployment plus a local agent
//! - **serverless**: a serverless project plus a local agent
//! - **environment**: services given through environment variables, with
//!   Fleet Server and agent provisioned locally when missing
//!
//! [`Lifecycle`] picks the provider recorded for the profile and delegates to
//! its [`ProviderAdapter`].

pub mod certs;
pub mod cloud;
pub mod compose;
pub mod config;
pub mod dump;
pub mod environment;
pub mod fleet;
pub mod kibana;
pub mod lifecycle;
pub mod local_services;
pub mod network;
pub mod registry;
pub mod resources;
pub mod serverless;
pub mod shellinit;
pub mod variants;

pub use certs::{CertificateAuthority, OpensslAuthority, TlsService};
pub use config::{StackConfig, StackConfigStore};
pub use dump::{DumpOptions, DumpResult};
pub use lifecycle::Lifecycle;
pub use kibana::KibanaClient;
pub use local_services::LocalServices;

use crate::client::{ClientFactory, ClientSpec, HttpClientFactory, ResourceClient};
use crate::docker::{ComposeFactory, ContainerDescription, DockerComposeFactory};
use crate::error::{Error, Result};
use crate::install::ApplicationConfiguration;
use crate::output::UserOutput;
use crate::profile::{Profile, DEFAULT_PROFILE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Directory inside the profile holding generated stack files.
pub const PROFILE_STACK_PATH: &str = "stack";
pub const CERTS_DIR: &str = "certs";
pub const CA_CERT_FILE: &str = "certs/ca-cert.pem";
pub const CA_KEY_FILE: &str = "certs/ca-key.pem";
pub const CA_ENV_FILE: &str = "certs/ca.env";
pub const COMPOSE_FILE: &str = "docker-compose.yml";

pub const ELASTIC_AGENT_SERVICE: &str = "elastic-agent";
pub const FLEET_SERVER_SERVICE: &str = "fleet-server";

pub(crate) const READY_SERVICES_SUFFIX: &str = "is_ready";
const BASE_COMPOSE_PROJECT: &str = "elastic-package-stack";

/// Parameter set when this tool provisioned the Fleet Server itself.
pub const PARAM_FLEET_SERVER_MANAGED: &str = "fleet_server_managed";
/// Fleet Server URL agents enroll against.
pub const PARAM_FLEET_URL: &str = "serverless_fleet_url";
/// Stack version of the locally started services.
pub const PARAM_LOCAL_STACK_VERSION: &str = "serverless_local_stack_version";

pub(crate) const CONFIG_LOGSTASH_ENABLED: &str = "stack.logstash_enabled";
pub(crate) const CONFIG_SELF_MONITOR_ENABLED: &str = "stack.self_monitor_enabled";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Compose,
    Cloud,
    Serverless,
    Environment,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Compose,
        Provider::Cloud,
        Provider::Serverless,
        Provider::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Compose => "compose",
            Provider::Cloud => "cloud",
            Provider::Serverless => "serverless",
            Provider::Environment => "environment",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::UnknownProvider(s.to_string()))
    }
}

/// One line of `stack status`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceStatus {
    pub name: String,
    pub status: String,
    pub version: String,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, status: impl Into<String>, version: impl Into<String>) -> Self {
        ServiceStatus {
            name: name.into(),
            status: status.into(),
            version: version.into(),
        }
    }
}

impl From<&ContainerDescription> for ServiceStatus {
    fn from(container: &ContainerDescription) -> Self {
        ServiceStatus {
            name: container.service.clone(),
            status: container.status(),
            version: container.version(),
        }
    }
}

/// Statuses of local containers, without the readiness markers.
pub fn container_statuses(containers: &[ContainerDescription]) -> Vec<ServiceStatus> {
    containers
        .iter()
        .filter(|c| !c.service.ends_with(READY_SERVICES_SUFFIX))
        .map(ServiceStatus::from)
        .collect()
}

/// External systems the providers drive.
#[derive(Clone)]
pub struct Backends {
    pub compose: Arc<dyn ComposeFactory>,
    pub http: Arc<dyn ClientFactory>,
    pub certificates: Arc<dyn CertificateAuthority>,
    /// Environment variable lookup.
    pub env: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Backends {
    /// Docker, reqwest, openssl and the process environment.
    pub fn system() -> Self {
        Backends {
            compose: Arc::new(DockerComposeFactory),
            http: Arc::new(HttpClientFactory),
            certificates: Arc::new(OpensslAuthority::default()),
            env: Arc::new(|key| std::env::var(key).ok().filter(|v| !v.is_empty())),
        }
    }

    pub fn env(&self, key: &str) -> Option<String> {
        (self.env)(key)
    }

    /// Image references and stack variant exported to compose.
    pub fn compose_env(&self, options: &Options) -> Vec<(String, String)> {
        let version = &options.stack_version;
        let mut env = options
            .app_config
            .stack_image_refs_with(version, version, |key| self.env(key))
            .as_env();
        env.push(variants::stack_variant_env(version));
        env
    }

    pub fn local_services(&self, profile: &Profile, compose_file: &'static str) -> LocalServices {
        LocalServices::new(profile, compose_file, self.compose.clone())
    }

    /// Client authenticated like the stack config says, for any of its
    /// services.
    pub fn stack_client(&self, config: &StackConfig, address: &str) -> Result<Arc<dyn ResourceClient>> {
        self.http.client(
            ClientSpec::new(address)
                .credentials(
                    &config.elasticsearch_api_key,
                    &config.elasticsearch_username,
                    &config.elasticsearch_password,
                )
                .ca_cert(config.ca_cert_path()),
        )
    }

    pub fn elasticsearch(&self, config: &StackConfig) -> Result<Arc<dyn ResourceClient>> {
        self.stack_client(config, &config.elasticsearch_host)
    }

    pub fn kibana(&self, config: &StackConfig) -> Result<KibanaClient> {
        let spec = kibana::kibana_spec(&config.kibana_host)
            .credentials(
                &config.elasticsearch_api_key,
                &config.elasticsearch_username,
                &config.elasticsearch_password,
            )
            .ca_cert(config.ca_cert_path());
        Ok(KibanaClient::new(self.http.client(spec)?))
    }

    pub fn package_registry(&self) -> Result<Arc<dyn ResourceClient>> {
        self.http.client(ClientSpec::new(registry::PRODUCTION_URL))
    }
}

/// Arguments shared by the lifecycle operations.
#[derive(Clone)]
pub struct Options {
    pub profile: Profile,
    pub stack_version: String,
    /// Services to start; empty means all of them.
    pub services: Vec<String>,
    pub daemon_mode: bool,
    /// Overrides of profile settings, keyed like them.
    pub parameters: BTreeMap<String, String>,
    pub app_config: ApplicationConfiguration,
    pub output: Arc<dyn UserOutput>,
}

impl Options {
    /// Setting from `--parameters`, then the profile, then `default`.
    pub fn setting(&self, key: &str, default: &str) -> String {
        match self.parameters.get(key) {
            Some(value) => value.clone(),
            None => self.profile.config(key, default),
        }
    }

    pub fn setting_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.parameters.get(key) {
            Some(value) => value.parse().map_err(|_| {
                Error::Config(format!("parameter {} must be a boolean, got '{}'", key, value))
            }),
            None => self.profile.config_bool(key, default),
        }
    }

    pub fn setting_i64(&self, key: &str, default: i64) -> Result<i64> {
        match self.parameters.get(key) {
            Some(value) => value.parse().map_err(|_| {
                Error::Config(format!("parameter {} must be an integer, got '{}'", key, value))
            }),
            None => self.profile.config_i64(key, default),
        }
    }
}

/// Operations every stack provider implements.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> Provider;

    /// Starts the stack, recording what was created in the stack config.
    async fn boot_up(&self, ctx: &CancellationToken, options: &Options) -> Result<()>;

    /// Removes whatever the stack config says was created.
    async fn tear_down(&self, ctx: &CancellationToken, options: &Options) -> Result<()>;

    /// Refreshes images or remote resources without restarting services.
    async fn update(&self, ctx: &CancellationToken, options: &Options) -> Result<()>;

    async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>>;

    async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>>;

    /// Logs of one local service.
    async fn service_logs(
        &self,
        ctx: &CancellationToken,
        profile: &Profile,
        service: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>>;
}

/// Compose project of a profile's local services.
pub fn compose_project_name(profile: &Profile) -> String {
    if profile.name() == DEFAULT_PROFILE {
        BASE_COMPOSE_PROJECT.to_string()
    } else {
        format!("{}-{}", BASE_COMPOSE_PROJECT, profile.name())
    }
}

/// The agent depends on every other service, so asking for it starts all.
pub fn with_dependent_services(services: &[String]) -> Vec<String> {
    if services.iter().any(|s| s == ELASTIC_AGENT_SERVICE) {
        return Vec::new();
    }
    services.to_vec()
}

/// Pairs each service with its `<service>_is_ready` marker so `up` waits
/// for its health check. Empty stays empty, meaning every service.
pub fn with_is_ready_services(services: Vec<String>) -> Vec<String> {
    services
        .into_iter()
        .flat_map(|s| {
            let ready = format!("{}_{}", s, READY_SERVICES_SUFFIX);
            [s, ready]
        })
        .collect()
}

/// True when every service except the agents is running.
pub fn only_elastic_agent_failed(statuses: &[ServiceStatus]) -> bool {
    statuses
        .iter()
        .filter(|s| !s.name.contains(ELASTIC_AGENT_SERVICE))
        .all(|s| s.status.starts_with("running"))
}

/// Shows the connection settings of the stack being started.
pub fn print_user_config(output: &dyn UserOutput, config: &StackConfig) {
    output.message("Elastic stack configuration:");
    output.message(&format!("Kibana host: {}", config.kibana_host));
    output.message(&format!("Elasticsearch host: {}", config.elasticsearch_host));
    if !config.elasticsearch_api_key.is_empty() {
        output.message("Elasticsearch API key: (set)");
    } else {
        output.message(&format!("Username: {}", config.elasticsearch_username));
        output.message(&format!("Password: {}", config.elasticsearch_password));
    }
    if !config.ca_cert_file.is_empty() {
        output.message(&format!("CA certificate: {}", config.ca_cert_file));
    }
}
