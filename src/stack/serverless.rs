//! Provider backed by an Elastic serverless project.

use super::dump::{dump_local_logs, DumpOptions, DumpResult};
use super::fleet;
use super::resources::SERVERLESS_COMPOSE_FILE;
use super::{
    print_user_config, Backends, LocalServices, Options, Provider, ProviderAdapter, ServiceStatus, StackConfig,
    StackConfigStore, PARAM_FLEET_URL,
};
use crate::client::{ClientSpec, ResourceClient, ResourceRequest};
use crate::error::{Error, Result};
use crate::healthcheck::{wait_healthy, ElasticsearchHealth, FleetHealth, HealthChecker, KibanaHealth};
use crate::poll::poll_until;
use crate::profile::Profile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PARAM_PROJECT_ID: &str = "serverless_project_id";
pub const PARAM_PROJECT_TYPE: &str = "serverless_project_type";

pub const CONFIG_REGION: &str = "stack.serverless.region";
pub const CONFIG_PROJECT_TYPE: &str = "stack.serverless.type";
pub const DEFAULT_REGION: &str = "aws-eu-west-1";
pub const DEFAULT_PROJECT_TYPE: &str = "observability";

pub const HOST_ENV: &str = "ELASTIC_PACKAGE_SERVERLESS_HOST";
pub const API_KEY_ENV: &str = "ELASTIC_PACKAGE_SERVERLESS_API_KEY";
pub const DEFAULT_HOST: &str = "https://cloud.elastic.co";

const PROJECTS_API: &str = "/api/v1/serverless/projects";
const PROVISION_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const POLL_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(default)]
    pub elasticsearch: String,
    #[serde(default)]
    pub kibana: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fleet: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub apm: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(rename = "type")]
    pub project_type: String,
    #[serde(default, rename = "region_id")]
    pub region: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub endpoints: Endpoints,
}

impl Project {
    fn path(&self) -> String {
        format!("{}/{}/{}", PROJECTS_API, self.project_type, self.id)
    }

    fn has_endpoints(&self) -> bool {
        !self.endpoints.elasticsearch.is_empty() && !self.endpoints.kibana.is_empty()
    }
}

/// Serverless projects API client.
pub struct ServerlessClient {
    client: Arc<dyn ResourceClient>,
}

impl ServerlessClient {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        ServerlessClient { client }
    }

    pub async fn create_project(
        &self,
        ctx: &CancellationToken,
        name: &str,
        region: &str,
        project_type: &str,
    ) -> Result<Project> {
        let body = serde_json::json!({ "name": name, "region_id": region });
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::post(format!("{}/{}", PROJECTS_API, project_type)).json(&body)?,
            )
            .await?
            .expect(&[201], "error creating project")?;
        let project: Project = resp.json()?;
        tracing::debug!(id = %project.id, name = %project.name, "created project");
        Ok(project)
    }

    /// Fails with [`Error::NotFound`] when the project does not exist.
    pub async fn get_project(&self, ctx: &CancellationToken, project_type: &str, id: &str) -> Result<Project> {
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::get(format!("{}/{}/{}", PROJECTS_API, project_type, id)),
            )
            .await?;
        if resp.status == 404 {
            return Err(Error::NotFound(format!("project {}", id)));
        }
        Ok(resp.expect(&[200], "error getting project")?.json()?)
    }

    pub async fn reset_credentials(&self, ctx: &CancellationToken, project: &Project) -> Result<Credentials> {
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::post(format!("{}/_reset-credentials", project.path())),
            )
            .await?
            .expect(&[200], "error resetting project credentials")?;
        Ok(resp.json()?)
    }

    pub async fn project_phase(&self, ctx: &CancellationToken, project: &Project) -> Result<String> {
        #[derive(Deserialize)]
        struct Status {
            #[serde(default)]
            phase: String,
        }

        let resp = self
            .client
            .send(ctx, ResourceRequest::get(format!("{}/status", project.path())))
            .await?
            .expect(&[200], "error getting project status")?;
        Ok(resp.json::<Status>()?.phase)
    }

    /// A project already deleted counts as deleted.
    pub async fn delete_project(&self, ctx: &CancellationToken, project: &Project) -> Result<()> {
        let resp = self
            .client
            .send(ctx, ResourceRequest::delete(project.path()))
            .await?;
        if resp.status == 404 {
            tracing::debug!(id = %project.id, "project already deleted");
            return Ok(());
        }
        resp.expect(&[200], "error deleting project")?;
        Ok(())
    }

    /// Polls the project until its Elasticsearch and Kibana endpoints are
    /// known. Credentials from `project` are kept.
    pub async fn ensure_endpoints(
        &self,
        ctx: &CancellationToken,
        project: &mut Project,
        period: Duration,
        timeout: Duration,
    ) -> Result<()> {
        if project.has_endpoints() {
            return Ok(());
        }
        let found_cell = parking_lot::Mutex::new(None);
        let found = &found_cell;
        let (project_type, id) = (project.project_type.as_str(), project.id.as_str());
        let ready = poll_until(ctx, period, timeout, move || async move {
            let current = self.get_project(ctx, project_type, id).await?;
            if current.has_endpoints() {
                *found.lock() = Some(current.endpoints);
                return Ok(true);
            }
            tracing::debug!(id = %id, "project endpoints not provisioned yet");
            Ok(false)
        })
        .await?;
        match found_cell.into_inner() {
            Some(endpoints) if ready => {
                project.endpoints = endpoints;
                Ok(())
            }
            _ => Err(Error::Timeout(format!("endpoints of project {}", project.id))),
        }
    }

    pub async fn ensure_initialized(
        &self,
        ctx: &CancellationToken,
        project: &Project,
        period: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let ready = poll_until(ctx, period, timeout, move || async move {
            let phase = self.project_phase(ctx, project).await?;
            tracing::debug!(id = %project.id, phase = %phase, "project phase");
            Ok(phase == "initialized")
        })
        .await?;
        if ready {
            Ok(())
        } else {
            Err(Error::Timeout(format!("project {} to be initialized", project.id)))
        }
    }
}

pub struct ServerlessProvider {
    backends: Backends,
}

impl ServerlessProvider {
    pub fn new(backends: Backends) -> Self {
        ServerlessProvider { backends }
    }

    fn client(&self) -> Result<ServerlessClient> {
        let host = self.backends.env(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let api_key = self
            .backends
            .env(API_KEY_ENV)
            .ok_or_else(|| Error::MissingEnv(API_KEY_ENV.to_string()))?;
        let client = self.backends.http.client(ClientSpec::new(host).api_key(&api_key))?;
        Ok(ServerlessClient::new(client))
    }

    fn local_agent(&self, profile: &Profile) -> LocalServices {
        self.backends.local_services(profile, SERVERLESS_COMPOSE_FILE)
    }

    /// The project recorded in the config, `None` when there is none or it
    /// was deleted.
    async fn current_project(
        &self,
        ctx: &CancellationToken,
        client: &ServerlessClient,
        config: &StackConfig,
    ) -> Result<Option<Project>> {
        let (Some(id), Some(project_type)) = (config.param(PARAM_PROJECT_ID), config.param(PARAM_PROJECT_TYPE))
        else {
            return Ok(None);
        };
        match client.get_project(ctx, project_type, id).await {
            Ok(mut project) => {
                project.credentials = Credentials {
                    username: config.elasticsearch_username.clone(),
                    password: config.elasticsearch_password.clone(),
                };
                project.endpoints.fleet = config.param(PARAM_FLEET_URL).unwrap_or_default().to_string();
                Ok(Some(project))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context("couldn't check project health")),
        }
    }

    async fn create_project(
        &self,
        ctx: &CancellationToken,
        client: &ServerlessClient,
        options: &Options,
    ) -> Result<StackConfig> {
        let name = project_name(&options.profile);
        let region = options.setting(CONFIG_REGION, DEFAULT_REGION);
        let project_type = options.setting(CONFIG_PROJECT_TYPE, DEFAULT_PROJECT_TYPE);
        tracing::info!(name = %name, region = %region, project_type = %project_type, "creating project");

        let mut project = client
            .create_project(ctx, &name, &region, &project_type)
            .await
            .map_err(|e| {
                e.context(format!(
                    "failed to create {} project {} in {}",
                    project_type, name, region
                ))
            })?;
        let store = StackConfigStore::new(&options.profile);

        // Persist the ids before anything else can fail, a failed boot must
        // still be able to delete the project.
        let mut config = StackConfig {
            provider: Some(Provider::Serverless),
            ..Default::default()
        };
        config.set_param(PARAM_PROJECT_ID, project.id.clone());
        config.set_param(PARAM_PROJECT_TYPE, project.project_type.clone());
        store.store(&config)?;

        if project.credentials.password.is_empty() {
            project.credentials = client.reset_credentials(ctx, &project).await?;
        }
        config.elasticsearch_username = project.credentials.username.clone();
        config.elasticsearch_password = project.credentials.password.clone();
        store.store(&config)?;

        client
            .ensure_endpoints(ctx, &mut project, POLL_PERIOD, PROVISION_TIMEOUT)
            .await
            .map_err(|e| e.context("failed to ensure endpoints have been provisioned properly"))?;
        config.elasticsearch_host = project.endpoints.elasticsearch.clone();
        config.kibana_host = project.endpoints.kibana.clone();
        store.store(&config)?;

        tracing::debug!("waiting for creation plan to be completed");
        client
            .ensure_initialized(ctx, &project, POLL_PERIOD, PROVISION_TIMEOUT)
            .await
            .map_err(|e| e.context("project not initialized"))?;

        let fleet_url = self
            .backends
            .kibana(&config)?
            .default_fleet_server_url(ctx)
            .await?
            .ok_or_else(|| Error::Config("no default fleet server URL in the project".to_string()))?;
        config.set_param(PARAM_FLEET_URL, fleet_url);
        print_user_config(options.output.as_ref(), &config);
        store.store(&config)?;

        self.ensure_healthy(ctx, &config)
            .await
            .map_err(|e| e.context("not all services are healthy"))?;
        Ok(config)
    }

    fn health_checkers(&self, config: &StackConfig) -> Result<Vec<Box<dyn HealthChecker>>> {
        let fleet_url = config.param(PARAM_FLEET_URL).unwrap_or_default();
        Ok(vec![
            Box::new(ElasticsearchHealth::new(self.backends.elasticsearch(config)?)),
            Box::new(KibanaHealth::new(self.backends.kibana(config)?.inner().clone())),
            Box::new(FleetHealth::new(self.backends.stack_client(config, fleet_url)?)),
        ])
    }

    async fn ensure_healthy(&self, ctx: &CancellationToken, config: &StackConfig) -> Result<()> {
        for checker in self.health_checkers(config)? {
            wait_healthy(ctx, checker.as_ref(), POLL_PERIOD, PROVISION_TIMEOUT).await?;
        }
        Ok(())
    }
}

/// Name of the project created for a profile.
pub fn project_name(profile: &Profile) -> String {
    format!("elastic-package-test-{}", profile.name())
}

#[async_trait]
impl ProviderAdapter for ServerlessProvider {
    fn name(&self) -> Provider {
        Provider::Serverless
    }

    async fn boot_up(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        tracing::warn!("Elastic Serverless provider is in technical preview");
        let client = self.client()?;
        let store = StackConfigStore::new(&options.profile);
        let mut config = store
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;

        match self.current_project(ctx, &client, &config).await? {
            None => {
                config = self
                    .create_project(ctx, &client, options)
                    .await
                    .map_err(|e| e.context("failed to create project"))?;

                tracing::info!("creating agent policy");
                let kibana = self.backends.kibana(&config)?;
                let registry = self.backends.package_registry()?;
                fleet::create_agent_policy(ctx, &kibana, registry.as_ref(), &options.stack_version, "", true)
                    .await
                    .map_err(|e| e.context("failed to create agent policy"))?;
            }
            Some(project) => {
                tracing::debug!(name = %project.name, "project existed");
                print_user_config(options.output.as_ref(), &config);
            }
        }

        config.enrollment_token = self
            .backends
            .kibana(&config)?
            .enrollment_token_for_policy(ctx, fleet::MANAGED_AGENT_POLICY_ID)
            .await
            .map_err(|e| e.context("failed to get an enrollment token"))?;

        tracing::info!("starting local agent");
        self.local_agent(&options.profile)
            .start_remote_agent(ctx, options, &config, self.backends.certificates.as_ref())
            .await
    }

    async fn tear_down(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        let config = StackConfigStore::new(&options.profile)
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        let mut errors = Vec::new();

        if let Err(e) = self.local_agent(&options.profile).destroy(ctx, Vec::new()).await {
            errors.push(e.context("failed to destroy local agent"));
        }

        let removal = async {
            let client = self.client()?;
            match self.current_project(ctx, &client, &config).await? {
                Some(project) => {
                    tracing::debug!(name = %project.name, id = %project.id, "deleting project");
                    client
                        .delete_project(ctx, &project)
                        .await
                        .map_err(|e| e.context("failed to delete project"))
                }
                None => {
                    tracing::debug!("no project to delete");
                    Ok(())
                }
            }
        };
        if let Err(e) = removal.await {
            errors.push(e);
        }

        Error::from_many(errors).map_or(Ok(()), Err)
    }

    async fn update(&self, _ctx: &CancellationToken, _options: &Options) -> Result<()> {
        Err(Error::NotImplemented {
            operation: "update",
            provider: "serverless",
        })
    }

    async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>> {
        dump_local_logs(ctx, &self.local_agent(&options.profile), options).await
    }

    async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>> {
        tracing::warn!("Elastic Serverless provider is in technical preview");
        let client = self.client()?;
        let config = StackConfigStore::new(&options.profile)
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        if self.current_project(ctx, &client, &config).await?.is_none() {
            return Err(Error::UnavailableStack("project does not exist".to_string()));
        }

        let mut statuses = Vec::new();
        for checker in self.health_checkers(&config)? {
            let status = match checker.check(ctx).await {
                Ok(()) => "healthy".to_string(),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => format!("unhealthy: {}", e),
            };
            statuses.push(ServiceStatus::new(checker.service(), status, "serverless"));
        }

        let agent = self
            .local_agent(&options.profile)
            .status(ctx)
            .await
            .map_err(|e| e.context("failed to get local agent status"))?;
        statuses.extend(agent);
        Ok(statuses)
    }

    async fn service_logs(
        &self,
        ctx: &CancellationToken,
        profile: &Profile,
        service: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        self.local_agent(profile).logs(ctx, service, since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceResponse;
    use parking_lot::Mutex;

    struct Scripted {
        responses: Mutex<Vec<ResourceResponse>>,
        paths: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: Vec<ResourceResponse>) -> Arc<Self> {
            Arc::new(Scripted {
                responses: Mutex::new(responses),
                paths: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ResourceClient for Scripted {
        fn address(&self) -> &str {
            DEFAULT_HOST
        }

        async fn send(&self, _ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse> {
            self.paths.lock().push(format!("{} {}", request.method, request.path));
            Ok(self.responses.lock().remove(0))
        }
    }

    fn project() -> Project {
        Project {
            id: "abc".to_string(),
            project_type: "observability".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let client = ServerlessClient::new(Scripted::new(vec![ResourceResponse::new(404, "")]));
        let err = client
            .get_project(&CancellationToken::new(), "observability", "abc")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn deleting_twice_succeeds() {
        let fake = Scripted::new(vec![ResourceResponse::new(200, "{}"), ResourceResponse::new(404, "")]);
        let client = ServerlessClient::new(fake.clone());
        let ctx = CancellationToken::new();
        client.delete_project(&ctx, &project()).await.unwrap();
        client.delete_project(&ctx, &project()).await.unwrap();
        assert_eq!(
            fake.paths.lock()[0],
            "DELETE /api/v1/serverless/projects/observability/abc"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_endpoints() {
        let fake = Scripted::new(vec![
            ResourceResponse::new(200, r#"{"id":"abc","type":"observability","endpoints":{"elasticsearch":"","kibana":""}}"#),
            ResourceResponse::new(
                200,
                r#"{"id":"abc","type":"observability","endpoints":{"elasticsearch":"https://es","kibana":"https://kb"}}"#,
            ),
        ]);
        let client = ServerlessClient::new(fake);
        let mut project = project();
        project.credentials.password = "secret".to_string();
        client
            .ensure_endpoints(
                &CancellationToken::new(),
                &mut project,
                Duration::from_secs(5),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(project.endpoints.kibana, "https://kb");
        assert_eq!(project.credentials.password, "secret");
    }

    #[tokio::test(start_paused = true)]
    async fn initialization_times_out() {
        let responses = (0..10)
            .map(|_| ResourceResponse::new(200, r#"{"phase":"initializing"}"#))
            .collect();
        let client = ServerlessClient::new(Scripted::new(responses));
        let err = client
            .ensure_initialized(
                &CancellationToken::new(),
                &project(),
                Duration::from_secs(5),
                Duration::from_secs(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn project_named_after_profile() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::with_config("ci", dir.path().to_path_buf(), "").unwrap();
        assert_eq!(project_name(&profile), "elastic-package-test-ci");
    }
}
