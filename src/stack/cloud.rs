//! Provider backed by an Elastic Cloud deployment.

use super::dump::{dump_local_logs, DumpOptions, DumpResult};
use super::fleet;
use super::resources::{self, CLOUD_COMPOSE_FILE};
use super::{
    print_user_config, Backends, LocalServices, Options, Provider, ProviderAdapter, ServiceStatus, StackConfig,
    StackConfigStore, PARAM_FLEET_URL,
};
use crate::client::{ClientSpec, ResourceClient, ResourceRequest};
use crate::error::{Error, Result};
use crate::poll::poll_until;
use crate::profile::Profile;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PARAM_REF_ID: &str = "cloud_ref_id";
pub const PARAM_DEPLOYMENT_ALIAS: &str = "cloud_deployment_alias";
pub const PARAM_DEPLOYMENT_ID: &str = "cloud_deployment_id";
pub const PARAM_GEOIP_EXTENSION_ID: &str = "cloud_geoip_extension_id";

pub const CONFIG_REGION: &str = "stack.cloud.region";
pub const CONFIG_TEMPLATE: &str = "stack.cloud.template";
pub const CONFIG_ZONE_COUNT: &str = "stack.cloud.zone_count";
pub const CONFIG_MEMORY_SIZE: &str = "stack.cloud.memory_size";
pub const DEFAULT_REGION: &str = "gcp-europe-west3";
pub const DEFAULT_TEMPLATE: &str = "gcp-general-purpose-v5";
pub const DEFAULT_ZONE_COUNT: i64 = 1;
pub const DEFAULT_MEMORY_SIZE: i64 = 4096;

pub const HOST_ENV: &str = "EC_HOST";
pub const API_KEY_ENV: &str = "EC_API_KEY";
pub const DEFAULT_HOST: &str = "https://api.elastic-cloud.com";

const DEPLOYMENTS_API: &str = "/api/v1/deployments";
const PLAN_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const POLL_PERIOD: Duration = Duration::from_secs(5);
const EXTENSION_RETRY_PERIOD: Duration = Duration::from_secs(5);
const EXTENSION_DELETE_TIMEOUT: Duration = Duration::from_secs(180);

const HOT_TIER: &str = "hot_content";
/// Databases replacing the ones Elasticsearch downloads, stored under
/// `ingest-geoip/` in the bundle.
pub const GEOIP_DATABASES: [&str; 3] = ["GeoLite2-ASN.mmdb", "GeoLite2-City.mmdb", "GeoLite2-Country.mmdb"];
const GEOIP_BUNDLE_DIR: &str = "ingest-geoip";

/// Resource kinds the tool does not need and strips from templates.
const UNUSED_RESOURCES: [&str; 3] = ["apm", "appsearch", "enterprise_search"];
const STATUS_RESOURCES: [(&str, &str); 3] = [
    ("elasticsearch", "elasticsearch"),
    ("kibana", "kibana"),
    ("integrations_server", "integrations-server"),
];

/// Shape of the deployment requested for a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSettings {
    pub name: String,
    pub region: String,
    pub template_id: String,
    pub zone_count: i64,
    pub memory_size: i64,
    pub stack_version: String,
}

impl CloudSettings {
    pub fn from_options(options: &Options) -> Result<Self> {
        let settings = CloudSettings {
            name: deployment_name(&options.profile),
            region: options.setting(CONFIG_REGION, DEFAULT_REGION),
            template_id: options.setting(CONFIG_TEMPLATE, DEFAULT_TEMPLATE),
            zone_count: options.setting_i64(CONFIG_ZONE_COUNT, DEFAULT_ZONE_COUNT)?,
            memory_size: options.setting_i64(CONFIG_MEMORY_SIZE, DEFAULT_MEMORY_SIZE)?,
            stack_version: options.stack_version.clone(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=3).contains(&self.zone_count) {
            return Err(Error::Config(format!(
                "{} must be between 1 and 3, got {}",
                CONFIG_ZONE_COUNT, self.zone_count
            )));
        }
        if self.memory_size <= 0 {
            return Err(Error::Config(format!(
                "{} must be positive, got {}",
                CONFIG_MEMORY_SIZE, self.memory_size
            )));
        }
        Ok(())
    }
}

/// Name of the deployment created for a profile.
pub fn deployment_name(profile: &Profile) -> String {
    format!("elastic-package-test-{}", profile.name())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Deployment {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub metadata: DeploymentMetadata,
    #[serde(default)]
    pub resources: DeploymentResources,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentMetadata {
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentResources {
    #[serde(default)]
    pub elasticsearch: Vec<DeploymentResource>,
    #[serde(default)]
    pub kibana: Vec<DeploymentResource>,
    #[serde(default)]
    pub integrations_server: Vec<DeploymentResource>,
}

impl DeploymentResources {
    fn by_kind(&self, kind: &str) -> &[DeploymentResource] {
        match kind {
            "elasticsearch" => &self.elasticsearch,
            "kibana" => &self.kibana,
            "integrations_server" => &self.integrations_server,
            _ => &[],
        }
    }

    fn all(&self) -> impl Iterator<Item = &DeploymentResource> {
        self.elasticsearch
            .iter()
            .chain(&self.kibana)
            .chain(&self.integrations_server)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentResource {
    #[serde(default)]
    pub ref_id: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub info: ResourceInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceInfo {
    #[serde(default)]
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub plan_info: PlanInfo,
    #[serde(default)]
    pub topology: Topology,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceMetadata {
    #[serde(default)]
    pub service_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanInfo {
    #[serde(default)]
    pub pending: Option<Value>,
    #[serde(default)]
    pub current: Option<PlanAttempt>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanAttempt {
    #[serde(default)]
    pub plan: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Instance {
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub service_version: String,
    #[serde(default)]
    pub healthy: bool,
}

impl Deployment {
    /// Whether any resource still has a plan being applied.
    pub fn has_pending_plan(&self) -> bool {
        self.resources.all().any(|r| r.info.plan_info.pending.is_some())
    }

    fn service_url(&self, kind: &str) -> Option<&str> {
        self.resources
            .by_kind(kind)
            .first()
            .map(|r| r.info.metadata.service_url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// One status per instance, named after the resource kind.
    pub fn instance_statuses(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::new();
        for (kind, label) in STATUS_RESOURCES {
            for resource in self.resources.by_kind(kind) {
                for (i, instance) in resource.info.topology.instances.iter().enumerate() {
                    let name = if instance.instance_name.is_empty() {
                        format!("{}-{}", label, i)
                    } else {
                        format!("{}-{}", label, instance.instance_name)
                    };
                    let status = if instance.healthy { "healthy" } else { "unhealthy" };
                    statuses.push(ServiceStatus::new(name, status, &instance.service_version));
                }
            }
        }
        statuses
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatedDeployment {
    pub id: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub resources: Vec<CreatedResource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatedResource {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub ref_id: String,
    #[serde(default)]
    pub credentials: Option<ResourceCredentials>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl CreatedDeployment {
    fn elasticsearch(&self) -> Option<&CreatedResource> {
        self.resources.iter().find(|r| r.kind == "elasticsearch")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Extension {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Set once a file was uploaded.
    #[serde(default)]
    pub url: String,
}

/// Sizes the hot tier of `plan` as `settings` ask, returns whether it
/// changed.
fn size_hot_tier(plan: &mut Value, settings: &CloudSettings) -> bool {
    let mut changed = false;
    for tier in plan
        .get_mut("cluster_topology")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
    {
        if tier.get("id").and_then(Value::as_str) != Some(HOT_TIER) {
            continue;
        }
        let size = tier.pointer("/size/value").and_then(Value::as_i64);
        let zones = tier.get("zone_count").and_then(Value::as_i64);
        if size == Some(settings.memory_size) && zones == Some(settings.zone_count) {
            continue;
        }
        tier["size"] = json!({ "value": settings.memory_size, "resource": "memory" });
        tier["zone_count"] = json!(settings.zone_count);
        changed = true;
    }
    changed
}

/// Turns a deployment template into a creation request sized by
/// `settings`.
pub fn deployment_request(template: Value, settings: &CloudSettings) -> Result<Value> {
    let mut request = match template {
        Value::Object(mut info) => info
            .remove("deployment_template")
            .ok_or_else(|| Error::Config(format!("template {} has no deployment", settings.template_id)))?,
        _ => return Err(Error::Config(format!("template {} is not an object", settings.template_id))),
    };

    let resources = request
        .get_mut("resources")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::Config(format!("template {} has no resources", settings.template_id)))?;
    for kind in UNUSED_RESOURCES {
        resources.remove(kind);
    }

    for es in resources
        .get_mut("elasticsearch")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
    {
        let Some(plan) = es.get_mut("plan") else {
            continue;
        };
        let Some(fields) = plan.as_object_mut() else {
            continue;
        };
        fields.insert("deployment_template".to_string(), json!({ "id": settings.template_id }));
        size_hot_tier(plan, settings);
    }

    for (kind, _) in STATUS_RESOURCES {
        for resource in resources
            .get_mut(kind)
            .and_then(Value::as_array_mut)
            .into_iter()
            .flatten()
        {
            let Some(plan) = resource.get_mut("plan").and_then(Value::as_object_mut) else {
                continue;
            };
            let service = plan.entry(kind.to_string()).or_insert_with(|| json!({}));
            if let Some(service) = service.as_object_mut() {
                service.insert("version".to_string(), json!(settings.stack_version));
            }
        }
    }

    request["name"] = json!(settings.name);
    Ok(request)
}

/// Update resizing the Elasticsearch resources of an existing deployment,
/// `None` when their hot tier already has the requested size.
pub fn resize_request(deployment: &Deployment, settings: &CloudSettings) -> Option<Value> {
    let mut resized = Vec::new();
    for es in &deployment.resources.elasticsearch {
        let Some(current) = &es.info.plan_info.current else {
            continue;
        };
        let mut plan = current.plan.clone();
        if size_hot_tier(&mut plan, settings) {
            resized.push(json!({ "ref_id": es.ref_id, "region": es.region, "plan": plan }));
        }
    }
    if resized.is_empty() {
        return None;
    }
    Some(json!({
        "prune_orphans": false,
        "resources": { "elasticsearch": resized },
    }))
}

/// Update loading `extension` as a user bundle into the Elasticsearch
/// resource `ref_id`.
pub fn user_bundle_request(
    ref_id: &str,
    settings: &CloudSettings,
    cluster_topology: Value,
    extension: &Extension,
) -> Value {
    json!({
        "prune_orphans": false,
        "resources": {
            "elasticsearch": [{
                "ref_id": ref_id,
                "region": settings.region,
                "plan": {
                    "cluster_topology": cluster_topology,
                    "deployment_template": { "id": settings.template_id },
                    "elasticsearch": {
                        "version": settings.stack_version,
                        "user_bundles": [{
                            "name": extension.name,
                            "url": extension.url,
                            "elasticsearch_version": settings.stack_version,
                        }],
                    },
                },
            }],
        },
    })
}

/// Zip with the GeoIP databases found in `dir`, `None` when there is none.
pub fn geoip_bundle(dir: &Path) -> Result<Option<Vec<u8>>> {
    let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let file_options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let mut found = false;
    for database in GEOIP_DATABASES {
        let path = dir.join(database);
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "GeoIP database not found");
            continue;
        }
        archive.start_file(format!("{}/{}", GEOIP_BUNDLE_DIR, database), file_options)?;
        archive.write_all(&std::fs::read(&path)?)?;
        found = true;
    }
    if !found {
        return Ok(None);
    }
    Ok(Some(archive.finish()?.into_inner()))
}

/// Elastic Cloud deployments API client.
pub struct CloudClient {
    client: Arc<dyn ResourceClient>,
}

impl CloudClient {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        CloudClient { client }
    }

    pub async fn get_template(&self, ctx: &CancellationToken, settings: &CloudSettings) -> Result<Value> {
        let path = format!(
            "{}/templates/{}?region={}&stack_version={}",
            DEPLOYMENTS_API, settings.template_id, settings.region, settings.stack_version
        );
        let resp = self
            .client
            .send(ctx, ResourceRequest::get(path))
            .await?
            .expect(&[200], "failed to get deployment template")?;
        resp.json()
    }

    pub async fn create_deployment(&self, ctx: &CancellationToken, request: &Value) -> Result<CreatedDeployment> {
        let resp = self
            .client
            .send(ctx, ResourceRequest::post(DEPLOYMENTS_API).json(request)?)
            .await?
            .expect(&[200, 201], "failed to create deployment")?;
        let created: CreatedDeployment = resp.json()?;
        tracing::debug!(id = %created.id, alias = %created.alias, "created deployment");
        Ok(created)
    }

    pub async fn update_deployment(&self, ctx: &CancellationToken, id: &str, request: &Value) -> Result<()> {
        self.client
            .send(
                ctx,
                ResourceRequest::put(format!("{}/{}", DEPLOYMENTS_API, id)).json(request)?,
            )
            .await?
            .expect(&[200], "failed to update deployment")?;
        Ok(())
    }

    /// Fails with [`Error::NotFound`] when the deployment does not exist.
    pub async fn get_deployment(&self, ctx: &CancellationToken, id: &str) -> Result<Deployment> {
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::get(format!("{}/{}?show_plans=true", DEPLOYMENTS_API, id)),
            )
            .await?;
        if resp.status == 404 {
            return Err(Error::NotFound(format!("deployment {}", id)));
        }
        resp.expect(&[200], "failed to get deployment")?.json()
    }

    /// A deployment already gone counts as shut down.
    pub async fn shutdown_deployment(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::post(format!("{}/{}/_shutdown?skip_snapshot=true", DEPLOYMENTS_API, id)),
            )
            .await?;
        if resp.status == 404 {
            tracing::debug!(id = %id, "deployment already deleted");
            return Ok(());
        }
        resp.expect(&[200], "failed to shut down deployment")?;
        Ok(())
    }

    pub async fn create_extension(&self, ctx: &CancellationToken, name: &str, description: &str) -> Result<Extension> {
        let body = json!({
            "name": name,
            "description": description,
            "extension_type": "bundle",
            "version": "*",
        });
        let extension: Extension = self
            .client
            .send(
                ctx,
                ResourceRequest::post(format!("{}/extensions", DEPLOYMENTS_API)).json(&body)?,
            )
            .await?
            .expect(&[200, 201], "failed to create extension")?
            .json()?;
        tracing::debug!(id = %extension.id, name = %extension.name, "created extension");
        Ok(extension)
    }

    pub async fn upload_extension(
        &self,
        ctx: &CancellationToken,
        id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<Extension> {
        self.client
            .send(
                ctx,
                ResourceRequest::put(format!("{}/extensions/{}", DEPLOYMENTS_API, id)).file("file", file_name, content),
            )
            .await?
            .expect(&[200, 201], "failed to upload extension")?
            .json()
    }

    pub async fn delete_extension(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let resp = self
            .client
            .send(
                ctx,
                ResourceRequest::delete(format!("{}/extensions/{}", DEPLOYMENTS_API, id)),
            )
            .await?;
        if resp.status == 404 {
            return Ok(());
        }
        resp.expect(&[200], "failed to delete extension")?;
        Ok(())
    }

    /// Polls until no resource of the deployment has a pending plan and
    /// returns its final state.
    pub async fn wait_for_plan(
        &self,
        ctx: &CancellationToken,
        id: &str,
        period: Duration,
        timeout: Duration,
    ) -> Result<Deployment> {
        let found_cell = parking_lot::Mutex::new(None);
        let found = &found_cell;
        let done = poll_until(ctx, period, timeout, move || async move {
            let deployment = self.get_deployment(ctx, id).await?;
            if deployment.has_pending_plan() {
                tracing::debug!(id = %id, "deployment plan still pending");
                return Ok(false);
            }
            *found.lock() = Some(deployment);
            Ok(true)
        })
        .await?;
        match found_cell.into_inner() {
            Some(deployment) if done => Ok(deployment),
            _ => Err(Error::Timeout(format!("plan of deployment {}", id))),
        }
    }

    /// Extension deletion fails while the deployment using it shuts down,
    /// so it is retried until `timeout`.
    pub async fn delete_extension_with_retries(
        &self,
        ctx: &CancellationToken,
        id: &str,
        period: Duration,
        timeout: Duration,
    ) -> Result<()> {
        let last_cell = parking_lot::Mutex::new(None);
        let last = &last_cell;
        let deleted = poll_until(ctx, period, timeout, move || async move {
            match self.delete_extension(ctx, id).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_cancelled() => Err(e),
                Err(e) => {
                    tracing::debug!(id = %id, error = %e, "extension not deleted yet");
                    *last.lock() = Some(e);
                    Ok(false)
                }
            }
        })
        .await?;
        if deleted {
            return Ok(());
        }
        Err(last_cell
            .into_inner()
            .unwrap_or_else(|| Error::Timeout(format!("deletion of extension {}", id)))
            .context(format!("failed to delete extension {}", id)))
    }
}

pub struct CloudProvider {
    backends: Backends,
}

impl CloudProvider {
    pub fn new(backends: Backends) -> Self {
        CloudProvider { backends }
    }

    fn client(&self) -> Result<CloudClient> {
        let host = self.backends.env(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let api_key = self
            .backends
            .env(API_KEY_ENV)
            .ok_or_else(|| Error::MissingEnv(API_KEY_ENV.to_string()))?;
        let client = self.backends.http.client(ClientSpec::new(host).api_key(&api_key))?;
        Ok(CloudClient::new(client))
    }

    fn local_agent(&self, profile: &Profile) -> LocalServices {
        self.backends.local_services(profile, CLOUD_COMPOSE_FILE)
    }

    /// The deployment recorded in the config, `None` when there is none or
    /// it was deleted.
    async fn current_deployment(
        &self,
        ctx: &CancellationToken,
        client: &CloudClient,
        config: &StackConfig,
    ) -> Result<Option<Deployment>> {
        let Some(id) = config.param(PARAM_DEPLOYMENT_ID) else {
            return Ok(None);
        };
        match client.get_deployment(ctx, id).await {
            // Deleted deployments stay visible for a while, hidden.
            Ok(deployment) if deployment.metadata.hidden => Ok(None),
            Ok(deployment) => Ok(Some(deployment)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context("couldn't check deployment")),
        }
    }

    async fn create_deployment(
        &self,
        ctx: &CancellationToken,
        client: &CloudClient,
        options: &Options,
        settings: &CloudSettings,
    ) -> Result<(StackConfig, Value)> {
        tracing::info!(
            name = %settings.name,
            region = %settings.region,
            template = %settings.template_id,
            "creating deployment"
        );
        let template = client.get_template(ctx, settings).await?;
        let request = deployment_request(template, settings)?;
        let cluster_topology = request
            .pointer("/resources/elasticsearch/0/plan/cluster_topology")
            .cloned()
            .unwrap_or_else(|| json!([]));
        let created = client
            .create_deployment(ctx, &request)
            .await
            .map_err(|e| e.context(format!("failed to create deployment {}", settings.name)))?;

        let store = StackConfigStore::new(&options.profile);
        let mut config = StackConfig {
            provider: Some(Provider::Cloud),
            ..Default::default()
        };
        config.set_param(PARAM_DEPLOYMENT_ALIAS, created.alias.clone());
        config.set_param(PARAM_DEPLOYMENT_ID, created.id.clone());
        if let Some(es) = created.elasticsearch() {
            config.set_param(PARAM_REF_ID, es.ref_id.clone());
            if let Some(credentials) = &es.credentials {
                config.elasticsearch_username = credentials.username.clone();
                config.elasticsearch_password = credentials.password.clone();
            }
        }
        store.store(&config)?;

        let deployment = client
            .get_deployment(ctx, &created.id)
            .await
            .map_err(|e| e.context("couldn't check deployment"))?;
        config.elasticsearch_host = deployment
            .service_url("elasticsearch")
            .ok_or_else(|| Error::Config("deployment has no Elasticsearch URL".to_string()))?
            .to_string();
        config.kibana_host = deployment
            .service_url("kibana")
            .ok_or_else(|| Error::Config("deployment has no Kibana URL".to_string()))?
            .to_string();
        print_user_config(options.output.as_ref(), &config);
        store.store(&config)?;

        tracing::debug!("waiting for creation plan to be completed");
        client
            .wait_for_plan(ctx, &created.id, POLL_PERIOD, PLAN_TIMEOUT)
            .await
            .map_err(|e| e.context("deployment plan not completed"))?;

        let fleet_url = self
            .backends
            .kibana(&config)?
            .default_fleet_server_url(ctx)
            .await?
            .ok_or_else(|| Error::Config("no default fleet server URL in the deployment".to_string()))?;
        config.set_param(PARAM_FLEET_URL, fleet_url);
        store.store(&config)?;
        Ok((config, cluster_topology))
    }

    /// Ships the GeoIP databases of the profile as a bundle extension so
    /// ingest pipelines resolve the same locations as on a local stack.
    async fn replace_geoip_databases(
        &self,
        ctx: &CancellationToken,
        client: &CloudClient,
        options: &Options,
        settings: &CloudSettings,
        config: &mut StackConfig,
        cluster_topology: Value,
    ) -> Result<()> {
        let dir = resources::geoip_dir(options);
        let Some(bundle) = geoip_bundle(&dir)? else {
            tracing::debug!(dir = %dir.display(), "no GeoIP databases to upload");
            return Ok(());
        };

        tracing::info!("replacing GeoIP databases");
        let disable_downloader = json!({ "persistent": { "ingest.geoip.downloader.enabled": false } });
        self.backends
            .elasticsearch(config)?
            .send(ctx, ResourceRequest::put("/_cluster/settings").json(&disable_downloader)?)
            .await?
            .expect(&[200], "failed to disable the GeoIP downloader")?;

        let profile = options.profile.name();
        let extension = client
            .create_extension(
                ctx,
                &format!("elastic-package-{}-geoip", profile),
                &format!("GeoIP extension for elastic-package tests ({} profile)", profile),
            )
            .await?;
        // Recorded first, tear down deletes it even if the rest fails.
        config.set_param(PARAM_GEOIP_EXTENSION_ID, extension.id.clone());
        StackConfigStore::new(&options.profile).store(config)?;

        let extension = client
            .upload_extension(ctx, &extension.id, "geoip.zip", bundle)
            .await?;
        let deployment_id = config.param(PARAM_DEPLOYMENT_ID).unwrap_or_default().to_string();
        let ref_id = config.param(PARAM_REF_ID).unwrap_or_default();
        let request = user_bundle_request(ref_id, settings, cluster_topology, &extension);
        client.update_deployment(ctx, &deployment_id, &request).await?;
        client
            .wait_for_plan(ctx, &deployment_id, POLL_PERIOD, PLAN_TIMEOUT)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for CloudProvider {
    fn name(&self) -> Provider {
        Provider::Cloud
    }

    async fn boot_up(&self, ctx: &CancellationToken, options: &Options) -> Result<()> {
        tracing::warn!("Elastic Cloud provider is in technical preview");
        let settings = CloudSettings::from_options(options)?;
        let client = self.client()?;
        let store = StackConfigStore::new(&options.profile);
        let mut config = store
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;

        match self.current_deployment(ctx, &client, &config).await? {
            None => {
                let (created, cluster_topology) = self
                    .create_deployment(ctx, &client, options, &settings)
                    .await
                    .map_err(|e| e.context("failed to create deployment"))?;
                config = created;

                tracing::info!("creating agent policy");
                let kibana = self.backends.kibana(&config)?;
                let registry = self.backends.package_registry()?;
                fleet::create_agent_policy(ctx, &kibana, registry.as_ref(), &options.stack_version, "", false)
                    .await
                    .map_err(|e| e.context("failed to create agent policy"))?;

                self.replace_geoip_databases(ctx, &client, options, &settings, &mut config, cluster_topology)
                    .await
                    .map_err(|e| e.context("failed to replace GeoIP databases"))?;
            }
            Some(deployment) => {
                tracing::debug!(id = %deployment.id, name = %deployment.name, "deployment existed");
                let deployment = client
                    .wait_for_plan(ctx, &deployment.id, POLL_PERIOD, PLAN_TIMEOUT)
                    .await
                    .map_err(|e| e.context("failed to update deployment"))?;
                match resize_request(&deployment, &settings) {
                    Some(request) => {
                        tracing::info!(
                            memory_size = settings.memory_size,
                            zone_count = settings.zone_count,
                            "resizing deployment"
                        );
                        client
                            .update_deployment(ctx, &deployment.id, &request)
                            .await
                            .map_err(|e| e.context("failed to update deployment"))?;
                        client
                            .wait_for_plan(ctx, &deployment.id, POLL_PERIOD, PLAN_TIMEOUT)
                            .await
                            .map_err(|e| e.context("failed to update deployment"))?;
                    }
                    None => tracing::debug!("deployment already has the requested size"),
                }
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

        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                errors.push(e);
                return Error::from_many(errors).map_or(Ok(()), Err);
            }
        };

        match self.current_deployment(ctx, &client, &config).await {
            Ok(Some(deployment)) => {
                tracing::debug!(id = %deployment.id, "shutting down deployment");
                if let Err(e) = client.shutdown_deployment(ctx, &deployment.id).await {
                    errors.push(e.context("failed to shut down deployment"));
                }
            }
            Ok(None) => tracing::debug!("no deployment to shut down"),
            Err(e) => errors.push(e),
        }

        if let Some(extension) = config.param(PARAM_GEOIP_EXTENSION_ID) {
            if let Err(e) = client
                .delete_extension_with_retries(ctx, extension, EXTENSION_RETRY_PERIOD, EXTENSION_DELETE_TIMEOUT)
                .await
            {
                errors.push(e);
            }
        }

        Error::from_many(errors).map_or(Ok(()), Err)
    }

    async fn update(&self, _ctx: &CancellationToken, options: &Options) -> Result<()> {
        options.output.message("Nothing to do.");
        Ok(())
    }

    async fn dump(&self, ctx: &CancellationToken, options: &DumpOptions) -> Result<Vec<DumpResult>> {
        dump_local_logs(ctx, &self.local_agent(&options.profile), options).await
    }

    async fn status(&self, ctx: &CancellationToken, options: &Options) -> Result<Vec<ServiceStatus>> {
        let client = self.client()?;
        let config = StackConfigStore::new(&options.profile)
            .load()
            .map_err(|e| e.context("failed to load configuration"))?;
        let Some(deployment) = self.current_deployment(ctx, &client, &config).await? else {
            return Err(Error::UnavailableStack("deployment does not exist".to_string()));
        };

        let mut statuses = deployment.instance_statuses();
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
