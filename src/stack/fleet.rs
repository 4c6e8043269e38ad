//! Fleet objects this tool creates: agent policies, outputs and Fleet
//! Server hosts. Creation is idempotent, an object that already exists is
//! reused; removal of something already gone succeeds.

use super::kibana::{AgentSsl, FleetOutput, FleetServerHost, KibanaClient, PackagePolicy, PackageRef, Policy};
use super::registry;
use super::resources::MANAGED_FLEET_SERVER_POLICY_ID;
use super::CERTS_DIR;
use crate::client::ResourceClient;
use crate::error::{Error, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const MANAGED_AGENT_POLICY_ID: &str = "elastic-agent-managed-ep";
pub const FLEET_LOGSTASH_OUTPUT: &str = "fleet-logstash-output";
pub const FLEET_ELASTICSEARCH_OUTPUT: &str = "fleet-elasticsearch-output";
pub const LOGSTASH_OUTPUT_HOST: &str = "logstash:5044";
pub const MANAGED_FLEET_SERVER_HOST_NAME: &str = "elastic-package-managed-fleet-server";

const POLICY_DESCRIPTION: &str = "Policy created by elastic-package";
const DEFAULT_NAMESPACE: &str = "default";

/// Id of the Fleet Server host registered for a profile.
pub fn fleet_server_host_id(profile: &str) -> String {
    format!("elastic-package-{}", profile)
}

/// Policy the test agents enroll with. Self-monitoring also adds the
/// `system` integration.
pub async fn create_agent_policy(
    ctx: &CancellationToken,
    kibana: &KibanaClient,
    registry: &dyn ResourceClient,
    stack_version: &str,
    output_id: &str,
    self_monitor: bool,
) -> Result<Policy> {
    let policy = Policy {
        id: MANAGED_AGENT_POLICY_ID.to_string(),
        name: "Elastic-Agent (elastic-package)".to_string(),
        description: POLICY_DESCRIPTION.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        monitoring_enabled: if self_monitor {
            vec!["logs".to_string(), "metrics".to_string()]
        } else {
            Vec::new()
        },
        data_output_id: output_id.to_string(),
        is_default_fleet_server: false,
    };

    let created = match kibana.create_policy(ctx, &policy).await {
        Ok(created) => created,
        Err(e) if e.is_conflict() => {
            return kibana
                .get_policy(ctx, &policy.id)
                .await
                .map_err(|e| e.context("error while getting existing policy"));
        }
        Err(e) => return Err(e.context("error while creating agent policy")),
    };

    if self_monitor {
        create_package_policy(ctx, kibana, registry, stack_version, &created, "system", "system-1").await?;
    }
    Ok(created)
}

/// Policy of a Fleet Server started by this tool.
pub async fn create_fleet_server_policy(
    ctx: &CancellationToken,
    kibana: &KibanaClient,
    registry: &dyn ResourceClient,
    stack_version: &str,
) -> Result<Policy> {
    let policy = Policy {
        id: MANAGED_FLEET_SERVER_POLICY_ID.to_string(),
        name: "Fleet Server (elastic-package)".to_string(),
        description: POLICY_DESCRIPTION.to_string(),
        namespace: DEFAULT_NAMESPACE.to_string(),
        is_default_fleet_server: true,
        ..Default::default()
    };

    let created = match kibana.create_policy(ctx, &policy).await {
        Ok(created) => created,
        Err(e) if e.is_conflict() => {
            return kibana
                .get_policy(ctx, &policy.id)
                .await
                .map_err(|e| e.context("error while getting existing policy"));
        }
        Err(e) => return Err(e.context("error while creating fleet server policy")),
    };

    create_package_policy(
        ctx,
        kibana,
        registry,
        stack_version,
        &created,
        "fleet_server",
        "fleet-server-ep",
    )
    .await?;
    Ok(created)
}

async fn create_package_policy(
    ctx: &CancellationToken,
    kibana: &KibanaClient,
    registry: &dyn ResourceClient,
    stack_version: &str,
    policy: &Policy,
    package: &str,
    name: &str,
) -> Result<()> {
    let version = registry::package_version(ctx, registry, package, stack_version)
        .await
        .map_err(|e| {
            e.context(format!(
                "could not get the {} package version for Kibana {}",
                package, stack_version
            ))
        })?;
    let package_policy = PackagePolicy {
        name: name.to_string(),
        policy_id: policy.id.clone(),
        namespace: policy.namespace.clone(),
        package: PackageRef {
            name: package.to_string(),
            version,
        },
    };
    kibana
        .create_package_policy(ctx, &package_policy)
        .await
        .map_err(|e| e.context("error while creating package policy"))
}

/// Deletes a policy; a policy that does not exist counts as deleted.
pub async fn delete_policy(ctx: &CancellationToken, kibana: &KibanaClient, id: &str) -> Result<()> {
    kibana.delete_policy(ctx, id).await.or_else(|e| {
        if e.is_not_found() {
            Ok(())
        } else {
            Err(e.context(format!("failed to delete policy {}", id)))
        }
    })
}

/// Force-unenrolls every agent enrolled with the policy.
pub async fn force_unenroll_agents(ctx: &CancellationToken, kibana: &KibanaClient, policy_id: &str) -> Result<()> {
    let agents = kibana
        .query_agents(ctx, &format!("policy_id: {}", policy_id))
        .await
        .map_err(|e| e.context(format!("error while querying agents with policy {}", policy_id)))?;
    for agent in &agents {
        tracing::debug!(agent = %agent.id, policy = policy_id, "unenrolling agent");
        kibana
            .remove_agent(ctx, agent)
            .await
            .map_err(|e| e.context(format!("failed to remove agent {}", agent.id)))?;
    }
    Ok(())
}

async fn add_output(ctx: &CancellationToken, kibana: &KibanaClient, output_type: &str, host: &str, id: &str) -> Result<()> {
    let output = FleetOutput {
        id: id.to_string(),
        name: id.to_string(),
        hosts: vec![host.to_string()],
        output_type: output_type.to_string(),
        ssl: None,
    };
    kibana.add_fleet_output(ctx, &output).await.or_else(|e| {
        if e.is_conflict() {
            Ok(())
        } else {
            Err(e.context(format!("failed to add {} fleet output of type {}", id, output_type)))
        }
    })
}

pub async fn add_logstash_output(ctx: &CancellationToken, kibana: &KibanaClient) -> Result<()> {
    add_output(ctx, kibana, "logstash", LOGSTASH_OUTPUT_HOST, FLEET_LOGSTASH_OUTPUT).await
}

pub async fn add_elasticsearch_output(ctx: &CancellationToken, kibana: &KibanaClient, host: &str) -> Result<()> {
    add_output(ctx, kibana, "elasticsearch", host, FLEET_ELASTICSEARCH_OUTPUT).await
}

/// Sets the agent's client certificate on the Logstash output.
pub async fn update_logstash_output(ctx: &CancellationToken, kibana: &KibanaClient, profile_root: &Path) -> Result<()> {
    let dir = profile_root.join(CERTS_DIR).join(super::ELASTIC_AGENT_SERVICE);
    let read = |file: &str, what: &str| {
        std::fs::read_to_string(dir.join(file))
            .map_err(|e| Error::Certificate(format!("failed to read {}: {}", what, e)))
    };
    let output = FleetOutput {
        ssl: Some(AgentSsl {
            certificate_authorities: vec![read("ca-cert.pem", "ca certificate")?],
            certificate: read("cert.pem", "client certificate")?,
            key: read("key.pem", "client certificate private key")?,
        }),
        ..Default::default()
    };
    kibana
        .update_fleet_output(ctx, FLEET_LOGSTASH_OUTPUT, &output)
        .await
        .map_err(|e| e.context("failed to update logstash fleet output"))
}

/// Registers `url` as the default Fleet Server host, updating the profile's
/// host if it was registered before.
pub async fn ensure_fleet_server_host(
    ctx: &CancellationToken,
    kibana: &KibanaClient,
    profile: &str,
    url: &str,
) -> Result<()> {
    let host = FleetServerHost {
        id: fleet_server_host_id(profile),
        host_urls: vec![url.to_string()],
        name: MANAGED_FLEET_SERVER_HOST_NAME.to_string(),
        is_default: true,
    };
    match kibana.add_fleet_server_host(ctx, &host).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => kibana.update_fleet_server_host(ctx, &host).await.map_err(|e| {
            e.context(format!(
                "failed to update existing Fleet Server host (id: {})",
                host.id
            ))
        }),
        Err(e) => Err(e.context("failed to add Fleet Server host")),
    }
}
