//! Kibana and Fleet API calls used to wire agents to a stack.

use crate::client::{ClientSpec, ResourceClient, ResourceRequest, ResourceResponse};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const FLEET_API: &str = "/api/fleet";

/// Connection settings for Kibana, with the XSRF header its API requires.
pub fn kibana_spec(address: &str) -> ClientSpec {
    ClientSpec::new(address).header("kbn-xsrf", "elastic-package")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub monitoring_enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_output_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default_fleet_server: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackagePolicy {
    pub name: String,
    pub policy_id: String,
    pub namespace: String,
    pub package: PackageRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentSsl {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificate_authorities: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetOutput {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub output_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<AgentSsl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetServerHost {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub host_urls: Vec<String>,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Agent {
    pub id: String,
    #[serde(default)]
    pub policy_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct EnrollmentToken {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct Item<T> {
    item: T,
}

/// Version reported by Elasticsearch's root endpoint or Kibana's status API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub build_flavor: String,
}

impl VersionInfo {
    /// Version to show in `stack status`.
    pub fn display(&self) -> String {
        if self.build_flavor == "serverless" {
            "serverless".to_string()
        } else {
            self.number.clone()
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionEnvelope {
    #[serde(default)]
    version: VersionInfo,
}

/// Version of the service behind `client`; `path` is `/` for
/// Elasticsearch and `/api/status` for Kibana.
pub async fn service_version(
    ctx: &CancellationToken,
    client: &dyn ResourceClient,
    path: &str,
) -> Result<VersionInfo> {
    let resp = client
        .send(ctx, ResourceRequest::get(path))
        .await?
        .expect(&[200], "failed to get version")?;
    Ok(resp.json::<VersionEnvelope>()?.version)
}

/// Fleet API client.
#[derive(Clone)]
pub struct KibanaClient {
    client: Arc<dyn ResourceClient>,
}

impl KibanaClient {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        KibanaClient { client }
    }

    pub fn inner(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    async fn send(&self, ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse> {
        self.client.send(ctx, request).await
    }

    /// First URL of the default Fleet Server host, if one is configured.
    pub async fn default_fleet_server_url(&self, ctx: &CancellationToken) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Host {
            #[serde(default)]
            is_default: bool,
            #[serde(default)]
            host_urls: Vec<String>,
        }
        #[derive(Deserialize)]
        struct Hosts {
            #[serde(default)]
            items: Vec<Host>,
        }

        let resp = self
            .send(ctx, ResourceRequest::get(format!("{}/fleet_server_hosts", FLEET_API)))
            .await?
            .expect(&[200], "could not get fleet server hosts")?;
        let hosts: Hosts = resp.json()?;
        Ok(hosts
            .items
            .into_iter()
            .filter(|h| h.is_default)
            .find_map(|h| h.host_urls.into_iter().next()))
    }

    pub async fn add_fleet_server_host(&self, ctx: &CancellationToken, host: &FleetServerHost) -> Result<()> {
        let resp = self
            .send(
                ctx,
                ResourceRequest::post(format!("{}/fleet_server_hosts", FLEET_API)).json(host)?,
            )
            .await?;
        if resp.status == 409 {
            return Err(Error::Conflict(format!("fleet server host {}", host.id)));
        }
        resp.expect(&[200], "could not add fleet server host")?;
        Ok(())
    }

    /// The id goes in the path and must not be part of the body.
    pub async fn update_fleet_server_host(&self, ctx: &CancellationToken, host: &FleetServerHost) -> Result<()> {
        if host.id.is_empty() {
            return Err(Error::Config(
                "host id required when updating fleet server host".to_string(),
            ));
        }
        let body = FleetServerHost {
            id: String::new(),
            ..host.clone()
        };
        self.send(
            ctx,
            ResourceRequest::put(format!("{}/fleet_server_hosts/{}", FLEET_API, host.id)).json(&body)?,
        )
        .await?
        .expect(&[200], "could not update fleet server host")?;
        Ok(())
    }

    pub async fn create_policy(&self, ctx: &CancellationToken, policy: &Policy) -> Result<Policy> {
        let resp = self
            .send(
                ctx,
                ResourceRequest::post(format!("{}/agent_policies", FLEET_API)).json(policy)?,
            )
            .await?;
        if resp.status == 409 {
            return Err(Error::Conflict(format!("policy {}", policy.id)));
        }
        let resp = resp.expect(&[200], "could not create policy")?;
        Ok(resp.json::<Item<Policy>>()?.item)
    }

    pub async fn get_policy(&self, ctx: &CancellationToken, id: &str) -> Result<Policy> {
        let resp = self
            .send(ctx, ResourceRequest::get(format!("{}/agent_policies/{}", FLEET_API, id)))
            .await?;
        if resp.status == 404 {
            return Err(Error::NotFound(format!("policy {}", id)));
        }
        let resp = resp.expect(&[200], "could not get policy")?;
        Ok(resp.json::<Item<Policy>>()?.item)
    }

    pub async fn delete_policy(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let resp = self
            .send(
                ctx,
                ResourceRequest::post(format!("{}/agent_policies/delete", FLEET_API))
                    .json(&serde_json::json!({ "agentPolicyId": id }))?,
            )
            .await?;
        if resp.status == 404 {
            return Err(Error::NotFound(format!("policy {}", id)));
        }
        resp.expect(&[200], "could not delete policy")?;
        Ok(())
    }

    pub async fn create_package_policy(&self, ctx: &CancellationToken, policy: &PackagePolicy) -> Result<()> {
        self.send(
            ctx,
            ResourceRequest::post(format!("{}/package_policies", FLEET_API)).json(policy)?,
        )
        .await?
        .expect(&[200], "could not create package policy")?;
        Ok(())
    }

    pub async fn add_fleet_output(&self, ctx: &CancellationToken, output: &FleetOutput) -> Result<()> {
        let resp = self
            .send(ctx, ResourceRequest::post(format!("{}/outputs", FLEET_API)).json(output)?)
            .await?;
        if resp.status == 409 {
            return Err(Error::Conflict(format!("fleet output {}", output.id)));
        }
        resp.expect(&[200], "could not add fleet output")?;
        Ok(())
    }

    pub async fn update_fleet_output(&self, ctx: &CancellationToken, id: &str, output: &FleetOutput) -> Result<()> {
        self.send(
            ctx,
            ResourceRequest::put(format!("{}/outputs/{}", FLEET_API, id)).json(output)?,
        )
        .await?
        .expect(&[200], "could not update fleet output")?;
        Ok(())
    }

    /// Removing an output that is already gone succeeds.
    pub async fn remove_fleet_output(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let resp = self
            .send(ctx, ResourceRequest::delete(format!("{}/outputs/{}", FLEET_API, id)))
            .await?;
        if resp.status == 404 {
            return Ok(());
        }
        resp.expect(&[200], "could not remove fleet output")?;
        Ok(())
    }

    pub async fn query_agents(&self, ctx: &CancellationToken, kuery: &str) -> Result<Vec<Agent>> {
        #[derive(Deserialize)]
        struct Agents {
            #[serde(default)]
            list: Vec<Agent>,
            #[serde(default)]
            items: Vec<Agent>,
        }

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("kuery", kuery)
            .finish();
        let resp = self
            .send(ctx, ResourceRequest::get(format!("{}/agents?{}", FLEET_API, query)))
            .await?
            .expect(&[200], "could not list agents")?;
        let agents: Agents = resp.json()?;
        Ok(if agents.list.is_empty() { agents.items } else { agents.list })
    }

    /// Force-unenrolls an agent, revoking its API key.
    pub async fn remove_agent(&self, ctx: &CancellationToken, agent: &Agent) -> Result<()> {
        self.send(
            ctx,
            ResourceRequest::post(format!("{}/agents/{}/unenroll", FLEET_API, agent.id))
                .json(&serde_json::json!({ "revoke": true, "force": true }))?,
        )
        .await?
        .expect(&[200], "could not unenroll agent")?;
        Ok(())
    }

    /// Newest active enrollment token of a policy, requesting one if there
    /// is none.
    pub async fn enrollment_token_for_policy(&self, ctx: &CancellationToken, policy_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Page {
            #[serde(default)]
            list: Vec<EnrollmentToken>,
            #[serde(default)]
            items: Vec<EnrollmentToken>,
            #[serde(default)]
            total: usize,
            #[serde(default)]
            page: usize,
            #[serde(default)]
            per_page: usize,
        }

        let kuery = format!("active:true and policy_id:{}", policy_id);
        let mut tokens = Vec::new();
        let mut page = 1;
        loop {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("page", &page.to_string())
                .append_pair("kuery", &kuery)
                .finish();
            let resp = self
                .send(
                    ctx,
                    ResourceRequest::get(format!("{}/enrollment_api_keys?{}", FLEET_API, query)),
                )
                .await?
                .expect(&[200], "could not get enrollment tokens")?;
            let body: Page = resp.json()?;
            // Some versions list every token twice, under both keys.
            let batch = if body.list.is_empty() { body.items } else { body.list };
            let empty = batch.is_empty();
            tokens.extend(batch);
            if empty || body.page * body.per_page >= body.total {
                break;
            }
            page = body.page + 1;
        }

        if let Some(token) = tokens.into_iter().next() {
            return Ok(token.api_key);
        }

        let resp = self
            .send(
                ctx,
                ResourceRequest::post(format!("{}/enrollment_api_keys", FLEET_API))
                    .json(&serde_json::json!({ "policy_id": policy_id }))?,
            )
            .await?
            .expect(&[200], "could not request enrollment token")?;
        let token = resp.json::<Item<EnrollmentToken>>()?.item;
        if !token.active {
            return Err(Error::Config(format!(
                "requested enrollment token {} is not active",
                token.id
            )));
        }
        Ok(token.api_key)
    }

    /// Service token Fleet Server authenticates with.
    pub async fn create_fleet_service_token(&self, ctx: &CancellationToken) -> Result<String> {
        #[derive(Deserialize)]
        struct Token {
            value: String,
        }

        let resp = self
            .send(
                ctx,
                ResourceRequest::post(format!("{}/service_tokens", FLEET_API)).json(&serde_json::json!({}))?,
            )
            .await?
            .expect(&[200], "could not create fleet service token")?;
        Ok(resp.json::<Token>()?.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Scripted {
        requests: Mutex<Vec<ResourceRequest>>,
        responses: Mutex<Vec<ResourceResponse>>,
    }

    impl Scripted {
        fn new(responses: Vec<ResourceResponse>) -> Arc<Self> {
            Arc::new(Scripted {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl ResourceClient for Scripted {
        fn address(&self) -> &str {
            "https://kibana:5601"
        }

        async fn send(&self, _ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse> {
            self.requests.lock().push(request);
            Ok(self.responses.lock().remove(0))
        }
    }

    #[tokio::test]
    async fn default_fleet_server_is_first_default_url() {
        let fake = Scripted::new(vec![ResourceResponse::new(
            200,
            r#"{"items":[
                {"is_default":false,"host_urls":["https://other:8220"]},
                {"is_default":true,"host_urls":["https://fleet:443","https://fleet2:443"]}
            ]}"#,
        )]);
        let kibana = KibanaClient::new(fake);
        let url = kibana
            .default_fleet_server_url(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(url.as_deref(), Some("https://fleet:443"));
    }

    #[tokio::test]
    async fn policy_conflict_and_missing() {
        let fake = Scripted::new(vec![
            ResourceResponse::new(409, "exists"),
            ResourceResponse::new(404, ""),
        ]);
        let kibana = KibanaClient::new(fake);
        let ctx = CancellationToken::new();
        let policy = Policy {
            id: "elastic-agent-managed-ep".to_string(),
            name: "Elastic-Agent (elastic-package)".to_string(),
            ..Default::default()
        };
        assert!(kibana.create_policy(&ctx, &policy).await.unwrap_err().is_conflict());
        assert!(kibana
            .delete_policy(&ctx, "elastic-agent-managed-ep")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn host_update_omits_id_from_body() {
        let fake = Scripted::new(vec![ResourceResponse::new(200, "{}")]);
        let kibana = KibanaClient::new(fake.clone());
        let host = FleetServerHost {
            id: "elastic-package-default".to_string(),
            host_urls: vec!["https://fleet-server:8220".to_string()],
            name: "elastic-package-managed-fleet-server".to_string(),
            is_default: true,
        };
        kibana
            .update_fleet_server_host(&CancellationToken::new(), &host)
            .await
            .unwrap();
        let request = fake.requests.lock().remove(0);
        assert_eq!(request.path, "/api/fleet/fleet_server_hosts/elastic-package-default");
        let body = request.body.unwrap();
        assert!(body.get("id").is_none());
        assert_eq!(body["is_default"], true);
    }

    #[tokio::test]
    async fn enrollment_token_requested_when_none_active() {
        let fake = Scripted::new(vec![
            ResourceResponse::new(200, r#"{"items":[],"total":0,"page":1,"perPage":20}"#),
            ResourceResponse::new(
                200,
                r#"{"item":{"id":"t1","active":true,"api_key":"secret","policy_id":"p"}}"#,
            ),
        ]);
        let kibana = KibanaClient::new(fake.clone());
        let token = kibana
            .enrollment_token_for_policy(&CancellationToken::new(), "p")
            .await
            .unwrap();
        assert_eq!(token, "secret");
        let requests = fake.requests.lock();
        assert!(requests[0].path.contains("kuery=active%3Atrue+and+policy_id%3Ap"));
        assert_eq!(requests[1].body.as_ref().unwrap()["policy_id"], "p");
    }

    #[test]
    fn serverless_flavor_is_reported_as_such() {
        let info: VersionEnvelope =
            serde_json::from_str(r#"{"version":{"number":"8.16.0","build_flavor":"serverless"}}"#)
                .unwrap();
        assert_eq!(info.version.display(), "serverless");
        let info: VersionEnvelope =
            serde_json::from_str(r#"{"version":{"number":"8.17.0","build_flavor":"default"}}"#).unwrap();
        assert_eq!(info.version.display(), "8.17.0");
    }
}
