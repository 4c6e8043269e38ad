use super::HealthChecker;
use crate::client::{ResourceClient, ResourceRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn unhealthy(service: &str, reason: impl std::fmt::Display) -> Error {
    Error::UnavailableStack(format!("{} unhealthy: {}", service, reason))
}

/// Cluster health must be `green`.
pub struct ElasticsearchHealth {
    client: Arc<dyn ResourceClient>,
}

impl ElasticsearchHealth {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        ElasticsearchHealth { client }
    }
}

#[async_trait]
impl HealthChecker for ElasticsearchHealth {
    fn service(&self) -> &str {
        "elasticsearch"
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        #[derive(Deserialize)]
        struct Health {
            status: String,
        }

        let resp = self
            .client
            .send(ctx, ResourceRequest::get("/_cluster/health"))
            .await?
            .expect(&[200], "failed to query elasticsearch health")?;
        let health: Health = resp.json()?;
        if health.status == "green" {
            Ok(())
        } else {
            Err(unhealthy(self.service(), health.status))
        }
    }
}

/// Kibana's overall status level must be `available`.
pub struct KibanaHealth {
    client: Arc<dyn ResourceClient>,
}

impl KibanaHealth {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        KibanaHealth { client }
    }
}

#[async_trait]
impl HealthChecker for KibanaHealth {
    fn service(&self) -> &str {
        "kibana"
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        #[derive(Deserialize)]
        struct Overall {
            level: String,
        }
        #[derive(Deserialize)]
        struct Status {
            overall: Overall,
        }
        #[derive(Deserialize)]
        struct Body {
            status: Status,
        }

        let resp = self
            .client
            .send(ctx, ResourceRequest::get("/api/status"))
            .await?
            .expect(&[200], "failed to query kibana status")?;
        let body: Body = resp.json()?;
        if body.status.overall.level == "available" {
            Ok(())
        } else {
            Err(unhealthy(self.service(), body.status.overall.level))
        }
    }
}

/// Fleet answers its status endpoint.
pub struct FleetHealth {
    client: Arc<dyn ResourceClient>,
}

impl FleetHealth {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        FleetHealth { client }
    }
}

#[async_trait]
impl HealthChecker for FleetHealth {
    fn service(&self) -> &str {
        "fleet"
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        let resp = self
            .client
            .send(ctx, ResourceRequest::get("/api/status"))
            .await?;
        if resp.status == 200 {
            Ok(())
        } else {
            Err(unhealthy(
                self.service(),
                format!("status code {}, body: {}", resp.status, resp.text()),
            ))
        }
    }
}

/// Fleet Server must report itself `healthy`.
pub struct FleetServerStatus {
    client: Arc<dyn ResourceClient>,
}

impl FleetServerStatus {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        FleetServerStatus { client }
    }
}

#[async_trait]
impl HealthChecker for FleetServerStatus {
    fn service(&self) -> &str {
        "fleet-server"
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        #[derive(Deserialize)]
        struct Body {
            #[serde(default)]
            status: String,
        }

        let resp = self
            .client
            .send(ctx, ResourceRequest::get("/api/status"))
            .await?
            .expect(&[200], "failed to query fleet server status")?;
        let body: Body = resp.json()?;
        if body.status.eq_ignore_ascii_case("healthy") {
            Ok(())
        } else {
            Err(unhealthy(self.service(), body.status.to_lowercase()))
        }
    }
}
