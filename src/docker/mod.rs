//! Docker and Docker Compose plumbing.
//!
//! [`DockerClient`] wraps the plain `docker` CLI (inspection, copying files out
//! of containers), and [`compose`] runs the stack's compose project.

pub mod client;
pub mod compose;
pub mod error;

pub use client::DockerClient;
pub use compose::{CommandOptions, ComposeDriver, ComposeFactory, DockerCompose, DockerComposeFactory};
pub use error::DockerError;

use serde::Deserialize;
use std::collections::HashMap;

/// Label compose sets on every container of a project.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label compose sets with the service a container belongs to.
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// What the stack needs to know about one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDescription {
    pub id: String,
    pub name: String,
    /// Compose service label, falls back to the container name.
    pub service: String,
    pub image: String,
    pub state: String,
    pub health: Option<String>,
    pub exit_code: i64,
}

impl ContainerDescription {
    /// Run state plus the health or exit code, e.g. `running (healthy)`.
    pub fn status(&self) -> String {
        match self.state.as_str() {
            "running" => format!(
                "running ({})",
                self.health.as_deref().unwrap_or("unknown health")
            ),
            "exited" => format!("exited ({})", self.exit_code),
            other => other.to_string(),
        }
    }

    /// Image tag, `latest` when the reference carries none.
    pub fn version(&self) -> String {
        let image = self.image.split('@').next().unwrap_or_default();
        let last_segment = image.rsplit('/').next().unwrap_or(image);
        match last_segment.rsplit_once(':') {
            Some((_, tag)) if !tag.is_empty() => tag.to_string(),
            _ => "latest".to_string(),
        }
    }
}

// Subset of `docker inspect` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InspectEntry {
    id: String,
    name: String,
    config: InspectConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

impl From<InspectEntry> for ContainerDescription {
    fn from(entry: InspectEntry) -> Self {
        let name = entry.name.trim_start_matches('/').to_string();
        let service = entry
            .config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SERVICE_LABEL).cloned())
            .unwrap_or_else(|| name.clone());
        ContainerDescription {
            id: entry.id,
            name,
            service,
            image: entry.config.image,
            state: entry.state.status,
            health: entry.state.health.map(|h| h.status),
            exit_code: entry.state.exit_code,
        }
    }
}
