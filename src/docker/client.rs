//! Thin wrapper over the `docker` CLI.
//!
//! Every call gets a timeout and maps failures to [`DockerError`].

use super::{ContainerDescription, DockerError, InspectEntry, PROJECT_LABEL};
use std::path::Path;
use std::process::Output;
use std::time::Duration;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default)]
pub struct DockerClient;

impl DockerClient {
    pub fn new() -> Self {
        DockerClient
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker")
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));
        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(cmd_str, e)),
            Err(_) => Err(DockerError::timeout(cmd_str, timeout)),
        }
    }

    async fn run_success(&self, args: &[&str], timeout: Duration) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(DockerError::failed(
                format!("docker {}", args.join(" ")),
                &output,
            ))
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// IDs of all containers (running or not) of a compose project.
    pub async fn project_container_ids(&self, project: &str) -> Result<Vec<String>, DockerError> {
        let filter = format!("label={}={}", PROJECT_LABEL, project);
        let output = self
            .run_success(&["ps", "-a", "-q", "--filter", &filter], INSPECT_TIMEOUT)
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Describes the given containers with `docker inspect`.
    pub async fn inspect(&self, ids: &[String]) -> Result<Vec<ContainerDescription>, DockerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect"];
        args.extend(ids.iter().map(String::as_str));
        let output = self.run_success(&args, INSPECT_TIMEOUT).await?;
        let entries: Vec<InspectEntry> =
            serde_json::from_slice(&output.stdout).map_err(|e| DockerError::CommandFailed {
                command: "docker inspect".to_string(),
                stderr: format!("unexpected output: {}", e),
                exit_code: None,
            })?;
        Ok(entries.into_iter().map(ContainerDescription::from).collect())
    }

    /// Copies `src` out of a container into `dest` on the host.
    pub async fn copy_from(
        &self,
        container: &str,
        src: &str,
        dest: &Path,
    ) -> Result<(), DockerError> {
        let from = format!("{}:{}", container, src);
        let to = dest.to_string_lossy();
        self.run_success(&["cp", &from, &to], COPY_TIMEOUT).await?;
        Ok(())
    }
}
