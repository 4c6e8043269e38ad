//! Compose project driver.

use super::{ContainerDescription, DockerClient, DockerError};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Docker Compose command flavour (v1 or v2)
#[derive(Debug, Clone, Copy)]
enum ComposeCommand {
    V2, // docker compose
    V1, // docker-compose
}

static COMPOSE_COMMAND: OnceCell<ComposeCommand> = OnceCell::const_new();

impl ComposeCommand {
    async fn detect() -> Result<ComposeCommand> {
        let v2 = tokio::process::Command::new("docker")
            .args(["compose", "version"])
            .output()
            .await;
        if matches!(v2, Ok(ref o) if o.status.success()) {
            return Ok(ComposeCommand::V2);
        }

        let v1 = tokio::process::Command::new("docker-compose")
            .args(["--version"])
            .output()
            .await;
        if matches!(v1, Ok(ref o) if o.status.success()) {
            return Ok(ComposeCommand::V1);
        }

        Err(DockerError::ComposeUnavailable.into())
    }

    async fn get() -> Result<ComposeCommand> {
        COMPOSE_COMMAND
            .get_or_try_init(|| async { Self::detect().await })
            .await
            .copied()
    }

    fn command_and_args(&self) -> (&'static str, Vec<&'static str>) {
        match self {
            ComposeCommand::V2 => ("docker", vec!["compose"]),
            ComposeCommand::V1 => ("docker-compose", vec![]),
        }
    }
}

/// Arguments shared by every compose subcommand.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Variables exported to the compose process.
    pub env: Vec<(String, String)>,
    /// Flags placed after the subcommand, before the services.
    pub extra_args: Vec<String>,
    /// Target services; empty means all of them.
    pub services: Vec<String>,
}

/// Operations the stack performs on its compose project.
#[async_trait]
pub trait ComposeDriver: Send + Sync {
    /// Compose project name.
    fn project(&self) -> &str;

    async fn build(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()>;

    async fn pull(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()>;

    async fn up(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()>;

    async fn down(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()>;

    /// Logs of the services in `opts`, optionally starting at `since`.
    async fn logs(
        &self,
        ctx: &CancellationToken,
        opts: &CommandOptions,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>>;

    /// Every container of the project, running or not.
    async fn status(&self, ctx: &CancellationToken) -> Result<Vec<ContainerDescription>>;

    /// Copies a path out of the container backing `service`.
    async fn copy_from_service(
        &self,
        ctx: &CancellationToken,
        service: &str,
        src: &str,
        dest: &Path,
    ) -> Result<()>;
}

/// Opens compose projects; lets callers swap Docker for a fake.
pub trait ComposeFactory: Send + Sync {
    fn project(&self, name: &str, files: Vec<PathBuf>) -> Arc<dyn ComposeDriver>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DockerComposeFactory;

impl ComposeFactory for DockerComposeFactory {
    fn project(&self, name: &str, files: Vec<PathBuf>) -> Arc<dyn ComposeDriver> {
        Arc::new(DockerCompose::new(name, files))
    }
}

/// [`ComposeDriver`] backed by the Docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    project: String,
    files: Vec<PathBuf>,
    docker: DockerClient,
}

impl DockerCompose {
    pub fn new(project: impl Into<String>, files: Vec<PathBuf>) -> Self {
        DockerCompose {
            project: project.into(),
            files,
            docker: DockerClient::new(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for file in &self.files {
            args.push("-f".to_string());
            args.push(file.to_string_lossy().into_owned());
        }
        args.push("-p".to_string());
        args.push(self.project.clone());
        args
    }

    fn subcommand_args(&self, subcommand: &str, opts: &CommandOptions) -> Vec<String> {
        let mut args = self.base_args();
        args.push(subcommand.to_string());
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());
        args
    }

    async fn command(&self, args: &[String], env: &[(String, String)]) -> Result<(tokio::process::Command, String)> {
        let (program, prefix) = ComposeCommand::get().await?.command_and_args();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&prefix)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        let display = format!("{} {} {}", program, prefix.join(" "), args.join(" "))
            .replace("  ", " ");
        Ok((cmd, display))
    }

    /// Runs a compose subcommand with its output forwarded to ours.
    async fn run_forwarded(
        &self,
        ctx: &CancellationToken,
        args: Vec<String>,
        env: &[(String, String)],
    ) -> Result<()> {
        let (mut cmd, command_line) = self.command(&args, env).await?;
        tracing::debug!(command = %command_line, "running compose");
        cmd.stdin(Stdio::null());

        let status = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            status = cmd.status() => status.map_err(|e| DockerError::exec_failed(command_line.clone(), e))?,
        };
        if !status.success() {
            return Err(DockerError::exited(command_line, status).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ComposeDriver for DockerCompose {
    fn project(&self) -> &str {
        &self.project
    }

    async fn build(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.run_forwarded(ctx, self.subcommand_args("build", opts), &opts.env)
            .await
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.run_forwarded(ctx, self.subcommand_args("pull", opts), &opts.env)
            .await
    }

    async fn up(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.run_forwarded(ctx, self.subcommand_args("up", opts), &opts.env)
            .await
    }

    async fn down(&self, ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.run_forwarded(ctx, self.subcommand_args("down", opts), &opts.env)
            .await
    }

    async fn logs(
        &self,
        ctx: &CancellationToken,
        opts: &CommandOptions,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        let mut args = self.base_args();
        args.push("logs".to_string());
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        args.extend(opts.extra_args.iter().cloned());
        args.extend(opts.services.iter().cloned());

        let (mut cmd, display) = self.command(&args, &opts.env).await?;
        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            output = cmd.output() => output.map_err(|e| DockerError::exec_failed(display.clone(), e))?,
        };
        if !output.status.success() {
            return Err(DockerError::failed(display, &output).into());
        }
        Ok(output.stdout)
    }

    async fn status(&self, ctx: &CancellationToken) -> Result<Vec<ContainerDescription>> {
        let lookup = async {
            let ids = self.docker.project_container_ids(&self.project).await?;
            self.docker.inspect(&ids).await
        };
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Cancelled),
            containers = lookup => Ok(containers?),
        }
    }

    async fn copy_from_service(
        &self,
        ctx: &CancellationToken,
        service: &str,
        src: &str,
        dest: &Path,
    ) -> Result<()> {
        let containers = self.status(ctx).await?;
        let container = containers
            .iter()
            .find(|c| c.service == service)
            .ok_or_else(|| DockerError::ContainerNotFound {
                service: service.to_string(),
            })?;
        self.docker.copy_from(&container.id, src, dest).await?;
        Ok(())
    }
}
