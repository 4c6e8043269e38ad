#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elastic_package::client::{ClientFactory, ClientSpec, ResourceClient, ResourceRequest, ResourceResponse};
use elastic_package::docker::{CommandOptions, ComposeDriver, ComposeFactory, ContainerDescription, DockerError};
use elastic_package::error::{Error, Result};
use elastic_package::install::ApplicationConfiguration;
use elastic_package::output::QuietOutput;
use elastic_package::profile::Profile;
use elastic_package::stack::{Backends, CertificateAuthority, Options, TlsService};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Records compose invocations; `up` fails while `up_failures` is positive.
#[derive(Default)]
pub struct FakeCompose {
    pub calls: Mutex<Vec<String>>,
    pub projects: Mutex<Vec<String>>,
    pub up_failures: Mutex<usize>,
    pub containers: Mutex<Vec<ContainerDescription>>,
}

impl FakeCompose {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of invocations of `command`.
    pub fn count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.split(' ').next() == Some(command))
            .count()
    }

    pub fn set_containers(&self, containers: Vec<ContainerDescription>) {
        *self.containers.lock() = containers;
    }

    fn record(&self, command: &str, opts: &CommandOptions) {
        let mut parts = vec![command.to_string()];
        parts.extend(opts.extra_args.iter().cloned());
        parts.extend(opts.services.iter().cloned());
        self.calls.lock().push(parts.join(" "));
    }
}

pub struct FakeProject {
    name: String,
    compose: Arc<FakeCompose>,
}

#[async_trait]
impl ComposeDriver for FakeProject {
    fn project(&self) -> &str {
        &self.name
    }

    async fn build(&self, _ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.compose.record("build", opts);
        Ok(())
    }

    async fn pull(&self, _ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.compose.record("pull", opts);
        Ok(())
    }

    async fn up(&self, _ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.compose.record("up", opts);
        let mut failures = self.compose.up_failures.lock();
        if *failures > 0 {
            *failures -= 1;
            return Err(DockerError::CommandFailed {
                command: "docker compose up".to_string(),
                stderr: "container elastic-package-stack-elastic-agent-1 exited (1)".to_string(),
                exit_code: Some(1),
            }
            .into());
        }
        Ok(())
    }

    async fn down(&self, _ctx: &CancellationToken, opts: &CommandOptions) -> Result<()> {
        self.compose.record("down", opts);
        Ok(())
    }

    async fn logs(
        &self,
        _ctx: &CancellationToken,
        opts: &CommandOptions,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<u8>> {
        self.compose.record("logs", opts);
        Ok(format!("logs of {}\n", opts.services.join(",")).into_bytes())
    }

    async fn status(&self, _ctx: &CancellationToken) -> Result<Vec<ContainerDescription>> {
        Ok(self.compose.containers.lock().clone())
    }

    async fn copy_from_service(&self, _ctx: &CancellationToken, service: &str, _src: &str, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("agent.ndjson"), service)?;
        Ok(())
    }
}

pub struct FakeComposeFactory(pub Arc<FakeCompose>);

impl ComposeFactory for FakeComposeFactory {
    fn project(&self, name: &str, _files: Vec<PathBuf>) -> Arc<dyn ComposeDriver> {
        self.0.projects.lock().push(name.to_string());
        Arc::new(FakeProject {
            name: name.to_string(),
            compose: self.0.clone(),
        })
    }
}

type Route = dyn Fn(&str, &ResourceRequest) -> ResourceResponse + Send + Sync;

/// Answers every request through `route(address, request)` and records
/// `METHOD address+path`.
pub struct ScriptedHttp {
    route: Box<Route>,
    pub requests: Mutex<Vec<String>>,
}

impl ScriptedHttp {
    pub fn new(route: impl Fn(&str, &ResourceRequest) -> ResourceResponse + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(ScriptedHttp {
            route: Box::new(route),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Fails any test that reaches the network.
    pub fn unreachable() -> Arc<Self> {
        Self::new(|address, request| panic!("unexpected request to {}{}", address, request.path))
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

struct ScriptedClient {
    address: String,
    http: Arc<ScriptedHttp>,
}

#[async_trait]
impl ResourceClient for ScriptedClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, _ctx: &CancellationToken, request: ResourceRequest) -> Result<ResourceResponse> {
        self.http
            .requests
            .lock()
            .push(format!("{} {}{}", request.method, self.address, request.path));
        Ok((self.http.route)(&self.address, &request))
    }
}

pub struct ScriptedHttpFactory(pub Arc<ScriptedHttp>);

impl ClientFactory for ScriptedHttpFactory {
    fn client(&self, spec: ClientSpec) -> Result<Arc<dyn ResourceClient>> {
        Ok(Arc::new(ScriptedClient {
            address: spec.address,
            http: self.0.clone(),
        }))
    }
}

/// Writes placeholder files and accepts any existing certificate.
#[derive(Default)]
pub struct FakeAuthority;

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn create_ca(&self, cert: &Path, key: &Path) -> Result<()> {
        std::fs::write(cert, "CA")?;
        std::fs::write(key, "CA KEY")?;
        Ok(())
    }

    async fn verify(&self, _ca_cert: &Path, cert: &Path, _host: Option<&str>) -> Result<()> {
        if cert.is_file() {
            Ok(())
        } else {
            Err(Error::Certificate(format!("{} missing", cert.display())))
        }
    }

    async fn issue(
        &self,
        _ca_cert: &Path,
        _ca_key: &Path,
        service: &TlsService,
        cert: &Path,
        key: &Path,
    ) -> Result<()> {
        std::fs::write(cert, service.name)?;
        std::fs::write(key, "KEY")?;
        Ok(())
    }

    async fn fingerprint(&self, _cert: &Path) -> Result<String> {
        Ok("0123456789ABCDEF".to_string())
    }
}

pub fn backends(compose: &Arc<FakeCompose>, http: &Arc<ScriptedHttp>, env: &[(&str, &str)]) -> Backends {
    let env: HashMap<String, String> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Backends {
        compose: Arc::new(FakeComposeFactory(compose.clone())),
        http: Arc::new(ScriptedHttpFactory(http.clone())),
        certificates: Arc::new(FakeAuthority),
        env: Arc::new(move |key| env.get(key).cloned()),
    }
}

pub fn profile(root: &Path, config_yaml: &str) -> Profile {
    Profile::with_config("default", root.to_path_buf(), config_yaml).expect("valid profile config")
}

pub fn options(profile: Profile) -> Options {
    Options {
        profile,
        stack_version: "8.17.0".to_string(),
        services: Vec::new(),
        daemon_mode: true,
        parameters: BTreeMap::new(),
        app_config: ApplicationConfiguration::default(),
        output: Arc::new(QuietOutput),
    }
}

pub fn container(service: &str, state: &str, health: Option<&str>) -> ContainerDescription {
    ContainerDescription {
        id: format!("{}-id", service),
        name: format!("elastic-package-stack-{}-1", service),
        service: service.to_string(),
        image: format!("docker.elastic.co/{}:8.17.0", service),
        state: state.to_string(),
        health: health.map(str::to_string),
        exit_code: if state == "exited" { 1 } else { 0 },
    }
}

pub fn json(status: u16, body: serde_json::Value) -> ResourceResponse {
    ResourceResponse::new(status, body.to_string())
}
