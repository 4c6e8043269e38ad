//! Files generated into `<profile>/stack`.
//!
//! Templates are embedded in the binary and rendered from a map of facts.
//! Two constructs are understood:
//!
//! - `{{ fact "name" }}` is replaced with the fact's value
//! - `{{ if fact "name" }} ... {{ end }}` keeps its body only when the fact
//!   is set to something other than empty or `false`; blocks do not nest
//!
//! Referencing a fact that was not provided is an error. Files whose rendered
//! content did not change are left untouched so compose does not rebuild
//! images needlessly.

use super::certs::{self, TlsService};
use super::config::{StackConfig, ELASTICSEARCH_PASSWORD, ELASTICSEARCH_USERNAME};
use super::network::{docker_internal_host, es_host_with_port};
use super::{
    Options, CONFIG_LOGSTASH_ENABLED, CONFIG_SELF_MONITOR_ENABLED, PARAM_FLEET_SERVER_MANAGED,
    PARAM_FLEET_URL, PROFILE_STACK_PATH,
};
use crate::error::{Error, Result};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub type Facts = BTreeMap<String, String>;

/// Directory holding the GeoIP databases. Relative paths start at the
/// profile stack directory, where compose resolves them too.
pub fn geoip_dir(options: &Options) -> PathBuf {
    let dir = PathBuf::from(options.setting(CONFIG_GEOIP_DIR, DEFAULT_GEOIP_DIR));
    if dir.is_absolute() {
        dir
    } else {
        options.profile.path(PROFILE_STACK_PATH).join(dir)
    }
}

pub const ELASTICSEARCH_CONFIG_FILE: &str = "elasticsearch.yml";
pub const KIBANA_CONFIG_FILE: &str = "kibana.yml";
pub const LOGSTASH_CONFIG_FILE: &str = "logstash.conf";
pub const ELASTIC_AGENT_ENV_FILE: &str = "elastic-agent.env";
pub const SERVERLESS_COMPOSE_FILE: &str = "serverless-elastic-agent.yml";
pub const CLOUD_COMPOSE_FILE: &str = "cloud-elastic-agent.yml";

pub const PACKAGE_REGISTRY_BASE_IMAGE: &str = "docker.elastic.co/package-registry/distribution:snapshot";
/// Policy id of the Fleet Server provisioned next to an adopted stack.
pub const MANAGED_FLEET_SERVER_POLICY_ID: &str = "fleet-server-managed-ep";

const CONFIG_APM_ENABLED: &str = "stack.apm_enabled";
const CONFIG_GEOIP_DIR: &str = "stack.geoip_dir";
const DEFAULT_GEOIP_DIR: &str = "./ingest-geoip";
const CONFIG_KIBANA_HTTP2_ENABLED: &str = "stack.kibana_http2_enabled";
const CONFIG_LOGSDB_ENABLED: &str = "stack.logsdb_enabled";
const CONFIG_ELASTIC_SUBSCRIPTION: &str = "stack.elastic_subscription";
const CONFIG_AGENT_PORTS: &str = "stack.agent.ports";

const SUPPORTED_SUBSCRIPTIONS: &[&str] = &["basic", "trial"];

static FACT_REGEX: OnceLock<Regex> = OnceLock::new();
static CONDITIONAL_REGEX: OnceLock<Regex> = OnceLock::new();

fn fact_regex() -> &'static Regex {
    FACT_REGEX.get_or_init(|| {
        Regex::new(r#"\{\{\s*fact\s+"([^"]+)"\s*\}\}"#).expect("static regex pattern is valid")
    })
}

fn conditional_regex() -> &'static Regex {
    CONDITIONAL_REGEX.get_or_init(|| {
        Regex::new(r#"(?s)\{\{\s*if\s+fact\s+"([^"]+)"\s*\}\}(.*?)\{\{\s*end\s*\}\}"#)
            .expect("static regex pattern is valid")
    })
}

/// Where a file's content comes from.
#[derive(Debug, Clone, Copy)]
enum Source {
    Static(&'static str),
    Template(&'static str),
}

/// One generated file, relative to the stack directory.
#[derive(Debug, Clone, Copy)]
pub struct Resource {
    pub path: &'static str,
    source: Source,
}

impl Resource {
    const fn file(path: &'static str, content: &'static str) -> Self {
        Resource {
            path,
            source: Source::Static(content),
        }
    }

    const fn template(path: &'static str, content: &'static str) -> Self {
        Resource {
            path,
            source: Source::Template(content),
        }
    }

    fn content(&self, facts: &Facts) -> Result<String> {
        match self.source {
            Source::Static(content) => Ok(content.to_string()),
            Source::Template(template) => {
                render(template, facts).map_err(|e| e.context(format!("rendering {}", self.path)))
            }
        }
    }
}

const FLEET_SERVER_HEALTHCHECK: Resource = Resource::file(
    "fleet-server-healthcheck.sh",
    include_str!("_static/fleet-server-healthcheck.sh"),
);
const ELASTIC_AGENT_ENV: Resource = Resource::template(
    ELASTIC_AGENT_ENV_FILE,
    include_str!("_static/elastic-agent.env.tmpl"),
);

const STACK_RESOURCES: &[Resource] = &[
    Resource::template(
        "Dockerfile.package-registry",
        include_str!("_static/Dockerfile.package-registry.tmpl"),
    ),
    Resource::template(
        super::COMPOSE_FILE,
        include_str!("_static/docker-compose-stack.yml.tmpl"),
    ),
    Resource::template(
        ELASTICSEARCH_CONFIG_FILE,
        include_str!("_static/elasticsearch.yml.tmpl"),
    ),
    Resource::file("service_tokens", include_str!("_static/service_tokens")),
    Resource::template(KIBANA_CONFIG_FILE, include_str!("_static/kibana.yml.tmpl")),
    Resource::template(
        "kibana-healthcheck.sh",
        include_str!("_static/kibana-healthcheck.sh.tmpl"),
    ),
    FLEET_SERVER_HEALTHCHECK,
    Resource::file(
        "package-registry.yml",
        include_str!("_static/package-registry.yml"),
    ),
    ELASTIC_AGENT_ENV,
];

const LOGSTASH_RESOURCES: &[Resource] = &[
    Resource::template(LOGSTASH_CONFIG_FILE, include_str!("_static/logstash.conf.tmpl")),
    Resource::file("Dockerfile.logstash", include_str!("_static/Dockerfile.logstash")),
];

const LOCAL_SERVICES_RESOURCES: &[Resource] = &[
    FLEET_SERVER_HEALTHCHECK,
    Resource::template(
        super::COMPOSE_FILE,
        include_str!("_static/local-services-docker-compose.yml.tmpl"),
    ),
    ELASTIC_AGENT_ENV,
];

const REMOTE_AGENT_TEMPLATE: &str = include_str!("_static/remote-agent-docker-compose.yml.tmpl");
const REMOTE_LOGSTASH: Resource = Resource::template(
    LOGSTASH_CONFIG_FILE,
    include_str!("_static/remote-logstash.conf.tmpl"),
);
const DOCKERFILE_LOGSTASH: Resource =
    Resource::file("Dockerfile.logstash", include_str!("_static/Dockerfile.logstash"));

/// Whether a fact enables a conditional block.
fn truthy(value: &str) -> bool {
    !value.is_empty() && value != "false"
}

fn lookup<'a>(facts: &'a Facts, name: &str) -> Result<&'a str> {
    facts
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::Template(format!("unknown fact \"{}\"", name)))
}

/// Renders a template with the given facts.
pub fn render(template: &str, facts: &Facts) -> Result<String> {
    let mut failure = None;
    let expanded = conditional_regex().replace_all(template, |caps: &Captures| {
        match lookup(facts, &caps[1]) {
            Ok(value) if truthy(value) => caps[2].to_string(),
            Ok(_) => String::new(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    if let Some(e) = failure.take() {
        return Err(e);
    }

    let rendered = fact_regex().replace_all(&expanded, |caps: &Captures| {
        match lookup(facts, &caps[1]) {
            Ok(value) => value.to_string(),
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

/// Writes resources under a directory.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    dir: PathBuf,
    facts: Facts,
}

impl ResourceManager {
    pub fn new(dir: impl Into<PathBuf>, facts: Facts) -> Self {
        ResourceManager {
            dir: dir.into(),
            facts,
        }
    }

    /// Renders every resource, then writes those that changed. Returns the
    /// paths written.
    pub fn apply(&self, resources: &[Resource]) -> Result<Vec<PathBuf>> {
        let mut rendered = Vec::with_capacity(resources.len());
        let mut errors = Vec::new();
        for resource in resources {
            match resource.content(&self.facts) {
                Ok(content) => rendered.push((self.dir.join(resource.path), content)),
                Err(e) => errors.push(e),
            }
        }
        if let Some(e) = Error::from_many(errors) {
            return Err(e);
        }

        std::fs::create_dir_all(&self.dir)?;
        let mut written = Vec::new();
        for (path, content) in rendered {
            if write_if_changed(&path, &content)? {
                tracing::debug!(path = %path.display(), "resource updated");
                written.push(path);
            }
        }
        Ok(written)
    }
}

fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if let Ok(current) = std::fs::read(path) {
        if current == content.as_bytes() {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(true)
}

fn facts<const N: usize>(pairs: [(&str, String); N]) -> Facts {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn stack_dir(options: &Options) -> PathBuf {
    options.profile.path(PROFILE_STACK_PATH)
}

/// Agent ports as YAML list entries of the agent service.
fn publish_ports(ports: &[String]) -> String {
    ports
        .iter()
        .map(|port| format!("      - \"{}\"", port))
        .collect::<Vec<_>>()
        .join("\n")
}

fn subscription(options: &Options) -> Result<String> {
    let subscription = options.setting(CONFIG_ELASTIC_SUBSCRIPTION, "trial");
    if !SUPPORTED_SUBSCRIPTIONS.contains(&subscription.as_str()) {
        return Err(Error::Config(format!(
            "unsupported Elastic subscription \"{}\": supported subscriptions: {}",
            subscription,
            SUPPORTED_SUBSCRIPTIONS.join(", ")
        )));
    }
    Ok(subscription)
}

/// Facts of the local compose stack.
pub fn stack_facts(options: &Options) -> Result<Facts> {
    let version = options.stack_version.clone();
    Ok(facts([
        ("registry_base_image", PACKAGE_REGISTRY_BASE_IMAGE.to_string()),
        ("elasticsearch_version", version.clone()),
        ("kibana_version", version.clone()),
        ("agent_version", version),
        ("kibana_host", "https://kibana:5601".to_string()),
        ("fleet_url", "https://fleet-server:8220".to_string()),
        ("elasticsearch_host", "https://elasticsearch:9200".to_string()),
        ("api_key", String::new()),
        ("username", ELASTICSEARCH_USERNAME.to_string()),
        ("password", ELASTICSEARCH_PASSWORD.to_string()),
        ("enrollment_token", String::new()),
        (
            "agent_publish_ports",
            publish_ports(&options.profile.config_list(CONFIG_AGENT_PORTS)),
        ),
        ("apm_enabled", options.setting(CONFIG_APM_ENABLED, "false")),
        ("geoip_dir", options.setting(CONFIG_GEOIP_DIR, DEFAULT_GEOIP_DIR)),
        (
            "kibana_http2_enabled",
            options.setting(CONFIG_KIBANA_HTTP2_ENABLED, "true"),
        ),
        ("logsdb_enabled", options.setting(CONFIG_LOGSDB_ENABLED, "false")),
        ("logstash_enabled", options.setting(CONFIG_LOGSTASH_ENABLED, "false")),
        (
            "self_monitor_enabled",
            options.setting(CONFIG_SELF_MONITOR_ENABLED, "false"),
        ),
        ("elastic_subscription", subscription(options)?),
    ]))
}

/// Facts of the services started next to an adopted stack.
pub fn local_services_facts(options: &Options, config: &StackConfig) -> Result<Facts> {
    let images = options
        .app_config
        .stack_image_refs(&options.stack_version, &options.stack_version);
    Ok(facts([
        ("agent_version", options.stack_version.clone()),
        ("agent_image", images.elastic_agent),
        ("logstash_image", images.logstash),
        ("isready_image", images.is_ready),
        (
            "elasticsearch_host",
            docker_internal_host(&es_host_with_port(&config.elasticsearch_host)),
        ),
        ("api_key", config.elasticsearch_api_key.clone()),
        ("username", config.elasticsearch_username.clone()),
        ("password", config.elasticsearch_password.clone()),
        ("kibana_host", docker_internal_host(&config.kibana_host)),
        (
            "fleet_url",
            config.param(PARAM_FLEET_URL).unwrap_or_default().to_string(),
        ),
        ("enrollment_token", config.enrollment_token.clone()),
        ("logstash_enabled", options.setting(CONFIG_LOGSTASH_ENABLED, "false")),
        (
            "fleet_server_managed",
            config
                .param(PARAM_FLEET_SERVER_MANAGED)
                .unwrap_or_default()
                .to_string(),
        ),
        ("fleet_server_policy", MANAGED_FLEET_SERVER_POLICY_ID.to_string()),
        ("fleet_service_token", config.fleet_service_token.clone()),
    ]))
}

/// Facts of the agent started next to a cloud deployment or serverless
/// project.
pub fn remote_agent_facts(options: &Options, config: &StackConfig) -> Result<Facts> {
    let images = options
        .app_config
        .stack_image_refs(&options.stack_version, &options.stack_version);
    Ok(facts([
        ("agent_version", options.stack_version.clone()),
        ("agent_image", images.elastic_agent),
        ("logstash_image", images.logstash),
        ("elasticsearch_host", es_host_with_port(&config.elasticsearch_host)),
        ("api_key", String::new()),
        ("username", config.elasticsearch_username.clone()),
        ("password", config.elasticsearch_password.clone()),
        ("kibana_host", config.kibana_host.clone()),
        (
            "fleet_url",
            config.param(PARAM_FLEET_URL).unwrap_or_default().to_string(),
        ),
        ("enrollment_token", config.enrollment_token.clone()),
        ("logstash_enabled", options.setting(CONFIG_LOGSTASH_ENABLED, "false")),
    ]))
}

fn logstash_enabled(options: &Options) -> Result<bool> {
    options.setting_bool(CONFIG_LOGSTASH_ENABLED, false)
}

/// Writes the compose stack files and its certificates.
pub async fn apply_stack_resources(
    options: &Options,
    authority: &dyn certs::CertificateAuthority,
) -> Result<()> {
    let mut resources = STACK_RESOURCES.to_vec();
    let mut tls: Vec<TlsService> = certs::COMPOSE_TLS_SERVICES.to_vec();
    if logstash_enabled(options)? {
        resources.extend_from_slice(LOGSTASH_RESOURCES);
        tls.push(certs::AGENT_CLIENT_TLS_SERVICE);
    }

    certs::ensure_certificates(authority, options.profile.root(), &tls)
        .await
        .map_err(|e| e.context("failed to create TLS files"))?;
    ResourceManager::new(stack_dir(options), stack_facts(options)?).apply(&resources)?;
    Ok(())
}

/// Writes the files of the services started next to an adopted stack.
pub async fn apply_local_resources(
    options: &Options,
    config: &StackConfig,
    authority: &dyn certs::CertificateAuthority,
) -> Result<()> {
    let mut resources = LOCAL_SERVICES_RESOURCES.to_vec();
    if logstash_enabled(options)? {
        resources.extend_from_slice(LOGSTASH_RESOURCES);
    }
    certs::ensure_certificates(authority, options.profile.root(), certs::LOCAL_TLS_SERVICES)
        .await
        .map_err(|e| e.context("failed to create TLS files"))?;
    ResourceManager::new(stack_dir(options), local_services_facts(options, config)?)
        .apply(&resources)
        .map_err(|e| e.context("could not initialize compose files for local services"))?;
    Ok(())
}

/// Writes the agent compose file used with a remote stack.
pub async fn apply_remote_agent_resources(
    options: &Options,
    config: &StackConfig,
    compose_file: &'static str,
    authority: &dyn certs::CertificateAuthority,
) -> Result<()> {
    let mut resources = vec![
        Resource::template(compose_file, REMOTE_AGENT_TEMPLATE),
        ELASTIC_AGENT_ENV,
        REMOTE_LOGSTASH,
    ];
    if logstash_enabled(options)? {
        resources.push(DOCKERFILE_LOGSTASH);
    }
    certs::ensure_certificates(
        authority,
        options.profile.root(),
        certs::REMOTE_AGENT_TLS_SERVICES,
    )
    .await
    .map_err(|e| e.context("failed to create TLS files"))?;
    ResourceManager::new(stack_dir(options), remote_agent_facts(options, config)?)
        .apply(&resources)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts_of(pairs: &[(&str, &str)]) -> Facts {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_facts() {
        let f = facts_of(&[("username", "elastic"), ("password", "changeme")]);
        assert_eq!(
            render(r#"-u {{ fact "username" }}:{{fact "password"}}"#, &f).unwrap(),
            "-u elastic:changeme"
        );
    }

    #[test]
    fn conditional_blocks() {
        let template = "a\n{{ if fact \"logstash_enabled\" }}logstash: {{ fact \"host\" }}\n{{ end }}b\n";
        let on = facts_of(&[("logstash_enabled", "true"), ("host", "ls:5044")]);
        let off = facts_of(&[("logstash_enabled", "false"), ("host", "ls:5044")]);
        let empty = facts_of(&[("logstash_enabled", ""), ("host", "ls:5044")]);
        assert_eq!(render(template, &on).unwrap(), "a\nlogstash: ls:5044\nb\n");
        assert_eq!(render(template, &off).unwrap(), "a\nb\n");
        assert_eq!(render(template, &empty).unwrap(), "a\nb\n");
    }

    #[test]
    fn unknown_fact_is_an_error() {
        let err = render(r#"{{ fact "nope" }}"#, &Facts::new()).unwrap_err();
        assert!(matches!(err, Error::Template(ref msg) if msg.contains("nope")));
        assert!(render(r#"{{ if fact "nope" }}x{{ end }}"#, &Facts::new()).is_err());
    }

    #[test]
    fn unchanged_files_are_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(
            dir.path(),
            facts_of(&[
                ("fleet_url", "https://fleet-server:8220"),
                ("kibana_host", "https://kibana:5601"),
                ("elasticsearch_host", "https://elasticsearch:9200"),
                ("username", "elastic"),
                ("password", "changeme"),
                ("api_key", ""),
                ("enrollment_token", ""),
            ]),
        );
        let first = manager.apply(&[ELASTIC_AGENT_ENV, FLEET_SERVER_HEALTHCHECK]).unwrap();
        assert_eq!(first.len(), 2);
        let env = std::fs::read_to_string(dir.path().join(ELASTIC_AGENT_ENV_FILE)).unwrap();
        assert!(env.contains("FLEET_URL=https://fleet-server:8220\n"));

        let second = manager.apply(&[ELASTIC_AGENT_ENV, FLEET_SERVER_HEALTHCHECK]).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn failed_render_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResourceManager::new(dir.path().join("stack"), Facts::new());
        assert!(manager.apply(&[FLEET_SERVER_HEALTHCHECK, ELASTIC_AGENT_ENV]).is_err());
        assert!(!dir.path().join("stack").exists());
    }

    #[test]
    fn embedded_templates_only_use_known_facts() {
        let stack = facts_of(&[
            ("registry_base_image", PACKAGE_REGISTRY_BASE_IMAGE),
            ("elasticsearch_version", "8.17.0"),
            ("kibana_version", "8.17.0"),
            ("agent_version", "8.17.0"),
            ("kibana_host", "https://kibana:5601"),
            ("fleet_url", "https://fleet-server:8220"),
            ("elasticsearch_host", "https://elasticsearch:9200"),
            ("api_key", ""),
            ("username", "elastic"),
            ("password", "changeme"),
            ("enrollment_token", ""),
            ("agent_publish_ports", "      - \"127.0.0.1:1514:1514/udp\""),
            ("apm_enabled", "false"),
            ("geoip_dir", "./ingest-geoip"),
            ("kibana_http2_enabled", "true"),
            ("logsdb_enabled", "false"),
            ("logstash_enabled", "true"),
            ("self_monitor_enabled", "false"),
            ("elastic_subscription", "trial"),
        ]);
        for resource in STACK_RESOURCES.iter().chain(LOGSTASH_RESOURCES) {
            resource.content(&stack).unwrap();
        }
        let compose = STACK_RESOURCES[1].content(&stack).unwrap();
        assert!(compose.contains("  logstash:\n"));
        assert!(compose.contains("    ports:\n      - \"127.0.0.1:1514:1514/udp\""));
        let parsed: serde_yaml::Value = serde_yaml::from_str(&compose).unwrap();
        assert!(parsed["services"]["elastic-agent_is_ready"].is_mapping());
    }

    #[test]
    fn local_services_template_without_managed_fleet_server() {
        let local = facts_of(&[
            ("agent_image", "docker.elastic.co/elastic-agent/elastic-agent-wolfi:8.17.0"),
            ("logstash_image", "docker.elastic.co/logstash/logstash:8.17.0"),
            ("isready_image", "tianon/true:multiarch"),
            ("elasticsearch_host", "https://host.docker.internal:9200"),
            ("api_key", ""),
            ("username", "elastic"),
            ("password", "changeme"),
            ("fleet_url", "https://fleet.example:443"),
            ("logstash_enabled", "false"),
            ("fleet_server_managed", ""),
            ("fleet_server_policy", MANAGED_FLEET_SERVER_POLICY_ID),
            ("fleet_service_token", ""),
        ]);
        let compose = LOCAL_SERVICES_RESOURCES[1].content(&local).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&compose).unwrap();
        assert!(parsed["services"]["fleet-server"].is_null());
        assert!(parsed["services"]["elastic-agent"].is_mapping());
    }
}
