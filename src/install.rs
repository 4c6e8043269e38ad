//! Application configuration and stack image selection.

use crate::error::{Error, Result};
use crate::profile::{DEFAULT_PROFILE, PROFILE_ENV};
use semver::Version;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_STACK_VERSION: &str = "8.17.0";

const ELASTIC_AGENT_LEGACY_IMAGE: &str = "docker.elastic.co/beats/elastic-agent";
const ELASTIC_AGENT_COMPLETE_LEGACY_IMAGE: &str = "docker.elastic.co/beats/elastic-agent-complete";
const ELASTIC_AGENT_COMPLETE_IMAGE: &str = "docker.elastic.co/elastic-agent/elastic-agent-complete";
const ELASTIC_AGENT_WOLFI_IMAGE: &str = "docker.elastic.co/elastic-agent/elastic-agent-wolfi";
const ELASTICSEARCH_IMAGE: &str = "docker.elastic.co/elasticsearch/elasticsearch";
const KIBANA_IMAGE: &str = "docker.elastic.co/kibana/kibana";
const LOGSTASH_IMAGE: &str = "docker.elastic.co/logstash/logstash";
const IS_READY_IMAGE: &str = "tianon/true:multiarch";

// `-0` is the lowest pre-release, so these also admit snapshots and build candidates.
const AGENT_COMPLETE_FIRST_VERSION: &str = "7.15.0-0";
const AGENT_COMPLETE_OWN_NAMESPACE_VERSION: &str = "8.2.0-0";
const AGENT_WOLFI_VERSION: &str = "8.16.0-0";

const DISABLE_WOLFI_ENV: &str = "ELASTIC_PACKAGE_DISABLE_ELASTIC_AGENT_WOLFI";
const CONFIG_FILE: &str = "config.yml";

/// Docker image references of the stack containers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageRefs {
    #[serde(default, rename = "elastic-agent")]
    pub elastic_agent: String,
    #[serde(default)]
    pub elasticsearch: String,
    #[serde(default)]
    pub kibana: String,
    #[serde(default)]
    pub logstash: String,
    #[serde(default)]
    pub is_ready: String,
}

impl ImageRefs {
    /// Variables consumed by the compose file.
    pub fn as_env(&self) -> Vec<(String, String)> {
        vec![
            ("ELASTIC_AGENT_IMAGE_REF".to_string(), self.elastic_agent.clone()),
            ("ELASTICSEARCH_IMAGE_REF".to_string(), self.elasticsearch.clone()),
            ("KIBANA_IMAGE_REF".to_string(), self.kibana.clone()),
            ("LOGSTASH_IMAGE_REF".to_string(), self.logstash.clone()),
            ("ISREADY_IMAGE_REF".to_string(), self.is_ready.clone()),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    stack: StackSection,
    #[serde(default)]
    profile: ProfileSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StackSection {
    #[serde(default)]
    image_ref_overrides: HashMap<String, ImageRefs>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ProfileSection {
    #[serde(default)]
    current: String,
}

/// Contents of `<data home>/config.yml`.
#[derive(Debug, Clone, Default)]
pub struct ApplicationConfiguration {
    config: ConfigFile,
}

impl ApplicationConfiguration {
    /// Reads the configuration; a missing file yields the defaults.
    pub fn load(data_home: &Path) -> Result<Self> {
        let path = data_home.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse(&raw).map_err(|e| e.context(format!("reading {}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ConfigFile = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid application configuration: {}", e)))?;
        Ok(ApplicationConfiguration { config })
    }

    /// Profile from the environment, then the configuration, then `default`.
    pub fn current_profile(&self) -> String {
        match std::env::var(PROFILE_ENV) {
            Ok(name) if !name.is_empty() => name,
            _ if !self.config.profile.current.is_empty() => self.config.profile.current.clone(),
            _ => DEFAULT_PROFILE.to_string(),
        }
    }

    /// Image references for a stack version, honouring overrides.
    pub fn stack_image_refs(&self, stack_version: &str, agent_version: &str) -> ImageRefs {
        self.stack_image_refs_with(stack_version, agent_version, |key| {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        })
    }

    pub fn stack_image_refs_with<F>(&self, stack_version: &str, agent_version: &str, env: F) -> ImageRefs
    where
        F: Fn(&str) -> Option<String>,
    {
        let configured = self
            .config
            .stack
            .image_ref_overrides
            .get(stack_version)
            .cloned()
            .unwrap_or_default();
        let pick = |env_key: &str, configured: String, default: String| {
            env(env_key)
                .or(Some(configured).filter(|c| !c.is_empty()))
                .unwrap_or(default)
        };
        let wolfi_disabled = env(DISABLE_WOLFI_ENV)
            .map(|v| !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);

        ImageRefs {
            elastic_agent: pick(
                "ELASTIC_AGENT_IMAGE_REF_OVERRIDE",
                configured.elastic_agent,
                format!(
                    "{}:{}",
                    agent_image_name(agent_version, wolfi_disabled),
                    agent_version
                ),
            ),
            elasticsearch: pick(
                "ELASTICSEARCH_IMAGE_REF_OVERRIDE",
                configured.elasticsearch,
                format!("{}:{}", ELASTICSEARCH_IMAGE, stack_version),
            ),
            kibana: pick(
                "KIBANA_IMAGE_REF_OVERRIDE",
                configured.kibana,
                format!("{}:{}", KIBANA_IMAGE, stack_version),
            ),
            logstash: pick(
                "LOGSTASH_IMAGE_REF_OVERRIDE",
                configured.logstash,
                format!("{}:{}", LOGSTASH_IMAGE, stack_version),
            ),
            is_ready: pick(
                "ISREADY_IMAGE_REF_OVERRIDE",
                configured.is_ready,
                IS_READY_IMAGE.to_string(),
            ),
        }
    }
}

fn at_least(version: &Version, min: &str) -> bool {
    Version::parse(min).map(|min| *version >= min).unwrap_or(false)
}

/// Agent image repository suitable for the given agent version.
fn agent_image_name(agent_version: &str, wolfi_disabled: bool) -> &'static str {
    let version = match Version::parse(agent_version) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(version = agent_version, error = %e, "agent version is not semver");
            return ELASTIC_AGENT_WOLFI_IMAGE;
        }
    };
    if !wolfi_disabled && at_least(&version, AGENT_WOLFI_VERSION) {
        ELASTIC_AGENT_WOLFI_IMAGE
    } else if at_least(&version, AGENT_COMPLETE_OWN_NAMESPACE_VERSION) {
        ELASTIC_AGENT_COMPLETE_IMAGE
    } else if at_least(&version, AGENT_COMPLETE_FIRST_VERSION) {
        ELASTIC_AGENT_COMPLETE_LEGACY_IMAGE
    } else {
        ELASTIC_AGENT_LEGACY_IMAGE
    }
}
