//! Persisted per-profile stack record.
//!
//! Providers rewrite it after every externally visible step of a boot so a
//! later teardown can still find what was created.

use super::{Provider, CA_CERT_FILE, PROFILE_STACK_PATH};
use crate::error::{Error, Result};
use crate::profile::Profile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.json";

pub const ELASTICSEARCH_USERNAME: &str = "elastic";
pub const ELASTICSEARCH_PASSWORD: &str = "changeme";

const LOCAL_ELASTICSEARCH_HOST: &str = "https://127.0.0.1:9200";
const LOCAL_KIBANA_HOST: &str = "https://127.0.0.1:5601";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elasticsearch_api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elasticsearch_host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elasticsearch_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elasticsearch_password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kibana_host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_cert_file: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fleet_server_id: String,

    /// Short-lived, only used while booting.
    #[serde(skip)]
    pub enrollment_token: String,

    /// Only used while booting a managed Fleet Server.
    #[serde(skip)]
    pub fleet_service_token: String,
}

impl StackConfig {
    /// Record of a local compose stack.
    pub fn local(ca_cert_file: &Path) -> Self {
        StackConfig {
            provider: Some(Provider::Compose),
            elasticsearch_host: LOCAL_ELASTICSEARCH_HOST.to_string(),
            elasticsearch_username: ELASTICSEARCH_USERNAME.to_string(),
            elasticsearch_password: ELASTICSEARCH_PASSWORD.to_string(),
            kibana_host: LOCAL_KIBANA_HOST.to_string(),
            ca_cert_file: ca_cert_file.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    /// Provider the record was written by; compose when never written.
    pub fn provider(&self) -> Provider {
        self.provider.unwrap_or_default()
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<String>) {
        self.parameters.insert(key.to_string(), value.into());
    }

    pub fn ca_cert_path(&self) -> Option<PathBuf> {
        (!self.ca_cert_file.is_empty()).then(|| PathBuf::from(&self.ca_cert_file))
    }
}

/// Reads and writes `<profile>/stack/config.json`.
#[derive(Debug, Clone)]
pub struct StackConfigStore {
    path: PathBuf,
    default_ca_cert: PathBuf,
}

impl StackConfigStore {
    pub fn new(profile: &Profile) -> Self {
        StackConfigStore {
            path: profile.path(PROFILE_STACK_PATH).join(CONFIG_FILE),
            default_ca_cert: profile.path(CA_CERT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record; a missing file yields the local defaults.
    pub fn load(&self) -> Result<StackConfig> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut config = StackConfig::local(&self.default_ca_cert);
                // Use the profile CA only if it exists.
                if !self.default_ca_cert.is_file() {
                    config.ca_cert_file.clear();
                }
                config.provider = None;
                return Ok(config);
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "failed to read stack config {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_slice(&raw).map_err(|e| {
            Error::Config(format!(
                "failed to decode stack config {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Writes the record so readers never observe a partial file.
    pub fn store(&self, config: &StackConfig) -> Result<()> {
        let encoded = serde_json::to_vec_pretty(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&self.path, &encoded)
            .map_err(|e| Error::Config(format!("failed to write stack config: {}", e)))
    }

    /// Clears the record after a successful teardown.
    pub fn reset(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp_path, path)
}
