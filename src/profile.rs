//! Profiles: named working directories, one per stack instance.
//!
//! A profile lives under `<data home>/profiles/<name>` and may carry a
//! `config.yml` with settings such as `stack.logstash_enabled: true`. Keys can
//! be written flat (`stack.cloud.region: ...`) or nested.

use crate::error::{Error, Result};
use serde_yaml::Value;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROFILE: &str = "default";
pub const DATA_HOME_ENV: &str = "ELASTIC_PACKAGE_DATA_HOME";
pub const PROFILE_ENV: &str = "ELASTIC_PACKAGE_PROFILE";

const PROFILES_DIR: &str = "profiles";
const CONFIG_FILE: &str = "config.yml";

/// Directory holding profiles and application configuration.
pub fn data_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(DATA_HOME_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".elastic-package"))
        .ok_or_else(|| Error::Config("could not determine the home directory".to_string()))
}

#[derive(Debug, Clone)]
pub struct Profile {
    name: String,
    path: PathBuf,
    config: Value,
}

impl Profile {
    /// Opens (creating if needed) the named profile under `data_home`.
    pub fn load(data_home: &Path, name: &str) -> Result<Profile> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Config(format!("invalid profile name '{}'", name)));
        }
        let path = data_home.join(PROFILES_DIR).join(name);
        std::fs::create_dir_all(&path)?;

        let config_path = path.join(CONFIG_FILE);
        let config = match std::fs::read_to_string(&config_path) {
            Ok(raw) if raw.trim().is_empty() => Value::Null,
            Ok(raw) => serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!(
                    "failed to parse profile config {}: {}",
                    config_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(e) => return Err(e.into()),
        };

        Ok(Profile {
            name: name.to_string(),
            path,
            config,
        })
    }

    /// Profile backed by in-memory settings.
    pub fn with_config(name: &str, path: PathBuf, config_yaml: &str) -> Result<Profile> {
        let config = if config_yaml.trim().is_empty() {
            Value::Null
        } else {
            serde_yaml::from_str(config_yaml)?
        };
        Ok(Profile {
            name: name.to_string(),
            path,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path inside the profile directory.
    pub fn path<P: AsRef<Path>>(&self, rel: P) -> PathBuf {
        self.path.join(rel)
    }

    pub fn root(&self) -> &Path {
        &self.path
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let map = self.config.as_mapping()?;
        if let Some(v) = map.get(Value::String(key.to_string())) {
            return Some(v);
        }
        let mut current = &self.config;
        for part in key.split('.') {
            current = current.as_mapping()?.get(Value::String(part.to_string()))?;
        }
        Some(current)
    }

    /// String setting, or `default` when unset.
    pub fn config(&self, key: &str, default: &str) -> String {
        match self.lookup(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn config_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => s.parse().map_err(|_| {
                Error::Config(format!("profile setting {} must be a boolean, got '{}'", key, s))
            }),
            Some(other) => Err(Error::Config(format!(
                "profile setting {} must be a boolean, got {:?}",
                key, other
            ))),
        }
    }

    pub fn config_i64(&self, key: &str, default: i64) -> Result<i64> {
        match self.lookup(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                Error::Config(format!("profile setting {} must be an integer", key))
            }),
            Some(Value::String(s)) => s.parse().map_err(|_| {
                Error::Config(format!("profile setting {} must be an integer, got '{}'", key, s))
            }),
            Some(other) => Err(Error::Config(format!(
                "profile setting {} must be an integer, got {:?}",
                key, other
            ))),
        }
    }

    pub fn config_list(&self, key: &str) -> Vec<String> {
        match self.lookup(key) {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_and_nested_keys() {
        let profile = Profile::with_config(
            "default",
            PathBuf::from("/tmp/p"),
            "stack.logstash_enabled: true\nstack:\n  cloud:\n    zone_count: 2\n  agent:\n    ports: [\"127.0.0.1:1514:1514/udp\"]\n",
        )
        .unwrap();
        assert!(profile.config_bool("stack.logstash_enabled", false).unwrap());
        assert_eq!(profile.config_i64("stack.cloud.zone_count", 1).unwrap(), 2);
        assert_eq!(
            profile.config_list("stack.agent.ports"),
            vec!["127.0.0.1:1514:1514/udp"]
        );
        assert_eq!(
            profile.config("stack.cloud.region", "gcp-europe-west3"),
            "gcp-europe-west3"
        );
    }

    #[test]
    fn wrong_types_are_errors() {
        let profile =
            Profile::with_config("default", PathBuf::from("/tmp/p"), "stack.apm_enabled: maybe\n")
                .unwrap();
        assert!(profile.config_bool("stack.apm_enabled", false).is_err());
    }

    #[test]
    fn load_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::load(dir.path(), "other").unwrap();
        assert!(profile.root().is_dir());
        assert_eq!(profile.name(), "other");
        assert!(Profile::load(dir.path(), "../escape").is_err());
    }
}
