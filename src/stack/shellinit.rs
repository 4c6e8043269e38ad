//! Shell snippets exporting the active stack's connection settings.

use super::config::StackConfig;
use crate::error::{Error, Result};
use std::path::Path;

pub const ELASTICSEARCH_API_KEY_ENV: &str = "ELASTIC_PACKAGE_ELASTICSEARCH_API_KEY";
pub const ELASTICSEARCH_HOST_ENV: &str = "ELASTIC_PACKAGE_ELASTICSEARCH_HOST";
pub const ELASTICSEARCH_USERNAME_ENV: &str = "ELASTIC_PACKAGE_ELASTICSEARCH_USERNAME";
pub const ELASTICSEARCH_PASSWORD_ENV: &str = "ELASTIC_PACKAGE_ELASTICSEARCH_PASSWORD";
pub const KIBANA_HOST_ENV: &str = "ELASTIC_PACKAGE_KIBANA_HOST";
pub const CA_CERT_ENV: &str = "ELASTIC_PACKAGE_CA_CERT";

pub const AVAILABLE_SHELLS: &[&str] = &["bash", "dash", "fish", "sh", "zsh", "pwsh", "powershell"];

/// Values exported by `stack shellinit`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitConfig {
    pub elasticsearch_api_key: String,
    pub elasticsearch_host: String,
    pub elasticsearch_username: String,
    pub elasticsearch_password: String,
    pub kibana_host: String,
    pub ca_cert_path: String,
}

impl From<&StackConfig> for InitConfig {
    fn from(config: &StackConfig) -> Self {
        InitConfig {
            elasticsearch_api_key: config.elasticsearch_api_key.clone(),
            elasticsearch_host: config.elasticsearch_host.clone(),
            elasticsearch_username: config.elasticsearch_username.clone(),
            elasticsearch_password: config.elasticsearch_password.clone(),
            kibana_host: config.kibana_host.clone(),
            ca_cert_path: config.ca_cert_file.clone(),
        }
    }
}

/// Line pattern for one variable; `{name}` and `{value}` are substituted.
pub fn select_pattern(shell: &str) -> Result<&'static str> {
    match shell {
        "bash" | "dash" | "sh" | "zsh" => Ok("export {name}={value}"),
        "fish" => Ok("set -x {name} {value};"),
        "pwsh" | "powershell" => Ok("$Env:{name}=\"{value}\";"),
        other => Err(Error::UnknownShell(other.to_string())),
    }
}

/// Renders the export statements for `shell`.
pub fn shell_init(config: &InitConfig, shell: &str) -> Result<String> {
    let pattern = select_pattern(shell)?;
    let vars = [
        (ELASTICSEARCH_API_KEY_ENV, &config.elasticsearch_api_key),
        (ELASTICSEARCH_HOST_ENV, &config.elasticsearch_host),
        (ELASTICSEARCH_USERNAME_ENV, &config.elasticsearch_username),
        (ELASTICSEARCH_PASSWORD_ENV, &config.elasticsearch_password),
        (KIBANA_HOST_ENV, &config.kibana_host),
        (CA_CERT_ENV, &config.ca_cert_path),
    ];
    Ok(vars
        .iter()
        .map(|(name, value)| pattern.replace("{name}", name).replace("{value}", value))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// How to load the output into the current session.
pub fn help_text(shell: &str) -> &'static str {
    match shell {
        "pwsh" | "powershell" => "elastic-package stack shellinit | Invoke-Expression",
        _ => "eval \"$(elastic-package stack shellinit)\"",
    }
}

/// Shell name from an executable path.
pub fn shell_name(exe: &str) -> String {
    let exe = exe.trim_end_matches(" (deleted)");
    let base = exe.rsplit(['/', '\\']).next().unwrap_or(exe);
    base.trim_end_matches(".exe").to_string()
}

/// Name of the shell that launched this process.
///
/// Looks through `go run` style wrappers to the grandparent process.
pub fn detect_shell() -> Result<String> {
    #[cfg(target_os = "linux")]
    {
        let parent = std::os::unix::process::parent_id();
        let shell = shell_name(&process_exe(parent)?);
        if shell == "go" {
            let grandparent = parent_of(parent)?;
            return Ok(shell_name(&process_exe(grandparent)?));
        }
        Ok(shell)
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::debug!("parent process inspection unsupported on this platform, assuming bash");
        Ok("bash".to_string())
    }
}

#[cfg(target_os = "linux")]
fn process_exe(pid: u32) -> Result<String> {
    let link = Path::new("/proc").join(pid.to_string()).join("exe");
    std::fs::read_link(&link)
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|e| Error::Config(format!("cannot retrieve information for process {}: {}", pid, e)))
}

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Result<u32> {
    let stat = std::fs::read_to_string(Path::new("/proc").join(pid.to_string()).join("stat"))?;
    // The command name is parenthesized and may contain spaces.
    stat.rfind(')')
        .and_then(|close| stat[close + 1..].split_whitespace().nth(1))
        .and_then(|ppid| ppid.parse().ok())
        .ok_or_else(|| Error::Config(format!("cannot retrieve parent of process {}", pid)))
}
