use std::time::Duration;
use thiserror::Error;

/// Structured error type for Docker and Compose CLI invocations.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The command did not finish in time.
    #[error("timed out running '{command}' (exceeded {} seconds)", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// The command ran but exited non-zero.
    #[error("'{command}' failed{}: {stderr}", .exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// The binary could not be started (not in PATH, permission denied).
    #[error("failed to execute '{command}': {source}")]
    ExecFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// No container answers to the given compose service.
    #[error("no container found for service {service}")]
    ContainerNotFound { service: String },

    /// Neither `docker compose` nor `docker-compose` answered.
    #[error("neither 'docker compose' (v2) nor 'docker-compose' (v1) is available")]
    ComposeUnavailable,
}

impl DockerError {
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        DockerError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Builds a command-failed error from a finished process.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code(),
        }
    }

    /// Builds a command-failed error for processes whose stderr was not captured.
    pub fn exited(cmd: impl Into<String>, status: std::process::ExitStatus) -> Self {
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr: "see output above".to_string(),
            exit_code: status.code(),
        }
    }

    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        DockerError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_mentions_exit_code() {
        let err = DockerError::CommandFailed {
            command: "docker compose up".to_string(),
            stderr: "service \"kibana\" is unhealthy".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(
            err.to_string(),
            "'docker compose up' failed (exit code 1): service \"kibana\" is unhealthy"
        );
    }

    #[test]
    fn timeout_in_seconds() {
        let err = DockerError::timeout("docker inspect abc", Duration::from_secs(30));
        assert!(err.to_string().contains("exceeded 30 seconds"));
    }
}
