//! Errors of the library. The binary prints them with [`Error::suggestion`]
//! as a hint.

use crate::docker::DockerError;
use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(elastic_package::config::error))]
    Config(String),

    #[error("environment variable {0} required")]
    #[diagnostic(
        code(elastic_package::env::missing),
        help("Export {0}, or load the stack variables with `eval \"$(elastic-package stack shellinit)\"`")
    )]
    MissingEnv(String),

    #[error("unknown provider '{0}'")]
    #[diagnostic(
        code(elastic_package::stack::unknown_provider),
        help("Supported providers: compose, cloud, serverless, environment")
    )]
    UnknownProvider(String),

    #[error("shell type is unknown, should be one of bash, dash, fish, sh, zsh, pwsh, powershell")]
    #[diagnostic(
        code(elastic_package::shellinit::unknown_shell),
        help("Pass the shell explicitly with `--shell <name>`")
    )]
    UnknownShell(String),

    #[error("{operation} not implemented for the {provider} provider")]
    #[diagnostic(code(elastic_package::stack::not_implemented))]
    NotImplemented {
        operation: &'static str,
        provider: &'static str,
    },

    #[error("Docker error: {0}")]
    #[diagnostic(
        code(elastic_package::docker::error),
        help("Check that Docker is running with `docker ps`")
    )]
    Docker(#[from] DockerError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context}: unexpected status code {status}: {body}")]
    Api {
        context: String,
        status: u16,
        body: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("timeout waiting for {0}")]
    #[diagnostic(
        code(elastic_package::stack::timeout),
        help("The stack may be slow to start. Check `elastic-package stack status` and try again")
    )]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("stack is not available: {0}")]
    #[diagnostic(
        code(elastic_package::stack::unavailable),
        help("Start the stack with `elastic-package stack up -d`")
    )]
    UnavailableStack(String),

    #[error("Certificate error: {0}")]
    #[diagnostic(code(elastic_package::certs::error))]
    Certificate(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("failed to parse pipeline {pipeline}: {reason}")]
    #[diagnostic(code(elastic_package::coverage::parse))]
    PipelineParse { pipeline: String, reason: String },

    #[error("{0}")]
    #[diagnostic(
        code(elastic_package::coverage::drift),
        help("The installed pipeline differs from its source; reinstall the package and rerun the tests")
    )]
    CoverageDrift(String),

    #[error("pipeline '{0}' not installed in Elasticsearch")]
    #[diagnostic(code(elastic_package::coverage::not_installed))]
    PipelineNotInstalled(String),

    #[error("node stats: {0}")]
    NodeStats(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<Error>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps the error with a message describing the failed step.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Collapses a list of errors: `None` when empty, the error itself when
    /// there is exactly one.
    pub fn from_many(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Multiple(errors)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Api { status, .. } => *status == 404,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Api { status, .. } => *status == 409,
            Error::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::MissingEnv(name) => Some(format!(
                "Set {} before using the environment provider, or load the active stack variables with:\n\n    eval \"$(elastic-package stack shellinit)\"",
                name
            )),
            Error::UnknownProvider(_) => Some(
                "Pick one of: compose, cloud, serverless, environment (e.g. `elastic-package stack up --provider compose`)".to_string()
            ),
            Error::UnknownShell(name) => Some(format!(
                "Detected shell '{}' is not supported. Pass one explicitly: elastic-package stack shellinit --shell bash",
                name
            )),
            Error::Docker(_) => Some(
                "Check that Docker is running: docker ps".to_string()
            ),
            Error::UnavailableStack(_) => Some(
                "Check the running services with: elastic-package stack status".to_string()
            ),
            Error::CoverageDrift(_) | Error::PipelineNotInstalled(_) => Some(
                "Make sure the pipelines under test are the ones installed in Elasticsearch".to_string()
            ),
            Error::Config(msg) if msg.contains("provider") => Some(
                "Tear the stack down with `elastic-package stack down` before switching providers".to_string()
            ),
            Error::Context { source, .. } => source.suggestion(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_lists_every_error() {
        let err = Error::Multiple(vec![
            Error::NotFound("agent policy".to_string()),
            Error::UnavailableStack("kibana".to_string()),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("Multiple errors occurred:"));
        assert!(text.contains("  - agent policy not found"));
        assert!(text.contains("  - kibana"), "{}", text);
    }

    #[test]
    fn from_many_collapses() {
        assert!(Error::from_many(vec![]).is_none());
        let single = Error::from_many(vec![Error::Cancelled]).unwrap();
        assert!(matches!(single, Error::Cancelled));
        let many = Error::from_many(vec![Error::Cancelled, Error::Cancelled]).unwrap();
        assert!(matches!(many, Error::Multiple(ref v) if v.len() == 2));
    }

    #[test]
    fn classification_sees_through_context() {
        let err = Error::Api {
            context: "could not get project".to_string(),
            status: 404,
            body: String::new(),
        }
        .context("locating serverless project");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert!(Error::Cancelled.context("waiting").is_cancelled());
    }

    #[test]
    fn missing_env_has_hint() {
        let err = Error::MissingEnv("ELASTIC_PACKAGE_KIBANA_HOST".to_string());
        assert_eq!(
            err.to_string(),
            "environment variable ELASTIC_PACKAGE_KIBANA_HOST required"
        );
        assert!(err.suggestion().unwrap().contains("stack shellinit"));
    }
}
