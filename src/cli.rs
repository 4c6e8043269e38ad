use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "elastic-package")]
#[command(about = "Elastic stacks for package testing, and ingest pipeline coverage")]
pub struct Cli {
    /// Profile to use (defaults to ELASTIC_PACKAGE_PROFILE, then the current profile)
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Log debug messages
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the Elastic stack
    #[command(subcommand)]
    Stack(StackCommands),
    /// Write a coverage report of installed ingest pipelines
    Coverage(CoverageArgs),
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_name = "SHELL")]
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Clone)]
pub struct StackArgs {
    /// Stack version
    #[arg(long)]
    pub version: Option<String>,

    /// Provider running the stack (compose, cloud, serverless, environment)
    #[arg(long)]
    pub provider: Option<String>,

    /// Provider settings overriding the profile, as key=value
    #[arg(short = 'U', long, value_delimiter = ',')]
    pub parameters: Vec<String>,
}

#[derive(Subcommand)]
pub enum StackCommands {
    /// Boot up the stack
    Up {
        /// Services to start (defaults to all)
        #[arg(short, long, value_delimiter = ',')]
        services: Vec<String>,

        /// Return once the services are up, leaving them in the background
        #[arg(short, long)]
        daemon: bool,

        #[command(flatten)]
        stack: StackArgs,
    },
    /// Take the stack down
    Down {
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Update the stack to the latest images or plan
    Update {
        #[command(flatten)]
        stack: StackArgs,
    },
    /// Show the status of the stack services
    Status {
        /// Stack version
        #[arg(long)]
        version: Option<String>,
    },
    /// Dump the logs of the stack services
    Dump {
        /// Directory the logs are written to
        #[arg(long, default_value = "elastic-stack-dump")]
        output: PathBuf,

        /// Only logs newer than this RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,

        /// Services to dump (defaults to all)
        #[arg(short, long, value_delimiter = ',')]
        services: Vec<String>,
    },
    /// Export the stack connection settings to the shell
    Shellinit {
        /// Shell to format for (detected from the parent process by default)
        #[arg(long)]
        shell: Option<String>,
    },
}

#[derive(Args)]
pub struct CoverageArgs {
    /// Directory with the pipeline sources
    #[arg(long)]
    pub pipelines: PathBuf,

    /// Report format (cobertura or generic)
    #[arg(long, default_value = "cobertura")]
    pub format: String,

    /// Elasticsearch to read the pipeline stats from (defaults to the stack of the profile)
    #[arg(long, env = "ELASTIC_PACKAGE_ELASTICSEARCH_HOST")]
    pub elasticsearch_host: Option<String>,

    /// Suffix the pipelines were installed with (discovered when unique)
    #[arg(long)]
    pub nonce: Option<String>,

    /// Package name in the report (defaults to the pipelines directory name)
    #[arg(long)]
    pub package: Option<String>,

    /// File the report is written to (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
