//! # elastic-package
//!
//! Provisions Elastic stacks for package testing and measures how much of an
//! ingest pipeline the tests exercised.
//!
//! ## Stacks
//!
//! A stack belongs to a [`profile::Profile`] and is run by one of four
//! providers:
//!
//! - **compose**: Elasticsearch, Kibana, Fleet Server, the package registry
//!   and an Elastic Agent as local containers
//! - **cloud**: an Elastic Cloud deployment with a local agent
//! - **serverless**: an Elastic serverless project with a local agent
//! - **environment**: an existing Elasticsearch and Kibana, with the local
//!   services needed to test against them
//!
//! Whatever a provider creates is recorded in the profile's stack config, so
//! later commands (`status`, `dump`, `down`) talk to the same stack.
//!
//! ```no_run
//! use elastic_package::stack::{Backends, Lifecycle};
//! # use elastic_package::stack::Options;
//! # async fn example(options: Options) -> elastic_package::Result<()> {
//! let ctx = tokio_util::sync::CancellationToken::new();
//! let lifecycle = Lifecycle::new(Backends::system());
//! lifecycle.boot_up(&ctx, &options, None).await?;
//! for status in lifecycle.status(&ctx, &options).await? {
//!     println!("{} {} {}", status.name, status.version, status.status);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline coverage
//!
//! [`coverage`] pairs the processors of pipeline sources with the hit counts
//! Elasticsearch keeps for the installed pipelines and renders Cobertura or
//! generic coverage reports.

pub mod client;
pub mod coverage;
pub mod docker;
pub mod error;
pub mod healthcheck;
pub mod install;
pub mod output;
pub mod poll;
pub mod profile;
pub mod stack;

pub use error::{Error, Result};
pub use profile::Profile;
pub use stack::{Lifecycle, Provider};
