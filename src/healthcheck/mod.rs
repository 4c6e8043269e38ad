//! Readiness checks for stack services reached over HTTP.

pub mod checker;
pub mod http;

pub use checker::{wait_healthy, HealthChecker};
pub use http::{ElasticsearchHealth, FleetHealth, FleetServerStatus, KibanaHealth};
