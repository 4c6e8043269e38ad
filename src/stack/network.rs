//! Address rewriting for hosts handed to containers.

use std::net::IpAddr;
use url::{Host, Url};

const DOCKER_HOST_INTERNAL: &str = "host.docker.internal";

/// Adds `:443` to hosts without an explicit port.
///
/// Logstash's Elasticsearch output needs the port spelled out. Hosts that
/// fail to parse are returned as they are.
pub fn es_host_with_port(host: &str) -> String {
    let Ok(url) = Url::parse(host) else {
        return host.to_string();
    };
    match host_span(host, &url) {
        Some(span) if !span.has_port => {
            format!("{}:443{}", &host[..span.end], &host[span.end..])
        }
        _ => host.to_string(),
    }
}

/// Replaces loopback hosts with the address containers use to reach the host.
pub fn docker_internal_host(host: &str) -> String {
    let Ok(url) = Url::parse(host) else {
        return host.to_string();
    };
    let is_loopback = match url.host() {
        Some(Host::Domain(domain)) => domain == "localhost",
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    };
    if !is_loopback {
        return host.to_string();
    }
    match host_span(host, &url) {
        Some(span) => format!(
            "{}{}{}",
            &host[..span.start],
            DOCKER_HOST_INTERNAL,
            &host[span.end..]
        ),
        None => host.to_string(),
    }
}

struct HostSpan {
    start: usize,
    end: usize,
    has_port: bool,
}

// Locates the host in the original text. `Url` would normalize away a port
// equal to the scheme default and store IDN hosts as punycode, the raw text
// must be kept as written.
fn host_span(raw: &str, url: &Url) -> Option<HostSpan> {
    url.host_str()?;
    let authority_start = raw.find("://")? + 3;
    let authority_end = raw[authority_start..]
        .find(['/', '?', '#'])
        .map(|i| authority_start + i)
        .unwrap_or(raw.len());
    let authority = &raw[authority_start..authority_end];
    let start = authority_start + authority.rfind('@').map(|i| i + 1).unwrap_or(0);
    let host = &raw[start..authority_end];
    let len = if host.starts_with('[') {
        host.find(']')? + 1
    } else {
        host.find(':').unwrap_or(host.len())
    };
    let end = start + len;
    Some(HostSpan {
        start,
        end,
        has_port: raw[end..authority_end].starts_with(':'),
    })
}
