//! Infrastructure shared by the exporter binary: custom prometheus
//! collectors, the per-query registry, bounded query-keyed queues, the
//! log-source HTTP clients and the push sinks.

pub mod codes;
pub mod collectors;
pub mod queues;
pub mod registry;
pub mod selfmonitor;
pub mod sinks;
pub mod sources;
pub mod tracing;

use std::time::Duration;

/// Registry key reserved for the exporter's own metrics.
pub const SELF_METRICS: &str = "__SELF_METRICS__";

/// The standard http client used for every remote host. TLS material and
/// timeouts are applied once at startup and the client is reused.
pub fn http_client(host: &model::HostConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .timeout(host.connection_timeout)
        .connect_timeout(host.connection_timeout)
        .user_agent("log-exporter/1.0.0");
    if host.tls_insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(ca_file) = &host.tls_ca_cert_file {
        let pem = std::fs::read(ca_file)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    if let (Some(cert_file), Some(key_file)) = (&host.tls_cert_file, &host.tls_key_file) {
        let mut pem = std::fs::read(cert_file)?;
        pem.extend(std::fs::read(key_file)?);
        builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
    }
    Ok(builder.build()?)
}

/// Truncates a response body for error logging.
pub fn limited_prefix(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((index, _)) => &s[..index],
        None => s,
    }
}

/// Backoff between a worker panic and its restart.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(5);
