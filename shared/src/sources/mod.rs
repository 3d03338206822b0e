//! Log-storage backends queried by the pipeline.
//!
//! All three clients expose the same seam: one query name plus an absolute
//! time window in, a header-first table of string rows out. The pipeline
//! only ever talks to the [`LogSource`] trait so tests can substitute a
//! mock.

mod graylog;
mod last_timestamp;
mod loki;
mod newrelic;

pub use graylog::GraylogSource;
pub use last_timestamp::{LastTimestampClient, LastTimestampError};
pub use loki::LokiSource;
pub use newrelic::NewRelicSource;

use crate::selfmonitor::SelfMonitor;
use chrono::{DateTime, Utc};
use model::{Config, DatasourceKind};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("error accessing {url}: {source}")]
    Request {
        url: String,
        code: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("received error status code {status}")]
    Status { status: u16, code: &'static str },
    #[error("failed to decode response: {message}")]
    Decode { message: String, code: &'static str },
    #[error("{message}")]
    InvalidQuery { message: String, code: &'static str },
}

impl SourceError {
    /// The `LME-7xxx` code routed to the `error_code` log field.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request { code, .. }
            | Self::Status { code, .. }
            | Self::Decode { code, .. }
            | Self::InvalidQuery { code, .. } => code,
        }
    }
}

/// A remote log store normalized to tabular output. The first row of a
/// non-empty result is the header.
#[mockall::automock]
#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    async fn query(
        &self,
        query_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Vec<String>>, SourceError>;
}

/// Builds the client matching the configured datasource type.
pub fn create(config: Arc<Config>, monitor: Arc<SelfMonitor>) -> anyhow::Result<Arc<dyn LogSource>> {
    Ok(match config.datasource().kind {
        DatasourceKind::Graylog => Arc::new(GraylogSource::new(config, monitor)?),
        DatasourceKind::Loki => Arc::new(LokiSource::new(config, monitor)?),
        DatasourceKind::NewRelic => Arc::new(NewRelicSource::new(config, monitor)?),
    })
}

/// Records latency, response size and the error counter for one request.
/// The error counter is reset (re-stamped at zero delta) after a success so
/// operators see the last state.
pub(crate) fn record_query_outcome(
    monitor: &SelfMonitor,
    query_name: &str,
    started: Instant,
    response_size: usize,
    failed: bool,
) {
    monitor.observe_query_latency(query_name, started.elapsed().as_secs_f64());
    monitor.observe_response_size(query_name, response_size as f64);
    if failed {
        monitor.inc_response_errors(query_name);
    } else {
        monitor.refresh_response_errors(query_name);
    }
}
