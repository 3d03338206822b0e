use super::prompb::{Label, Sample, TimeSeries, WriteRequest};
use super::{MetricsSink, SinkError};
use crate::{codes, http_client, limited_prefix};
use model::ExportConfig;
use prometheus::proto::{self, MetricFamily};
use prost::Message;

const LOGGED_BODY_LIMIT: usize = 10_000;

/// Pushes snapshots through the remote-write protocol: each family expands
/// into one or more time series, the request is protobuf-encoded and
/// snappy-compressed.
pub struct RemoteWriteSink {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl RemoteWriteSink {
    pub fn new(export: &ExportConfig) -> anyhow::Result<Self> {
        let url = format!("{}{}", export.host.trimmed_host(), export.endpoint);
        tracing::info!(%url, "remote-write sink initialized");
        Ok(Self {
            client: http_client(&export.host)?,
            url,
            user: export.host.user.clone(),
            password: export.host.password.clone(),
        })
    }
}

#[async_trait::async_trait]
impl MetricsSink for RemoteWriteSink {
    async fn push(&self, families: &[MetricFamily], key: &str) -> Result<(), SinkError> {
        let request = WriteRequest {
            timeseries: families_to_timeseries(families, chrono::Utc::now().timestamp_millis()),
        };
        let encoded = request.encode_to_vec();
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&encoded)
            .map_err(|err| SinkError::Encode { message: err.to_string(), code: codes::LME_1042 })?;
        tracing::info!(key, size = compressed.len(), "sending remote-write request");

        let mut request = self
            .client
            .post(&self.url)
            .header("X-Prometheus-Remote-Write-Version", "0.1.0")
            .header("Content-Encoding", "snappy")
            .header("Content-Type", "application/x-protobuf")
            .body(compressed);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request.send().await.map_err(|source| SinkError::Request {
            url: self.url.clone(),
            code: codes::LME_7120,
            source,
        })?;
        let status = response.status();
        if status.as_u16() / 100 != 2 {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body: limited_prefix(&body, LOGGED_BODY_LIMIT).to_string(),
                code: codes::LME_7122,
            });
        }
        tracing::info!(key, status = status.as_u16(), "remote-write push succeeded");
        Ok(())
    }
}

/// Expands metric families into remote-write time series. Histograms yield
/// `_bucket` (with `+Inf` synthesized when absent), `_sum` and `_count`;
/// summaries yield their quantiles plus `_sum` and `_count`. Samples
/// without an explicit timestamp get `default_timestamp_ms`.
pub fn families_to_timeseries(
    families: &[MetricFamily],
    default_timestamp_ms: i64,
) -> Vec<TimeSeries> {
    let mut result = Vec::new();
    for family in families {
        let name = family.get_name();
        if name.is_empty() || family.get_metric().is_empty() {
            tracing::error!(
                error_code = codes::LME_1042,
                "metric family without name or metrics skipped",
            );
            continue;
        }
        for metric in family.get_metric() {
            match family.get_field_type() {
                proto::MetricType::COUNTER => result.push(series(
                    name,
                    "",
                    metric,
                    None,
                    metric.get_counter().get_value(),
                    default_timestamp_ms,
                )),
                proto::MetricType::GAUGE => result.push(series(
                    name,
                    "",
                    metric,
                    None,
                    metric.get_gauge().get_value(),
                    default_timestamp_ms,
                )),
                proto::MetricType::UNTYPED => result.push(series(
                    name,
                    "",
                    metric,
                    None,
                    metric.get_untyped().get_value(),
                    default_timestamp_ms,
                )),
                proto::MetricType::SUMMARY => {
                    let summary = metric.get_summary();
                    for quantile in summary.get_quantile() {
                        result.push(series(
                            name,
                            "",
                            metric,
                            Some(("quantile", quantile.get_quantile())),
                            quantile.get_value(),
                            default_timestamp_ms,
                        ));
                    }
                    result.push(series(
                        name,
                        "_sum",
                        metric,
                        None,
                        summary.get_sample_sum(),
                        default_timestamp_ms,
                    ));
                    result.push(series(
                        name,
                        "_count",
                        metric,
                        None,
                        summary.get_sample_count() as f64,
                        default_timestamp_ms,
                    ));
                }
                proto::MetricType::HISTOGRAM => {
                    let histogram = metric.get_histogram();
                    let mut saw_inf = false;
                    for bucket in histogram.get_bucket() {
                        saw_inf |= bucket.get_upper_bound().is_infinite();
                        result.push(series(
                            name,
                            "_bucket",
                            metric,
                            Some(("le", bucket.get_upper_bound())),
                            bucket.get_cumulative_count() as f64,
                            default_timestamp_ms,
                        ));
                    }
                    if !saw_inf {
                        result.push(series(
                            name,
                            "_bucket",
                            metric,
                            Some(("le", f64::INFINITY)),
                            histogram.get_sample_count() as f64,
                            default_timestamp_ms,
                        ));
                    }
                    result.push(series(
                        name,
                        "_sum",
                        metric,
                        None,
                        histogram.get_sample_sum(),
                        default_timestamp_ms,
                    ));
                    result.push(series(
                        name,
                        "_count",
                        metric,
                        None,
                        histogram.get_sample_count() as f64,
                        default_timestamp_ms,
                    ));
                }
            }
        }
    }
    result
}

fn series(
    name: &str,
    suffix: &str,
    metric: &proto::Metric,
    bound_label: Option<(&str, f64)>,
    value: f64,
    default_timestamp_ms: i64,
) -> TimeSeries {
    let mut labels = Vec::with_capacity(metric.get_label().len() + 2);
    labels.push(Label { name: "__name__".to_string(), value: format!("{}{}", name, suffix) });
    for pair in metric.get_label() {
        labels.push(Label { name: pair.get_name().to_string(), value: pair.get_value().to_string() });
    }
    if let Some((label_name, bound)) = bound_label {
        labels.push(Label { name: label_name.to_string(), value: format_bound(bound) });
    }
    let timestamp = if metric.get_timestamp_ms() != 0 {
        metric.get_timestamp_ms()
    } else {
        default_timestamp_ms
    };
    TimeSeries { labels, samples: vec![Sample { value, timestamp }] }
}

fn format_bound(bound: f64) -> String {
    if bound == f64::INFINITY {
        "+Inf".to_string()
    } else if bound == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else if bound.fract() == 0.0 && bound.abs() < 1e15 {
        format!("{}", bound as i64)
    } else {
        bound.to_string()
    }
}
