//! Metric evaluation: turns a batch of tabular log rows into metric series.
//!
//! The entry point dispatches on the configured operation (`count`,
//! `value`, `duration`); `duration-no-response` metrics are evaluated only
//! as children of a duration metric. After the operation-specific pass,
//! label-set memory fills in default series for every known series absent
//! from the batch.

pub mod caches;
pub mod condition;
mod count;
mod duration;
pub mod state;
mod value;

pub use state::{labels_cartesian, olv_from_labels, Labels, MetricState, MonitoringState};

use caches::{IdFieldCacheRepo, NoResponseCacheRepo, RequestTimeCacheRepo};
use chrono::{DateTime, Utc};
use model::{Config, MetricConfig, MetricKind, Operation};
use shared::codes;
use shared::selfmonitor::SelfMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One evaluated series: aggregate values for one ordered-label-value
/// string within one batch.
#[derive(Debug, Clone, Default)]
pub struct MetricSeries {
    pub labels: Labels,
    pub sum: f64,
    pub count: u64,
    pub average: f64,
    pub timestamp: Option<DateTime<Utc>>,
    pub histogram: Option<HistogramValue>,
}

/// Histogram accumulation at the evaluation level. Buckets are cumulative
/// and use less-or-equal assignment; the sample-level strict-less path
/// lives in the collectors and must not be confused with this one.
#[derive(Debug, Clone)]
pub struct HistogramValue {
    pub sum: f64,
    pub count: u64,
    bounds: Vec<f64>,
    counts: Vec<u64>,
}

impl HistogramValue {
    pub fn new(bounds: &[f64]) -> Self {
        let mut sorted = bounds.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        sorted.dedup();
        let counts = vec![0; sorted.len()];
        Self { sum: 0.0, count: 0, bounds: sorted, counts }
    }

    pub fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (index, &bound) in self.bounds.iter().enumerate() {
            if value <= bound {
                self.counts[index] += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &HistogramValue) {
        self.sum += other.sum;
        self.count += other.count;
        for (index, &bound) in other.bounds.iter().enumerate() {
            match self.bounds.binary_search_by(|b| b.partial_cmp(&bound).unwrap()) {
                Ok(position) => self.counts[position] += other.counts[index],
                Err(position) => {
                    self.bounds.insert(position, bound);
                    self.counts.insert(position, other.counts[index]);
                }
            }
        }
    }

    /// Bucket pairs in the form the collectors merge.
    pub fn bucket_pairs(&self) -> Vec<(f64, u64)> {
        self.bounds.iter().copied().zip(self.counts.iter().copied()).collect()
    }
}

#[derive(Debug, Default)]
pub struct MetricEvaluationResult {
    pub series: Vec<MetricSeries>,
    pub children: HashMap<String, MetricEvaluationResult>,
}

pub struct Evaluator {
    config: Arc<Config>,
    state: MonitoringState,
    request_caches: RequestTimeCacheRepo,
    no_response_caches: NoResponseCacheRepo,
    id_caches: IdFieldCacheRepo,
    default_values: HashMap<String, f64>,
    disable_timestamp: bool,
    monitor: Arc<SelfMonitor>,
}

impl Evaluator {
    pub fn new(config: Arc<Config>, monitor: Arc<SelfMonitor>, disable_timestamp: bool) -> Self {
        let state = MonitoringState::new();
        for (metric_name, metric) in &config.metrics {
            let metric_state = state.get_or_create(metric_name);
            for expected in &metric.expected_labels {
                for labels in labels_cartesian(expected) {
                    metric_state.set(olv_from_labels(&labels, &metric.labels), labels);
                }
            }
            if metric.labels.is_empty() {
                metric_state.set(String::new(), Labels::new());
            }
        }

        let mut default_values = HashMap::new();
        for (metric_name, metric) in &config.metrics {
            let Some(raw) = metric.parameter("default-value") else {
                continue;
            };
            match raw.parse::<f64>() {
                Ok(value) => {
                    default_values.insert(metric_name.clone(), value);
                }
                Err(err) => tracing::error!(
                    error_code = codes::LME_8104,
                    metric = %metric_name,
                    value = raw,
                    %err,
                    "failed to parse default-value, NaN is used",
                ),
            }
        }

        Self {
            request_caches: RequestTimeCacheRepo::new(&config),
            no_response_caches: NoResponseCacheRepo::new(&config),
            id_caches: IdFieldCacheRepo::new(&config),
            config,
            state,
            default_values,
            disable_timestamp,
            monitor,
        }
    }

    /// Evaluates one metric against one batch. `rows` is header-first.
    /// Returns None when the metric cannot be evaluated at all; row-level
    /// problems are logged and skipped inside the operations.
    pub fn evaluate(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        query: &str,
        end_time: DateTime<Utc>,
    ) -> Option<MetricEvaluationResult> {
        let started = Instant::now();
        let result = self.dispatch(rows, metric_name, query);
        self.monitor
            .observe_metric_evaluation_latency(metric_name, started.elapsed().as_secs_f64());
        let mut result = result?;

        if !self.disable_timestamp {
            for series in &mut result.series {
                series.timestamp = Some(end_time);
            }
            for child in result.children.values_mut() {
                for series in &mut child.series {
                    series.timestamp = Some(end_time);
                }
            }
        }
        Some(result)
    }

    fn dispatch(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        query: &str,
    ) -> Option<MetricEvaluationResult> {
        let Some(metric) = self.config.metrics.get(metric_name) else {
            tracing::error!(
                error_code = codes::LME_8102,
                metric = metric_name,
                "metric is not defined in the metrics section",
            );
            return None;
        };
        match metric.operation {
            Operation::Count => self.evaluate_count(rows, metric_name, metric),
            Operation::Value => self.evaluate_value(rows, metric_name, metric),
            Operation::Duration => self.evaluate_duration(rows, metric_name, metric, query),
            Operation::DurationNoResponse => {
                tracing::error!(
                    error_code = codes::LME_8102,
                    metric = metric_name,
                    "duration-no-response can be evaluated only as a child of a duration metric",
                );
                None
            }
        }
    }

    pub(crate) fn metric_default_value(&self, metric: &str) -> f64 {
        self.default_values.get(metric).copied().unwrap_or(f64::NAN)
    }

    /// Fills series for known label sets absent from this batch: gauges get
    /// the configured default (NaN when absent), counters and histograms
    /// get zero-valued series when timestamps are enabled so downstream can
    /// distinguish silence from a missing sample.
    fn post_evaluation(
        &self,
        result: &mut MetricEvaluationResult,
        metric_state: &MetricState,
        evaluated: &HashMap<String, MetricSeries>,
        metric_name: &str,
        metric: &MetricConfig,
    ) {
        match metric.kind {
            MetricKind::Gauge => {
                for key in metric_state.keys() {
                    if !evaluated.contains_key(&key) {
                        let series = MetricSeries {
                            labels: metric_state.get(&key).unwrap_or_default(),
                            average: self.metric_default_value(metric_name),
                            ..Default::default()
                        };
                        result.series.push(series);
                    }
                }
            }
            MetricKind::Counter if !self.disable_timestamp => {
                for key in metric_state.keys() {
                    if !evaluated.contains_key(&key) {
                        result.series.push(MetricSeries {
                            labels: metric_state.get(&key).unwrap_or_default(),
                            ..Default::default()
                        });
                    }
                }
            }
            MetricKind::Histogram if !self.disable_timestamp => {
                for key in metric_state.keys() {
                    if !evaluated.contains_key(&key) {
                        result.series.push(MetricSeries {
                            labels: metric_state.get(&key).unwrap_or_default(),
                            histogram: Some(HistogramValue::new(&metric.buckets)),
                            ..Default::default()
                        });
                    }
                }
            }
            _ => {}
        }
    }

    /// Resolves label sets for evaluated series, remembering new ones.
    fn resolve_series_labels(
        &self,
        metric_state: &MetricState,
        olv: &str,
        metric: &MetricConfig,
    ) -> Labels {
        match metric_state.get(olv) {
            Some(labels) => labels,
            None => {
                let labels = labels_from_olv(olv, &metric.labels);
                metric_state.set(olv.to_string(), labels.clone());
                labels
            }
        }
    }
}

/// Rebuilds a label map from an ordered-label-value string.
pub fn labels_from_olv(olv: &str, label_names: &[String]) -> Labels {
    let values: Vec<&str> = olv.split(';').collect();
    if values.len() != label_names.len() {
        tracing::error!(
            error_code = codes::LME_1020,
            expected = label_names.len(),
            actual = values.len(),
            olv,
            "label count mismatch while rebuilding labels from the series key",
        );
    }
    label_names
        .iter()
        .zip(values)
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect()
}

/// The ordered-label-value string of one row.
pub(crate) fn olv_from_row(label_indexes: &[usize], row: &[String]) -> String {
    label_indexes
        .iter()
        .map(|&index| row.get(index).map(String::as_str).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(";")
}

/// Header indexes of the non-multi-value labels, resolved through
/// `label-field-map`.
pub(crate) fn label_field_indexes(
    metric: &MetricConfig,
    header: &[String],
) -> Result<Vec<usize>, String> {
    let count = metric.labels.len() - metric.multi_value_fields.len();
    let mut indexes = Vec::with_capacity(count);
    for label in &metric.labels[..count] {
        let field = metric.label_field_map.get(label).unwrap_or(label);
        match header.iter().position(|name| name == field) {
            Some(index) => indexes.push(index),
            None => {
                return Err(format!("field {} not found in the output for label {}", field, label))
            }
        }
    }
    Ok(indexes)
}

pub(crate) fn find_field(header: &[String], field: &str) -> Option<usize> {
    header.iter().position(|name| name == field)
}

/// Splits the data rows (excluding the header) into `threads` contiguous
/// ranges. Row indexes are 1-based because index 0 is the header.
pub(crate) fn row_ranges(data_len: usize, threads: usize) -> Vec<(usize, usize)> {
    let rows = data_len.saturating_sub(1);
    let threads = threads.clamp(1, rows.max(1));
    (0..threads)
        .map(|thread| {
            let start = 1 + thread * rows / threads;
            let end = 1 + (thread + 1) * rows / threads;
            (start, end)
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_value_uses_less_or_equal() {
        let mut value = HistogramValue::new(&[1.0, 2.0]);
        value.observe(1.0);
        assert_eq!(value.bucket_pairs(), vec![(1.0, 1), (2.0, 1)]);
        value.observe(1.5);
        assert_eq!(value.bucket_pairs(), vec![(1.0, 1), (2.0, 2)]);
        assert_eq!(value.count, 2);
        assert_eq!(value.sum, 2.5);
    }

    #[test]
    fn histogram_merge_is_bucketwise() {
        let mut first = HistogramValue::new(&[1.0, 2.0]);
        first.observe(0.5);
        let mut second = HistogramValue::new(&[1.0, 2.0]);
        second.observe(1.5);
        first.merge(&second);
        assert_eq!(first.count, 2);
        assert_eq!(first.bucket_pairs(), vec![(1.0, 1), (2.0, 2)]);
    }

    #[test]
    fn row_ranges_cover_all_rows_exactly_once() {
        let ranges = row_ranges(11, 3);
        assert_eq!(ranges.first().unwrap().0, 1);
        assert_eq!(ranges.last().unwrap().1, 11);
        let total: usize = ranges.iter().map(|(start, end)| end - start).sum();
        assert_eq!(total, 10);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn labels_from_olv_round_trips() {
        let names = vec!["first".to_string(), "second".to_string()];
        let labels = labels_from_olv("a;b", &names);
        assert_eq!(labels["first"], "a");
        assert_eq!(labels["second"], "b");
        assert_eq!(olv_from_labels(&labels, &names), "a;b");
    }
}
