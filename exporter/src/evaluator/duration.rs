use super::caches::NoResponseBatch;
use super::{
    find_field, label_field_indexes, olv_from_row, Evaluator, HistogramValue,
    MetricEvaluationResult, MetricSeries,
};
use model::{MetricConfig, MetricKind, Operation};
use shared::codes;
use std::collections::HashMap;

const DEFAULT_MESSAGE_TYPE_REQUEST: &str = "request";
const DEFAULT_MESSAGE_TYPE_RESPONSE: &str = "response";

/// Request/response pair under one correlation id. Times are Unix
/// milliseconds; zero means the side has not been seen. The label values
/// come from the response row because request rows may lack the labels.
#[derive(Debug, Default)]
struct IntCall {
    request_time: i64,
    response_time: i64,
    olv: String,
}

impl Evaluator {
    pub(super) fn evaluate_duration(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        metric: &MetricConfig,
        query: &str,
    ) -> Option<MetricEvaluationResult> {
        tracing::debug!(metric = metric_name, "evaluating duration metric");
        let metric_state = self.state.get_or_create(metric_name);
        let is_histogram = metric.kind == MetricKind::Histogram;
        let mut result = MetricEvaluationResult::default();

        let int_calls = match self.duration_int_calls(rows, metric_name, metric, query) {
            Ok(calls) => calls,
            Err(message) => {
                tracing::error!(
                    error_code = codes::LME_1020,
                    metric = metric_name,
                    message = %message,
                    "error evaluating duration metric",
                );
                let evaluated = HashMap::new();
                self.post_evaluation(&mut result, &metric_state, &evaluated, metric_name, metric);
                return Some(result);
            }
        };

        let mut evaluated: HashMap<String, MetricSeries> = HashMap::new();
        for (correlation_id, call) in &int_calls {
            if call.request_time == 0 || call.response_time == 0 {
                continue;
            }
            let duration = (call.response_time - call.request_time) as f64 / 1000.0;
            if duration.is_nan() || duration.is_infinite() {
                tracing::warn!(metric = metric_name, correlation_id = %correlation_id, "skipping non-finite duration");
                continue;
            }
            let series = evaluated.entry(call.olv.clone()).or_insert_with(|| MetricSeries {
                histogram: is_histogram.then(|| HistogramValue::new(&metric.buckets)),
                ..Default::default()
            });
            series.count += 1;
            series.sum += duration;
            if let Some(histogram) = &mut series.histogram {
                histogram.observe(duration);
            }
        }

        for (olv, series) in evaluated.iter_mut() {
            series.labels = self.resolve_series_labels(&metric_state, olv, metric);
            series.average = series.sum / series.count as f64;
            result.series.push(series.clone());
        }

        if self.config.has_no_response_child(metric) {
            for child_name in &metric.child_metrics {
                let Some(child) = self.config.metrics.get(child_name) else {
                    continue;
                };
                if child.operation != Operation::DurationNoResponse {
                    continue;
                }
                if let Some(child_result) =
                    self.evaluate_duration_no_response(&int_calls, child_name, child)
                {
                    result.children.insert(child_name.clone(), child_result);
                }
            }
        }

        self.post_evaluation(&mut result, &metric_state, &evaluated, metric_name, metric);
        Some(result)
    }

    fn evaluate_duration_no_response(
        &self,
        int_calls: &HashMap<String, IntCall>,
        metric_name: &str,
        metric: &MetricConfig,
    ) -> Option<MetricEvaluationResult> {
        tracing::debug!(metric = metric_name, "evaluating duration-no-response metric");
        let metric_state = self.state.get_or_create(metric_name);
        let Some(cache) = self.no_response_caches.get(metric_name) else {
            tracing::error!(
                error_code = codes::LME_1604,
                metric = metric_name,
                "duration-no-response metric has no cache",
            );
            return None;
        };
        let mut result = MetricEvaluationResult::default();

        let mut new_batch = NoResponseBatch::new();
        for (correlation_id, call) in int_calls {
            if call.request_time == 0 && call.response_time == 0 {
                continue;
            }
            if call.response_time == 0 {
                new_batch.put(correlation_id.clone(), call.request_time, call.olv.clone());
                continue;
            }
            cache.mark_has_response(correlation_id);
        }

        let mut evaluated: HashMap<String, MetricSeries> = HashMap::new();
        for (olv, count) in cache.count_no_response_in_last_batch() {
            let series = MetricSeries {
                labels: self.resolve_series_labels(&metric_state, &olv, metric),
                count,
                sum: count as f64,
                average: count as f64,
                ..Default::default()
            };
            result.series.push(series.clone());
            evaluated.insert(olv, series);
        }

        self.post_evaluation(&mut result, &metric_state, &evaluated, metric_name, metric);
        cache.put_batch(new_batch);
        Some(result)
    }

    /// First pass: correlate request and response rows into [`IntCall`]s,
    /// then fill request times from the cache ring and enqueue still
    /// unanswered requests for the next ring shift.
    fn duration_int_calls(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        metric: &MetricConfig,
        query: &str,
    ) -> Result<HashMap<String, IntCall>, String> {
        let mut int_calls: HashMap<String, IntCall> = HashMap::new();
        if rows.is_empty() {
            return Ok(int_calls);
        }

        let time_field = metric
            .parameter("time_field")
            .ok_or_else(|| "parameter time_field not set".to_string())?;
        let message_type_field = metric
            .parameter("message_type_field")
            .ok_or_else(|| "parameter message_type_field not set".to_string())?;
        let correlation_id_field = metric
            .parameter("correlation_id_field")
            .ok_or_else(|| "parameter correlation_id_field not set".to_string())?;
        let time_format = metric.parameter("time_format");
        let message_type_request =
            metric.parameter("message_type_request").unwrap_or(DEFAULT_MESSAGE_TYPE_REQUEST);
        let message_type_response =
            metric.parameter("message_type_response").unwrap_or(DEFAULT_MESSAGE_TYPE_RESPONSE);
        let cache_name = metric.parameter("cache");
        let cache_update = metric.parameter("cache-update") == Some("true");

        let header = &rows[0];
        let time_index = find_field(header, time_field)
            .ok_or_else(|| format!("field {} not found in the output", time_field))?;
        let message_type_index = find_field(header, message_type_field)
            .ok_or_else(|| format!("field {} not found in the output", message_type_field))?;
        let correlation_id_index = find_field(header, correlation_id_field)
            .ok_or_else(|| format!("field {} not found in the output", correlation_id_field))?;
        let label_indexes = label_field_indexes(metric, header)?;

        for row in &rows[1..] {
            let raw_time = row.get(time_index).map(String::as_str).unwrap_or_default();
            let Some(unix_millis) = parse_time_millis(raw_time, time_format) else {
                tracing::debug!(metric = metric_name, value = raw_time, "failed to parse time field");
                continue;
            };
            let message_type = row.get(message_type_index).map(String::as_str).unwrap_or_default();
            let correlation_id = row
                .get(correlation_id_index)
                .map(String::as_str)
                .unwrap_or_default();
            if message_type == message_type_request {
                let call = int_calls.entry(correlation_id.to_string()).or_insert_with(|| IntCall {
                    olv: olv_from_row(&label_indexes, row),
                    ..Default::default()
                });
                call.request_time = unix_millis;
            } else if message_type == message_type_response {
                let olv = olv_from_row(&label_indexes, row);
                let call = int_calls.entry(correlation_id.to_string()).or_default();
                call.response_time = unix_millis;
                call.olv = olv;
            } else {
                tracing::error!(
                    error_code = codes::LME_1020,
                    metric = metric_name,
                    message_type,
                    "wrong message type",
                );
            }
        }

        let cache = cache_name.and_then(|name| self.request_caches.get(query, name));
        let mut new_batch: HashMap<String, i64> = HashMap::new();
        for (correlation_id, call) in int_calls.iter_mut() {
            if call.request_time == 0 {
                let Some(cache) = &cache else {
                    continue;
                };
                match cache.lookup(correlation_id) {
                    Some(request_time) => call.request_time = request_time,
                    None => continue,
                }
            }
            if call.response_time == 0 && cache_update && cache.is_some() {
                new_batch.insert(correlation_id.clone(), call.request_time);
            }
        }

        if cache_update {
            if let (Some(cache), Some(cache_name)) = (&cache, cache_name) {
                tracing::debug!(query, cache = cache_name, metric = metric_name, "updating request time cache");
                cache.put_batch(new_batch);
                self.monitor.set_cache_size(query, cache_name, cache.size() as f64);
            }
        }

        Ok(int_calls)
    }
}

/// Parses the time field to Unix milliseconds: either an integer
/// millisecond value, or a formatted timestamp when `time_format` is set.
fn parse_time_millis(raw: &str, format: Option<&str>) -> Option<i64> {
    match format {
        None => raw.parse::<i64>().ok(),
        Some(format) => {
            if let Ok(zoned) = chrono::DateTime::parse_from_str(raw, format) {
                return Some(zoned.timestamp_millis());
            }
            chrono::NaiveDateTime::parse_from_str(raw, format)
                .ok()
                .map(|naive| naive.and_utc().timestamp_millis())
        }
    }
}
