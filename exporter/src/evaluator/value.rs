use super::condition::Condition;
use super::{
    find_field, label_field_indexes, olv_from_row, row_ranges, Evaluator, HistogramValue,
    MetricEvaluationResult, MetricSeries,
};
use model::{MetricConfig, MetricKind};
use shared::codes;
use std::collections::HashMap;

impl Evaluator {
    pub(super) fn evaluate_value(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        metric: &MetricConfig,
    ) -> Option<MetricEvaluationResult> {
        tracing::debug!(metric = metric_name, "evaluating value metric");
        let metric_state = self.state.get_or_create(metric_name);
        let mut result = MetricEvaluationResult::default();

        let mut evaluated = self.value_series_map(rows, metric_name, metric);
        for (olv, series) in evaluated.iter_mut() {
            series.labels = self.resolve_series_labels(&metric_state, olv, metric);
            series.average = if series.count != 0 {
                series.sum / series.count as f64
            } else {
                f64::NAN
            };
            result.series.push(series.clone());
        }

        self.post_evaluation(&mut result, &metric_state, &evaluated, metric_name, metric);
        Some(result)
    }

    fn value_series_map(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        metric: &MetricConfig,
    ) -> HashMap<String, MetricSeries> {
        if rows.len() < 2 {
            return HashMap::new();
        }
        let header = &rows[0];
        let label_indexes = match label_field_indexes(metric, header) {
            Ok(indexes) => indexes,
            Err(message) => {
                tracing::error!(
                    error_code = codes::LME_1020,
                    metric = metric_name,
                    message = %message,
                    "can not evaluate value metric",
                );
                return HashMap::new();
            }
        };

        let value_field = metric
            .metric_value
            .as_deref()
            .or_else(|| metric.parameter("value-field"))
            .unwrap_or_default();
        let Some(value_index) = find_field(header, value_field) else {
            tracing::error!(
                error_code = codes::LME_1020,
                metric = metric_name,
                field = value_field,
                "value field not found in the output",
            );
            return HashMap::new();
        };

        let condition = if metric.conditions.is_empty() {
            None
        } else {
            Some(Condition::compile(metric_name, &metric.conditions, header))
        };

        let ranges = row_ranges(rows.len(), metric.threads.max(1));
        if ranges.len() == 1 {
            let (start, end) = ranges[0];
            return value_range(
                rows,
                start,
                end,
                metric_name,
                metric,
                &label_indexes,
                value_index,
                condition.as_ref(),
            );
        }

        let partials: Vec<HashMap<String, MetricSeries>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(start, end)| {
                    let label_indexes = &label_indexes;
                    let condition = condition.as_ref();
                    scope.spawn(move || {
                        value_range(
                            rows,
                            start,
                            end,
                            metric_name,
                            metric,
                            label_indexes,
                            value_index,
                            condition,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let mut merged: HashMap<String, MetricSeries> = HashMap::new();
        for partial in partials {
            for (olv, series) in partial {
                match merged.get_mut(&olv) {
                    Some(existing) => {
                        existing.sum += series.sum;
                        existing.count += series.count;
                        match (&mut existing.histogram, &series.histogram) {
                            (Some(mine), Some(theirs)) => mine.merge(theirs),
                            (None, Some(theirs)) => existing.histogram = Some(theirs.clone()),
                            _ => {}
                        }
                    }
                    None => {
                        merged.insert(olv, series);
                    }
                }
            }
        }
        merged
    }
}

#[allow(clippy::too_many_arguments)]
fn value_range(
    rows: &[Vec<String>],
    start: usize,
    end: usize,
    metric_name: &str,
    metric: &MetricConfig,
    label_indexes: &[usize],
    value_index: usize,
    condition: Option<&Condition>,
) -> HashMap<String, MetricSeries> {
    let is_histogram = metric.kind == MetricKind::Histogram;
    let mut result: HashMap<String, MetricSeries> = HashMap::new();
    let mut parsing_errors = 0u64;
    let mut nans = 0u64;
    let mut infs = 0u64;
    for row in &rows[start.min(rows.len())..end.min(rows.len())] {
        if condition.map(|condition| !condition.matches(row)).unwrap_or(false) {
            continue;
        }
        let raw = row.get(value_index).map(String::as_str).unwrap_or_default();
        let value = match raw.parse::<f64>() {
            Ok(value) => value,
            Err(_) => {
                parsing_errors += 1;
                continue;
            }
        };
        if value.is_nan() {
            nans += 1;
            continue;
        }
        if value.is_infinite() {
            infs += 1;
            continue;
        }

        let olv = olv_from_row(label_indexes, row);
        let series = result.entry(olv).or_insert_with(|| MetricSeries {
            histogram: is_histogram.then(|| HistogramValue::new(&metric.buckets)),
            ..Default::default()
        });
        series.sum += value;
        series.count += 1;
        if let Some(histogram) = &mut series.histogram {
            histogram.observe(value);
        }
    }
    if parsing_errors != 0 || nans != 0 || infs != 0 {
        tracing::warn!(
            metric = metric_name,
            start,
            end,
            parsing_errors,
            nans,
            infs,
            "rows were skipped while evaluating value metric",
        );
    }
    result
}
