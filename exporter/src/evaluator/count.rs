use super::caches::IdFieldCache;
use super::condition::Condition;
use super::state::increment_indexes;
use super::{
    find_field, label_field_indexes, olv_from_row, row_ranges, Evaluator, Labels,
    MetricEvaluationResult, MetricSeries,
};
use model::{IdFieldStrategy, MetricConfig, MetricKind};
use shared::codes;
use std::collections::HashMap;
use std::sync::Arc;

impl Evaluator {
    pub(super) fn evaluate_count(
        &self,
        rows: &[Vec<String>],
        metric_name: &str,
        metric: &MetricConfig,
    ) -> Option<MetricEvaluationResult> {
        tracing::debug!(metric = metric_name, "evaluating count metric");
        if metric.kind == MetricKind::Histogram {
            tracing::error!(
                error_code = codes::LME_8102,
                metric = metric_name,
                "count operation does not support the histogram type",
            );
            return None;
        }
        let metric_state = self.state.get_or_create(metric_name);
        let mut result = MetricEvaluationResult::default();

        let evaluated = if rows.is_empty() {
            HashMap::new()
        } else if metric.labels.is_empty() {
            let count = (rows.len() - 1) as u64;
            let series = MetricSeries {
                labels: Labels::new(),
                count,
                sum: count as f64,
                average: count as f64,
                ..Default::default()
            };
            result.series.push(series.clone());
            HashMap::from([(String::new(), series)])
        } else {
            let mut evaluated = self.count_series_map(rows, metric_name, metric);
            for (olv, series) in evaluated.iter_mut() {
                series.labels = self.resolve_series_labels(&metric_state, olv, metric);
                series.sum = series.count as f64;
                series.average = series.count as f64;
                result.series.push(series.clone());
            }
            evaluated
        };

        self.post_evaluation(&mut result, &metric_state, &evaluated, metric_name, metric);
        Some(result)
    }

    fn count_series_map(
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
                    "can not evaluate count metric",
                );
                return HashMap::new();
            }
        };

        let mut id_plan = None;
        if let Some(id_field) = metric.id_field.as_deref() {
            if let Some(index) = find_field(header, id_field) {
                let cache = self.id_caches.get_or_create(metric_name);
                cache.inc_age();
                id_plan = Some((index, metric.id_field_strategy, cache));
            }
        }

        let condition = if metric.conditions.is_empty() {
            None
        } else {
            Some(Condition::compile(metric_name, &metric.conditions, header))
        };

        let multi_value_indexes = if metric.multi_value_fields.is_empty() {
            Vec::new()
        } else {
            let mut indexes = Vec::with_capacity(metric.multi_value_fields.len());
            for field in &metric.multi_value_fields {
                match find_field(header, &field.field_name) {
                    Some(index) => indexes.push(index),
                    None => {
                        tracing::error!(
                            error_code = codes::LME_1020,
                            metric = metric_name,
                            field = %field.field_name,
                            "multi-value field not found in the output",
                        );
                        return HashMap::new();
                    }
                }
            }
            indexes
        };

        let ranges = row_ranges(rows.len(), metric.threads.max(1));
        if ranges.len() == 1 {
            let (start, end) = ranges[0];
            return count_range(
                rows,
                start,
                end,
                metric,
                &label_indexes,
                id_plan.as_ref(),
                condition.as_ref(),
                &multi_value_indexes,
            );
        }

        let partials: Vec<HashMap<String, MetricSeries>> = std::thread::scope(|scope| {
            let handles: Vec<_> = ranges
                .iter()
                .map(|&(start, end)| {
                    let label_indexes = &label_indexes;
                    let id_plan = id_plan.as_ref();
                    let condition = condition.as_ref();
                    let multi_value_indexes = &multi_value_indexes;
                    scope.spawn(move || {
                        count_range(
                            rows,
                            start,
                            end,
                            metric,
                            label_indexes,
                            id_plan,
                            condition,
                            multi_value_indexes,
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let mut merged = HashMap::new();
        for partial in partials {
            for (olv, series) in partial {
                merged
                    .entry(olv)
                    .and_modify(|existing: &mut MetricSeries| existing.count += series.count)
                    .or_insert(series);
            }
        }
        merged
    }
}

#[allow(clippy::too_many_arguments)]
fn count_range(
    rows: &[Vec<String>],
    start: usize,
    end: usize,
    metric: &MetricConfig,
    label_indexes: &[usize],
    id_plan: Option<&(usize, IdFieldStrategy, Arc<IdFieldCache>)>,
    condition: Option<&Condition>,
    multi_value_indexes: &[usize],
) -> HashMap<String, MetricSeries> {
    let mut result: HashMap<String, MetricSeries> = HashMap::new();
    for row in &rows[start.min(rows.len())..end.min(rows.len())] {
        if condition.map(|condition| !condition.matches(row)).unwrap_or(false) {
            continue;
        }
        if let Some((index, IdFieldStrategy::Metric, cache)) = id_plan {
            if cache.is_used(&row[*index]) {
                continue;
            }
        }
        let olvs = if multi_value_indexes.is_empty() {
            vec![olv_from_row(label_indexes, row)]
        } else {
            expand_multi_value_olvs(label_indexes, row, metric, multi_value_indexes)
        };
        for olv in olvs {
            if let Some((index, IdFieldStrategy::Label, cache)) = id_plan {
                if cache.is_used_for_olv(&row[*index], &olv) {
                    continue;
                }
            }
            result.entry(olv).or_default().count += 1;
        }
    }
    result
}

/// Multi-value expansion: the base label prefix crossed with every
/// combination of the split multi-value components.
fn expand_multi_value_olvs(
    label_indexes: &[usize],
    row: &[String],
    metric: &MetricConfig,
    multi_value_indexes: &[usize],
) -> Vec<String> {
    let prefix = olv_from_row(label_indexes, row);

    let mut components: Vec<Vec<String>> = Vec::with_capacity(metric.multi_value_fields.len());
    for (field, &index) in metric.multi_value_fields.iter().zip(multi_value_indexes) {
        let values = row[index]
            .split(&field.separator)
            .map(|part| part.trim().to_string())
            .collect();
        components.push(values);
    }

    let sizes: Vec<usize> = components.iter().map(Vec::len).collect();
    let mut indexes = vec![0usize; components.len()];
    let mut result = Vec::with_capacity(sizes.iter().product());
    loop {
        let suffix = components
            .iter()
            .zip(&indexes)
            .map(|(values, &index)| values[index].as_str())
            .collect::<Vec<_>>()
            .join(";");
        result.push(format!("{};{}", prefix, suffix));
        if increment_indexes(&mut indexes, &sizes) {
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{evaluator_for, evaluator_without_timestamps, rows, series_by_olv};
    use super::*;

    fn count_config(extra: &str) -> String {
        format!(
            r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  requests_total:
    type: counter
    operation: count
    labels: [code]
{}
queries:
  requests:
    metrics: [requests_total]
    croniter: "* * * * *"
    timerange: 1m
"#,
            extra
        )
    }

    fn label_order() -> Vec<String> {
        vec!["code".to_string()]
    }

    #[test]
    fn counts_rows_per_label_value() {
        let evaluator = evaluator_for(&count_config(""));
        let data = rows(&[
            &["timestamp", "code"],
            &["t1", "200"],
            &["t2", "200"],
            &["t3", "500"],
        ]);
        let result = evaluator
            .evaluate(&data, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert_eq!(by_olv["200"].count, 2);
        assert_eq!(by_olv["200"].sum, 2.0);
        assert_eq!(by_olv["500"].count, 1);
    }

    #[test]
    fn unlabelled_metric_counts_data_rows() {
        let yaml = r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  lines_total:
    type: counter
    operation: count
queries:
  requests:
    metrics: [lines_total]
    croniter: "* * * * *"
    timerange: 1m
"#;
        let evaluator = evaluator_for(yaml);
        let data = rows(&[&["message"], &["a"], &["b"], &["c"]]);
        let result = evaluator
            .evaluate(&data, "lines_total", "requests", chrono::Utc::now())
            .unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].count, 3);
    }

    #[test]
    fn multi_value_fields_expand_to_the_cartesian_product() {
        let yaml = r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  tagged_total:
    type: counter
    operation: count
    labels: [code]
    multi-value-fields:
      - field-name: tags
        label-name: tag
        separator: ","
      - field-name: zones
        label-name: zone
        separator: ","
queries:
  requests:
    metrics: [tagged_total]
    croniter: "* * * * *"
    timerange: 1m
"#;
        let evaluator = evaluator_for(yaml);
        let data = rows(&[
            &["code", "tags", "zones"],
            &["200", "x, y", "1, 2"],
        ]);
        let result = evaluator
            .evaluate(&data, "tagged_total", "requests", chrono::Utc::now())
            .unwrap();
        let order = vec!["code".to_string(), "tag".to_string(), "zone".to_string()];
        let by_olv = series_by_olv(&result, &order);
        for olv in ["200;x;1", "200;x;2", "200;y;1", "200;y;2"] {
            assert_eq!(by_olv[olv].count, 1, "missing combination {}", olv);
        }
        assert_eq!(result.series.len(), 4);
    }

    #[test]
    fn conditions_filter_rows() {
        let extra = r#"    conditions:
      - equ:
          level: ERROR"#;
        let evaluator = evaluator_for(&count_config(extra));
        let data = rows(&[
            &["code", "level"],
            &["200", "ERROR"],
            &["200", "INFO"],
        ]);
        let result = evaluator
            .evaluate(&data, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert_eq!(by_olv["200"].count, 1);
    }

    #[test]
    fn label_strategy_dedups_per_label_set() {
        let extra = r#"    id-field: request_id
    id-field-strategy: label
    id-field-ttl: 1"#;
        let evaluator = evaluator_without_timestamps(&count_config(extra));
        let batch_one = rows(&[&["code", "request_id"], &["200", "id-1"]]);
        let result = evaluator
            .evaluate(&batch_one, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        assert_eq!(series_by_olv(&result, &label_order())["200"].count, 1);

        // the same id in the next batch is still within the two generations
        let batch_two = rows(&[&["code", "request_id"], &["200", "id-1"], &["500", "id-1"]]);
        let result = evaluator
            .evaluate(&batch_two, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert!(!by_olv.contains_key("200"), "duplicate id for the same label set must be skipped");
        assert_eq!(by_olv["500"].count, 1, "other label sets still count");
    }

    #[test]
    fn metric_strategy_dedups_across_label_sets() {
        let extra = r#"    id-field: request_id
    id-field-strategy: metric"#;
        let evaluator = evaluator_without_timestamps(&count_config(extra));
        let data = rows(&[
            &["code", "request_id"],
            &["200", "id-1"],
            &["500", "id-1"],
            &["500", "id-2"],
        ]);
        let result = evaluator
            .evaluate(&data, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert_eq!(by_olv["200"].count, 1);
        assert_eq!(by_olv["500"].count, 1, "second occurrence of id-1 skipped entirely");
    }

    #[test]
    fn threads_partition_and_merge() {
        let extra = "    threads: 4";
        let evaluator = evaluator_for(&count_config(extra));
        let mut table: Vec<Vec<String>> = vec![vec!["code".to_string()]];
        for index in 0..100 {
            table.push(vec![if index % 2 == 0 { "200" } else { "500" }.to_string()]);
        }
        let result = evaluator
            .evaluate(&table, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert_eq!(by_olv["200"].count, 50);
        assert_eq!(by_olv["500"].count, 50);
    }

    #[test]
    fn absent_counter_series_emit_zero_when_timestamps_are_enabled() {
        let evaluator = evaluator_for(&count_config(""));
        let batch_one = rows(&[&["code"], &["200"]]);
        evaluator
            .evaluate(&batch_one, "requests_total", "requests", chrono::Utc::now())
            .unwrap();

        let batch_two = rows(&[&["code"], &["500"]]);
        let result = evaluator
            .evaluate(&batch_two, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        let by_olv = series_by_olv(&result, &label_order());
        assert_eq!(by_olv["500"].count, 1);
        let silent = by_olv["200"];
        assert_eq!(silent.count, 0, "silent series must be distinguishable from missing ones");
        assert_eq!(silent.sum, 0.0);
        assert!(silent.timestamp.is_some());
    }

    #[test]
    fn missing_label_field_invalidates_the_batch() {
        let evaluator = evaluator_without_timestamps(&count_config(""));
        let data = rows(&[&["timestamp"], &["t1"]]);
        let result = evaluator
            .evaluate(&data, "requests_total", "requests", chrono::Utc::now())
            .unwrap();
        assert!(result.series.is_empty());
    }
}
