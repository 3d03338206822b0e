//! Collector wiring: one custom collector per configured metric, owned by
//! the metric and registered into the sub-registry of every query that
//! references it. Counters and histograms can be primed at startup through
//! `init-value` and `expected-labels`.

use crate::evaluator::{labels_cartesian, Labels, MetricSeries};
use model::{Config, MetricConfig, MetricKind};
use shared::codes;
use shared::collectors::{CustomCounter, CustomGauge, CustomHistogram};
use shared::registry::QueryRegistry;
use std::collections::{HashMap, HashSet};

pub struct MetricCollectors {
    counters: HashMap<String, CustomCounter>,
    gauges: HashMap<String, CustomGauge>,
    histograms: HashMap<String, CustomHistogram>,
}

impl MetricCollectors {
    pub fn new(config: &Config, registry: &QueryRegistry) -> anyhow::Result<Self> {
        let mut collectors = Self {
            counters: HashMap::new(),
            gauges: HashMap::new(),
            histograms: HashMap::new(),
        };
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for (query_name, query) in &config.queries {
            for metric_name in &query.metrics {
                collectors.init_metric(config, registry, metric_name, query_name, &mut seen)?;
                if let Some(metric) = config.metrics.get(metric_name) {
                    for child_name in &metric.child_metrics {
                        collectors.init_metric(config, registry, child_name, query_name, &mut seen)?;
                    }
                }
            }
        }
        Ok(collectors)
    }

    fn init_metric(
        &mut self,
        config: &Config,
        registry: &QueryRegistry,
        metric_name: &str,
        query_name: &str,
        seen: &mut HashSet<(String, String)>,
    ) -> anyhow::Result<()> {
        let Some(metric) = config.metrics.get(metric_name) else {
            tracing::error!(
                error_code = codes::LME_8102,
                metric = metric_name,
                query = query_name,
                "metric has no configuration, initialization skipped",
            );
            return Ok(());
        };
        if !seen.insert((query_name.to_string(), metric_name.to_string())) {
            return Ok(());
        }
        let const_labels = const_labels(config, metric);

        match metric.kind {
            MetricKind::Counter => {
                let counter = match self.counters.get(metric_name) {
                    Some(counter) => counter.clone(),
                    None => {
                        let counter = CustomCounter::new(
                            metric_name,
                            &metric.description,
                            &metric.labels,
                            const_labels,
                        )?;
                        init_counter_values(metric, metric_name, &counter);
                        self.counters.insert(metric_name.to_string(), counter.clone());
                        counter
                    }
                };
                registry.register(query_name, Box::new(counter))?;
            }
            MetricKind::Gauge => {
                let gauge = match self.gauges.get(metric_name) {
                    Some(gauge) => gauge.clone(),
                    None => {
                        let gauge = CustomGauge::new(
                            metric_name,
                            &metric.description,
                            &metric.labels,
                            const_labels,
                        )?;
                        self.gauges.insert(metric_name.to_string(), gauge.clone());
                        gauge
                    }
                };
                registry.register(query_name, Box::new(gauge))?;
            }
            MetricKind::Histogram => {
                let histogram = match self.histograms.get(metric_name) {
                    Some(histogram) => histogram.clone(),
                    None => {
                        let histogram = CustomHistogram::new(
                            metric_name,
                            &metric.description,
                            &metric.labels,
                            const_labels,
                        )?;
                        init_histogram_values(metric, metric_name, &histogram);
                        self.histograms.insert(metric_name.to_string(), histogram.clone());
                        histogram
                    }
                };
                registry.register(query_name, Box::new(histogram))?;
            }
        }
        tracing::info!(
            metric = metric_name,
            query = query_name,
            labels = ?metric.labels,
            "metric collector registered",
        );
        Ok(())
    }

    /// Writes one evaluation's series into the metric's collector.
    pub fn apply(&self, series: &[MetricSeries], metric_name: &str, metric: &MetricConfig) {
        match metric.kind {
            MetricKind::Counter => {
                let Some(counter) = self.counters.get(metric_name) else {
                    return;
                };
                for entry in series {
                    counter.add(entry.sum, &entry.labels, entry.timestamp);
                }
            }
            MetricKind::Gauge => {
                let Some(gauge) = self.gauges.get(metric_name) else {
                    return;
                };
                for entry in series {
                    gauge.set(entry.average, &entry.labels, entry.timestamp);
                }
            }
            MetricKind::Histogram => {
                let Some(histogram) = self.histograms.get(metric_name) else {
                    return;
                };
                for entry in series {
                    let Some(value) = &entry.histogram else {
                        tracing::error!(
                            error_code = codes::LME_1604,
                            metric = metric_name,
                            labels = ?entry.labels,
                            "histogram series without histogram value",
                        );
                        continue;
                    };
                    histogram.observe(
                        value.sum,
                        value.count,
                        &value.bucket_pairs(),
                        &entry.labels,
                        entry.timestamp,
                    );
                }
            }
        }
    }
}

fn const_labels(config: &Config, metric: &MetricConfig) -> HashMap<String, String> {
    let mut labels = config.datasource().labels.clone();
    labels.extend(metric.const_labels.clone());
    labels
}

fn init_counter_values(metric: &MetricConfig, metric_name: &str, counter: &CustomCounter) {
    let Some(init_value) = metric.parameter("init-value") else {
        return;
    };
    if metric.labels.is_empty() {
        if init_value.eq_ignore_ascii_case("nan") {
            counter.add(f64::NAN, &Labels::new(), None);
            return;
        }
        match init_value.parse::<f64>() {
            Ok(value) if value >= 0.0 => counter.add(value, &Labels::new(), None),
            Ok(value) => tracing::warn!(
                metric = metric_name,
                value,
                "counter can not be initialized with a negative value",
            ),
            Err(err) => tracing::error!(
                error_code = codes::LME_8102,
                metric = metric_name,
                value = init_value,
                %err,
                "failed to parse init-value",
            ),
        }
        return;
    }

    if metric.expected_labels.is_empty() {
        tracing::error!(
            error_code = codes::LME_8102,
            metric = metric_name,
            "metric with labels can not be initialized without expected-labels",
        );
        return;
    }
    let value = match init_value.parse::<f64>() {
        Ok(value) if value >= 0.0 => value,
        Ok(_) | Err(_) => {
            tracing::error!(
                error_code = codes::LME_8102,
                metric = metric_name,
                value = init_value,
                "init-value must be a non-negative number",
            );
            return;
        }
    };
    for expected in &metric.expected_labels {
        for labels in labels_cartesian(expected) {
            counter.add(value, &labels, None);
        }
    }
}

fn init_histogram_values(metric: &MetricConfig, metric_name: &str, histogram: &CustomHistogram) {
    if metric.parameter("init-value").is_none() {
        return;
    }
    let mut buckets: Vec<(f64, u64)> = metric.buckets.iter().map(|&bound| (bound, 0)).collect();
    buckets.push((f64::INFINITY, 0));

    if metric.labels.is_empty() {
        histogram.observe(0.0, 0, &buckets, &Labels::new(), None);
        return;
    }
    if metric.expected_labels.is_empty() {
        tracing::error!(
            error_code = codes::LME_8102,
            metric = metric_name,
            "metric with labels can not be initialized without expected-labels",
        );
        return;
    }
    for expected in &metric.expected_labels {
        for labels in labels_cartesian(expected) {
            histogram.observe(0.0, 0, &buckets, &labels, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testutil::config_from;

    fn config() -> Config {
        config_from(
            r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
    labels:
      source: graylog
metrics:
  requests_total:
    type: counter
    operation: count
    labels: [code]
    expected-labels:
      - code: ["200", "500"]
    parameters:
      init-value: "0"
  latency_seconds:
    type: histogram
    operation: value
    metric-value: duration
    buckets: [0.1, 1.0]
queries:
  requests:
    metrics: [requests_total, latency_seconds]
    croniter: "* * * * *"
    timerange: 1m
"#,
        )
    }

    #[test]
    fn expected_labels_prime_the_first_gather() {
        let config = config();
        let registry = QueryRegistry::new(config.queries.keys().map(String::as_str));
        MetricCollectors::new(&config, &registry).unwrap();
        let families = registry.gather_query("requests");
        let requests = families
            .iter()
            .find(|family| family.get_name() == "requests_total")
            .unwrap();
        assert_eq!(requests.get_metric().len(), 2);
        for metric in requests.get_metric() {
            assert_eq!(metric.get_counter().get_value(), 0.0);
            assert!(metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == "source" && pair.get_value() == "graylog"));
        }
    }

    #[test]
    fn apply_routes_series_to_the_right_collector() {
        let config = config();
        let registry = QueryRegistry::new(config.queries.keys().map(String::as_str));
        let collectors = MetricCollectors::new(&config, &registry).unwrap();

        let series = vec![MetricSeries {
            labels: maplit::hashmap! {"code".to_string() => "200".to_string()},
            sum: 5.0,
            count: 5,
            average: 5.0,
            ..Default::default()
        }];
        collectors.apply(&series, "requests_total", &config.metrics["requests_total"]);
        collectors.apply(&series, "requests_total", &config.metrics["requests_total"]);

        let families = registry.gather_query("requests");
        let requests = families
            .iter()
            .find(|family| family.get_name() == "requests_total")
            .unwrap();
        let code_200 = requests
            .get_metric()
            .iter()
            .find(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|pair| pair.get_name() == "code" && pair.get_value() == "200")
            })
            .unwrap();
        assert_eq!(code_200.get_counter().get_value(), 10.0);
    }
}
