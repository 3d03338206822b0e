//! The exporter's own health metrics.
//!
//! One instance is shared by the queues, the source clients, the enricher
//! and the evaluator. All collectors are registered into the dedicated
//! self-metrics sub-registry and snapshotted by a minute cron into the
//! metrics queue.

use crate::collectors::{CustomCounter, CustomGauge, CustomHistogram, Labels};
use crate::registry::QueryRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

const QUERY_LATENCY_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];
const EVALUATION_LATENCY_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];
const RESPONSE_SIZE_BUCKETS: &[f64] =
    &[1.0, 32.0, 1024.0, 32768.0, 1048576.0, 33554432.0, 1073741824.0];

fn string_labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

pub struct SelfMonitor {
    disable_timestamp: bool,
    cache_size: CustomGauge,
    response_error_count: CustomCounter,
    query_latency: CustomHistogram,
    metric_evaluation_latency: CustomHistogram,
    enrich_evaluation_latency: CustomHistogram,
    response_size: CustomHistogram,
    regex_matched: CustomCounter,
    regex_not_matched: CustomCounter,
    panic_recoveries: CustomCounter,
    queue_size: CustomGauge,
}

impl SelfMonitor {
    /// `omnipresent` carries the datasource label overlay applied to every
    /// self metric as const labels.
    pub fn new(
        omnipresent: &HashMap<String, String>,
        disable_timestamp: bool,
    ) -> prometheus::Result<Self> {
        let query = &["query_name".to_string()];
        let metric = &["metric_name".to_string()];
        let enrich = &["query_name".to_string(), "enrich_index".to_string()];
        let process = &["query_name".to_string(), "process_name".to_string()];
        let queue = &["query_name".to_string(), "queue_name".to_string()];
        let cache = &["query_name".to_string(), "cache_name".to_string()];
        Ok(Self {
            disable_timestamp,
            cache_size: CustomGauge::new(
                "data_exporter_cache_size",
                "Correlation cache size by query and cache",
                cache,
                omnipresent.clone(),
            )?,
            response_error_count: CustomCounter::new(
                "graylog_response_error_count",
                "Datasource response error count by query",
                query,
                omnipresent.clone(),
            )?,
            query_latency: CustomHistogram::new(
                "query_latency",
                "Query execution latency in seconds",
                query,
                omnipresent.clone(),
            )?,
            metric_evaluation_latency: CustomHistogram::new(
                "metric_evaluation_latency",
                "Metric evaluation latency in seconds",
                metric,
                omnipresent.clone(),
            )?,
            enrich_evaluation_latency: CustomHistogram::new(
                "enrich_evaluation_latency",
                "Enrich evaluation latency in seconds (enrich_index starts from 0)",
                enrich,
                omnipresent.clone(),
            )?,
            response_size: CustomHistogram::new(
                "graylog_response_size",
                "Datasource response size in bytes by query",
                query,
                omnipresent.clone(),
            )?,
            regex_matched: CustomCounter::new(
                "regex_matched",
                "Count of matched regexps per query and enrich_index",
                enrich,
                omnipresent.clone(),
            )?,
            regex_not_matched: CustomCounter::new(
                "regex_not_matched",
                "Count of not matched regexps per query and enrich_index",
                enrich,
                omnipresent.clone(),
            )?,
            panic_recoveries: CustomCounter::new(
                "panic_recovery_count",
                "Count of recovered panics by query and process",
                process,
                omnipresent.clone(),
            )?,
            queue_size: CustomGauge::new(
                "queue_size",
                "Size of the bounded pipeline queues",
                queue,
                omnipresent.clone(),
            )?,
        })
    }

    pub fn register_into(&self, registry: &QueryRegistry) -> prometheus::Result<()> {
        registry.register(crate::SELF_METRICS, Box::new(self.cache_size.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.response_error_count.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.query_latency.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.metric_evaluation_latency.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.enrich_evaluation_latency.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.response_size.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.regex_matched.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.regex_not_matched.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.panic_recoveries.clone()))?;
        registry.register(crate::SELF_METRICS, Box::new(self.queue_size.clone()))?;
        Ok(())
    }

    /// Primes the regexp counters to zero for every configured enrich step
    /// so operators can alert on increments from the first scrape on.
    pub fn prime_enrich_counters(&self, config: &model::Config) {
        for (query_name, query) in &config.queries {
            for enrich_index in 0..query.enrich.len() {
                self.add_regex_matched(query_name, enrich_index, 0.0);
                self.add_regex_not_matched(query_name, enrich_index, 0.0);
            }
        }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        if self.disable_timestamp {
            None
        } else {
            Some(Utc::now())
        }
    }

    pub fn set_queue_size(&self, query: &str, queue: &str, size: usize) {
        let labels = string_labels(&[("query_name", query), ("queue_name", queue)]);
        self.queue_size.set(size as f64, &labels, self.timestamp());
    }

    pub fn set_cache_size(&self, query: &str, cache: &str, size: f64) {
        let labels = string_labels(&[("query_name", query), ("cache_name", cache)]);
        self.cache_size.set(size, &labels, self.timestamp());
    }

    pub fn observe_query_latency(&self, query: &str, seconds: f64) {
        let labels = string_labels(&[("query_name", query)]);
        self.query_latency
            .observe_single(seconds, QUERY_LATENCY_BUCKETS, &labels, self.timestamp());
    }

    pub fn observe_response_size(&self, query: &str, bytes: f64) {
        let labels = string_labels(&[("query_name", query)]);
        self.response_size
            .observe_single(bytes, RESPONSE_SIZE_BUCKETS, &labels, self.timestamp());
    }

    pub fn inc_response_errors(&self, query: &str) {
        let labels = string_labels(&[("query_name", query)]);
        self.response_error_count.add(1.0, &labels, self.timestamp());
    }

    /// Re-stamps the error counter without incrementing it after a
    /// successful response. A no-op when timestamps are disabled.
    pub fn refresh_response_errors(&self, query: &str) {
        if self.disable_timestamp {
            return;
        }
        let labels = string_labels(&[("query_name", query)]);
        self.response_error_count.add(0.0, &labels, self.timestamp());
    }

    pub fn observe_metric_evaluation_latency(&self, metric: &str, seconds: f64) {
        let labels = string_labels(&[("metric_name", metric)]);
        self.metric_evaluation_latency.observe_single(
            seconds,
            EVALUATION_LATENCY_BUCKETS,
            &labels,
            self.timestamp(),
        );
    }

    pub fn observe_enrich_latency(&self, query: &str, enrich_index: usize, seconds: f64) {
        let index = enrich_index.to_string();
        let labels = string_labels(&[("query_name", query), ("enrich_index", &index)]);
        self.enrich_evaluation_latency.observe_single(
            seconds,
            EVALUATION_LATENCY_BUCKETS,
            &labels,
            self.timestamp(),
        );
    }

    pub fn add_regex_matched(&self, query: &str, enrich_index: usize, count: f64) {
        let index = enrich_index.to_string();
        let labels = string_labels(&[("query_name", query), ("enrich_index", &index)]);
        self.regex_matched.add(count, &labels, self.timestamp());
    }

    pub fn add_regex_not_matched(&self, query: &str, enrich_index: usize, count: f64) {
        let index = enrich_index.to_string();
        let labels = string_labels(&[("query_name", query), ("enrich_index", &index)]);
        self.regex_not_matched.add(count, &labels, self.timestamp());
    }

    /// Called with 0 when a worker starts and 1 after each recovered panic.
    pub fn record_panic_recovery(&self, query: &str, process: &str, value: f64) {
        let labels = string_labels(&[("query_name", query), ("process_name", process)]);
        self.panic_recoveries.add(value, &labels, self.timestamp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    fn monitor() -> SelfMonitor {
        SelfMonitor::new(&HashMap::new(), true).unwrap()
    }

    fn counter_value(collector: &dyn Collector, index: usize) -> f64 {
        collector.collect()[0].get_metric()[index].get_counter().get_value()
    }

    #[test]
    fn panic_recoveries_accumulate_per_process() {
        let monitor = monitor();
        monitor.record_panic_recovery("requests", "evaluation", 0.0);
        monitor.record_panic_recovery("requests", "evaluation", 1.0);
        monitor.record_panic_recovery("requests", "evaluation", 1.0);
        assert_eq!(counter_value(&monitor.panic_recoveries, 0), 2.0);
    }

    #[test]
    fn queue_size_is_labelled_by_queue_name() {
        let monitor = monitor();
        monitor.set_queue_size("requests", "DataQueue", 3);
        monitor.set_queue_size("requests", "ScheduleQueue", 7);
        let family = &monitor.queue_size.collect()[0];
        assert_eq!(family.get_metric().len(), 2);
    }

    #[test]
    fn refresh_is_a_noop_without_timestamps() {
        let monitor = monitor();
        monitor.inc_response_errors("requests");
        monitor.refresh_response_errors("requests");
        assert_eq!(counter_value(&monitor.response_error_count, 0), 1.0);
    }

    #[test]
    fn registers_all_collectors() {
        let registry = QueryRegistry::new(["requests"]);
        let monitor = monitor();
        monitor.set_queue_size("requests", "DataQueue", 1);
        monitor.register_into(&registry).unwrap();
        assert!(!registry.gather().is_empty());
    }
}
