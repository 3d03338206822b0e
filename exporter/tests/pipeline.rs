//! End-to-end pipeline tests with a mocked log source: a timestamp enters
//! the schedule queue, rows flow through enrichment and evaluation, and
//! the per-query registry (or the push sink) observes the outcome.

use chrono::Utc;
use exporter::enrich::Enricher;
use exporter::evaluator::Evaluator;
use exporter::metrics::MetricCollectors;
use exporter::pipeline::Pipeline;
use model::Config;
use prometheus::proto::MetricFamily;
use shared::queues::{
    DataQueue, MetricsQueue, ScheduleQueue, DATA_QUEUE, METRICS_QUEUE, SCHEDULE_QUEUE,
};
use shared::registry::QueryRegistry;
use shared::selfmonitor::SelfMonitor;
use shared::sinks::{MetricsSink, SinkError};
use shared::sources::MockLogSource;
use shared::SELF_METRICS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn test_config() -> Arc<Config> {
    let yaml = r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  requests_total:
    type: counter
    operation: count
    labels: [method]
queries:
  requests:
    metrics: [requests_total]
    croniter: "* * * * *"
    timerange: 1m
    enrich:
      - source-field: message
        regexp: "method=(\\w+)"
        dest-fields:
          - field-name: method
            template: "$1"
"#;
    let mut config: Config = serde_yaml::from_str(yaml).unwrap();
    config.finalize().unwrap();
    Arc::new(config)
}

fn sample_rows() -> Vec<Vec<String>> {
    vec![
        vec!["message".to_string()],
        vec!["method=GET".to_string()],
        vec!["method=GET".to_string()],
        vec!["method=POST".to_string()],
    ]
}

struct TestHarness {
    pipeline: Pipeline,
    schedule_queue: Arc<ScheduleQueue>,
    registry: Arc<QueryRegistry>,
}

fn harness(config: Arc<Config>, sink: Option<Arc<dyn MetricsSink>>) -> TestHarness {
    let monitor = Arc::new(SelfMonitor::new(&HashMap::new(), true).unwrap());
    let registry = Arc::new(QueryRegistry::new(config.queries.keys().map(String::as_str)));
    let collectors = Arc::new(MetricCollectors::new(&config, &registry).unwrap());
    let evaluator = Arc::new(Evaluator::new(config.clone(), monitor.clone(), true));
    let enricher = Arc::new(Enricher::new(&config, monitor.clone()));

    let mut source = MockLogSource::new();
    source.expect_query().returning(|_, _, _| Ok(sample_rows()));

    let schedule_queue = Arc::new(ScheduleQueue::new(
        SCHEDULE_QUEUE,
        config.queries.keys().map(|name| (name.clone(), 4)),
        monitor.clone(),
    ));
    let data_queue = Arc::new(DataQueue::new(
        DATA_QUEUE,
        config.queries.keys().map(|name| (name.clone(), 4)),
        monitor.clone(),
    ));
    let metrics_queue = sink.is_some().then(|| {
        Arc::new(MetricsQueue::new(
            METRICS_QUEUE,
            config
                .queries
                .keys()
                .map(|name| (name.clone(), 4))
                .chain(std::iter::once((SELF_METRICS.to_string(), 4))),
            monitor.clone(),
        ))
    });

    let pipeline = Pipeline {
        config,
        source: Arc::new(source),
        enricher,
        evaluator,
        collectors,
        registry: registry.clone(),
        schedule_queue: schedule_queue.clone(),
        data_queue,
        metrics_queue,
        sink,
        monitor,
    };
    TestHarness { pipeline, schedule_queue, registry }
}

fn counter_value(families: &[MetricFamily], name: &str, method: &str) -> Option<f64> {
    families
        .iter()
        .find(|family| family.get_name() == name)?
        .get_metric()
        .iter()
        .find(|metric| {
            metric
                .get_label()
                .iter()
                .any(|pair| pair.get_name() == "method" && pair.get_value() == method)
        })
        .map(|metric| metric.get_counter().get_value())
}

#[tokio::test]
async fn batch_flows_from_schedule_to_registry() {
    let harness = harness(test_config(), None);
    harness.pipeline.start();
    harness.schedule_queue.put("requests", Utc::now());

    for _ in 0..50 {
        let families = harness.registry.gather_query("requests");
        if counter_value(&families, "requests_total", "GET") == Some(2.0) {
            assert_eq!(counter_value(&families, "requests_total", "POST"), Some(1.0));
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("pipeline did not produce the expected series in time");
}

#[derive(Default)]
struct CapturingSink {
    pushes: Mutex<Vec<(String, Vec<MetricFamily>)>>,
}

#[async_trait::async_trait]
impl MetricsSink for CapturingSink {
    async fn push(&self, families: &[MetricFamily], key: &str) -> Result<(), SinkError> {
        self.pushes.lock().unwrap().push((key.to_string(), families.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn evaluated_snapshots_reach_the_push_sink() {
    let sink = Arc::new(CapturingSink::default());
    let harness = harness(test_config(), Some(sink.clone() as Arc<dyn MetricsSink>));
    harness.pipeline.start();
    harness.schedule_queue.put("requests", Utc::now());

    for _ in 0..50 {
        {
            let pushes = sink.pushes.lock().unwrap();
            if let Some((key, families)) = pushes.first() {
                assert_eq!(key, "requests");
                assert_eq!(counter_value(families, "requests_total", "GET"), Some(2.0));
                // cloud identity labels are appended before every push
                let sample = &families[0].get_metric()[0];
                for label in ["namespace", "pod", "container"] {
                    assert!(
                        sample.get_label().iter().any(|pair| pair.get_name() == label),
                        "missing pushed label {}",
                        label
                    );
                }
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("push sink did not receive a snapshot in time");
}
