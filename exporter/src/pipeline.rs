//! The per-query worker pipeline and its supervision harness.
//!
//! One long-lived worker exists per (stage, query) tuple. Workers talk to
//! each other only through the bounded queues; a panic inside a worker is
//! logged, counted, and followed by a restart after a backoff.

use crate::enrich::Enricher;
use crate::evaluator::Evaluator;
use crate::metrics::MetricCollectors;
use model::Config;
use shared::codes;
use shared::queues::{DataQueue, LogBatch, MetricsQueue, QueueReceiver, ScheduleQueue};
use shared::registry::QueryRegistry;
use shared::selfmonitor::SelfMonitor;
use shared::sinks::{append_cloud_labels, MetricsSink};
use shared::sources::LogSource;
use shared::{RESTART_BACKOFF, SELF_METRICS};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const SOURCE_PROCESS: &str = "source";
pub const EVALUATION_PROCESS: &str = "evaluation";
pub const PUSH_PROCESS: &str = "push";

/// Runs `make()` as a worker task and restarts it after every panic. The
/// worker ends for good when its future completes normally (its queue was
/// closed) or the surrounding runtime shuts down.
pub fn spawn_supervised<F, Fut>(
    process: &'static str,
    query: String,
    monitor: Arc<SelfMonitor>,
    backoff: Duration,
    mut make: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    monitor.record_panic_recovery(&query, process, 0.0);
    tokio::spawn(async move {
        loop {
            let worker = tokio::spawn(make());
            match worker.await {
                Ok(()) => {
                    tracing::info!(process, query = %query, "worker finished");
                    return;
                }
                Err(err) if err.is_panic() => {
                    tracing::error!(
                        error_code = codes::LME_1601,
                        process,
                        query = %query,
                        %err,
                        "panic in worker, restarting",
                    );
                    monitor.record_panic_recovery(&query, process, 1.0);
                    tokio::time::sleep(backoff).await;
                    tracing::info!(process, query = %query, "starting worker again");
                }
                Err(_) => return,
            }
        }
    });
}

pub struct Pipeline {
    pub config: Arc<Config>,
    pub source: Arc<dyn LogSource>,
    pub enricher: Arc<Enricher>,
    pub evaluator: Arc<Evaluator>,
    pub collectors: Arc<MetricCollectors>,
    pub registry: Arc<QueryRegistry>,
    pub schedule_queue: Arc<ScheduleQueue>,
    pub data_queue: Arc<DataQueue>,
    pub metrics_queue: Option<Arc<MetricsQueue>>,
    pub sink: Option<Arc<dyn MetricsSink>>,
    pub monitor: Arc<SelfMonitor>,
}

impl Pipeline {
    /// Spawns every stage worker. Queue receivers are taken here, once.
    pub fn start(&self) {
        for query_name in self.config.queries.keys() {
            if let Some(receiver) = self.schedule_queue.take_receiver(query_name) {
                self.spawn_source_worker(query_name.clone(), receiver);
            }
            if let Some(receiver) = self.data_queue.take_receiver(query_name) {
                self.spawn_evaluation_worker(query_name.clone(), receiver);
            }
        }
        if let (Some(metrics_queue), Some(_)) = (&self.metrics_queue, &self.sink) {
            for query_name in self.config.queries.keys() {
                if let Some(receiver) = metrics_queue.take_receiver(query_name) {
                    self.spawn_push_worker(query_name.clone(), receiver);
                }
            }
            if let Some(receiver) = metrics_queue.take_receiver(SELF_METRICS) {
                self.spawn_push_worker(SELF_METRICS.to_string(), receiver);
            }
        }
    }

    fn spawn_source_worker(
        &self,
        query_name: String,
        receiver: QueueReceiver<chrono::DateTime<chrono::Utc>>,
    ) {
        let receiver = Arc::new(Mutex::new(receiver));
        let config = self.config.clone();
        let source = self.source.clone();
        let data_queue = self.data_queue.clone();
        let worker_query = query_name.clone();
        spawn_supervised(
            SOURCE_PROCESS,
            query_name,
            self.monitor.clone(),
            RESTART_BACKOFF,
            move || {
                let config = config.clone();
                let source = source.clone();
                let data_queue = data_queue.clone();
                let receiver = receiver.clone();
                let query_name = worker_query.clone();
                async move {
                    let query = &config.queries[&query_name];
                    let timerange = chrono::Duration::from_std(query.timerange).unwrap_or_default();
                    let mut receiver = receiver.lock().await;
                    while let Some(start) = receiver.recv().await {
                        let end = start + timerange;
                        let rows = loop {
                            match source.query(&query_name, start, end).await {
                                Ok(rows) => break rows,
                                Err(err) => {
                                    tracing::error!(
                                        error_code = err.code(),
                                        query = %query_name,
                                        %start,
                                        %end,
                                        %err,
                                        "error requesting the datasource",
                                    );
                                    if config.general.datasource_retry {
                                        tokio::time::sleep(config.general.datasource_retry_period())
                                            .await;
                                        tracing::info!(query = %query_name, "retrying the datasource request");
                                    } else {
                                        break Vec::new();
                                    }
                                }
                            }
                        };
                        data_queue
                            .put_blocking(&query_name, LogBatch { rows, start, end })
                            .await;
                    }
                }
            },
        );
    }

    fn spawn_evaluation_worker(&self, query_name: String, receiver: QueueReceiver<LogBatch>) {
        let receiver = Arc::new(Mutex::new(receiver));
        let config = self.config.clone();
        let enricher = self.enricher.clone();
        let evaluator = self.evaluator.clone();
        let collectors = self.collectors.clone();
        let registry = self.registry.clone();
        let metrics_queue = self.metrics_queue.clone();
        let worker_query = query_name.clone();
        spawn_supervised(
            EVALUATION_PROCESS,
            query_name,
            self.monitor.clone(),
            RESTART_BACKOFF,
            move || {
                let config = config.clone();
                let enricher = enricher.clone();
                let evaluator = evaluator.clone();
                let collectors = collectors.clone();
                let registry = registry.clone();
                let metrics_queue = metrics_queue.clone();
                let receiver = receiver.clone();
                let query_name = worker_query.clone();
                async move {
                    let query = &config.queries[&query_name];
                    let mut receiver = receiver.lock().await;
                    while let Some(mut batch) = receiver.recv().await {
                        enricher.enrich(&query_name, &mut batch.rows);
                        {
                            let _update = registry.begin_update();
                            for metric_name in &query.metrics {
                                let Some(result) = evaluator.evaluate(
                                    &batch.rows,
                                    metric_name,
                                    &query_name,
                                    batch.end,
                                ) else {
                                    continue;
                                };
                                if let Some(metric) = config.metrics.get(metric_name) {
                                    collectors.apply(&result.series, metric_name, metric);
                                }
                                for (child_name, child_result) in &result.children {
                                    if let Some(child) = config.metrics.get(child_name) {
                                        collectors.apply(&child_result.series, child_name, child);
                                    }
                                }
                            }
                        }
                        if let Some(metrics_queue) = &metrics_queue {
                            let families = registry.gather_query(&query_name);
                            if !families.is_empty() {
                                metrics_queue.put_blocking(&query_name, families).await;
                            }
                        }
                    }
                }
            },
        );
    }

    fn spawn_push_worker(
        &self,
        key: String,
        receiver: QueueReceiver<Vec<prometheus::proto::MetricFamily>>,
    ) {
        let receiver = Arc::new(Mutex::new(receiver));
        let config = self.config.clone();
        let Some(sink) = self.sink.clone() else {
            return;
        };
        let worker_key = key.clone();
        spawn_supervised(PUSH_PROCESS, key, self.monitor.clone(), RESTART_BACKOFF, move || {
            let config = config.clone();
            let sink = sink.clone();
            let receiver = receiver.clone();
            let key = worker_key.clone();
            async move {
                let mut receiver = receiver.lock().await;
                while let Some(mut families) = receiver.recv().await {
                    if families.is_empty() {
                        tracing::info!(key = %key, "no metric families received");
                        continue;
                    }
                    if !config.general.disable_push_cloud_labels {
                        append_cloud_labels(
                            &mut families,
                            &config.cloud,
                            &config.general.push_cloud_labels,
                        );
                    }
                    loop {
                        match sink.push(&families, &key).await {
                            Ok(()) => break,
                            Err(err) => {
                                tracing::error!(
                                    error_code = err.code(),
                                    key = %key,
                                    %err,
                                    "error pushing metrics",
                                );
                                if config.general.push_retry {
                                    tokio::time::sleep(config.general.push_retry_period()).await;
                                    tracing::info!(key = %key, "retrying the push");
                                } else {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    /// A dedicated minute cron snapshotting the self-metrics registry into
    /// the metrics queue under the reserved key. Non-blocking: losing a
    /// self-metrics snapshot is preferable to stalling.
    pub fn start_self_monitor_schedule(&self, precision: model::CronPrecision) {
        let Some(metrics_queue) = self.metrics_queue.clone() else {
            tracing::info!("no push sink configured, self-monitor scheduler disabled");
            return;
        };
        let registry = self.registry.clone();
        let schedule = match model::validation::normalize_cron("* * * * *", precision) {
            Ok(schedule) => schedule,
            Err(err) => {
                tracing::error!(error_code = codes::LME_1608, %err, "failed to schedule self-monitor snapshots");
                return;
            }
        };
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                    return;
                };
                if let Ok(wait) = (next - chrono::Utc::now()).to_std() {
                    tokio::time::sleep(wait).await;
                }
                let families = registry.gather_query(SELF_METRICS);
                if !families.is_empty() {
                    metrics_queue.put(SELF_METRICS, families);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn supervised_worker_restarts_after_a_panic() {
        let monitor = Arc::new(SelfMonitor::new(&HashMap::new(), true).unwrap());
        let attempts = Arc::new(AtomicU32::new(0));
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<u32>();
        let done_tx = Arc::new(std::sync::Mutex::new(Some(done_tx)));

        let worker_attempts = attempts.clone();
        spawn_supervised(
            "test-process",
            "test-query".to_string(),
            monitor.clone(),
            Duration::from_millis(0),
            move || {
                let attempts = worker_attempts.clone();
                let done_tx = done_tx.clone();
                async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt == 1 {
                        panic!("induced failure");
                    }
                    if let Some(done) = done_tx.lock().unwrap().take() {
                        let _ = done.send(attempt);
                    }
                }
            },
        );

        let attempt = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("worker did not restart")
            .unwrap();
        assert_eq!(attempt, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn supervised_worker_stops_on_clean_exit() {
        let monitor = Arc::new(SelfMonitor::new(&HashMap::new(), true).unwrap());
        let attempts = Arc::new(AtomicU32::new(0));
        let worker_attempts = attempts.clone();
        spawn_supervised(
            "test-process",
            "test-query".to_string(),
            monitor,
            Duration::from_millis(0),
            move || {
                let attempts = worker_attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                }
            },
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
