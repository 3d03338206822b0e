//! Timestamp production: a cron ticker per query plus a one-shot history
//! backfill driven by the downstream TSDB's last published sample.

use chrono::{DateTime, SubsecRound, Utc};
use model::{validation::normalize_cron, Config, CronPrecision, QueryConfig};
use shared::codes;
use shared::queues::ScheduleQueue;
use shared::sources::LastTimestampClient;
use std::sync::Arc;
use std::time::Duration;

pub struct Scheduler {
    config: Arc<Config>,
    precision: CronPrecision,
    schedule_queue: Arc<ScheduleQueue>,
    last_timestamp: Option<Arc<LastTimestampClient>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        precision: CronPrecision,
        schedule_queue: Arc<ScheduleQueue>,
        last_timestamp: Option<Arc<LastTimestampClient>>,
    ) -> Self {
        Self { config, precision, schedule_queue, last_timestamp }
    }

    /// Spawns one task per query: history backfill first (when a
    /// last-timestamp service is configured), then the cron ticker. A
    /// backfill failure only affects its own query.
    pub fn start(self: &Arc<Self>) {
        for query_name in self.config.queries.keys() {
            let scheduler = self.clone();
            let query_name = query_name.clone();
            tokio::spawn(async move {
                scheduler.run_backfill(&query_name).await;
                scheduler.run_ticker(&query_name).await;
            });
        }
    }

    async fn run_ticker(&self, query_name: &str) {
        let query = &self.config.queries[query_name];
        let schedule = match normalize_cron(&query.croniter, self.precision) {
            Ok(schedule) => schedule,
            Err(err) => {
                tracing::error!(
                    error_code = codes::LME_1608,
                    query = query_name,
                    %err,
                    "failed to register query in the cron scheduler",
                );
                self.schedule_queue.close(query_name);
                return;
            }
        };
        tracing::info!(query = query_name, cron = %query.croniter, "query registered in the cron scheduler");

        let window_shift = query.query_lag() + query.timerange;
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::error!(
                    error_code = codes::LME_1608,
                    query = query_name,
                    "cron expression has no upcoming fire times",
                );
                self.schedule_queue.close(query_name);
                return;
            };
            let wait = next - Utc::now();
            if let Ok(wait) = wait.to_std() {
                tokio::time::sleep(wait).await;
            }
            let current = Utc::now().round_subsecs(0);
            let start = current - chrono::Duration::from_std(window_shift).unwrap_or_default();
            tracing::debug!(query = query_name, %start, %current, "cron tick");
            // a full queue means the pipeline is behind and the tick is
            // redundant; the non-blocking put drops it on purpose
            self.schedule_queue.put(query_name, start);
        }
    }

    async fn run_backfill(&self, query_name: &str) {
        let Some(client) = &self.last_timestamp else {
            return;
        };
        let query = &self.config.queries[query_name];
        let Some(interval) = query.interval.filter(|interval| !interval.is_zero()) else {
            tracing::error!(
                error_code = codes::LME_8102,
                query = query_name,
                "interval is not set, history will not be processed",
            );
            return;
        };
        let Some(max_lookup) = query.max_history_lookup.filter(|lookup| !lookup.is_zero()) else {
            tracing::error!(
                error_code = codes::LME_8102,
                query = query_name,
                "max-history-lookup is not set, history will not be processed",
            );
            return;
        };

        let retry_count = self.config.general.lts_retry_count();
        let retry_period = self.config.general.lts_retry_period();
        let mut last_error = None;
        let mut unix_time = None;
        for attempt in 1..=retry_count {
            match client.last_timestamp(query_name, query).await {
                Ok(seconds) => {
                    tracing::info!(query = query_name, attempt, "last timestamp extracted");
                    unix_time = Some(seconds);
                    break;
                }
                Err(err) if err.retryable() => {
                    tracing::warn!(query = query_name, attempt, %err, "last timestamp attempt failed");
                    last_error = Some(err);
                    tokio::time::sleep(retry_period).await;
                }
                Err(err) => {
                    tracing::warn!(query = query_name, attempt, %err, "retry is not possible");
                    last_error = Some(err);
                    break;
                }
            }
        }
        let Some(unix_time) = unix_time else {
            if let Some(err) = last_error {
                tracing::error!(
                    error_code = err.code(),
                    query = query_name,
                    %err,
                    "history will not be processed",
                );
            }
            return;
        };

        let Some(last_timestamp) = DateTime::from_timestamp(unix_time, 0) else {
            tracing::error!(
                error_code = codes::LME_7134,
                query = query_name,
                unix_time,
                "last timestamp is out of range",
            );
            return;
        };
        if last_timestamp > Utc::now() {
            tracing::error!(
                error_code = codes::LME_7130,
                query = query_name,
                "last timestamp is in the future, history will not be processed",
            );
            return;
        }

        let next_fire = match normalize_cron(&query.croniter, self.precision) {
            Ok(schedule) => match schedule.upcoming(Utc).next() {
                Some(next) => next,
                None => return,
            },
            Err(err) => {
                tracing::error!(
                    error_code = codes::LME_1608,
                    query = query_name,
                    %err,
                    "history will be skipped",
                );
                return;
            }
        };

        let timestamps = history_timestamps(
            last_timestamp,
            next_fire,
            query,
            interval,
            max_lookup,
            query.schedule_queue_size(),
        );
        tracing::info!(
            query = query_name,
            count = timestamps.len(),
            "enqueueing history timestamps",
        );
        for timestamp in timestamps {
            self.schedule_queue.put_blocking(query_name, timestamp).await;
        }
    }
}

/// Computes the backfill plan: monotonically increasing timestamps stepping
/// by `interval`, ending one interval before the window start of the next
/// cron fire, spanning at most `max_lookup` and at most the schedule
/// queue's capacity.
pub fn history_timestamps(
    last_timestamp: DateTime<Utc>,
    next_fire: DateTime<Utc>,
    query: &QueryConfig,
    interval: Duration,
    max_lookup: Duration,
    capacity: usize,
) -> Vec<DateTime<Utc>> {
    let window_shift =
        chrono::Duration::from_std(query.query_lag() + query.timerange).unwrap_or_default();
    let next_window_start = next_fire - window_shift;
    let mut span = next_window_start - last_timestamp;
    let max_lookup = chrono::Duration::from_std(max_lookup).unwrap_or_default();
    if span > max_lookup {
        span = max_lookup;
    }
    let interval = match chrono::Duration::from_std(interval) {
        Ok(interval) if interval > chrono::Duration::zero() => interval,
        _ => return Vec::new(),
    };

    let mut size = span.num_nanoseconds().unwrap_or(0) / interval.num_nanoseconds().unwrap_or(1);
    if size > capacity as i64 {
        size = capacity as i64;
    }
    if size <= 0 {
        return Vec::new();
    }

    let first = next_window_start - interval * (size as i32);
    (0..size).map(|step| first + interval * (step as i32)).collect()
}
