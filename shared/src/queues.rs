//! Bounded query-keyed queues connecting the pipeline stages.
//!
//! Each queue maps a query name to a bounded FIFO with a single producer
//! (the previous stage's worker) and a single consumer (the next stage's
//! worker, which takes ownership of the receiving end at startup). Every
//! put and get publishes the resulting depth as a `queue_size` gauge.

use crate::codes;
use crate::selfmonitor::SelfMonitor;
use chrono::{DateTime, Utc};
use prometheus::proto::MetricFamily;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub const SCHEDULE_QUEUE: &str = "ScheduleQueue";
pub const DATA_QUEUE: &str = "DataQueue";
pub const METRICS_QUEUE: &str = "MetricsQueue";

/// One query result travelling from the source stage to the evaluator.
#[derive(Debug, Clone)]
pub struct LogBatch {
    /// Header row first, data rows after it.
    pub rows: Vec<Vec<String>>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub type ScheduleQueue = QueryQueue<DateTime<Utc>>;
pub type DataQueue = QueryQueue<LogBatch>;
pub type MetricsQueue = QueryQueue<Vec<MetricFamily>>;

pub struct QueryQueue<T> {
    name: &'static str,
    monitor: Arc<SelfMonitor>,
    senders: RwLock<HashMap<String, mpsc::Sender<T>>>,
    receivers: Mutex<HashMap<String, QueueReceiver<T>>>,
    depths: HashMap<String, Arc<AtomicUsize>>,
}

impl<T: Send + 'static> QueryQueue<T> {
    pub fn new(
        name: &'static str,
        sizes: impl IntoIterator<Item = (String, usize)>,
        monitor: Arc<SelfMonitor>,
    ) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut depths = HashMap::new();
        for (query, capacity) in sizes {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            let depth = Arc::new(AtomicUsize::new(0));
            tracing::info!(queue = name, query = %query, capacity, "queue created");
            senders.insert(query.clone(), tx);
            receivers.insert(
                query.clone(),
                QueueReceiver {
                    rx,
                    depth: depth.clone(),
                    queue: name,
                    query: query.clone(),
                    monitor: monitor.clone(),
                },
            );
            depths.insert(query, depth);
        }
        Self {
            name,
            monitor,
            senders: RwLock::new(senders),
            receivers: Mutex::new(receivers),
            depths,
        }
    }

    /// Non-blocking put. Returns false when the value was dropped because
    /// the queue is full, closed or does not exist.
    pub fn put(&self, query: &str, value: T) -> bool {
        let senders = self.senders.read().unwrap();
        let Some(sender) = senders.get(query) else {
            tracing::error!(
                error_code = codes::LME_1624,
                queue = self.name,
                query,
                "attempt to put to a non-existent queue",
            );
            return false;
        };
        match sender.try_send(value) {
            Ok(()) => {
                self.publish_depth(query, 1);
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::error!(
                    error_code = codes::LME_1625,
                    queue = self.name,
                    query,
                    "attempt to put to a full queue, value dropped",
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::error!(
                    error_code = codes::LME_1622,
                    queue = self.name,
                    query,
                    "attempt to put to a closed queue",
                );
                false
            }
        }
    }

    /// Blocking put: waits for capacity. A stalled consumer stalls the
    /// producer on purpose; dropping data is considered worse here.
    pub async fn put_blocking(&self, query: &str, value: T) {
        let sender = {
            let senders = self.senders.read().unwrap();
            match senders.get(query) {
                Some(sender) => sender.clone(),
                None => {
                    tracing::error!(
                        error_code = codes::LME_1624,
                        queue = self.name,
                        query,
                        "attempt to put to a non-existent queue",
                    );
                    return;
                }
            }
        };
        if sender.send(value).await.is_err() {
            tracing::error!(
                error_code = codes::LME_1622,
                queue = self.name,
                query,
                "attempt to put to a closed queue",
            );
            return;
        }
        self.publish_depth(query, 1);
    }

    /// Hands the consuming end to the stage worker. Each receiver can be
    /// taken exactly once.
    pub fn take_receiver(&self, query: &str) -> Option<QueueReceiver<T>> {
        self.receivers.lock().unwrap().remove(query)
    }

    /// Closes the queue for the given query; pending gets drain the
    /// remaining items and then observe the closed state.
    pub fn close(&self, query: &str) {
        tracing::info!(queue = self.name, query, "queue closed");
        self.senders.write().unwrap().remove(query);
    }

    fn publish_depth(&self, query: &str, added: usize) {
        if let Some(depth) = self.depths.get(query) {
            let size = depth.fetch_add(added, Ordering::Relaxed) + added;
            self.monitor.set_queue_size(query, self.name, size);
        }
    }
}

pub struct QueueReceiver<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
    queue: &'static str,
    query: String,
    monitor: Arc<SelfMonitor>,
}

impl<T> QueueReceiver<T> {
    /// Blocks until an item is available. Returns None once the queue is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        match self.rx.recv().await {
            Some(value) => {
                let size = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
                self.monitor.set_queue_size(&self.query, self.queue, size);
                Some(value)
            }
            None => {
                tracing::error!(
                    error_code = codes::LME_1621,
                    queue = self.queue,
                    query = %self.query,
                    "queue is closed, stopping consumer",
                );
                None
            }
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> QueryQueue<u64> {
        let monitor = Arc::new(SelfMonitor::new(&HashMap::new(), true).unwrap());
        QueryQueue::new(
            SCHEDULE_QUEUE,
            [("requests".to_string(), capacity)],
            monitor,
        )
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let queue = queue(4);
        assert!(queue.put("requests", 7));
        let mut receiver = queue.take_receiver("requests").unwrap();
        assert_eq!(receiver.recv().await, Some(7));
    }

    #[tokio::test]
    async fn non_blocking_put_drops_when_full() {
        let queue = queue(2);
        assert!(queue.put("requests", 1));
        assert!(queue.put("requests", 2));
        assert!(!queue.put("requests", 3));

        let mut receiver = queue.take_receiver("requests").unwrap();
        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, Some(2));
    }

    #[tokio::test]
    async fn put_to_unknown_query_is_dropped() {
        let queue = queue(2);
        assert!(!queue.put("unknown", 1));
    }

    #[tokio::test]
    async fn close_drains_then_signals_end() {
        let queue = queue(2);
        assert!(queue.put("requests", 1));
        queue.close("requests");
        let mut receiver = queue.take_receiver("requests").unwrap();
        assert_eq!(receiver.recv().await, Some(1));
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn receiver_can_be_taken_only_once() {
        let queue = queue(1);
        assert!(queue.take_receiver("requests").is_some());
        assert!(queue.take_receiver("requests").is_none());
    }

    #[tokio::test]
    async fn blocking_put_waits_for_capacity() {
        let queue = Arc::new(queue(1));
        queue.put("requests", 1);
        let mut receiver = queue.take_receiver("requests").unwrap();
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put_blocking("requests", 2).await })
        };
        assert_eq!(receiver.recv().await, Some(1));
        producer.await.unwrap();
        assert_eq!(receiver.recv().await, Some(2));
    }
}
