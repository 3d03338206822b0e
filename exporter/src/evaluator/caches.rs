//! Correlation caches: fixed-length rings of per-batch maps.
//!
//! Each evaluation shifts the ring one slot toward the tail and installs a
//! fresh batch at index 0; the slot falling off the end is dropped. The
//! small fixed K (typically well under 60) makes a manual shift simpler to
//! reason about than any eviction policy.

use model::{Config, Operation};
use shared::codes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

const DEFAULT_NO_RESPONSE_CACHE_SIZE: usize = 30;

/// Ring of `correlation-id -> request-time-ms` batches for one named cache.
pub struct RequestTimeCache {
    ring: RwLock<Vec<HashMap<String, i64>>>,
}

impl RequestTimeCache {
    pub fn new(size: usize) -> Self {
        Self { ring: RwLock::new(vec![HashMap::new(); size.max(1)]) }
    }

    /// Shifts the ring right and installs the batch at index 0.
    pub fn put_batch(&self, batch: HashMap<String, i64>) {
        let mut ring = self.ring.write().unwrap();
        ring.pop();
        ring.insert(0, batch);
    }

    /// Searches every slot, newest first.
    pub fn lookup(&self, correlation_id: &str) -> Option<i64> {
        let ring = self.ring.read().unwrap();
        for batch in ring.iter() {
            if let Some(&time) = batch.get(correlation_id) {
                if time != 0 {
                    return Some(time);
                }
            }
        }
        None
    }

    /// Total number of cached requests across all slots.
    pub fn size(&self) -> usize {
        self.ring.read().unwrap().iter().map(HashMap::len).sum()
    }
}

pub struct RequestTimeCacheRepo {
    caches: HashMap<String, HashMap<String, Arc<RequestTimeCache>>>,
}

impl RequestTimeCacheRepo {
    pub fn new(config: &Config) -> Self {
        let mut caches: HashMap<String, HashMap<String, Arc<RequestTimeCache>>> = HashMap::new();
        for (query_name, query) in &config.queries {
            for (cache_name, cache_config) in &query.caches {
                tracing::info!(
                    query = %query_name,
                    cache = %cache_name,
                    size = cache_config.size,
                    "request time cache created",
                );
                caches
                    .entry(query_name.clone())
                    .or_default()
                    .insert(cache_name.clone(), Arc::new(RequestTimeCache::new(cache_config.size)));
            }
        }
        Self { caches }
    }

    pub fn get(&self, query: &str, cache_name: &str) -> Option<Arc<RequestTimeCache>> {
        self.caches.get(query)?.get(cache_name).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct NoResponseEntry {
    pub time: i64,
    pub olv: String,
    pub has_response: bool,
}

/// One evaluation's worth of still-unanswered requests.
#[derive(Debug, Default)]
pub struct NoResponseBatch {
    entries: HashMap<String, NoResponseEntry>,
}

impl NoResponseBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, correlation_id: String, time: i64, olv: String) {
        self.entries.insert(correlation_id, NoResponseEntry { time, olv, has_response: false });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ring of [`NoResponseBatch`]es. A response arriving in a later batch
/// flips `has_response` in place wherever the request still lives.
pub struct NoResponseCache {
    ring: RwLock<Vec<Option<NoResponseBatch>>>,
}

impl NoResponseCache {
    pub fn new(size: usize) -> Self {
        let mut ring = Vec::with_capacity(size.max(1));
        ring.resize_with(size.max(1), || None);
        Self { ring: RwLock::new(ring) }
    }

    pub fn mark_has_response(&self, correlation_id: &str) {
        let mut ring = self.ring.write().unwrap();
        for batch in ring.iter_mut().flatten() {
            if let Some(entry) = batch.entries.get_mut(correlation_id) {
                tracing::debug!(correlation_id, "request found in cache, marking as answered");
                entry.has_response = true;
                return;
            }
        }
        tracing::debug!(correlation_id, "request not found in no-response cache");
    }

    /// Per-OLV counts of unanswered requests in the slot about to fall off
    /// the ring: these aged out of the correlation horizon.
    pub fn count_no_response_in_last_batch(&self) -> HashMap<String, u64> {
        let ring = self.ring.read().unwrap();
        let mut result = HashMap::new();
        if let Some(Some(batch)) = ring.last() {
            for entry in batch.entries.values() {
                if !entry.has_response {
                    *result.entry(entry.olv.clone()).or_insert(0) += 1;
                }
            }
        }
        result
    }

    pub fn put_batch(&self, batch: NoResponseBatch) {
        let mut ring = self.ring.write().unwrap();
        ring.pop();
        ring.insert(0, Some(batch));
    }

    pub fn size(&self) -> usize {
        self.ring.read().unwrap().iter().flatten().map(NoResponseBatch::len).sum()
    }
}

pub struct NoResponseCacheRepo {
    caches: HashMap<String, Arc<NoResponseCache>>,
}

impl NoResponseCacheRepo {
    pub fn new(config: &Config) -> Self {
        let mut caches = HashMap::new();
        for (metric_name, metric) in &config.metrics {
            if metric.operation != Operation::DurationNoResponse {
                continue;
            }
            let size = match metric.parameter("cache_size").map(str::parse::<usize>) {
                Some(Ok(size)) if size >= 1 => size,
                Some(_) => {
                    tracing::error!(
                        error_code = codes::LME_8104,
                        metric = %metric_name,
                        "invalid cache_size parameter, default 30 is used",
                    );
                    DEFAULT_NO_RESPONSE_CACHE_SIZE
                }
                None => DEFAULT_NO_RESPONSE_CACHE_SIZE,
            };
            caches.insert(metric_name.clone(), Arc::new(NoResponseCache::new(size)));
        }
        Self { caches }
    }

    pub fn get(&self, metric: &str) -> Option<Arc<NoResponseCache>> {
        self.caches.get(metric).cloned()
    }
}

/// Two-generation id cache backing `id-field` deduplication. When the age
/// reaches the TTL the current generation rotates into the previous one.
pub struct IdFieldCache {
    inner: Mutex<IdFieldCacheInner>,
}

struct IdFieldCacheInner {
    metric: String,
    max_ttl: u32,
    age: u32,
    current: HashSet<String>,
    previous: HashSet<String>,
    olv_current: HashMap<String, HashSet<String>>,
    olv_previous: HashMap<String, HashSet<String>>,
}

impl IdFieldCache {
    pub fn new(ttl: u32, metric: &str) -> Self {
        Self {
            inner: Mutex::new(IdFieldCacheInner {
                metric: metric.to_string(),
                max_ttl: if ttl == 0 { model::config::DEFAULT_ID_FIELD_TTL } else { ttl },
                age: 0,
                current: HashSet::new(),
                previous: HashSet::new(),
                olv_current: HashMap::new(),
                olv_previous: HashMap::new(),
            }),
        }
    }

    /// Marks the id as seen and reports whether it was already known in
    /// either generation.
    pub fn is_used(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.current.insert(id.to_string()) {
            inner.previous.contains(id)
        } else {
            true
        }
    }

    /// Like [`Self::is_used`] but scoped to one ordered-label-value string.
    pub fn is_used_for_olv(&self, id: &str, olv: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let fresh = inner
            .olv_current
            .entry(olv.to_string())
            .or_default()
            .insert(id.to_string());
        if fresh {
            inner
                .olv_previous
                .get(olv)
                .map(|ids| ids.contains(id))
                .unwrap_or(false)
        } else {
            true
        }
    }

    /// Advances the generation age; called once per evaluation.
    pub fn inc_age(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.age += 1;
        if inner.age >= inner.max_ttl {
            tracing::info!(
                metric = %inner.metric,
                current = inner.current.len(),
                previous = inner.previous.len(),
                "id field cache generation shift",
            );
            inner.age = 0;
            inner.previous = std::mem::take(&mut inner.current);
            inner.olv_previous = std::mem::take(&mut inner.olv_current);
        }
    }
}

pub struct IdFieldCacheRepo {
    caches: RwLock<HashMap<String, Arc<IdFieldCache>>>,
}

impl IdFieldCacheRepo {
    pub fn new(config: &Config) -> Self {
        let mut caches = HashMap::new();
        for (metric_name, metric) in &config.metrics {
            if metric.id_field.is_some() {
                caches.insert(
                    metric_name.clone(),
                    Arc::new(IdFieldCache::new(metric.id_field_ttl(), metric_name)),
                );
            }
        }
        Self { caches: RwLock::new(caches) }
    }

    pub fn get_or_create(&self, metric: &str) -> Arc<IdFieldCache> {
        if let Some(cache) = self.caches.read().unwrap().get(metric) {
            return cache.clone();
        }
        let mut caches = self.caches.write().unwrap();
        caches
            .entry(metric.to_string())
            .or_insert_with(|| Arc::new(IdFieldCache::new(model::config::DEFAULT_ID_FIELD_TTL, metric)))
            .clone()
    }
}
