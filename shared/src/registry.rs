//! Per-query collector registries.
//!
//! Every query owns one sub-registry; the exporter's own metrics live in a
//! dedicated one under [`crate::SELF_METRICS`]. Partitioning keeps push
//! snapshots per query cheap and isolates collector failures.

use crate::codes;
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct QueryRegistry {
    registries: HashMap<String, Registry>,
    /// Guards the atomic-per-batch view: the evaluator holds the write side
    /// while mutating collectors and snapshotting, gathers hold the read
    /// side.
    update_lock: RwLock<()>,
}

impl QueryRegistry {
    /// Creates one sub-registry per query plus the self-metrics registry.
    pub fn new<'a>(query_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut registries: HashMap<String, Registry> = query_names
            .into_iter()
            .map(|name| (name.to_string(), Registry::new()))
            .collect();
        registries.insert(crate::SELF_METRICS.to_string(), Registry::new());
        Self { registries, update_lock: RwLock::new(()) }
    }

    /// Attaches a collector to the named sub-registry. Registering against
    /// an unknown query is a logged error, never a panic.
    pub fn register(&self, query: &str, collector: Box<dyn Collector>) -> prometheus::Result<()> {
        match self.registries.get(query) {
            Some(registry) => registry.register(collector),
            None => {
                tracing::error!(
                    error_code = codes::LME_1604,
                    query,
                    "can not register collector: registry does not exist",
                );
                Ok(())
            }
        }
    }

    /// Concatenates the gather output of every sub-registry.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let _read = self.update_lock.read().unwrap();
        let mut result = Vec::new();
        for registry in self.registries.values() {
            result.extend(registry.gather());
        }
        result
    }

    /// Snapshots a single sub-registry. The families are freshly built by
    /// each collector, so the caller owns an independent copy.
    pub fn gather_query(&self, query: &str) -> Vec<MetricFamily> {
        let _read = self.update_lock.read().unwrap();
        match self.registries.get(query) {
            Some(registry) => registry.gather(),
            None => {
                tracing::error!(
                    error_code = codes::LME_1005,
                    query,
                    "can not gather: registry does not exist",
                );
                Vec::new()
            }
        }
    }

    /// Taken by the evaluation stage around collector mutation and the
    /// follow-up snapshot so pull-mode gathers never observe a half-written
    /// batch.
    pub fn begin_update(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.update_lock.write().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CustomCounter;
    use maplit::hashmap;

    #[test]
    fn gather_aggregates_all_sub_registries() {
        let registry = QueryRegistry::new(["first", "second"]);
        let first = CustomCounter::new("first_total", "first", &[], HashMap::new()).unwrap();
        let second = CustomCounter::new("second_total", "second", &[], HashMap::new()).unwrap();
        first.add(1.0, &HashMap::new(), None);
        second.add(2.0, &HashMap::new(), None);
        registry.register("first", Box::new(first)).unwrap();
        registry.register("second", Box::new(second)).unwrap();

        let families = registry.gather();
        let mut names: Vec<&str> = families.iter().map(|family| family.get_name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["first_total", "second_total"]);
    }

    #[test]
    fn gather_query_is_scoped_to_one_registry() {
        let registry = QueryRegistry::new(["first", "second"]);
        let counter = CustomCounter::new(
            "scoped_total",
            "scoped",
            &["code".to_string()],
            HashMap::new(),
        )
        .unwrap();
        counter.add(1.0, &hashmap! {"code".to_string() => "200".to_string()}, None);
        registry.register("first", Box::new(counter)).unwrap();

        assert_eq!(registry.gather_query("first").len(), 1);
        assert!(registry.gather_query("second").is_empty());
        assert!(registry.gather_query("unknown").is_empty());
    }

    #[test]
    fn register_against_unknown_query_is_not_fatal() {
        let registry = QueryRegistry::new(["only"]);
        let counter = CustomCounter::new("lost_total", "lost", &[], HashMap::new()).unwrap();
        registry.register("unknown", Box::new(counter)).unwrap();
        assert!(registry.gather_query("unknown").is_empty());
    }
}
