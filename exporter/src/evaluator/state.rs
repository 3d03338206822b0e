//! Per-metric label-set memory.
//!
//! Every label set a metric has ever produced (or is expected to produce,
//! via `expected-labels`) is remembered for the process lifetime so that
//! batches without a matching row can still emit default series.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub type Labels = HashMap<String, String>;

/// Maps the ordered-label-value string of a series to its label set.
#[derive(Default)]
pub struct MetricState {
    inner: RwLock<HashMap<String, Labels>>,
}

impl MetricState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Labels> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: String, labels: Labels) {
        self.inner.write().unwrap().insert(key, labels);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// All metric states keyed by metric name.
#[derive(Default)]
pub struct MonitoringState {
    inner: RwLock<HashMap<String, Arc<MetricState>>>,
}

impl MonitoringState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, metric: &str) -> Arc<MetricState> {
        if let Some(state) = self.inner.read().unwrap().get(metric) {
            return state.clone();
        }
        let mut inner = self.inner.write().unwrap();
        inner.entry(metric.to_string()).or_default().clone()
    }
}

/// The ordered-label-value string of a label set: values joined by `;` in
/// the metric's configured label order.
pub fn olv_from_labels(labels: &Labels, label_order: &[String]) -> String {
    label_order
        .iter()
        .map(|name| labels.get(name).map(String::as_str).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(";")
}

/// Cartesian product of an `expected-labels` entry, label names sorted for
/// a deterministic order.
pub fn labels_cartesian(expected: &HashMap<String, Vec<String>>) -> Vec<Labels> {
    let mut names: Vec<&String> = expected.keys().collect();
    names.sort();
    let sizes: Vec<usize> = names.iter().map(|name| expected[*name].len()).collect();
    if sizes.iter().any(|&size| size == 0) {
        return Vec::new();
    }

    let mut indexes = vec![0usize; names.len()];
    let mut result = Vec::new();
    loop {
        let labels: Labels = names
            .iter()
            .zip(&indexes)
            .map(|(name, &index)| ((*name).clone(), expected[*name][index].clone()))
            .collect();
        result.push(labels);
        if increment_indexes(&mut indexes, &sizes) {
            return result;
        }
    }
}

/// Advances a mixed-radix counter; returns true on wrap-around.
pub fn increment_indexes(indexes: &mut [usize], sizes: &[usize]) -> bool {
    for position in 0..indexes.len() {
        indexes[position] += 1;
        if indexes[position] < sizes[position] {
            return false;
        }
        if position == indexes.len() - 1 {
            return true;
        }
        indexes[position] = 0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn state_remembers_label_sets() {
        let state = MetricState::new();
        assert!(state.get("a;b").is_none());
        state.set("a;b".to_string(), hashmap! {"l1".to_string() => "a".to_string()});
        assert_eq!(state.get("a;b").unwrap()["l1"], "a");
        assert_eq!(state.keys(), vec!["a;b".to_string()]);
    }

    #[test]
    fn olv_follows_configured_label_order() {
        let labels = hashmap! {
            "second".to_string() => "2".to_string(),
            "first".to_string() => "1".to_string(),
        };
        let order = vec!["first".to_string(), "second".to_string()];
        assert_eq!(olv_from_labels(&labels, &order), "1;2");
    }

    #[test]
    fn cartesian_covers_all_combinations() {
        let expected = hashmap! {
            "code".to_string() => vec!["200".to_string(), "500".to_string()],
            "method".to_string() => vec!["GET".to_string(), "POST".to_string(), "PUT".to_string()],
        };
        let combinations = labels_cartesian(&expected);
        assert_eq!(combinations.len(), 6);
        assert!(combinations.iter().any(|labels| labels["code"] == "500" && labels["method"] == "PUT"));
    }

    #[test]
    fn cartesian_of_empty_value_list_is_empty() {
        let expected = hashmap! {
            "code".to_string() => Vec::<String>::new(),
        };
        assert!(labels_cartesian(&expected).is_empty());
    }

    #[test]
    fn increment_indexes_wraps_at_the_end() {
        let sizes = [2, 3, 2];
        let mut indexes = [0, 0, 0];
        assert!(!increment_indexes(&mut indexes, &sizes));
        assert_eq!(indexes, [1, 0, 0]);

        let mut last = [1, 2, 1];
        assert!(increment_indexes(&mut last, &sizes));
    }
}
