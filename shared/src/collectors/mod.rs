//! Label-set-keyed collectors backing every exported metric.
//!
//! Unlike the stock prometheus vectors these keep the full history of label
//! sets ever observed, accept pre-aggregated histogram batches and can
//! attach an explicit timestamp to every stored sample, which the push
//! exporters rely on for backfilled batches.

mod counter;
mod gauge;
mod histogram;

pub use counter::CustomCounter;
pub use gauge::CustomGauge;
pub use histogram::CustomHistogram;

use prometheus::core::Desc;
use prometheus::proto;
use std::collections::HashMap;

pub type Labels = HashMap<String, String>;

/// Key identifying a series inside a collector: label pairs sorted by name.
pub(crate) fn series_key(labels: &Labels) -> String {
    let mut names: Vec<&String> = labels.keys().collect();
    names.sort();
    let mut key = String::new();
    for name in names {
        key.push_str(name);
        key.push_str("=\"");
        key.push_str(&labels[name]);
        key.push_str("\",");
    }
    key
}

/// Builds the label pairs of one stored series: const labels from the
/// descriptor plus the projection of `labels` onto the variable label names,
/// sorted by label name as the exposition format expects.
pub(crate) fn label_pairs(desc: &Desc, labels: &Labels) -> Vec<proto::LabelPair> {
    let mut pairs: Vec<proto::LabelPair> = desc.const_label_pairs.to_vec();
    for name in &desc.variable_labels {
        let mut pair = proto::LabelPair::new();
        pair.set_name(name.clone());
        pair.set_value(labels.get(name).cloned().unwrap_or_default());
        pairs.push(pair);
    }
    pairs.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    pairs
}

pub(crate) fn new_desc(
    name: &str,
    help: &str,
    variable_labels: &[String],
    const_labels: HashMap<String, String>,
) -> prometheus::Result<Desc> {
    let help = if help.is_empty() { name } else { help };
    Desc::new(name.to_string(), help.to_string(), variable_labels.to_vec(), const_labels)
}

#[cfg(test)]
pub(crate) mod testutil {
    use prometheus::core::Collector;
    use prometheus::proto;

    /// The single family a collector produces, with its metrics.
    pub fn collect_family(collector: &dyn Collector) -> proto::MetricFamily {
        let mut families = collector.collect();
        assert_eq!(families.len(), 1);
        families.remove(0)
    }

    pub fn single_metric(collector: &dyn Collector) -> proto::Metric {
        let family = collect_family(collector);
        assert_eq!(family.get_metric().len(), 1);
        family.get_metric()[0].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    #[test]
    fn series_key_is_order_insensitive() {
        let first = hashmap! {"b".to_string() => "2".to_string(), "a".to_string() => "1".to_string()};
        let second = hashmap! {"a".to_string() => "1".to_string(), "b".to_string() => "2".to_string()};
        assert_eq!(series_key(&first), series_key(&second));
        assert_eq!(series_key(&first), "a=\"1\",b=\"2\",");
    }

    #[test]
    fn label_pairs_are_sorted_and_projected() {
        let desc = new_desc(
            "test_metric",
            "help",
            &["zeta".to_string(), "alpha".to_string()],
            hashmap! {"middle".to_string() => "m".to_string()},
        )
        .unwrap();
        let labels = hashmap! {
            "zeta".to_string() => "z".to_string(),
            "alpha".to_string() => "a".to_string(),
            "ignored".to_string() => "x".to_string(),
        };
        let pairs = label_pairs(&desc, &labels);
        let names: Vec<&str> = pairs.iter().map(|pair| pair.get_name()).collect();
        assert_eq!(names, vec!["alpha", "middle", "zeta"]);
    }
}
