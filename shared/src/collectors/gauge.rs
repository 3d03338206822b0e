use super::{label_pairs, new_desc, series_key, Labels};
use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Last-write-wins gauge keyed by label set. NaN is a legal stored value;
/// the evaluator uses it to mark series that were absent from a batch.
#[derive(Clone)]
pub struct CustomGauge {
    core: Arc<Core>,
}

struct Core {
    desc: Desc,
    state: RwLock<HashMap<String, Series>>,
}

struct Series {
    labels: Labels,
    value: f64,
    timestamp_ms: Option<i64>,
}

impl CustomGauge {
    pub fn new(
        name: &str,
        help: &str,
        variable_labels: &[String],
        const_labels: HashMap<String, String>,
    ) -> prometheus::Result<Self> {
        Ok(Self {
            core: Arc::new(Core {
                desc: new_desc(name, help, variable_labels, const_labels)?,
                state: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn set(&self, value: f64, labels: &Labels, timestamp: Option<DateTime<Utc>>) {
        let key = series_key(labels);
        let mut state = self.core.state.write().unwrap();
        state.insert(
            key,
            Series {
                labels: labels.clone(),
                value,
                timestamp_ms: timestamp.map(|ts| ts.timestamp_millis()),
            },
        );
    }
}

impl Collector for CustomGauge {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.core.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let state = self.core.state.read().unwrap();
        if state.is_empty() {
            return Vec::new();
        }
        let mut keys: Vec<&String> = state.keys().collect();
        keys.sort();
        let mut family = proto::MetricFamily::new();
        family.set_name(self.core.desc.fq_name.clone());
        family.set_help(self.core.desc.help.clone());
        family.set_field_type(proto::MetricType::GAUGE);
        for key in keys {
            let series = &state[key];
            let mut metric = proto::Metric::new();
            for pair in label_pairs(&self.core.desc, &series.labels) {
                metric.mut_label().push(pair);
            }
            let mut gauge = proto::Gauge::new();
            gauge.set_value(series.value);
            metric.set_gauge(gauge);
            if let Some(timestamp_ms) = series.timestamp_ms {
                metric.set_timestamp_ms(timestamp_ms);
            }
            family.mut_metric().push(metric);
        }
        vec![family]
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::single_metric;
    use super::*;
    use maplit::hashmap;

    fn gauge() -> CustomGauge {
        CustomGauge::new(
            "test_gauge",
            "test gauge",
            &["label1".to_string(), "label2".to_string()],
            HashMap::new(),
        )
        .unwrap()
    }

    fn labels() -> Labels {
        hashmap! {
            "label1".to_string() => "value1".to_string(),
            "label2".to_string() => "value2".to_string(),
        }
    }

    #[test]
    fn set_overwrites_previous_value() {
        let gauge = gauge();
        gauge.set(3.0, &labels(), None);
        gauge.set(15.5, &labels(), None);
        let metric = single_metric(&gauge);
        assert_eq!(metric.get_gauge().get_value(), 15.5);
    }

    #[test]
    fn timestamp_is_attached_when_provided() {
        let gauge = gauge();
        let now = Utc::now();
        gauge.set(20.0, &labels(), Some(now));
        let metric = single_metric(&gauge);
        assert_eq!(metric.get_timestamp_ms(), now.timestamp_millis());
    }

    #[test]
    fn nan_values_are_stored() {
        let gauge = gauge();
        gauge.set(f64::NAN, &labels(), None);
        let metric = single_metric(&gauge);
        assert!(metric.get_gauge().get_value().is_nan());
    }
}
