use super::{label_pairs, new_desc, series_key, Labels};
use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Cumulative counter keyed by label set. `add` accumulates into the stored
/// total; the collected sample always carries the cumulative value and, when
/// given, the timestamp of the last update.
#[derive(Clone)]
pub struct CustomCounter {
    core: Arc<Core>,
}

struct Core {
    desc: Desc,
    state: RwLock<HashMap<String, Series>>,
}

struct Series {
    labels: Labels,
    total: f64,
    timestamp_ms: Option<i64>,
}

impl CustomCounter {
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

    pub fn add(&self, delta: f64, labels: &Labels, timestamp: Option<DateTime<Utc>>) {
        let key = series_key(labels);
        let mut state = self.core.state.write().unwrap();
        let series = state.entry(key).or_insert_with(|| Series {
            labels: labels.clone(),
            total: 0.0,
            timestamp_ms: None,
        });
        series.total += delta;
        series.timestamp_ms = timestamp.map(|ts| ts.timestamp_millis());
    }
}

impl Collector for CustomCounter {
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
        family.set_field_type(proto::MetricType::COUNTER);
        for key in keys {
            let series = &state[key];
            let mut metric = proto::Metric::new();
            for pair in label_pairs(&self.core.desc, &series.labels) {
                metric.mut_label().push(pair);
            }
            let mut counter = proto::Counter::new();
            counter.set_value(series.total);
            metric.set_counter(counter);
            if let Some(timestamp_ms) = series.timestamp_ms {
                metric.set_timestamp_ms(timestamp_ms);
            }
            family.mut_metric().push(metric);
        }
        vec![family]
    }
}
