use super::{label_pairs, new_desc, series_key, Labels};
use chrono::{DateTime, Utc};
use prometheus::core::{Collector, Desc};
use prometheus::proto;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Histogram keyed by label set with two observation paths.
///
/// `observe` merges a pre-aggregated batch: the caller-supplied bucket
/// counts are trusted to be cumulative and are added bound-by-bound.
/// `observe_single` records one sample with strict-less-than bucket
/// assignment (`value < bound`). The two semantics are deliberately
/// different and must stay that way; downstream percentiles depend on it.
#[derive(Clone)]
pub struct CustomHistogram {
    core: Arc<Core>,
}

struct Core {
    desc: Desc,
    state: RwLock<HashMap<String, Series>>,
}

struct Series {
    labels: Labels,
    sum: f64,
    count: u64,
    /// Bucket upper bounds paired with cumulative counts, sorted ascending.
    buckets: Vec<(f64, u64)>,
    timestamp_ms: Option<i64>,
}

impl Series {
    fn new(labels: Labels) -> Self {
        Self { labels, sum: 0.0, count: 0, buckets: Vec::new(), timestamp_ms: None }
    }

    fn add_to_bucket(&mut self, bound: f64, count: u64) {
        match self
            .buckets
            .binary_search_by(|(existing, _)| existing.partial_cmp(&bound).unwrap())
        {
            Ok(index) => self.buckets[index].1 += count,
            Err(index) => self.buckets.insert(index, (bound, count)),
        }
    }
}

impl CustomHistogram {
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

    /// Merges a pre-aggregated observation batch into the stored state.
    pub fn observe(
        &self,
        sum: f64,
        count: u64,
        buckets: &[(f64, u64)],
        labels: &Labels,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let key = series_key(labels);
        let mut state = self.core.state.write().unwrap();
        let series = state.entry(key).or_insert_with(|| Series::new(labels.clone()));
        series.sum += sum;
        series.count += count;
        for &(bound, bucket_count) in buckets {
            series.add_to_bucket(bound, bucket_count);
        }
        series.timestamp_ms = timestamp.map(|ts| ts.timestamp_millis());
    }

    /// Records a single sample against the given bucket bounds.
    pub fn observe_single(
        &self,
        value: f64,
        bounds: &[f64],
        labels: &Labels,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let key = series_key(labels);
        let mut state = self.core.state.write().unwrap();
        let series = state.entry(key).or_insert_with(|| {
            let mut series = Series::new(labels.clone());
            for &bound in bounds {
                series.add_to_bucket(bound, 0);
            }
            series
        });
        series.sum += value;
        series.count += 1;
        for bucket in series.buckets.iter_mut() {
            if value < bucket.0 {
                bucket.1 += 1;
            }
        }
        series.timestamp_ms = timestamp.map(|ts| ts.timestamp_millis());
    }
}

impl Collector for CustomHistogram {
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
        family.set_field_type(proto::MetricType::HISTOGRAM);
        for key in keys {
            let series = &state[key];
            let mut metric = proto::Metric::new();
            for pair in label_pairs(&self.core.desc, &series.labels) {
                metric.mut_label().push(pair);
            }
            let mut histogram = proto::Histogram::new();
            histogram.set_sample_sum(series.sum);
            histogram.set_sample_count(series.count);
            let mut saw_inf = false;
            for &(bound, count) in &series.buckets {
                let mut bucket = proto::Bucket::new();
                bucket.set_upper_bound(bound);
                bucket.set_cumulative_count(count);
                histogram.mut_bucket().push(bucket);
                saw_inf |= bound.is_infinite();
            }
            if !saw_inf {
                let mut bucket = proto::Bucket::new();
                bucket.set_upper_bound(f64::INFINITY);
                bucket.set_cumulative_count(series.count);
                histogram.mut_bucket().push(bucket);
            }
            metric.set_histogram(histogram);
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

    fn histogram() -> CustomHistogram {
        CustomHistogram::new(
            "test_histogram",
            "test histogram",
            &["label1".to_string()],
            HashMap::new(),
        )
        .unwrap()
    }

    fn labels() -> Labels {
        hashmap! {"label1".to_string() => "value1".to_string()}
    }

    fn bucket_counts(metric: &proto::Metric) -> Vec<(f64, u64)> {
        metric
            .get_histogram()
            .get_bucket()
            .iter()
            .map(|bucket| (bucket.get_upper_bound(), bucket.get_cumulative_count()))
            .collect()
    }

    #[test]
    fn observe_merges_pre_aggregated_batches() {
        let histogram = histogram();
        let buckets = [(1.0, 2), (2.5, 1), (5.0, 1)];
        histogram.observe(10.0, 3, &buckets, &labels(), None);
        let metric = single_metric(&histogram);
        assert_eq!(metric.get_histogram().get_sample_count(), 3);
        assert_eq!(metric.get_histogram().get_sample_sum(), 10.0);

        histogram.observe(10.0, 3, &buckets, &labels(), None);
        let metric = single_metric(&histogram);
        assert_eq!(metric.get_histogram().get_sample_count(), 6);
        assert_eq!(metric.get_histogram().get_sample_sum(), 20.0);
        assert_eq!(
            bucket_counts(&metric),
            vec![(1.0, 4), (2.5, 2), (5.0, 2), (f64::INFINITY, 6)]
        );
    }

    #[test]
    fn observe_single_uses_strict_less_than() {
        let histogram = histogram();
        let bounds = [1.0, 2.5, 5.0, 10.0];
        histogram.observe_single(0.5, &bounds, &labels(), None);
        histogram.observe_single(3.0, &bounds, &labels(), None);
        let metric = single_metric(&histogram);
        assert_eq!(metric.get_histogram().get_sample_count(), 2);
        assert_eq!(metric.get_histogram().get_sample_sum(), 3.5);
        assert_eq!(
            bucket_counts(&metric),
            vec![(1.0, 1), (2.5, 1), (5.0, 2), (10.0, 2), (f64::INFINITY, 2)]
        );
    }

    #[test]
    fn timestamp_is_attached_when_provided() {
        let histogram = histogram();
        let now = Utc::now();
        histogram.observe(5.0, 1, &[(1.0, 1)], &labels(), Some(now));
        let metric = single_metric(&histogram);
        assert_eq!(metric.get_timestamp_ms(), now.timestamp_millis());
    }

    #[test]
    fn infinity_bucket_is_not_duplicated() {
        let histogram = histogram();
        histogram.observe(0.0, 0, &[(1.0, 0), (f64::INFINITY, 0)], &labels(), None);
        let metric = single_metric(&histogram);
        assert_eq!(bucket_counts(&metric), vec![(1.0, 0), (f64::INFINITY, 0)]);
    }
}
