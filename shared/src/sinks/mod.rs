//! Push sinks for evaluated metric families.
//!
//! Exactly one push sink is active per process: Victoria-style text import
//! or the remote-write protobuf endpoint. Both receive whole per-query
//! snapshots from the metrics queue and decorate them with the deployment
//! identity labels before shipping.

mod prompb;
mod remote_write;
mod victoria;

pub use prompb::{Label, Sample, TimeSeries, WriteRequest};
pub use remote_write::RemoteWriteSink;
pub use victoria::VictoriaSink;

use model::CloudIdentity;
use prometheus::proto::{LabelPair, MetricFamily};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("error accessing {url}: {source}")]
    Request {
        url: String,
        code: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("received error status code {status}: {body}")]
    Status {
        status: u16,
        body: String,
        code: &'static str,
    },
    #[error("failed to encode metrics: {message}")]
    Encode { message: String, code: &'static str },
}

impl SinkError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request { code, .. } | Self::Status { code, .. } | Self::Encode { code, .. } => {
                code
            }
        }
    }
}

/// A push consumer of gathered metric families.
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync {
    async fn push(&self, families: &[MetricFamily], key: &str) -> Result<(), SinkError>;
}

fn label_pair(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::new();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

/// Appends `{namespace, pod, container}` and the configured push-cloud
/// labels to every metric of every family.
pub fn append_cloud_labels(
    families: &mut [MetricFamily],
    cloud: &CloudIdentity,
    extra: &HashMap<String, String>,
) {
    let mut extras: Vec<(&String, &String)> = extra.iter().collect();
    extras.sort();
    for family in families {
        for metric in family.mut_metric().iter_mut() {
            metric.mut_label().push(label_pair("namespace", &cloud.namespace));
            metric.mut_label().push(label_pair("pod", &cloud.pod));
            metric.mut_label().push(label_pair("container", &cloud.container));
            for (name, value) in &extras {
                metric.mut_label().push(label_pair(name, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CustomCounter;
    use maplit::hashmap;
    use prometheus::core::Collector;

    #[test]
    fn cloud_labels_are_appended_to_every_sample() {
        let counter = CustomCounter::new(
            "pushed_total",
            "pushed",
            &["code".to_string()],
            HashMap::new(),
        )
        .unwrap();
        counter.add(1.0, &hashmap! {"code".to_string() => "200".to_string()}, None);
        counter.add(2.0, &hashmap! {"code".to_string() => "500".to_string()}, None);
        let mut families = counter.collect();

        let cloud = CloudIdentity {
            namespace: "prod".to_string(),
            pod: "exporter-0".to_string(),
            container: "exporter".to_string(),
        };
        let extra = hashmap! {"cluster".to_string() => "east".to_string()};
        append_cloud_labels(&mut families, &cloud, &extra);

        for metric in families[0].get_metric() {
            let labels: HashMap<&str, &str> = metric
                .get_label()
                .iter()
                .map(|pair| (pair.get_name(), pair.get_value()))
                .collect();
            assert_eq!(labels["namespace"], "prod");
            assert_eq!(labels["pod"], "exporter-0");
            assert_eq!(labels["container"], "exporter");
            assert_eq!(labels["cluster"], "east");
        }
    }
}
