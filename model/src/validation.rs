//! Startup validation of the loaded configuration.
//!
//! Findings are split the way the runtime treats them: fatal problems abort
//! startup, degraded findings are logged and the affected query or metric is
//! skipped at runtime.

use crate::config::{Config, ExportStrategy, MetricKind, Operation};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::str::FromStr;

const SUPPORTED_API_VERSIONS: &[&str] = &["v1"];

/// Cron precision selected by the `--croniter-precision` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronPrecision {
    Second,
    Minute,
}

impl FromStr for CronPrecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "second" => Ok(Self::Second),
            "minute" => Ok(Self::Minute),
            other => bail!("unsupported croniter precision {}", other),
        }
    }
}

/// Normalizes a configured cron expression to the six-field form the cron
/// crate expects. With second precision a five-field expression gets a zero
/// seconds field; with minute precision six-field expressions are rejected.
pub fn normalize_cron(expression: &str, precision: CronPrecision) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = match (precision, fields) {
        (_, 0) => bail!("empty cron expression"),
        (CronPrecision::Second, 5) | (CronPrecision::Minute, 5) => format!("0 {}", expression),
        (CronPrecision::Second, 6 | 7) => expression.to_string(),
        (CronPrecision::Minute, _) => {
            bail!("cron expression {:?} must have five fields with minute precision", expression)
        }
        _ => bail!("cron expression {:?} has {} fields", expression, fields),
    };
    Ok(cron::Schedule::from_str(&normalized)?)
}

/// Validates the configuration. Returns the list of degraded (non-fatal)
/// findings on success and an error on the first fatal problem.
pub fn validate(config: &Config, precision: CronPrecision) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if let Some(version) = config.api_version.as_deref() {
        if !SUPPORTED_API_VERSIONS.contains(&version) {
            bail!("unsupported apiVersion {}", version);
        }
    }

    validate_datasources(config)?;
    validate_exports(config)?;
    validate_metrics(config, &mut warnings)?;
    validate_queries(config, precision, &mut warnings)?;

    let referenced: HashSet<&str> = config
        .queries
        .values()
        .flat_map(|query| query.metrics.iter().map(String::as_str))
        .collect();
    let children: HashSet<&str> = config
        .metrics
        .values()
        .flat_map(|metric| metric.child_metrics.iter().map(String::as_str))
        .collect();
    for name in config.metrics.keys() {
        if !referenced.contains(name.as_str()) && !children.contains(name.as_str()) {
            warnings.push(format!("metric {} is not referenced by any query", name));
        }
    }

    Ok(warnings)
}

fn validate_datasources(config: &Config) -> Result<()> {
    if config.datasources.len() != 1 {
        bail!(
            "exactly one datasource must be defined, found {}",
            config.datasources.len()
        );
    }
    let (name, datasource) = config.datasources.iter().next().unwrap();
    if datasource.host.host.trim().is_empty() {
        bail!("datasource {} has no host", name);
    }
    Ok(())
}

fn validate_exports(config: &Config) -> Result<()> {
    let mut pulls = 0;
    let mut pushes = 0;
    for (name, export) in &config.exports {
        match export.strategy {
            ExportStrategy::Pull => {
                pulls += 1;
                if export.port.is_none() {
                    bail!("pull export {} has no port", name);
                }
            }
            ExportStrategy::Push => {
                pushes += 1;
                if export.host.host.trim().is_empty() {
                    bail!("push export {} has no host", name);
                }
                if let Some(lts) = &export.last_timestamp_host {
                    if lts.host.host.trim().is_empty() {
                        bail!("last-timestamp-host of export {} has no host", name);
                    }
                }
            }
        }
    }
    if pulls > 1 {
        bail!("at most one pull export may be defined, found {}", pulls);
    }
    if pushes > 1 {
        bail!("at most one push export may be defined, found {}", pushes);
    }
    Ok(())
}

fn validate_metrics(config: &Config, warnings: &mut Vec<String>) -> Result<()> {
    for (name, metric) in &config.metrics {
        match metric.operation {
            Operation::Count => {
                if metric.kind == MetricKind::Histogram {
                    bail!("metric {}: count operation does not support the histogram type", name);
                }
            }
            Operation::Duration | Operation::DurationNoResponse => {
                for parameter in ["time_field", "message_type_field", "correlation_id_field"] {
                    if metric.operation == Operation::Duration && metric.parameter(parameter).is_none() {
                        bail!("metric {}: duration operation requires parameter {}", name, parameter);
                    }
                }
            }
            Operation::Value => {
                if metric.metric_value.is_none() && metric.parameter("value-field").is_none() {
                    bail!("metric {}: value operation requires metric-value or the value-field parameter", name);
                }
            }
        }

        if metric.kind == MetricKind::Gauge && metric.parameter("init-value").is_some() {
            bail!("metric {}: init-value is not supported for gauges", name);
        }

        if metric.kind == MetricKind::Histogram {
            if metric.buckets.is_empty() {
                warnings.push(format!("histogram metric {} has no buckets", name));
            }
            if metric.buckets.windows(2).any(|pair| pair[0] >= pair[1]) {
                warnings.push(format!("histogram metric {} has unsorted buckets", name));
            }
        }

        for label in metric.label_field_map.keys() {
            if !metric.labels.contains(label) {
                warnings.push(format!(
                    "metric {}: label-field-map entry {} does not match any label",
                    name, label
                ));
            }
        }

        for child in &metric.child_metrics {
            match config.metrics.get(child) {
                None => bail!("metric {}: child metric {} is not defined", name, child),
                Some(config) if config.operation != Operation::DurationNoResponse => {
                    warnings.push(format!(
                        "metric {}: child metric {} is not a duration-no-response metric",
                        name, child
                    ));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn validate_queries(
    config: &Config,
    precision: CronPrecision,
    warnings: &mut Vec<String>,
) -> Result<()> {
    for (name, query) in &config.queries {
        normalize_cron(&query.croniter, precision)
            .map_err(|err| anyhow::anyhow!("query {}: invalid cron expression: {}", name, err))?;

        for metric in &query.metrics {
            if !config.metrics.contains_key(metric) {
                bail!("query {} references undefined metric {}", name, metric);
            }
        }

        // Invariant: per query and cache name there is at most one writer.
        let mut writers: HashSet<&str> = HashSet::new();
        for metric in &query.metrics {
            let Some(metric_config) = config.metrics.get(metric) else {
                continue;
            };
            let Some(cache) = metric_config.parameter("cache") else {
                continue;
            };
            if !query.caches.contains_key(cache) {
                bail!("query {}: metric {} references undefined cache {}", name, metric, cache);
            }
            if metric_config.parameter("cache-update") == Some("true") && !writers.insert(cache) {
                bail!("query {}: cache {} has more than one writing metric", name, cache);
            }
        }

        for (cache_name, cache) in &query.caches {
            if cache.size == 0 {
                bail!("query {}: cache {} has zero size", name, cache_name);
            }
        }

        for (index, step) in query.enrich.iter().enumerate() {
            if step.dest_fields.is_empty() {
                warnings.push(format!("query {}: enrich step {} has no dest-fields", name, index));
            }
            if let Some(pattern) = step.regexp.as_deref() {
                regex::Regex::new(pattern).map_err(|err| {
                    anyhow::anyhow!("query {}: enrich step {}: invalid regexp: {}", name, index, err)
                })?;
            }
        }

        if query.interval.map(|interval| interval.as_secs() == 0).unwrap_or(false) {
            warnings.push(format!("query {}: interval is zero, history will be skipped", name));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config_from(yaml: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.finalize().unwrap();
        config
    }

    fn base_yaml() -> String {
        r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  errors_total:
    type: counter
    operation: count
    labels: [code]
queries:
  errors:
    metrics: [errors_total]
    query_string: "level: ERROR"
    croniter: "* * * * *"
    timerange: 1m
"#
        .to_string()
    }

    #[test]
    fn accepts_valid_config() {
        let config = config_from(&base_yaml());
        let warnings = validate(&config, CronPrecision::Second).unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn rejects_undefined_metric_reference() {
        let yaml = base_yaml().replace("metrics: [errors_total]", "metrics: [missing_metric]");
        let config = config_from(&yaml);
        let err = validate(&config, CronPrecision::Second).unwrap_err();
        assert!(err.to_string().contains("undefined metric"));
    }

    #[test]
    fn rejects_invalid_cron_expression() {
        let yaml = base_yaml().replace("\"* * * * *\"", "\"not a cron\"");
        let config = config_from(&yaml);
        assert!(validate(&config, CronPrecision::Second).is_err());
    }

    #[test]
    fn rejects_init_value_on_gauge() {
        let yaml = base_yaml().replace(
            "    type: counter\n    operation: count",
            "    type: gauge\n    operation: count\n    parameters:\n      init-value: \"1\"",
        );
        let config = config_from(&yaml);
        let err = validate(&config, CronPrecision::Second).unwrap_err();
        assert!(err.to_string().contains("init-value"));
    }

    #[test]
    fn warns_about_unreferenced_metric() {
        let yaml = base_yaml().replace(
            "metrics:\n  errors_total:",
            "metrics:\n  unused_metric:\n    type: gauge\n    operation: value\n    metric-value: v\n  errors_total:",
        );
        let config = config_from(&yaml);
        let warnings = validate(&config, CronPrecision::Second).unwrap();
        assert!(warnings.iter().any(|warning| warning.contains("unused_metric")));
    }

    #[test]
    fn rejects_second_cache_writer() {
        let yaml = r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
metrics:
  first_duration:
    type: gauge
    operation: duration
    parameters:
      time_field: time
      message_type_field: type
      correlation_id_field: id
      cache: calls
      cache-update: "true"
  second_duration:
    type: gauge
    operation: duration
    parameters:
      time_field: time
      message_type_field: type
      correlation_id_field: id
      cache: calls
      cache-update: "true"
queries:
  durations:
    metrics: [first_duration, second_duration]
    croniter: "* * * * *"
    timerange: 1m
    caches:
      calls:
        size: 10
"#;
        let config = config_from(yaml);
        let err = validate(&config, CronPrecision::Second).unwrap_err();
        assert!(err.to_string().contains("more than one writing metric"));
    }

    #[test]
    fn normalize_cron_prepends_seconds_field() {
        assert!(normalize_cron("* * * * *", CronPrecision::Second).is_ok());
        assert!(normalize_cron("*/5 * * * * *", CronPrecision::Second).is_ok());
        assert!(normalize_cron("*/5 * * * * *", CronPrecision::Minute).is_err());
    }
}
