use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SCHEDULE_QUEUE_SIZE: usize = 100;
const DEFAULT_DATA_QUEUE_SIZE: usize = 10;
const DEFAULT_METRICS_QUEUE_SIZE: usize = 10;
const DEFAULT_SELF_MON_QUEUE_SIZE: usize = 10;
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_LTS_RETRY_COUNT: u32 = 3;
const DEFAULT_LTS_RETRY_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_ID_FIELD_TTL: u32 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(rename = "apiVersion", default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub exports: HashMap<String, ExportConfig>,
    pub datasources: HashMap<String, DatasourceConfig>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricConfig>,
    #[serde(default)]
    pub queries: HashMap<String, QueryConfig>,
    #[serde(default)]
    pub general: GeneralConfig,
    /// CLI options re-applied from the config file after load.
    #[serde(default)]
    pub flags: HashMap<String, String>,
    #[serde(rename = "graylog-emulator", default)]
    pub emulator: Option<EmulatorConfig>,
    /// Name of the selected datasource entry, resolved during finalization.
    #[serde(skip)]
    pub datasource_name: String,
    /// Deployment identity appended to pushed samples, taken from the
    /// environment during finalization.
    #[serde(skip)]
    pub cloud: CloudIdentity,
}

impl Config {
    /// Reads and finalizes the configuration file. The returned value is
    /// ready for validation and component construction.
    pub fn read(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&contents).context("failed to parse yaml config")?;
        config.finalize()?;
        Ok(config)
    }

    /// Resolves the active datasource, fills credentials from the
    /// environment and appends multi-value label names to each metric's
    /// label list so that label order is fixed for the process lifetime.
    pub fn finalize(&mut self) -> Result<()> {
        self.datasource_name = self
            .datasources
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| anyhow!("no datasource is defined"))?;

        for datasource in self.datasources.values_mut() {
            let (user_var, password_var) = match datasource.kind {
                DatasourceKind::Graylog => ("GRAYLOG_USER", "GRAYLOG_PASSWORD"),
                DatasourceKind::Loki => ("LOKI_USER", "LOKI_PASSWORD"),
                DatasourceKind::NewRelic => ("NEWRELIC_ACCOUNT_ID", "NEWRELIC_X_QUERY_KEY"),
            };
            datasource.host.fill_credentials_from_env(user_var, password_var);
        }

        for export in self.exports.values_mut() {
            let (user_var, password_var) = match export.consumer {
                Consumer::VictoriaVmagent => ("VICTORIA_USER", "VICTORIA_PASSWORD"),
                Consumer::PrometheusRemoteWrite => ("PROMRW_USER", "PROMRW_PASSWORD"),
            };
            export.host.fill_credentials_from_env(user_var, password_var);
            if let Some(lts) = export.last_timestamp_host.as_mut() {
                lts.host
                    .fill_credentials_from_env("LAST_TIMESTAMP_USER", "LAST_TIMESTAMP_PASSWORD");
            }
        }

        for metric in self.metrics.values_mut() {
            for field in &metric.multi_value_fields {
                metric.labels.push(field.label_name.clone());
            }
        }

        self.cloud = CloudIdentity::from_env();
        Ok(())
    }

    pub fn datasource(&self) -> &DatasourceConfig {
        &self.datasources[&self.datasource_name]
    }

    /// The configured pull export, if any.
    pub fn pull_export(&self) -> Option<(&String, &ExportConfig)> {
        self.exports
            .iter()
            .find(|(_, export)| export.strategy == ExportStrategy::Pull)
    }

    /// The configured push export, if any.
    pub fn push_export(&self) -> Option<(&String, &ExportConfig)> {
        self.exports
            .iter()
            .find(|(_, export)| export.strategy == ExportStrategy::Push)
    }

    /// True when a duration metric has at least one duration-no-response
    /// child configured.
    pub fn has_no_response_child(&self, metric: &MetricConfig) -> bool {
        metric.child_metrics.iter().any(|child| {
            self.metrics
                .get(child)
                .map(|config| config.operation == Operation::DurationNoResponse)
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct HostConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub connection_timeout: Duration,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_ca_cert_file: Option<PathBuf>,
}

impl HostConfig {
    fn fill_credentials_from_env(&mut self, user_var: &str, password_var: &str) {
        if self.user.is_none() {
            self.user = std::env::var(user_var).ok().filter(|value| !value.is_empty());
        }
        if self.password.is_none() {
            self.password = std::env::var(password_var)
                .ok()
                .filter(|value| !value.is_empty());
        }
    }

    /// Host with surrounding whitespace and trailing slashes removed.
    pub fn trimmed_host(&self) -> &str {
        self.host.trim().trim_end_matches('/')
    }
}

fn default_connection_timeout() -> Duration {
    DEFAULT_CONNECTION_TIMEOUT
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    Graylog,
    Loki,
    #[serde(alias = "new-relic")]
    NewRelic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasourceConfig {
    #[serde(flatten)]
    pub host: HostConfig,
    #[serde(rename = "type")]
    pub kind: DatasourceKind,
    /// Labels applied as const labels to every emitted metric.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStrategy {
    Pull,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Consumer {
    #[default]
    #[serde(alias = "victoria")]
    VictoriaVmagent,
    #[serde(alias = "remote-write")]
    PrometheusRemoteWrite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportConfig {
    #[serde(flatten)]
    pub host: HostConfig,
    #[serde(default)]
    pub endpoint: String,
    pub strategy: ExportStrategy,
    #[serde(default)]
    pub consumer: Consumer,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub last_timestamp_host: Option<LastTimestampHostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LastTimestampHostConfig {
    #[serde(flatten)]
    pub host: HostConfig,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub json_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Count,
    Value,
    Duration,
    DurationNoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdFieldStrategy {
    Metric,
    #[default]
    Label,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MultiValueField {
    pub field_name: String,
    pub label_name: String,
    pub separator: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricConfig {
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub description: String,
    /// Configured labels; multi-value label names are appended at the end
    /// during finalization, fixing the ordered-label-value layout.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub const_labels: HashMap<String, String>,
    #[serde(default)]
    pub metric_value: Option<String>,
    pub operation: Operation,
    #[serde(default)]
    pub label_field_map: HashMap<String, String>,
    #[serde(default)]
    pub multi_value_fields: Vec<MultiValueField>,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub id_field_strategy: IdFieldStrategy,
    #[serde(default)]
    pub id_field_ttl: Option<u32>,
    #[serde(default)]
    pub buckets: Vec<f64>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub child_metrics: Vec<String>,
    #[serde(default)]
    pub threads: usize,
    #[serde(default)]
    pub expected_labels: Vec<HashMap<String, Vec<String>>>,
    /// OR-of-AND row predicate: each entry maps a condition kind (only
    /// `equ` is supported) to field/value equality pairs.
    #[serde(rename = "conditions", default)]
    pub conditions: Vec<HashMap<String, HashMap<String, String>>>,
}

impl MetricConfig {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str).filter(|value| !value.is_empty())
    }

    pub fn id_field_ttl(&self) -> u32 {
        match self.id_field_ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => DEFAULT_ID_FIELD_TTL,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub size: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct UriProcessing {
    #[serde(default)]
    pub uuid_replacer: Option<String>,
    #[serde(default)]
    pub number_replacer: Option<String>,
    #[serde(default)]
    pub id_replacer: Option<String>,
    #[serde(default)]
    pub id_digit_quantity: usize,
    #[serde(default)]
    pub fsm_replacer: Option<String>,
    #[serde(default)]
    pub fsm_replacer_limit: i32,
}

impl UriProcessing {
    pub fn is_enabled(&self) -> bool {
        self.uuid_replacer.is_some()
            || self.number_replacer.is_some()
            || self.id_replacer.is_some()
            || self.fsm_replacer.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestField {
    pub field_name: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub uri_processing: UriProcessing,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnrichStep {
    pub source_field: String,
    #[serde(default)]
    pub json_path: Option<String>,
    #[serde(default)]
    pub regexp: Option<String>,
    #[serde(default)]
    pub dest_fields: Vec<DestField>,
    #[serde(default)]
    pub threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueryConfig {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(rename = "query_string", default)]
    pub query_string: String,
    #[serde(rename = "fields_in_order", default)]
    pub fields_in_order: Vec<String>,
    /// Cron expression that fires the query.
    pub croniter: String,
    /// Width of the queried time window.
    #[serde(default, with = "humantime_serde")]
    pub timerange: Duration,
    /// Nominal step size used for history backfill planning.
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    /// How far behind real time the queried window lags.
    #[serde(rename = "query_lag", default, with = "humantime_serde")]
    pub query_lag: Option<Duration>,
    #[serde(default)]
    pub enrich: Vec<EnrichStep>,
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
    #[serde(default)]
    pub schedule_queue_size: Option<usize>,
    #[serde(default)]
    pub data_queue_size: Option<usize>,
    #[serde(default)]
    pub metrics_queue_size: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub max_history_lookup: Option<Duration>,
    #[serde(default)]
    pub last_timestamp_endpoint: Option<String>,
    #[serde(default)]
    pub last_timestamp_json_path: Option<String>,
}

impl QueryConfig {
    pub fn query_lag(&self) -> Duration {
        self.query_lag.unwrap_or_default()
    }

    pub fn schedule_queue_size(&self) -> usize {
        non_zero_or(self.schedule_queue_size, DEFAULT_SCHEDULE_QUEUE_SIZE)
    }

    pub fn data_queue_size(&self) -> usize {
        non_zero_or(self.data_queue_size, DEFAULT_DATA_QUEUE_SIZE)
    }

    pub fn metrics_queue_size(&self) -> usize {
        non_zero_or(self.metrics_queue_size, DEFAULT_METRICS_QUEUE_SIZE)
    }
}

fn non_zero_or(value: Option<usize>, default: usize) -> usize {
    match value {
        Some(size) if size > 0 => size,
        _ => default,
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralConfig {
    #[serde(default)]
    pub metrics_queue_self_mon_size: Option<usize>,
    #[serde(default)]
    pub disable_push_cloud_labels: bool,
    #[serde(default)]
    pub push_cloud_labels: HashMap<String, String>,
    #[serde(default)]
    pub last_timestamp_retry_count: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub last_timestamp_retry_period: Option<Duration>,
    #[serde(default)]
    pub datasource_retry: bool,
    #[serde(default, with = "humantime_serde")]
    pub datasource_retry_period: Option<Duration>,
    #[serde(default)]
    pub push_retry: bool,
    #[serde(default, with = "humantime_serde")]
    pub push_retry_period: Option<Duration>,
}

impl GeneralConfig {
    pub fn self_mon_queue_size(&self) -> usize {
        non_zero_or(self.metrics_queue_self_mon_size, DEFAULT_SELF_MON_QUEUE_SIZE)
    }

    pub fn lts_retry_count(&self) -> u32 {
        self.last_timestamp_retry_count
            .unwrap_or(DEFAULT_LTS_RETRY_COUNT)
            .max(1)
    }

    pub fn lts_retry_period(&self) -> Duration {
        self.last_timestamp_retry_period
            .unwrap_or(DEFAULT_LTS_RETRY_PERIOD)
    }

    pub fn datasource_retry_period(&self) -> Duration {
        self.datasource_retry_period.unwrap_or(DEFAULT_RETRY_PERIOD)
    }

    pub fn push_retry_period(&self) -> Duration {
        self.push_retry_period.unwrap_or(DEFAULT_RETRY_PERIOD)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EmulatorConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(default)]
    pub source_files: Vec<PathBuf>,
}

/// Deployment identity labels attached to every pushed sample.
#[derive(Debug, Clone, Default)]
pub struct CloudIdentity {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl CloudIdentity {
    pub fn from_env() -> Self {
        Self {
            namespace: std::env::var("NAMESPACE").unwrap_or_default(),
            pod: std::env::var("HOSTNAME").unwrap_or_default(),
            container: std::env::var("CONTAINER_NAME").unwrap_or_default(),
        }
    }
}
