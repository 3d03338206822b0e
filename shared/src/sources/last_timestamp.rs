use crate::{codes, http_client};
use model::{LastTimestampHostConfig, QueryConfig};
use serde_json::Value;
use thiserror::Error;

/// Probes the downstream TSDB for the last published sample of a sentinel
/// metric. The scheduler uses the result as the history backfill horizon.
pub struct LastTimestampClient {
    config: LastTimestampHostConfig,
    client: reqwest::Client,
}

#[derive(Debug, Error)]
pub enum LastTimestampError {
    #[error("error accessing {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("received error status code {status}")]
    Status { status: u16 },
    #[error("error evaluating json path: {0}")]
    JsonPath(String),
    #[error("value at json path can not be parsed: {0}")]
    Value(String),
    /// The sentinel metric has no samples yet. Expected on first rollout.
    #[error("no data at the json path")]
    NoData,
    #[error("{0}")]
    Config(String),
}

impl LastTimestampError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Request { .. } | Self::Status { .. } | Self::JsonPath(_) | Self::Value(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Request { .. } => codes::LME_7130,
            Self::Status { .. } => codes::LME_7131,
            Self::JsonPath(_) => codes::LME_7133,
            Self::Value(_) | Self::NoData => codes::LME_7134,
            Self::Config(_) => codes::LME_8102,
        }
    }
}

impl LastTimestampClient {
    pub fn new(config: &LastTimestampHostConfig) -> anyhow::Result<Self> {
        Ok(Self { config: config.clone(), client: http_client(&config.host)? })
    }

    /// The Unix second of the newest sample, resolved through the
    /// configured JSON path. Query-level endpoint and path overrides take
    /// precedence over the host-level settings.
    pub async fn last_timestamp(
        &self,
        query_name: &str,
        query: &QueryConfig,
    ) -> Result<i64, LastTimestampError> {
        let endpoint = query
            .last_timestamp_endpoint
            .as_deref()
            .unwrap_or(&self.config.endpoint);
        let json_path = query
            .last_timestamp_json_path
            .as_deref()
            .unwrap_or(&self.config.json_path);
        if self.config.host.host.is_empty() || endpoint.is_empty() {
            return Err(LastTimestampError::Config(
                "last timestamp host or endpoint is not defined".to_string(),
            ));
        }
        if json_path.is_empty() {
            return Err(LastTimestampError::Config(
                "last timestamp json path is not defined".to_string(),
            ));
        }
        let url = format!("{}{}", self.config.host.trimmed_host(), endpoint);
        tracing::info!(query = query_name, %url, json_path, "probing last timestamp");

        let mut request = self.client.get(&url);
        if let Some(user) = &self.config.host.user {
            request = request.basic_auth(user, self.config.host.password.as_deref());
        }
        let response = request
            .send()
            .await
            .map_err(|source| LastTimestampError::Request { url: url.clone(), source })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|source| LastTimestampError::Request { url: url.clone(), source })?;
        tracing::info!(
            query = query_name,
            status = status.as_u16(),
            body_length = body.len(),
            "last timestamp response received",
        );
        if status.as_u16() >= 400 {
            return Err(LastTimestampError::Status { status: status.as_u16() });
        }
        let seconds = extract_timestamp(&body, json_path)?;
        Ok(seconds as i64)
    }
}

/// Dereferences the JSON path and reduces the result to a Unix second:
/// a numeric string parses directly, a list yields its maximum.
pub fn extract_timestamp(body: &str, json_path: &str) -> Result<f64, LastTimestampError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|err| LastTimestampError::JsonPath(err.to_string()))?;
    let matches = jsonpath_lib::select(&json, json_path)
        .map_err(|err| LastTimestampError::JsonPath(err.to_string()))?;
    if matches.is_empty() {
        return Err(LastTimestampError::NoData);
    }

    let mut candidates: Vec<&Value> = Vec::new();
    for matched in matches {
        match matched {
            Value::Array(items) => candidates.extend(items.iter()),
            other => candidates.push(other),
        }
    }
    if candidates.is_empty() {
        return Err(LastTimestampError::NoData);
    }
    if candidates.len() == 1 {
        if let Value::String(s) = candidates[0] {
            if s.is_empty() {
                return Err(LastTimestampError::NoData);
            }
        }
    }

    let mut max: Option<f64> = None;
    for candidate in &candidates {
        let parsed = match candidate {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        match parsed {
            Some(value) => max = Some(max.map_or(value, |current| current.max(value))),
            None => tracing::error!(
                error_code = codes::LME_1609,
                value = %candidate,
                "failed to parse json path element to a number",
            ),
        }
    }
    max.ok_or_else(|| {
        LastTimestampError::Value(format!("no element could be parsed from {} candidates", candidates.len()))
    })
}
