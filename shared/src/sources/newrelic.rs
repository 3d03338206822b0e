use super::{record_query_outcome, LogSource, SourceError};
use crate::selfmonitor::SelfMonitor;
use crate::{codes, http_client, limited_prefix};
use chrono::{DateTime, Utc};
use model::Config;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Synthetic column carrying facet counts and unique counts.
pub const RESULT_FIELD_NAME: &str = "_RESULT_";

const START_TIME_PLACEHOLDER: &str = "{{StartTime}}";
const END_TIME_PLACEHOLDER: &str = "{{EndTime}}";
const LOGGED_BODY_LIMIT: usize = 10_000;

/// New Relic client: renders the templated NRQL query against the window
/// and tabularizes the union-typed response (event list, faceted counts or
/// a scalar unique count).
pub struct NewRelicSource {
    config: Arc<Config>,
    client: reqwest::Client,
    monitor: Arc<SelfMonitor>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NrResponse {
    #[serde(default)]
    pub results: Option<Vec<NrResult>>,
    #[serde(default)]
    pub facets: Vec<NrFacet>,
    #[serde(default)]
    pub metadata: NrMetadata,
}

#[derive(Debug, Deserialize, Default)]
pub struct NrResult {
    #[serde(default)]
    pub events: Option<Vec<serde_json::Map<String, Value>>>,
    #[serde(rename = "uniqueCount", default)]
    pub unique_count: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NrMetadata {
    #[serde(default)]
    pub facet: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NrFacet {
    #[serde(default)]
    pub name: Value,
    #[serde(default)]
    pub results: Vec<NrFacetResult>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NrFacetResult {
    #[serde(default)]
    pub count: f64,
}

impl NewRelicSource {
    pub fn new(config: Arc<Config>, monitor: Arc<SelfMonitor>) -> anyhow::Result<Self> {
        let client = http_client(&config.datasource().host)?;
        Ok(Self { config, client, monitor })
    }

    async fn fetch(
        &self,
        query_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<String, SourceError> {
        let datasource = self.config.datasource();
        let query = &self.config.queries[query_name];
        let account = datasource.host.user.as_deref().unwrap_or_default();
        let nrql = render_nrql(&query.query_string, start, end);
        tracing::debug!(query = query_name, %nrql, "sending nrql query");
        let url = format!("{}/v1/accounts/{}/query", datasource.host.trimmed_host(), account);
        let response = self
            .client
            .get(&url)
            .query(&[("nrql", nrql.as_str())])
            .header("Content-Type", "application/json")
            .header("X-Query-Key", datasource.host.password.as_deref().unwrap_or_default())
            .send()
            .await
            .map_err(|source| SourceError::Request {
                url: url.clone(),
                code: codes::LME_7140,
                source,
            })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| SourceError::Request {
            url: url.clone(),
            code: codes::LME_7140,
            source,
        })?;
        tracing::info!(
            query = query_name,
            %url,
            status = status.as_u16(),
            body_length = text.len(),
            "new relic response received",
        );
        if status.as_u16() != 200 {
            tracing::error!(
                error_code = codes::LME_7142,
                query = query_name,
                status = status.as_u16(),
                body = limited_prefix(&text, LOGGED_BODY_LIMIT),
                "unexpected status code from new relic",
            );
            if status.as_u16() >= 400 {
                return Err(SourceError::Status { status: status.as_u16(), code: codes::LME_7141 });
            }
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl LogSource for NewRelicSource {
    async fn query(
        &self,
        query_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Vec<String>>, SourceError> {
        let started = Instant::now();
        let result = self.fetch(query_name, start, end).await;
        let size = result.as_ref().map(String::len).unwrap_or(0);
        record_query_outcome(&self.monitor, query_name, started, size, result.is_err());
        let response: NrResponse =
            serde_json::from_str(&result?).map_err(|err| SourceError::Decode {
                message: err.to_string(),
                code: codes::LME_7143,
            })?;
        Ok(tabularize(response, query_name))
    }
}

/// Substitutes the window bounds into the configured NRQL template.
pub fn render_nrql(template: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let format = "%Y-%m-%d %H:%M:%S UTC";
    template
        .replace(START_TIME_PLACEHOLDER, &start.format(format).to_string())
        .replace(END_TIME_PLACEHOLDER, &end.format(format).to_string())
}

/// Dispatches on the response shape. The discriminator is the presence of
/// `metadata.facet`, then the kind of `results[0]`.
pub fn tabularize(response: NrResponse, query_name: &str) -> Vec<Vec<String>> {
    if response.metadata.facet.is_some() {
        return process_facets(&response);
    }
    if let Some(results) = &response.results {
        let Some(first) = results.first() else {
            tracing::warn!(query = query_name, "new relic results list is empty");
            return Vec::new();
        };
        if let Some(events) = &first.events {
            return process_events(events);
        }
        if let Some(unique_count) = first.unique_count {
            return process_unique_count(unique_count);
        }
    }
    tracing::error!(
        error_code = codes::LME_7144,
        query = query_name,
        "unknown new relic response shape, processing skipped",
    );
    Vec::new()
}

fn process_events(events: &[serde_json::Map<String, Value>]) -> Vec<Vec<String>> {
    let mut header: Vec<String> = Vec::new();
    let mut indexes: HashMap<String, usize> = HashMap::new();
    for event in events {
        for key in event.keys() {
            if !indexes.contains_key(key) {
                indexes.insert(key.clone(), header.len());
                header.push(key.clone());
            }
        }
    }
    let width = header.len();
    let mut rows = Vec::with_capacity(events.len() + 1);
    rows.push(header);
    for event in events {
        let mut row = vec![String::new(); width];
        for (key, value) in event {
            row[indexes[key]] = format_value(value);
        }
        rows.push(row);
    }
    rows
}

fn process_facets(response: &NrResponse) -> Vec<Vec<String>> {
    let facet = response.metadata.facet.as_ref().unwrap();
    let label_names: Vec<String> = match facet {
        Value::String(name) => vec![name.clone()],
        Value::Array(names) => names.iter().map(format_value).collect(),
        other => vec![format_value(other)],
    };

    let width = label_names.len() + 1;
    let mut rows = Vec::with_capacity(response.facets.len() + 1);
    let mut header = label_names;
    header.push(RESULT_FIELD_NAME.to_string());
    rows.push(header);

    for item in &response.facets {
        let mut row: Vec<String> = match &item.name {
            Value::String(name) => vec![name.clone()],
            Value::Array(names) => names.iter().map(format_value).collect(),
            other => vec![format_value(other)],
        };
        let Some(first) = item.results.first() else {
            tracing::warn!("facet item has no results, skipping");
            continue;
        };
        row.push(format_number(first.count));
        if row.len() != width {
            tracing::warn!(actual = row.len(), expected = width, "facet row width mismatch");
        }
        rows.push(row);
    }
    rows
}

fn process_unique_count(unique_count: f64) -> Vec<Vec<String>> {
    vec![
        vec![RESULT_FIELD_NAME.to_string()],
        vec![format_number(unique_count)],
    ]
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_f64()
            .map(format_number)
            .unwrap_or_else(|| n.to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Whole floats print without a fractional part, matching what the
/// downstream field parsers expect for counts.
fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renders_nrql_window_bounds() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 3, 9, 5).unwrap();
        let nrql = render_nrql(
            "SELECT * FROM Log SINCE '{{StartTime}}' UNTIL '{{EndTime}}'",
            start,
            end,
        );
        assert_eq!(
            nrql,
            "SELECT * FROM Log SINCE '2024-01-02 03:04:05 UTC' UNTIL '2024-01-02 03:09:05 UTC'"
        );
    }

    #[test]
    fn tabularizes_events() {
        let response: NrResponse = serde_json::from_str(
            r#"{"results": [{"events": [
                {"service": "billing", "duration": 12},
                {"service": "checkout", "code": 503}
            ]}]}"#,
        )
        .unwrap();
        let rows = tabularize(response, "events");
        assert_eq!(rows[0], vec!["service", "duration", "code"]);
        assert_eq!(rows[1], vec!["billing", "12", ""]);
        assert_eq!(rows[2], vec!["checkout", "", "503"]);
    }

    #[test]
    fn tabularizes_single_name_facets() {
        let response: NrResponse = serde_json::from_str(
            r#"{
                "metadata": {"facet": "service"},
                "facets": [
                    {"name": "billing", "results": [{"count": 3}]},
                    {"name": "checkout", "results": [{"count": 5.5}]}
                ]
            }"#,
        )
        .unwrap();
        let rows = tabularize(response, "facets");
        assert_eq!(rows[0], vec!["service", RESULT_FIELD_NAME]);
        assert_eq!(rows[1], vec!["billing", "3"]);
        assert_eq!(rows[2], vec!["checkout", "5.5"]);
    }

    #[test]
    fn tabularizes_multi_name_facets() {
        let response: NrResponse = serde_json::from_str(
            r#"{
                "metadata": {"facet": ["service", "code"]},
                "facets": [{"name": ["billing", "500"], "results": [{"count": 2}]}]
            }"#,
        )
        .unwrap();
        let rows = tabularize(response, "facets");
        assert_eq!(rows[0], vec!["service", "code", RESULT_FIELD_NAME]);
        assert_eq!(rows[1], vec!["billing", "500", "2"]);
    }

    #[test]
    fn tabularizes_unique_count() {
        let response: NrResponse =
            serde_json::from_str(r#"{"results": [{"uniqueCount": 42}]}"#).unwrap();
        let rows = tabularize(response, "uniques");
        assert_eq!(rows, vec![vec![RESULT_FIELD_NAME.to_string()], vec!["42".to_string()]]);
    }

    #[test]
    fn unknown_shape_is_skipped() {
        let response: NrResponse = serde_json::from_str(r#"{"results": [{}]}"#).unwrap();
        assert!(tabularize(response, "unknown").is_empty());
    }
}
