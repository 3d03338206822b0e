use super::{record_query_outcome, LogSource, SourceError};
use crate::selfmonitor::SelfMonitor;
use crate::{codes, http_client, limited_prefix};
use chrono::{DateTime, SecondsFormat, Utc};
use model::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const QUERY_RANGE_ENDPOINT: &str = "/loki/api/v1/query_range";
const RESULT_LIMIT: &str = "5000";
const LOGGED_BODY_LIMIT: usize = 10_000;

/// Loki client: GETs a range query and flattens the returned streams into
/// rows. The header is `message` plus the configured fields plus every
/// stream label key observed in the response; the log line lands in the
/// `message` column.
pub struct LokiSource {
    config: Arc<Config>,
    client: reqwest::Client,
    monitor: Arc<SelfMonitor>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LokiResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub data: LokiData,
}

#[derive(Debug, Deserialize, Default)]
pub struct LokiData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LokiStream {
    #[serde(default)]
    pub stream: HashMap<String, String>,
    /// `[timestamp, line]` pairs.
    #[serde(default)]
    pub values: Vec<Vec<String>>,
}

impl LokiSource {
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
        let url = format!("{}{}", datasource.host.trimmed_host(), QUERY_RANGE_ENDPOINT);
        let mut request = self.client.get(&url).query(&[
            ("query", query.query_string.as_str()),
            ("limit", RESULT_LIMIT),
            ("start", &start.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ("end", &end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ]);
        if let Some(user) = &datasource.host.user {
            request = request.basic_auth(user, datasource.host.password.as_deref());
        }
        let response = request.send().await.map_err(|source| SourceError::Request {
            url: url.clone(),
            code: codes::LME_7100,
            source,
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| SourceError::Request {
            url: url.clone(),
            code: codes::LME_7100,
            source,
        })?;
        tracing::info!(
            query = query_name,
            %url,
            status = status.as_u16(),
            body_length = text.len(),
            "loki response received",
        );
        if status.as_u16() != 200 {
            tracing::error!(
                error_code = codes::LME_7102,
                query = query_name,
                status = status.as_u16(),
                body = limited_prefix(&text, LOGGED_BODY_LIMIT),
                "unexpected status code from loki",
            );
            if status.as_u16() >= 400 {
                return Err(SourceError::Status { status: status.as_u16(), code: codes::LME_7101 });
            }
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl LogSource for LokiSource {
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
        let response: LokiResponse =
            serde_json::from_str(&result?).map_err(|err| SourceError::Decode {
                message: err.to_string(),
                code: codes::LME_7143,
            })?;
        let fields_in_order = &self.config.queries[query_name].fields_in_order;
        Ok(flatten_streams(response, fields_in_order))
    }
}

/// Flattens the stream results into header-first rows.
pub fn flatten_streams(response: LokiResponse, fields_in_order: &[String]) -> Vec<Vec<String>> {
    if response.data.result.is_empty() {
        return Vec::new();
    }

    let mut header: Vec<String> = vec!["message".to_string()];
    let mut indexes: HashMap<String, usize> = HashMap::new();
    indexes.insert("message".to_string(), 0);
    for field in fields_in_order {
        if field == "message" {
            continue;
        }
        indexes.entry(field.clone()).or_insert_with(|| {
            header.push(field.clone());
            header.len() - 1
        });
    }
    for stream in &response.data.result {
        let mut keys: Vec<&String> = stream.stream.keys().collect();
        keys.sort();
        for key in keys {
            if !indexes.contains_key(key) {
                indexes.insert(key.clone(), header.len());
                header.push(key.clone());
            }
        }
    }

    let width = header.len();
    let total: usize = response.data.result.iter().map(|stream| stream.values.len()).sum();
    let mut rows = Vec::with_capacity(total + 1);
    rows.push(header);
    for stream in response.data.result {
        let mut template = vec![String::new(); width];
        for (key, value) in &stream.stream {
            template[indexes[key]] = value.clone();
        }
        for value in stream.values {
            if value.len() < 2 {
                continue;
            }
            let mut row = template.clone();
            row[0] = value[1].clone();
            rows.push(row);
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> LokiResponse {
        serde_json::from_str(
            r#"{
                "status": "success",
                "data": {
                    "resultType": "streams",
                    "result": [
                        {
                            "stream": {"app": "checkout", "level": "error"},
                            "values": [
                                ["1700000000000000000", "first line"],
                                ["1700000001000000000", "second line"]
                            ]
                        },
                        {
                            "stream": {"app": "billing", "pod": "billing-0"},
                            "values": [["1700000002000000000", "third line"]]
                        }
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn header_is_message_fields_then_stream_labels() {
        let rows = flatten_streams(response(), &["level".to_string()]);
        assert_eq!(rows[0], vec!["message", "level", "app", "pod"]);
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn log_line_lands_in_the_message_column() {
        let rows = flatten_streams(response(), &[]);
        assert_eq!(rows[1][0], "first line");
        assert_eq!(rows[3][0], "third line");
    }

    #[test]
    fn stream_labels_fill_their_columns() {
        let rows = flatten_streams(response(), &[]);
        let header = &rows[0];
        let app = header.iter().position(|field| field == "app").unwrap();
        let pod = header.iter().position(|field| field == "pod").unwrap();
        assert_eq!(rows[1][app], "checkout");
        assert_eq!(rows[1][pod], "");
        assert_eq!(rows[3][app], "billing");
        assert_eq!(rows[3][pod], "billing-0");
    }

    #[test]
    fn empty_result_yields_no_rows() {
        let response = LokiResponse::default();
        assert!(flatten_streams(response, &[]).is_empty());
    }

    #[test]
    fn short_value_pairs_are_skipped() {
        let mut response = response();
        response.data.result[0].values.push(vec!["1700000003000000000".to_string()]);
        let rows = flatten_streams(response, &[]);
        assert_eq!(rows.len(), 4);
    }
}
