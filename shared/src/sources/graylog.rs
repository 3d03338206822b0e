use super::{record_query_outcome, LogSource, SourceError};
use crate::selfmonitor::SelfMonitor;
use crate::{codes, http_client, limited_prefix};
use chrono::{DateTime, SecondsFormat, Utc};
use model::Config;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

const MESSAGES_ENDPOINT: &str = "/api/views/search/messages";
const LOGGED_BODY_LIMIT: usize = 10_000;

/// Graylog client: POSTs an absolute-timerange search and decodes the CSV
/// response, header row first.
pub struct GraylogSource {
    config: Arc<Config>,
    client: reqwest::Client,
    monitor: Arc<SelfMonitor>,
}

impl GraylogSource {
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
        let url = format!("{}{}", datasource.host.trimmed_host(), MESSAGES_ENDPOINT);
        let body = json!({
            "streams": query.streams,
            "query_string": {
                "type": "elasticsearch",
                "query_string": query.query_string,
            },
            "timerange": {
                "type": "absolute",
                "from": start.to_rfc3339_opts(SecondsFormat::Secs, true),
                "to": end.to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            "fields_in_order": query.fields_in_order,
        });
        tracing::debug!(query = query_name, %body, "sending graylog request");

        let mut request = self
            .client
            .post(&url)
            .header("X-Requested-By", "*")
            .header("Content-Type", "application/json")
            .json(&body);
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
            "graylog response received",
        );
        if status.as_u16() != 200 {
            tracing::error!(
                error_code = codes::LME_7102,
                query = query_name,
                status = status.as_u16(),
                body = limited_prefix(&text, LOGGED_BODY_LIMIT),
                "unexpected status code from graylog",
            );
            if status.as_u16() >= 400 {
                return Err(SourceError::Status { status: status.as_u16(), code: codes::LME_7101 });
            }
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl LogSource for GraylogSource {
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
        parse_csv(&result?)
    }
}

/// Decodes the CSV body into rows. Rows may have a varying number of
/// fields; downstream field lookups go through the header.
pub fn parse_csv(body: &str) -> Result<Vec<Vec<String>>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SourceError::Decode {
            message: err.to_string(),
            code: codes::LME_7103,
        })?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}
