use super::{MetricsSink, SinkError};
use crate::{codes, http_client, limited_prefix};
use model::ExportConfig;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};

const LOGGED_BODY_LIMIT: usize = 10_000;

/// Pushes the text exposition format to a Victoria-style import endpoint in
/// a single POST per snapshot.
pub struct VictoriaSink {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl VictoriaSink {
    pub fn new(export: &ExportConfig) -> anyhow::Result<Self> {
        let url = format!("{}{}", export.host.trimmed_host(), export.endpoint);
        tracing::info!(%url, "victoria sink initialized");
        Ok(Self {
            client: http_client(&export.host)?,
            url,
            user: export.host.user.clone(),
            password: export.host.password.clone(),
        })
    }
}

#[async_trait::async_trait]
impl MetricsSink for VictoriaSink {
    async fn push(&self, families: &[MetricFamily], key: &str) -> Result<(), SinkError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(families, &mut buffer)
            .map_err(|err| SinkError::Encode { message: err.to_string(), code: codes::LME_1041 })?;

        let mut request = self.client.post(&self.url).body(buffer);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request.send().await.map_err(|source| SinkError::Request {
            url: self.url.clone(),
            code: codes::LME_7110,
            source,
        })?;
        let status = response.status();
        tracing::info!(url = %self.url, key, status = status.as_u16(), "victoria push response received");
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Status {
                status: status.as_u16(),
                body: limited_prefix(&body, LOGGED_BODY_LIMIT).to_string(),
                code: codes::LME_7111,
            });
        }
        Ok(())
    }
}
