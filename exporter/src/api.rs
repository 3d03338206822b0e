//! The HTTP surface: pull-mode `/metrics`, the `/probe` liveness endpoint
//! and the optional log-source emulator used by tests and demos.

use model::EmulatorConfig;
use prometheus::{Encoder, TextEncoder};
use shared::codes;
use shared::registry::QueryRegistry;
use std::sync::{Arc, Mutex};
use warp::filters::path::FullPath;
use warp::{Filter, Rejection, Reply};

const DEFAULT_EMULATOR_ENDPOINT: &str = "/api/views/search/messages";

pub fn routes(
    registry: Arc<QueryRegistry>,
    emulator: Option<Arc<Emulator>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let metrics = warp::path("metrics")
        .and(warp::get())
        .map(move || metrics_reply(&registry));
    let probe = warp::path("probe").and(warp::get()).map(|| {
        tracing::debug!("probe call");
        warp::reply::reply().into_response()
    });
    let emulator_route = warp::post()
        .and(warp::path::full())
        .and_then(move |path: FullPath| {
            let emulator = emulator.clone();
            async move {
                match emulator {
                    Some(emulator) if path.as_str() == emulator.endpoint() => {
                        Ok(emulator.reply())
                    }
                    _ => Err(warp::reject::not_found()),
                }
            }
        });
    metrics.or(probe).or(emulator_route)
}

fn metrics_reply(registry: &QueryRegistry) -> warp::reply::Response {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error_code = codes::LME_1041, %err, "failed to encode metrics");
        return warp::reply::with_status(
            "failed to encode metrics",
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        )
        .into_response();
    }
    warp::reply::with_header(buffer, "Content-Type", "text/plain; version=0.0.4").into_response()
}

/// Replays configured bodies (inline or from files) in a round-robin over
/// the configured sources, one per request.
pub struct Emulator {
    config: EmulatorConfig,
    current: Mutex<usize>,
    sources: usize,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Option<Arc<Self>> {
        let sources = if config.data.is_empty() {
            config.source_files.len()
        } else {
            config.data.len()
        };
        if sources == 0 {
            tracing::error!(
                error_code = codes::LME_8106,
                "emulator has no data and no source files, it will not start",
            );
            return None;
        }
        tracing::info!(sources, "log source emulator is configured");
        Some(Arc::new(Self { config, current: Mutex::new(sources - 1), sources }))
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.as_deref().unwrap_or(DEFAULT_EMULATOR_ENDPOINT)
    }

    fn next_index(&self) -> usize {
        let mut current = self.current.lock().unwrap();
        *current = (*current + 1) % self.sources;
        *current
    }

    fn reply(&self) -> warp::reply::Response {
        let index = self.next_index();
        if !self.config.data.is_empty() {
            return self.config.data[index].clone().into_response();
        }
        match std::fs::read(&self.config.source_files[index]) {
            Ok(body) => body.into_response(),
            Err(err) => {
                tracing::error!(error_code = codes::LME_1605, %err, "emulator failed to read source file");
                warp::reply::with_status(
                    "emulator source file unavailable",
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                )
                .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::collectors::CustomCounter;
    use std::collections::HashMap;

    fn registry_with_counter() -> Arc<QueryRegistry> {
        let registry = QueryRegistry::new(["requests"]);
        let counter =
            CustomCounter::new("up_total", "up", &[], HashMap::new()).unwrap();
        counter.add(1.0, &HashMap::new(), None);
        registry.register("requests", Box::new(counter)).unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn probe_always_answers_200() {
        let filter = routes(registry_with_counter(), None);
        let response = warp::test::request().path("/probe").reply(&filter).await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn metrics_exposes_the_text_format() {
        let filter = routes(registry_with_counter(), None);
        let response = warp::test::request().path("/metrics").reply(&filter).await;
        assert_eq!(response.status(), 200);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("# TYPE up_total counter"));
        assert!(body.contains("up_total 1"));
    }

    #[tokio::test]
    async fn emulator_cycles_through_sources() {
        let emulator = Emulator::new(EmulatorConfig {
            endpoint: None,
            data: vec!["first".to_string(), "second".to_string()],
            source_files: Vec::new(),
        })
        .unwrap();
        let filter = routes(registry_with_counter(), Some(emulator));
        for expected in ["first", "second", "first"] {
            let response = warp::test::request()
                .method("POST")
                .path("/api/views/search/messages")
                .reply(&filter)
                .await;
            assert_eq!(response.status(), 200);
            assert_eq!(response.body(), expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_rejected() {
        let filter = routes(registry_with_counter(), None);
        let response = warp::test::request().path("/unknown").reply(&filter).await;
        assert_eq!(response.status(), 404);
    }
}
