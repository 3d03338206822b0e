//! Row enrichment: synthesizes new columns from existing ones.
//!
//! Each enrich step resolves its source field, optionally extracts a value
//! through a JSON path, optionally runs a regexp with template expansion
//! for every dest field, and optionally scrubs identifiers out of URI
//! values. Steps run in their configured order; each step may process the
//! data rows in parallel ranges.

pub mod uri;

use model::{Config, EnrichStep, QueryConfig};
use regex::Regex;
use shared::codes;
use shared::selfmonitor::SelfMonitor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

pub const NOT_MATCHED: &str = "NOT_MATCHED";
pub const JSON_NOT_PARSED: &str = "JSON_NOT_PARSED";
pub const JSONPATH_ERROR: &str = "JSONPATH_ERROR";
pub const JSONPATH_UNKNOWN_TYPE: &str = "JSONPATH_UNKNOWN_TYPE";

/// How many json-path failures are logged per step per batch.
const JSON_ERROR_LOG_BUDGET: u32 = 5;

pub struct Enricher {
    steps_by_query: HashMap<String, Vec<CompiledStep>>,
    monitor: Arc<SelfMonitor>,
}

struct CompiledStep {
    index: usize,
    source_field: String,
    json_path: Option<String>,
    regex: Option<Regex>,
    dest_fields: Vec<CompiledDest>,
    threads: usize,
}

struct CompiledDest {
    field_name: String,
    template: String,
    default_value: Option<String>,
    uri_processing: Option<model::UriProcessing>,
}

impl Enricher {
    pub fn new(config: &Config, monitor: Arc<SelfMonitor>) -> Self {
        let mut steps_by_query = HashMap::new();
        for (query_name, query) in &config.queries {
            steps_by_query.insert(query_name.clone(), compile_steps(query_name, query));
        }
        Self { steps_by_query, monitor }
    }

    /// Applies every configured step of the query to the batch in place.
    pub fn enrich(&self, query_name: &str, rows: &mut Vec<Vec<String>>) {
        let Some(steps) = self.steps_by_query.get(query_name) else {
            return;
        };
        if rows.is_empty() {
            for step in steps {
                self.monitor.observe_enrich_latency(query_name, step.index, 0.0);
            }
            return;
        }
        for step in steps {
            let started = Instant::now();
            let counts = step.add_columns(query_name, rows);
            if step.regex.is_some() {
                self.monitor.add_regex_matched(query_name, step.index, counts.matched as f64);
                self.monitor
                    .add_regex_not_matched(query_name, step.index, counts.not_matched as f64);
            }
            self.monitor
                .observe_enrich_latency(query_name, step.index, started.elapsed().as_secs_f64());
        }
    }
}

fn compile_steps(query_name: &str, query: &QueryConfig) -> Vec<CompiledStep> {
    let mut compiled = Vec::with_capacity(query.enrich.len());
    for (index, step) in query.enrich.iter().enumerate() {
        match compile_step(index, step) {
            Ok(step) => compiled.push(step),
            Err(err) => tracing::error!(
                error_code = codes::LME_1010,
                query = query_name,
                enrich_index = index,
                %err,
                "enrich step is skipped",
            ),
        }
    }
    compiled
}

fn compile_step(index: usize, step: &EnrichStep) -> anyhow::Result<CompiledStep> {
    let regex = step.regexp.as_deref().map(Regex::new).transpose()?;
    let dest_fields = step
        .dest_fields
        .iter()
        .map(|dest| CompiledDest {
            field_name: dest.field_name.clone(),
            template: dest.template.clone().unwrap_or_default(),
            default_value: dest.default_value.clone().filter(|value| !value.is_empty()),
            uri_processing: dest.uri_processing.is_enabled().then(|| dest.uri_processing.clone()),
        })
        .collect();
    Ok(CompiledStep {
        index,
        source_field: step.source_field.clone(),
        json_path: step.json_path.clone(),
        regex,
        dest_fields,
        threads: step.threads.max(1),
    })
}

#[derive(Default, Clone, Copy)]
struct MatchCounts {
    matched: u64,
    not_matched: u64,
}

impl CompiledStep {
    fn add_columns(&self, query_name: &str, rows: &mut Vec<Vec<String>>) -> MatchCounts {
        let Some(source_index) = rows[0].iter().position(|field| field == &self.source_field)
        else {
            tracing::error!(
                error_code = codes::LME_1010,
                query = query_name,
                enrich_index = self.index,
                source_field = %self.source_field,
                "source field is not found, columns are not added",
            );
            return MatchCounts::default();
        };
        for dest in &self.dest_fields {
            rows[0].push(dest.field_name.clone());
        }

        let data = &mut rows[1..];
        if data.is_empty() {
            return MatchCounts::default();
        }
        let threads = self.threads.min(data.len());
        if threads <= 1 {
            return self.process_range(data, source_index);
        }

        let chunk_size = (data.len() + threads - 1) / threads;
        let partials: Vec<MatchCounts> = std::thread::scope(|scope| {
            let handles: Vec<_> = data
                .chunks_mut(chunk_size)
                .map(|chunk| scope.spawn(move || self.process_range(chunk, source_index)))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        partials.into_iter().fold(MatchCounts::default(), |mut total, counts| {
            total.matched += counts.matched;
            total.not_matched += counts.not_matched;
            total
        })
    }

    fn process_range(&self, rows: &mut [Vec<String>], source_index: usize) -> MatchCounts {
        let mut counts = MatchCounts::default();
        let mut json_error_budget = JSON_ERROR_LOG_BUDGET;
        for row in rows {
            let source = row.get(source_index).cloned().unwrap_or_default();
            let content = match &self.json_path {
                Some(path) => match extract_json_path(&source, path) {
                    Ok(value) => value,
                    Err((sentinel, err)) => {
                        if json_error_budget > 0 {
                            json_error_budget -= 1;
                            tracing::error!(
                                error_code = codes::LME_1011,
                                json_path = %path,
                                %err,
                                "error applying json path",
                            );
                        }
                        sentinel.to_string()
                    }
                },
                None => source,
            };

            match &self.regex {
                Some(regex) => match regex.captures(&content) {
                    Some(captures) => {
                        for dest in &self.dest_fields {
                            counts.matched += 1;
                            let mut value = String::new();
                            captures.expand(&dest.template, &mut value);
                            if let Some(processing) = &dest.uri_processing {
                                value = uri::scrub_uri(&value, processing);
                            }
                            row.push(value);
                        }
                    }
                    None => {
                        for dest in &self.dest_fields {
                            counts.not_matched += 1;
                            row.push(
                                dest.default_value.clone().unwrap_or_else(|| NOT_MATCHED.to_string()),
                            );
                        }
                    }
                },
                None => {
                    for dest in &self.dest_fields {
                        let value = match &dest.uri_processing {
                            Some(processing) => uri::scrub_uri(&content, processing),
                            None => content.clone(),
                        };
                        row.push(value);
                    }
                }
            }
        }
        counts
    }
}

/// Extracts a value through a JSON path. Failures map to sentinel values
/// that flow into the regexp stage like any other content.
fn extract_json_path(data: &str, path: &str) -> Result<String, (&'static str, String)> {
    let json: serde_json::Value = serde_json::from_str(data)
        .map_err(|err| (JSON_NOT_PARSED, err.to_string()))?;
    let matches = jsonpath_lib::select(&json, path)
        .map_err(|err| (JSONPATH_ERROR, err.to_string()))?;
    match matches.as_slice() {
        [] => Err((JSONPATH_ERROR, format!("no value at json path {}", path))),
        [serde_json::Value::String(value)] => Ok(value.clone()),
        [serde_json::Value::Array(items)] => {
            Ok(serde_json::to_string(items).unwrap_or_default())
        }
        [other] => Err((JSONPATH_UNKNOWN_TYPE, format!("unsupported value type at json path: {}", other))),
        many => Ok(serde_json::to_string(&many).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testutil::config_from;

    fn enricher_for(yaml: &str) -> Enricher {
        let config = config_from(yaml);
        let monitor = Arc::new(SelfMonitor::new(&HashMap::new(), true).unwrap());
        Enricher::new(&config, monitor)
    }

    fn base_config(enrich: &str) -> String {
        format!(
            r#"
datasources:
  main:
    type: graylog
    host: http://graylog:9000
queries:
  requests:
    croniter: "* * * * *"
    timerange: 1m
    enrich:
{}
"#,
            enrich
        )
    }

    fn table(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter().map(|row| row.iter().map(|cell| cell.to_string()).collect()).collect()
    }

    #[test]
    fn regexp_capture_expands_the_template() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: message
        regexp: "method=(\\w+) path=(\\S+)"
        dest-fields:
          - field-name: method
            template: "$1"
          - field-name: path
            template: "$2"
"#,
        ));
        let mut rows = table(&[
            &["message"],
            &["method=GET path=/users/42"],
            &["no match here"],
        ]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[0], vec!["message", "method", "path"]);
        assert_eq!(rows[1][1], "GET");
        assert_eq!(rows[1][2], "/users/42");
        assert_eq!(rows[2][1], NOT_MATCHED);
        assert_eq!(rows[2][2], NOT_MATCHED);
    }

    #[test]
    fn default_value_replaces_not_matched() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: message
        regexp: "code=(\\d+)"
        dest-fields:
          - field-name: code
            template: "$1"
            default-value: unknown
"#,
        ));
        let mut rows = table(&[&["message"], &["nothing"]]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[1][1], "unknown");
    }

    #[test]
    fn json_path_extracts_nested_values() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: payload
        json-path: "$.request.url"
        dest-fields:
          - field-name: url
"#,
        ));
        let mut rows = table(&[
            &["payload"],
            &[r#"{"request": {"url": "/orders/15"}}"#],
            &["not json at all"],
        ]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[1][1], "/orders/15");
        assert_eq!(rows[2][1], JSON_NOT_PARSED);
    }

    #[test]
    fn json_path_miss_yields_the_error_sentinel() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: payload
        json-path: "$.missing"
        dest-fields:
          - field-name: value
"#,
        ));
        let mut rows = table(&[&["payload"], &[r#"{"other": 1}"#]]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[1][1], JSONPATH_ERROR);
    }

    #[test]
    fn uri_processing_applies_to_expanded_values() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: message
        regexp: "path=(\\S+)"
        dest-fields:
          - field-name: path
            template: "$1"
            uri-processing:
              uuid-replacer: _UUID_
              number-replacer: _NUMBER_
"#,
        ));
        let mut rows = table(&[
            &["message"],
            &["path=/users/12345678-1234-1234-1234-123456789012/orders/456"],
        ]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[1][1], "/users/_UUID_/orders/_NUMBER_");
    }

    #[test]
    fn steps_chain_in_order() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: message
        regexp: "url=(\\S+)"
        dest-fields:
          - field-name: url
            template: "$1"
      - source-field: url
        regexp: "^/api/(\\w+)"
        dest-fields:
          - field-name: api_group
            template: "$1"
"#,
        ));
        let mut rows = table(&[&["message"], &["url=/api/orders/15"]]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[0], vec!["message", "url", "api_group"]);
        assert_eq!(rows[1][2], "orders");
    }

    #[test]
    fn missing_source_field_skips_the_step() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: absent
        dest-fields:
          - field-name: copy
"#,
        ));
        let mut rows = table(&[&["message"], &["hello"]]);
        enricher.enrich("requests", &mut rows);
        assert_eq!(rows[0], vec!["message"]);
        assert_eq!(rows[1].len(), 1);
    }

    #[test]
    fn parallel_ranges_produce_the_same_result() {
        let enricher = enricher_for(&base_config(
            r#"      - source-field: message
        regexp: "n=(\\d+)"
        threads: 4
        dest-fields:
          - field-name: n
            template: "$1"
"#,
        ));
        let mut rows = vec![vec!["message".to_string()]];
        for index in 0..50 {
            rows.push(vec![format!("n={}", index)]);
        }
        enricher.enrich("requests", &mut rows);
        for (index, row) in rows.iter().enumerate().skip(1) {
            assert_eq!(row[1], (index - 1).to_string());
        }
    }
}
