use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::types::{LogEntry, LogLevel, LogStream};

#[derive(Debug, Clone)]
pub struct LogsClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for LogsClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3100".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Client for a LogQL-dialect log backend.
///
/// Queries are opaque selector-plus-pipeline strings; replies are parsed
/// into [`LogStream`]s with per-line severity derivation. Malformed entries
/// are skipped rather than failing the whole reply.
pub struct LogsClient {
    http: reqwest::Client,
    config: LogsClientConfig,
}

#[derive(Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(default)]
    result: Vec<RawStream>,
}

#[derive(Deserialize)]
struct RawStream {
    #[serde(default)]
    stream: HashMap<String, String>,
    #[serde(default)]
    values: Vec<Value>,
}

impl LogsClient {
    pub fn new(config: LogsClientConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("building logs client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Execute a time-range query. `start`/`end` are sent as UTC nanosecond
    /// timestamps; `limit` is enforced server-side.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> EngineResult<Vec<LogStream>> {
        if end < start {
            return Err(EngineError::InvalidInput(
                "range end precedes start".to_string(),
            ));
        }
        let url = format!(
            "{}/loki/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );
        let params = vec![
            ("query".to_string(), query.to_string()),
            (
                "start".to_string(),
                start.timestamp_nanos_opt().unwrap_or_default().to_string(),
            ),
            (
                "end".to_string(),
                end.timestamp_nanos_opt().unwrap_or_default().to_string(),
            ),
            ("limit".to_string(), limit.to_string()),
        ];

        let mut attempt: u32 = 0;
        let data = loop {
            match self.get_once(&url, &params).await {
                Ok(data) => break data,
                Err(error) => {
                    let transient = matches!(
                        error,
                        EngineError::Unavailable(_) | EngineError::Timeout(_)
                    );
                    if !transient || attempt >= self.config.max_retries {
                        return Err(error);
                    }
                    let delay = self.config.retry_base_delay * (attempt + 1);
                    warn!(%url, %error, attempt, "log query failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        Ok(data.result.into_iter().map(parse_stream).collect())
    }

    /// Probe the backend's readiness endpoint.
    pub async fn healthy(&self) -> bool {
        let url = format!("{}/ready", self.config.base_url.trim_end_matches('/'));
        matches!(self.http.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    async fn get_once(&self, url: &str, params: &[(String, String)]) -> EngineResult<ApiData> {
        let response = self.http.get(url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Unavailable(format!(
                "log backend returned {}",
                response.status()
            )));
        }
        let envelope: ApiEnvelope = response.json().await?;
        if envelope.status != "success" {
            return Err(EngineError::Unavailable(format!(
                "log backend error: {}",
                envelope.error.unwrap_or_else(|| envelope.status.clone())
            )));
        }
        envelope
            .data
            .ok_or_else(|| EngineError::Unavailable("log reply had no data".to_string()))
    }
}

/// Parse one raw stream, skipping malformed value pairs. Entries come back
/// time-ordered ascending.
fn parse_stream(raw: RawStream) -> LogStream {
    let mut entries: Vec<LogEntry> = raw
        .values
        .iter()
        .filter_map(|pair| parse_entry(pair, &raw.stream))
        .collect();
    entries.sort_by_key(|entry| entry.timestamp);
    LogStream {
        labels: raw.stream,
        entries,
    }
}

/// A value pair is `["<unix-nanos>", "<line>"]`.
fn parse_entry(pair: &Value, labels: &HashMap<String, String>) -> Option<LogEntry> {
    let pair = pair.as_array()?;
    if pair.len() != 2 {
        debug!("skipping log value with unexpected arity");
        return None;
    }
    let nanos: i64 = pair[0].as_str()?.parse().ok()?;
    let message = pair[1].as_str()?.to_string();
    let level = LogLevel::derive(&message);
    Some(LogEntry {
        timestamp: DateTime::from_timestamp_nanos(nanos),
        message,
        level,
        labels: labels.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_parsing_skips_malformed_entries() {
        let raw: RawStream = serde_json::from_value(json!({
            "stream": {"app": "api", "env": "prod"},
            "values": [
                ["1700000001000000000", "INFO request served"],
                ["not-nanos", "dropped"],
                ["1700000000000000000", "ERROR upstream timeout"],
                ["1700000002000000000"]
            ]
        }))
        .unwrap();
        let stream = parse_stream(raw);
        assert_eq!(stream.entries.len(), 2);
        // Sorted ascending despite reply order.
        assert_eq!(stream.entries[0].level, LogLevel::Error);
        assert_eq!(stream.entries[1].level, LogLevel::Info);
        assert_eq!(stream.entries[0].labels.get("app").unwrap(), "api");
    }

    #[test]
    fn empty_label_set_is_legal() {
        let raw: RawStream = serde_json::from_value(json!({
            "values": [["1700000000000000000", "hello"]]
        }))
        .unwrap();
        let stream = parse_stream(raw);
        assert!(stream.labels.is_empty());
        assert_eq!(stream.entries.len(), 1);
    }
}
