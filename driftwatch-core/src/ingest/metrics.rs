use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::ingest::buffer::MetricsBuffer;
use crate::types::MetricResult;

#[derive(Debug, Clone)]
pub struct MetricsClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub cache_ttl: Duration,
}

impl Default for MetricsClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
        }
    }
}

/// One failed member of a batch execution.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub query: String,
    pub error: String,
}

/// Outcome of a batch execution: partial successes are always preserved.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: HashMap<String, Vec<MetricResult>>,
    pub failures: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregate error carrying the failure count, if any query failed.
    pub fn error(&self) -> Option<EngineError> {
        if self.failures.is_empty() {
            None
        } else {
            Some(EngineError::Unavailable(format!(
                "{} of {} batch queries failed",
                self.failures.len(),
                self.failures.len() + self.results.len()
            )))
        }
    }
}

struct CachedEntry {
    results: Vec<MetricResult>,
    inserted_at: Instant,
}

/// Client for a Prometheus-dialect metric backend.
///
/// Instant queries are cached per client for the configured TTL; transport
/// errors are retried with a linear backoff (`base_delay · (attempt + 1)`).
/// Reply warnings are logged, never fatal.
pub struct MetricsClient {
    http: reqwest::Client,
    config: MetricsClientConfig,
    cache: RwLock<HashMap<String, CachedEntry>>,
}

#[derive(Deserialize)]
struct ApiEnvelope {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    warnings: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Value,
}

impl MetricsClient {
    pub fn new(config: MetricsClientConfig) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| EngineError::Internal(format!("building metrics client: {e}")))?;
        Ok(Self {
            http,
            config,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Execute an instant query, serving from the per-client cache when the
    /// cached result is fresh enough.
    pub async fn query(&self, query: &str) -> EngineResult<Vec<MetricResult>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(query)
                && entry.inserted_at.elapsed() <= self.config.cache_ttl
            {
                debug!(query, "metrics cache hit");
                return Ok(entry.results.clone());
            }
        }

        let url = format!("{}/api/v1/query", self.config.base_url.trim_end_matches('/'));
        let params = vec![("query".to_string(), query.to_string())];
        let data = self.get_with_retry(&url, &params).await?;
        let results = normalize(query, &data);

        self.cache.write().await.insert(
            query.to_string(),
            CachedEntry {
                results: results.clone(),
                inserted_at: Instant::now(),
            },
        );
        Ok(results)
    }

    /// Execute a range query. Range pulls bypass the cache; they exist for
    /// training detectors from history.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> EngineResult<Vec<MetricResult>> {
        if end < start {
            return Err(EngineError::InvalidInput(
                "range end precedes start".to_string(),
            ));
        }
        let url = format!(
            "{}/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );
        let params = vec![
            ("query".to_string(), query.to_string()),
            ("start".to_string(), start.timestamp().to_string()),
            ("end".to_string(), end.timestamp().to_string()),
            ("step".to_string(), format!("{}s", step.as_secs().max(1))),
        ];
        let data = self.get_with_retry(&url, &params).await?;
        Ok(normalize(query, &data))
    }

    /// Execute many queries in parallel, preserving partial successes.
    pub async fn query_batch(&self, queries: &[String]) -> BatchResult {
        let futures = queries.iter().map(|q| async move { (q.clone(), self.query(q).await) });
        let outcomes = futures::future::join_all(futures).await;

        let mut batch = BatchResult::default();
        for (query, outcome) in outcomes {
            match outcome {
                Ok(results) => {
                    batch.results.insert(query, results);
                }
                Err(error) => batch.failures.push(BatchFailure {
                    query,
                    error: error.to_string(),
                }),
            }
        }
        batch
    }

    /// Probe the backend's readiness endpoint.
    pub async fn healthy(&self) -> bool {
        let url = format!("{}/-/healthy", self.config.base_url.trim_end_matches('/'));
        matches!(self.http.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }

    /// Streaming mode: each tick launches one concurrent task per query,
    /// appending results into the buffer.
    pub fn spawn_stream(
        self: Arc<Self>,
        queries: Vec<String>,
        interval: Duration,
        buffer: Arc<MetricsBuffer>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("metric stream stopped");
                        break;
                    }
                    _ = tick.tick() => {
                        for query in &queries {
                            let client = Arc::clone(&client);
                            let buffer = Arc::clone(&buffer);
                            let query = query.clone();
                            tokio::spawn(async move {
                                match client.query(&query).await {
                                    Ok(results) => buffer.extend(results).await,
                                    Err(error) => {
                                        warn!(%query, %error, "streaming query failed")
                                    }
                                }
                            });
                        }
                    }
                }
            }
        })
    }

    async fn get_with_retry(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> EngineResult<ApiData> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_once(url, params).await {
                Ok(data) => return Ok(data),
                Err(error) => {
                    let transient = matches!(
                        error,
                        EngineError::Unavailable(_) | EngineError::Timeout(_)
                    );
                    if !transient || attempt >= self.config.max_retries {
                        return Err(error);
                    }
                    let delay = self.config.retry_base_delay * (attempt + 1);
                    warn!(%url, %error, attempt, "metrics query failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn get_once(&self, url: &str, params: &[(String, String)]) -> EngineResult<ApiData> {
        let response = self.http.get(url).query(params).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::Unavailable(format!(
                "metric backend returned {}",
                response.status()
            )));
        }
        let envelope: ApiEnvelope = response.json().await?;
        for warning in &envelope.warnings {
            warn!(%warning, "metric backend warning");
        }
        if envelope.status != "success" {
            return Err(EngineError::Unavailable(format!(
                "metric backend error: {}",
                envelope.error.unwrap_or_else(|| envelope.status.clone())
            )));
        }
        envelope
            .data
            .ok_or_else(|| EngineError::Unavailable("metric reply had no data".to_string()))
    }
}

/// Flatten a scalar, vector, or matrix reply into metric results. A matrix
/// expands into one result per (labels, point). Malformed members are
/// skipped.
fn normalize(query: &str, data: &ApiData) -> Vec<MetricResult> {
    let mut out = Vec::new();
    match data.result_type.as_str() {
        "scalar" => {
            if let Some((timestamp, value)) = parse_point(&data.result) {
                out.push(MetricResult {
                    name: query.to_string(),
                    value,
                    timestamp,
                    labels: HashMap::new(),
                });
            }
        }
        "vector" => {
            for member in data.result.as_array().into_iter().flatten() {
                let (name, labels) = parse_metric_labels(query, member.get("metric"));
                if let Some((timestamp, value)) = member.get("value").and_then(parse_point) {
                    out.push(MetricResult {
                        name,
                        value,
                        timestamp,
                        labels,
                    });
                }
            }
        }
        "matrix" => {
            for member in data.result.as_array().into_iter().flatten() {
                let (name, labels) = parse_metric_labels(query, member.get("metric"));
                for point in member
                    .get("values")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    if let Some((timestamp, value)) = parse_point(point) {
                        out.push(MetricResult {
                            name: name.clone(),
                            value,
                            timestamp,
                            labels: labels.clone(),
                        });
                    }
                }
            }
        }
        other => {
            warn!(result_type = other, "unsupported metric result type");
        }
    }
    out
}

fn parse_metric_labels(
    query: &str,
    metric: Option<&Value>,
) -> (String, HashMap<String, String>) {
    let mut labels: HashMap<String, String> = metric
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let name = labels
        .remove("__name__")
        .unwrap_or_else(|| query.to_string());
    (name, labels)
}

/// A point is a `[unix-seconds, "value"]` pair.
fn parse_point(point: &Value) -> Option<(DateTime<Utc>, f64)> {
    let pair = point.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    let seconds = pair[0].as_f64()?;
    let value: f64 = pair[1].as_str()?.parse().ok()?;
    let timestamp = DateTime::from_timestamp_millis((seconds * 1000.0) as i64)?;
    Some((timestamp, value))
}
