//! Collector scheduling and sample routing.
//!
//! A tick fires every second and launches every collector whose interval
//! has elapsed as its own task; runs for the same collector never overlap
//! (a tick that finds a run still in flight is skipped, not queued). A bad
//! sample or failed query is logged and never stops the scheduler.

pub mod transform;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{AnomalyEvent, EventBus};
use crate::ingest::logs::LogsClient;
use crate::ingest::metrics::MetricsClient;
use crate::pipeline::transform::{METRIC_NAME_LABEL, StandardTransformer, Transformer};
use crate::store::{DetectorStatus, DetectorStore};
use crate::types::LogStream;

/// Scheduler granularity.
pub const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// A scheduled metric collector bound to an optional detector.
#[derive(Debug, Clone)]
pub struct MetricCollector {
    pub id: String,
    pub query: String,
    pub interval: Duration,
    pub detector_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

struct CollectorEntry {
    collector: MetricCollector,
    transformer: Arc<dyn Transformer>,
}

/// The ingestion pipeline: schedules collectors, transforms results into
/// samples, and routes them into detectors through the store.
pub struct Pipeline {
    metrics: Arc<MetricsClient>,
    store: Arc<DetectorStore>,
    events: Arc<EventBus>,
    collectors: RwLock<HashMap<String, CollectorEntry>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Pipeline {
    pub fn new(
        metrics: Arc<MetricsClient>,
        store: Arc<DetectorStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            metrics,
            store,
            events,
            collectors: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Register a collector. A missing transformer means passthrough.
    pub async fn add_collector(
        &self,
        collector: MetricCollector,
        transformer: Option<Arc<dyn Transformer>>,
    ) -> EngineResult<()> {
        if collector.interval.is_zero() {
            return Err(EngineError::InvalidInput(
                "collector interval must be > 0".to_string(),
            ));
        }
        let mut collectors = self.collectors.write().await;
        if collectors.contains_key(&collector.id) {
            return Err(EngineError::Conflict(format!(
                "collector '{}' already exists",
                collector.id
            )));
        }
        info!(id = %collector.id, query = %collector.query, "collector registered");
        collectors.insert(
            collector.id.clone(),
            CollectorEntry {
                collector,
                transformer: transformer.unwrap_or_else(|| Arc::new(StandardTransformer)),
            },
        );
        Ok(())
    }

    pub async fn remove_collector(&self, id: &str) -> EngineResult<()> {
        let mut collectors = self.collectors.write().await;
        collectors
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("collector '{id}' not found")))
    }

    pub async fn list_collectors(&self) -> Vec<MetricCollector> {
        let collectors = self.collectors.read().await;
        let mut list: Vec<MetricCollector> = collectors
            .values()
            .map(|entry| entry.collector.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Run the scheduler until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCHEDULER_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("pipeline scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("pipeline scheduler stopped");
                        break;
                    }
                    _ = tick.tick() => Arc::clone(&self).launch_due().await,
                }
            }
        })
    }

    async fn launch_due(self: Arc<Self>) {
        let now = Utc::now();
        let due: Vec<(String, String, Option<String>, Arc<dyn Transformer>)> = {
            let mut collectors = self.collectors.write().await;
            let mut in_flight = self.in_flight.lock().await;
            let mut due = Vec::new();
            for entry in collectors.values_mut() {
                let collector = &mut entry.collector;
                let elapsed = collector
                    .last_run_at
                    .map(|last| now - last)
                    .and_then(|d| d.to_std().ok());
                let is_due = match elapsed {
                    None => true,
                    Some(elapsed) => elapsed >= collector.interval,
                };
                if !is_due || in_flight.contains(&collector.id) {
                    continue;
                }
                in_flight.insert(collector.id.clone());
                collector.last_run_at = Some(now);
                due.push((
                    collector.id.clone(),
                    collector.query.clone(),
                    collector.detector_id.clone(),
                    Arc::clone(&entry.transformer),
                ));
            }
            due
        };

        for (id, query, detector_id, transformer) in due {
            let pipeline = Arc::clone(&self);
            tokio::spawn(async move {
                pipeline
                    .run_collector(&id, &query, detector_id.as_deref(), transformer)
                    .await;
                pipeline.in_flight.lock().await.remove(&id);
            });
        }
    }

    async fn run_collector(
        &self,
        id: &str,
        query: &str,
        detector_id: Option<&str>,
        transformer: Arc<dyn Transformer>,
    ) {
        let results = match self.metrics.query(query).await {
            Ok(results) => results,
            Err(error) => {
                warn!(collector = id, %error, "collector query failed");
                return;
            }
        };
        let samples = transformer.transform(&results);
        debug!(collector = id, samples = samples.len(), "collector ran");
        if samples.is_empty() {
            return;
        }

        let Some(detector_id) = detector_id else {
            return;
        };
        if let Err(error) = self.store.mark_run(detector_id).await {
            warn!(collector = id, detector_id, %error, "marking run failed");
        }

        let status = match self.store.status(detector_id).await {
            Ok(status) => status,
            Err(error) => {
                warn!(collector = id, detector_id, %error, "detector lookup failed");
                return;
            }
        };

        match status {
            DetectorStatus::Starting => {
                let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
                if let Err(error) = self.store.train(detector_id, &values).await {
                    warn!(detector_id, %error, "warm-up training failed");
                    return;
                }
                match self.store.promote_if_warm(detector_id).await {
                    Ok(true) => info!(detector_id, "detector promoted to running"),
                    Ok(false) => {}
                    Err(error) => warn!(detector_id, %error, "promotion check failed"),
                }
            }
            DetectorStatus::Running => {
                for sample in &samples {
                    let mut sample = sample.clone();
                    let metric = sample
                        .labels
                        .remove(METRIC_NAME_LABEL)
                        .unwrap_or_else(|| query.to_string());
                    match self.store.detect(detector_id, &sample).await {
                        Ok(Some(anomaly)) => {
                            self.events.publish(AnomalyEvent::new(
                                detector_id,
                                metric,
                                sample.labels.clone(),
                                anomaly,
                            ));
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!(detector_id, %error, "detection failed");
                        }
                    }
                }
            }
            // Stopped, stopping, updating, error: samples are not routed.
            _ => {}
        }
    }
}

/// Callback invoked once per stream returned by a log query.
pub type LogStreamCallback =
    Arc<dyn Fn(String, LogStream) -> BoxFuture<'static, EngineResult<()>> + Send + Sync>;

/// A named log query with its incremental watermark.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub name: String,
    pub query: String,
}

struct LogQueryState {
    query: String,
    /// Upper bound of the last successful poll; advances monotonically.
    last_queried_to: Option<DateTime<Utc>>,
}

/// Polls registered log queries on an interval, tracking a per-query
/// watermark so each poll covers `[watermark, now]`. The watermark only
/// advances on success.
pub struct LogCollector {
    logs: Arc<LogsClient>,
    queries: RwLock<HashMap<String, LogQueryState>>,
    lookback: Duration,
    poll_interval: Duration,
    limit: u32,
}

impl LogCollector {
    pub fn new(
        logs: Arc<LogsClient>,
        lookback: Duration,
        poll_interval: Duration,
        limit: u32,
    ) -> Self {
        Self {
            logs,
            queries: RwLock::new(HashMap::new()),
            lookback,
            poll_interval,
            limit,
        }
    }

    pub async fn register(&self, query: LogQuery) -> EngineResult<()> {
        let mut queries = self.queries.write().await;
        if queries.contains_key(&query.name) {
            return Err(EngineError::Conflict(format!(
                "log query '{}' already registered",
                query.name
            )));
        }
        queries.insert(
            query.name,
            LogQueryState {
                query: query.query,
                last_queried_to: None,
            },
        );
        Ok(())
    }

    pub async fn deregister(&self, name: &str) -> EngineResult<()> {
        self.queries
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("log query '{name}' not found")))
    }

    pub fn spawn(
        self: Arc<Self>,
        callback: LogStreamCallback,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("log collector started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("log collector stopped");
                        break;
                    }
                    _ = tick.tick() => self.poll_all(&callback).await,
                }
            }
        })
    }

    async fn poll_all(&self, callback: &LogStreamCallback) {
        let now = Utc::now();
        let lookback =
            chrono::Duration::from_std(self.lookback).unwrap_or_else(|_| chrono::Duration::zero());
        let pending: Vec<(String, String, DateTime<Utc>)> = {
            let queries = self.queries.read().await;
            queries
                .iter()
                .map(|(name, state)| {
                    let start = state.last_queried_to.unwrap_or(now - lookback);
                    (name.clone(), state.query.clone(), start)
                })
                .collect()
        };

        let polls = pending.into_iter().map(|(name, query, start)| async move {
            match self.logs.query_range(&query, start, now, self.limit).await {
                Ok(streams) => Some((name, streams)),
                Err(error) => {
                    warn!(query = %name, %error, "log poll failed");
                    None
                }
            }
        });
        let outcomes = futures::future::join_all(polls).await;

        for (name, streams) in outcomes.into_iter().flatten() {
            {
                let mut queries = self.queries.write().await;
                if let Some(state) = queries.get_mut(&name) {
                    state.last_queried_to = Some(now);
                }
            }
            for stream in streams {
                if let Err(error) = callback(name.clone(), stream).await {
                    warn!(query = %name, %error, "log callback failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DedupCache;
    use crate::ingest::metrics::MetricsClientConfig;

    async fn pipeline() -> (Pipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DetectorStore::open(dir.path().join("detectors.json"))
                .await
                .unwrap(),
        );
        let metrics = Arc::new(MetricsClient::new(MetricsClientConfig::default()).unwrap());
        let events = Arc::new(EventBus::new(Arc::new(DedupCache::new(
            Duration::from_secs(60),
        ))));
        (Pipeline::new(metrics, store, events), dir)
    }

    fn collector(id: &str, interval_secs: u64) -> MetricCollector {
        MetricCollector {
            id: id.to_string(),
            query: "up".to_string(),
            interval: Duration::from_secs(interval_secs),
            detector_id: None,
            last_run_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_collector_ids_conflict() {
        let (pipeline, _) = pipeline().await;
        pipeline.add_collector(collector("c1", 30), None).await.unwrap();
        assert!(matches!(
            pipeline.add_collector(collector("c1", 30), None).await,
            Err(EngineError::Conflict(_))
        ));
        assert_eq!(pipeline.list_collectors().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let (pipeline, _) = pipeline().await;
        assert!(matches!(
            pipeline.add_collector(collector("c0", 0), None).await,
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn remove_unknown_collector_is_not_found() {
        let (pipeline, _) = pipeline().await;
        assert!(matches!(
            pipeline.remove_collector("ghost").await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn in_flight_collectors_are_skipped_on_the_next_tick() {
        let (pipeline, _) = pipeline().await;
        let pipeline = Arc::new(pipeline);
        pipeline.add_collector(collector("busy", 1), None).await.unwrap();

        // Simulate an in-flight run.
        pipeline.in_flight.lock().await.insert("busy".to_string());
        Arc::clone(&pipeline).launch_due().await;

        // last_run_at untouched because the launch was skipped.
        let listed = pipeline.list_collectors().await;
        assert!(listed[0].last_run_at.is_none());
    }

    #[tokio::test]
    async fn log_query_registration_is_unique() {
        let logs = Arc::new(
            LogsClient::new(crate::ingest::logs::LogsClientConfig::default()).unwrap(),
        );
        let collector = LogCollector::new(
            logs,
            Duration::from_secs(300),
            Duration::from_secs(30),
            1000,
        );
        collector
            .register(LogQuery {
                name: "api-errors".to_string(),
                query: "{app=\"api\"} |= \"error\"".to_string(),
            })
            .await
            .unwrap();
        assert!(
            collector
                .register(LogQuery {
                    name: "api-errors".to_string(),
                    query: "{}".to_string(),
                })
                .await
                .is_err()
        );
        collector.deregister("api-errors").await.unwrap();
        assert!(collector.deregister("api-errors").await.is_err());
    }
}
