//! In-process anomaly event bus.
//!
//! Detector outputs land on a bounded channel (drop-newest under
//! backpressure, with a drop counter), pass through a dedup cache keyed by
//! the canonical metric fingerprint, and fan out sequentially to registered
//! alert callbacks. A failing callback is logged and never blocks the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::Anomaly;

/// Bounded capacity of the in-process anomaly channel.
pub const EVENT_BUS_CAPACITY: usize = 100;

/// Default suppression window for duplicate anomalies.
pub const DEFAULT_DEDUP_TTL_SECS: i64 = 30 * 60;

/// A confirmed anomaly enriched with its origin.
#[derive(Debug, Clone, Serialize)]
pub struct AnomalyEvent {
    pub detector_id: String,
    pub metric: String,
    pub labels: HashMap<String, String>,
    pub anomaly: Anomaly,
    pub occurred_at: DateTime<Utc>,
}

impl AnomalyEvent {
    pub fn new(
        detector_id: impl Into<String>,
        metric: impl Into<String>,
        labels: HashMap<String, String>,
        anomaly: Anomaly,
    ) -> Self {
        Self {
            detector_id: detector_id.into(),
            metric: metric.into(),
            labels,
            anomaly,
            occurred_at: Utc::now(),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.metric, &self.labels)
    }
}

/// Canonical dedup key: metric name plus the label set sorted by key, so
/// identical label sets fingerprint identically regardless of map order.
pub fn fingerprint(metric: &str, labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<(&String, &String)> = labels.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    format!("{metric}{{{joined}}}")
}

/// Last-alert cache used to suppress duplicate anomalies.
///
/// An entry suppresses re-emission for the TTL after its last alert. The
/// TTL can be overridden per detector.
pub struct DedupCache {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    default_ttl: ChronoDuration,
    overrides: RwLock<HashMap<String, ChronoDuration>>,
}

impl DedupCache {
    pub fn new(default_ttl: std::time::Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl: ChronoDuration::from_std(default_ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(DEFAULT_DEDUP_TTL_SECS)),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_detector_ttl(&self, detector_id: &str, ttl: std::time::Duration) {
        if let Ok(ttl) = ChronoDuration::from_std(ttl) {
            self.overrides
                .write()
                .await
                .insert(detector_id.to_string(), ttl);
        }
    }

    pub async fn clear_detector_ttl(&self, detector_id: &str) {
        self.overrides.write().await.remove(detector_id);
    }

    /// Record the alert and report whether it should be emitted. Suppressed
    /// alerts do not refresh the recorded time.
    pub async fn should_emit(&self, detector_id: &str, key: &str) -> bool {
        self.should_emit_at(detector_id, key, Utc::now()).await
    }

    async fn should_emit_at(&self, detector_id: &str, key: &str, now: DateTime<Utc>) -> bool {
        let ttl = self
            .overrides
            .read()
            .await
            .get(detector_id)
            .copied()
            .unwrap_or(self.default_ttl);
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(last) if now - *last < ttl => false,
            _ => {
                entries.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop entries old enough that they can no longer suppress anything.
    pub async fn prune(&self) {
        let max_ttl = {
            let overrides = self.overrides.read().await;
            overrides
                .values()
                .copied()
                .chain(std::iter::once(self.default_ttl))
                .max()
                .unwrap_or(self.default_ttl)
        };
        let cutoff = Utc::now() - max_ttl;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, last| *last >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "pruned dedup cache");
        }
    }

    pub fn spawn_reaper(
        self: Arc<Self>,
        interval: std::time::Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => self.prune().await,
                }
            }
        })
    }
}

/// Alert callback signature: callbacks own their event copy and report
/// failures for logging.
pub type AlertCallback =
    Arc<dyn Fn(AnomalyEvent) -> BoxFuture<'static, crate::EngineResult<()>> + Send + Sync>;

/// The bus itself. Publishing is non-blocking; a full channel drops the
/// newest event and bumps the drop counter.
pub struct EventBus {
    tx: mpsc::Sender<AnomalyEvent>,
    rx: Mutex<Option<mpsc::Receiver<AnomalyEvent>>>,
    dropped: AtomicU64,
    dedup: Arc<DedupCache>,
    callbacks: Arc<RwLock<Vec<(String, AlertCallback)>>>,
}

impl EventBus {
    pub fn new(dedup: Arc<DedupCache>) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUS_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
            dedup,
            callbacks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Non-blocking publish with a drop-newest overflow policy.
    pub fn publish(&self, event: AnomalyEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    detector_id = %event.detector_id,
                    metric = %event.metric,
                    dropped,
                    "anomaly channel full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("anomaly channel closed, dropping event");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    /// Register a named alert callback.
    pub async fn subscribe(&self, name: impl Into<String>, callback: AlertCallback) {
        self.callbacks.write().await.push((name.into(), callback));
    }

    /// Start the dispatcher: dedup, then invoke callbacks sequentially. May
    /// be called once; subsequent calls return a no-op handle.
    pub fn spawn_dispatcher(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let bus = self;
        tokio::spawn(async move {
            let Some(mut rx) = bus.rx.lock().await.take() else {
                warn!("event dispatcher already running");
                return;
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("event dispatcher stopped");
                        break;
                    }
                    received = rx.recv() => {
                        let Some(event) = received else { break };
                        bus.dispatch(event).await;
                    }
                }
            }
        })
    }

    async fn dispatch(&self, event: AnomalyEvent) {
        let key = event.fingerprint();
        if !self.dedup.should_emit(&event.detector_id, &key).await {
            debug!(%key, "suppressing duplicate anomaly");
            return;
        }
        let callbacks = self.callbacks.read().await.clone();
        for (name, callback) in callbacks {
            if let Err(e) = callback(event.clone()).await {
                error!(callback = %name, error = %e, "alert callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalySeverity;
    use std::sync::atomic::AtomicUsize;

    fn event(metric: &str, labels: &[(&str, &str)]) -> AnomalyEvent {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AnomalyEvent::new(
            "det-1",
            metric,
            labels,
            Anomaly {
                timestamp: Utc::now(),
                kind: "cpu".to_string(),
                severity: AnomalySeverity::Warning,
                value: 97.0,
                threshold: 2.0,
                source: "statistical".to_string(),
                message: None,
            },
        )
    }

    #[test]
    fn fingerprint_ignores_label_order() {
        let a = fingerprint(
            "cpu_usage",
            &HashMap::from([
                ("instance".to_string(), "a".to_string()),
                ("zone".to_string(), "eu".to_string()),
            ]),
        );
        let b = fingerprint(
            "cpu_usage",
            &HashMap::from([
                ("zone".to_string(), "eu".to_string()),
                ("instance".to_string(), "a".to_string()),
            ]),
        );
        assert_eq!(a, b);
        assert_eq!(a, "cpu_usage{instance=a,zone=eu}");
        assert_eq!(fingerprint("up", &HashMap::new()), "up{}");
    }

    #[tokio::test]
    async fn duplicate_within_ttl_is_suppressed_and_emits_after_expiry() {
        let cache = DedupCache::new(std::time::Duration::from_secs(30 * 60));
        let key = "cpu_usage{instance=a}";
        let start = Utc::now();

        assert!(cache.should_emit_at("det-1", key, start).await);
        // Ten seconds later: suppressed.
        assert!(
            !cache
                .should_emit_at("det-1", key, start + ChronoDuration::seconds(10))
                .await
        );
        // Thirty-one minutes after the first alert: emitted again.
        assert!(
            cache
                .should_emit_at("det-1", key, start + ChronoDuration::minutes(31))
                .await
        );
    }

    #[tokio::test]
    async fn per_detector_ttl_overrides_the_default() {
        let cache = DedupCache::new(std::time::Duration::from_secs(30 * 60));
        cache
            .set_detector_ttl("det-2", std::time::Duration::from_secs(5))
            .await;
        let start = Utc::now();
        assert!(cache.should_emit_at("det-2", "m{}", start).await);
        assert!(
            cache
                .should_emit_at("det-2", "m{}", start + ChronoDuration::seconds(6))
                .await
        );
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let bus = Arc::new(EventBus::new(Arc::new(DedupCache::new(
            std::time::Duration::from_secs(60),
        ))));
        // No dispatcher running: fill the channel past capacity.
        for i in 0..(EVENT_BUS_CAPACITY + 7) {
            bus.publish(event(&format!("m{i}"), &[]));
        }
        assert_eq!(bus.dropped_count(), 7);
    }

    #[tokio::test]
    async fn failing_callback_does_not_block_the_next() {
        let bus = Arc::new(EventBus::new(Arc::new(DedupCache::new(
            std::time::Duration::from_secs(60),
        ))));
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "broken",
            Arc::new(|_| {
                Box::pin(async {
                    Err(crate::EngineError::Handler("boom".to_string()))
                })
            }),
        )
        .await;
        let hits_clone = Arc::clone(&hits);
        bus.subscribe(
            "counter",
            Arc::new(move |_| {
                let hits = Arc::clone(&hits_clone);
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await;

        bus.dispatch(event("cpu_usage", &[("instance", "a")])).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Same fingerprint right away: suppressed, no second hit.
        bus.dispatch(event("cpu_usage", &[("instance", "a")])).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Different labels fingerprint differently.
        bus.dispatch(event("cpu_usage", &[("instance", "b")])).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
