use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use driftwatch_config::Config;
use driftwatch_core::actions::orchestrator::Orchestrator;
use driftwatch_core::events::EventBus;
use driftwatch_core::ingest::logs::LogsClient;
use driftwatch_core::ingest::metrics::MetricsClient;
use driftwatch_core::pipeline::{LogCollector, Pipeline};
use driftwatch_core::store::{DetectorSnapshot, DetectorStore};
use tokio_util::sync::CancellationToken;

use crate::gateway::ConnectionManager;
use crate::infra::metrics::EngineMetrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<DetectorStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<Pipeline>,
    pub log_collector: Arc<LogCollector>,
    pub metrics_client: Arc<MetricsClient>,
    pub logs_client: Arc<LogsClient>,
    pub events: Arc<EventBus>,
    pub gateway: Arc<ConnectionManager>,
    pub metrics: Arc<EngineMetrics>,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Publish a detector lifecycle event to the gateway before the HTTP
    /// response goes out, so subscribers observe the new state first.
    pub async fn publish_detector_event(&self, event_type: &str, snapshot: &DetectorSnapshot) {
        let payload = match serde_json::to_value(snapshot) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        self.gateway
            .publish("detectors", event_type, payload.clone())
            .await;
        self.gateway
            .publish(
                &format!("detector.{}.status", snapshot.config.id),
                event_type,
                payload,
            )
            .await;
    }
}
