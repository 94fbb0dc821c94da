use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use driftwatch_config::{Config, TransformerConfig, TransformerKind};
use driftwatch_core::actions::handlers::{
    NotifyHandler, ResourceHandler, ScriptHandler, ScriptHandlerConfig,
};
use driftwatch_core::actions::orchestrator::Orchestrator;
use driftwatch_core::events::{AnomalyEvent, DedupCache, EventBus};
use driftwatch_core::ingest::logs::LogsClient;
use driftwatch_core::ingest::metrics::MetricsClient;
use driftwatch_core::ingest::patterns::PatternAnalyzer;
use driftwatch_core::pipeline::transform::{
    AggregationTransformer, StandardTransformer, Transformer,
};
use driftwatch_core::pipeline::{
    LogCollector, LogQuery, LogStreamCallback, MetricCollector, Pipeline,
};
use driftwatch_core::store::DetectorStore;
use driftwatch_core::types::AnomalySeverity;
use driftwatch_core::EngineError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::ConnectionManager;
use crate::infra::app_state::AppState;
use crate::infra::metrics::EngineMetrics;

/// Assemble every subsystem into the shared application state.
pub async fn build_state(config: Arc<Config>, shutdown: CancellationToken) -> Result<AppState> {
    let store = Arc::new(DetectorStore::open(&config.store.path).await?);

    // Detectors marked active before the last shutdown resume warming up.
    for snapshot in store.list(None, None).await {
        if snapshot.config.is_active {
            if let Err(error) = store.start(&snapshot.config.id).await {
                warn!(id = %snapshot.config.id, %error, "could not resume detector");
            }
        }
    }

    let metrics_client = Arc::new(MetricsClient::new(config.metrics_backend.client_config())?);
    let logs_client = Arc::new(LogsClient::new(config.logs_backend.client_config())?);

    let dedup = Arc::new(DedupCache::new(Duration::from_secs(config.dedup.ttl_secs)));
    let events = Arc::new(EventBus::new(dedup));

    let orchestrator = Arc::new(Orchestrator::new());
    orchestrator
        .register_handler(Arc::new(ScriptHandler::new(ScriptHandlerConfig {
            scripts_root: config.actions.scripts_root.clone(),
            allowed_extensions: config.actions.allowed_extensions.clone(),
            default_timeout: Duration::from_secs(config.actions.default_timeout_secs),
        })))
        .await;
    orchestrator
        .register_handler(Arc::new(NotifyHandler::new()?))
        .await;
    if config.actions.kubernetes {
        match ResourceHandler::from_env().await {
            Ok(handler) => orchestrator.register_handler(Arc::new(handler)).await,
            Err(error) => {
                warn!(%error, "cluster client unavailable; restart/scale actions disabled")
            }
        }
    }

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&metrics_client),
        Arc::clone(&store),
        Arc::clone(&events),
    ));
    for collector in &config.pipeline.collectors {
        pipeline
            .add_collector(
                MetricCollector {
                    id: collector.id.clone(),
                    query: collector.query.clone(),
                    interval: Duration::from_secs(collector.interval_secs),
                    detector_id: collector.detector_id.clone(),
                    last_run_at: None,
                },
                build_transformer(collector.transformer.as_ref())?,
            )
            .await?;
    }

    let log_collector = Arc::new(LogCollector::new(
        Arc::clone(&logs_client),
        Duration::from_secs(config.logs_backend.lookback_secs),
        Duration::from_secs(config.logs_backend.poll_interval_secs),
        config.logs_backend.query_limit,
    ));
    for query in &config.logs_backend.queries {
        log_collector
            .register(LogQuery {
                name: query.name.clone(),
                query: query.query.clone(),
            })
            .await?;
    }

    let gateway = Arc::new(ConnectionManager::new(
        config.gateway.send_queue_capacity,
        Duration::from_secs(config.gateway.heartbeat_interval_secs),
        Duration::from_secs(config.gateway.idle_timeout_secs),
    ));

    // Fan confirmed anomalies out to the gateway topics.
    {
        let gateway = Arc::clone(&gateway);
        events
            .subscribe(
                "gateway",
                Arc::new(move |event: AnomalyEvent| {
                    let gateway = Arc::clone(&gateway);
                    Box::pin(async move {
                        let payload = serde_json::to_value(&event)
                            .map_err(|e| EngineError::Internal(e.to_string()))?;
                        gateway.publish("anomalies", "anomaly", payload.clone()).await;
                        if event.anomaly.severity == AnomalySeverity::Critical {
                            gateway
                                .publish("anomalies.critical", "anomaly", payload.clone())
                                .await;
                        }
                        gateway
                            .publish(
                                &format!("detector.{}.metrics", event.detector_id),
                                "anomaly",
                                payload,
                            )
                            .await;
                        Ok(())
                    })
                }),
            )
            .await;
    }

    let metrics = Arc::new(EngineMetrics::new()?);

    Ok(AppState {
        config,
        store,
        orchestrator,
        pipeline,
        log_collector,
        metrics_client,
        logs_client,
        events,
        gateway,
        metrics,
        shutdown,
        started_at: Utc::now(),
    })
}

fn build_transformer(config: Option<&TransformerConfig>) -> Result<Option<Arc<dyn Transformer>>> {
    match config {
        None => Ok(None),
        Some(cfg) => match cfg.kind {
            TransformerKind::Standard => Ok(Some(Arc::new(StandardTransformer))),
            TransformerKind::Aggregation => {
                let window = Duration::from_secs(cfg.window_secs.unwrap_or(60));
                let function = cfg
                    .function
                    .unwrap_or(driftwatch_core::pipeline::transform::AggregateFunction::Avg);
                Ok(Some(Arc::new(AggregationTransformer::new(
                    window, function,
                )?)))
            }
        },
    }
}

/// Start the long-lived background tasks. Each terminates on the shutdown
/// token.
pub fn spawn_background(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    tasks.push(Arc::clone(&state.pipeline).spawn(state.shutdown.clone()));
    tasks.push(Arc::clone(&state.events).spawn_dispatcher(state.shutdown.clone()));
    tasks.push(Arc::clone(state.events.dedup()).spawn_reaper(
        Duration::from_secs(state.config.dedup.reap_interval_secs),
        state.shutdown.clone(),
    ));
    tasks.push(Arc::clone(&state.gateway).spawn_heartbeat(state.shutdown.clone()));

    let analyzer =
        Arc::new(PatternAnalyzer::with_defaults().expect("default log patterns compile"));
    let callback: LogStreamCallback = Arc::new(move |name, stream| {
        let analyzer = Arc::clone(&analyzer);
        Box::pin(async move {
            let report = analyzer.analyze(std::slice::from_ref(&stream));
            if report.anomaly_count > 0 {
                warn!(
                    query = %name,
                    anomalies = report.anomaly_count,
                    errors = report.error_count,
                    total = report.total_logs,
                    "log anomalies detected"
                );
            } else {
                debug!(query = %name, total = report.total_logs, "log window analyzed");
            }
            Ok(())
        })
    });
    tasks.push(
        Arc::clone(&state.log_collector).spawn(callback, state.shutdown.clone()),
    );

    info!(tasks = tasks.len(), "background tasks started");
    tasks
}
