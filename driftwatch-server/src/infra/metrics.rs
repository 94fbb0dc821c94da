use anyhow::Result;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

/// Self-metrics exposed at `/metrics` in Prometheus text format.
///
/// Values are sampled from live state at render time rather than being
/// incremented inline, so the exposition path stays out of the hot paths.
pub struct EngineMetrics {
    registry: Registry,
    pub detectors: IntGauge,
    pub detections_total: IntGauge,
    pub anomalies_total: IntGauge,
    pub events_dropped_total: IntGauge,
    pub ws_connections: IntGauge,
    pub actions_total: IntGauge,
    pub actions_failed_total: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let detectors = IntGauge::new("driftwatch_detectors", "Registered detectors")?;
        let detections_total = IntGauge::new(
            "driftwatch_detections_total",
            "Samples scored across all detectors",
        )?;
        let anomalies_total = IntGauge::new(
            "driftwatch_anomalies_total",
            "Anomalies found across all detectors",
        )?;
        let events_dropped_total = IntGauge::new(
            "driftwatch_events_dropped_total",
            "Anomaly events dropped by the bus under backpressure",
        )?;
        let ws_connections = IntGauge::new(
            "driftwatch_ws_connections",
            "Active gateway connections",
        )?;
        let actions_total =
            IntGauge::new("driftwatch_actions_total", "Actions in the orchestrator store")?;
        let actions_failed_total = IntGauge::new(
            "driftwatch_actions_failed_total",
            "Actions whose last execution failed",
        )?;

        registry.register(Box::new(detectors.clone()))?;
        registry.register(Box::new(detections_total.clone()))?;
        registry.register(Box::new(anomalies_total.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;
        registry.register(Box::new(ws_connections.clone()))?;
        registry.register(Box::new(actions_total.clone()))?;
        registry.register(Box::new(actions_failed_total.clone()))?;

        Ok(Self {
            registry,
            detectors,
            detections_total,
            anomalies_total,
            events_dropped_total,
            ws_connections,
            actions_total,
            actions_failed_total,
        })
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
