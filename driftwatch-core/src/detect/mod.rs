//! Anomaly detectors.
//!
//! Three variants sit behind the [`Detector`] trait: a statistical z-score
//! detector over a rolling window, a short reactive window variant, and a
//! simplified trainable isolation forest. Variant-specific invariants
//! (threshold ranges, window geometry) are enforced at construction, not in
//! `detect`.

mod isolation;
mod statistical;
mod stats;
mod window;

pub use isolation::IsolationForestDetector;
pub use statistical::StatisticalDetector;
pub use window::WindowDetector;

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{Anomaly, Sample};

/// Detector variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Statistical,
    Window,
    IsolationForest,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Statistical => "statistical",
            DetectorKind::Window => "window",
            DetectorKind::IsolationForest => "isolation_forest",
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DetectorKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "statistical" => Ok(DetectorKind::Statistical),
            "window" => Ok(DetectorKind::Window),
            "isolation_forest" => Ok(DetectorKind::IsolationForest),
            other => Err(EngineError::InvalidInput(format!(
                "unknown detector type '{other}'"
            ))),
        }
    }
}

/// Typed parameter bag for detector construction and reconfiguration.
///
/// Which keys are recognized depends on the variant; keys that a variant does
/// not recognize are rejected rather than ignored, so configuration drift
/// surfaces immediately. Unknown JSON keys are rejected at the serde layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_samples: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_trees: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_mad: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_update: Option<bool>,
}

impl DetectorParams {
    /// Reject parameters the given variant does not recognize.
    pub fn validate_for(&self, kind: DetectorKind) -> EngineResult<()> {
        let mut unrecognized: Vec<&str> = Vec::new();
        match kind {
            DetectorKind::Statistical => {
                if self.num_trees.is_some() {
                    unrecognized.push("num_trees");
                }
                if self.sample_size.is_some() {
                    unrecognized.push("sample_size");
                }
            }
            DetectorKind::Window => {
                if self.min_samples.is_some() {
                    unrecognized.push("min_samples");
                }
                if self.num_trees.is_some() {
                    unrecognized.push("num_trees");
                }
                if self.sample_size.is_some() {
                    unrecognized.push("sample_size");
                }
                if self.auto_update.is_some() {
                    unrecognized.push("auto_update");
                }
            }
            DetectorKind::IsolationForest => {
                if self.window_size.is_some() {
                    unrecognized.push("window_size");
                }
                if self.min_samples.is_some() {
                    unrecognized.push("min_samples");
                }
                if self.use_mad.is_some() {
                    unrecognized.push("use_mad");
                }
                if self.auto_update.is_some() {
                    unrecognized.push("auto_update");
                }
            }
        }
        if unrecognized.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidInput(format!(
                "parameters not recognized by {kind} detectors: {}",
                unrecognized.join(", ")
            )))
        }
    }
}

/// Point-in-time statistics snapshot of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    pub mad: f64,
    pub sample_count: usize,
    pub total_detections: u64,
    pub anomalies_found: u64,
    pub anomaly_rate: f64,
    pub last_detection_at: Option<DateTime<Utc>>,
    pub avg_response_ms: f64,
}

/// Diagnostic health snapshot of a detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorHealth {
    pub healthy: bool,
    pub sample_count: usize,
    /// Samples required before the detector scores anything.
    pub required_samples: usize,
    /// Seconds since the last detect/train call, if any.
    pub staleness_seconds: Option<i64>,
    pub last_detection_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared anomaly-scoring capability set.
///
/// Implementations are plain CPU-bound state machines; callers serialize
/// access (the store guards each engine behind a mutex), so every operation
/// observes a consistent view.
pub trait Detector: Send {
    fn kind(&self) -> DetectorKind;

    /// Streaming detection: scores the sample against the current baseline,
    /// then folds it into the rolling state. Returns at most one anomaly.
    fn detect(&mut self, sample: &Sample) -> EngineResult<Option<Anomaly>>;

    /// Inspection variant: scores the last element of `values` against the
    /// current state without mutating it.
    fn is_anomaly(&self, values: &[f64]) -> EngineResult<(bool, f64)>;

    /// Replace internal state from a historical window.
    fn train(&mut self, values: &[f64]) -> EngineResult<()>;

    /// Apply a parameter bag atomically. Unrecognized keys are rejected.
    fn configure(&mut self, params: &DetectorParams) -> EngineResult<()>;

    /// Replace the threshold atomically.
    fn update_threshold(&mut self, threshold: f64) -> EngineResult<()>;

    fn statistics(&self) -> DetectorStatistics;

    fn health(&self) -> DetectorHealth;
}

/// Build a detector of the given kind, enforcing variant invariants.
pub fn build_detector(
    kind: DetectorKind,
    data_type: &str,
    threshold: f64,
    params: &DetectorParams,
) -> EngineResult<Box<dyn Detector>> {
    match kind {
        DetectorKind::Statistical => Ok(Box::new(StatisticalDetector::new(
            data_type, threshold, params,
        )?)),
        DetectorKind::Window => Ok(Box::new(WindowDetector::new(data_type, threshold, params)?)),
        DetectorKind::IsolationForest => Ok(Box::new(IsolationForestDetector::new(
            data_type, threshold, params,
        )?)),
    }
}

/// Detection bookkeeping shared by all variants. Latency is folded into an
/// exponentially weighted average.
#[derive(Debug, Clone, Default)]
pub(crate) struct DetectionCounters {
    pub total: u64,
    pub anomalies: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub avg_response_ms: f64,
}

const LATENCY_EWMA_ALPHA: f64 = 0.3;

impl DetectionCounters {
    pub fn record(&mut self, started: Instant, anomalous: bool) {
        self.total += 1;
        if anomalous {
            self.anomalies += 1;
        }
        self.observe_latency(started);
    }

    /// Latency-only update, used by training.
    pub fn record_latency(&mut self, started: Instant) {
        self.observe_latency(started);
    }

    pub fn anomaly_rate(&self) -> f64 {
        if self.total > 0 {
            self.anomalies as f64 / self.total as f64
        } else {
            0.0
        }
    }

    fn observe_latency(&mut self, started: Instant) {
        let ms = started.elapsed().as_secs_f64() * 1000.0;
        if self.avg_response_ms == 0.0 {
            self.avg_response_ms = ms;
        } else {
            self.avg_response_ms =
                self.avg_response_ms * (1.0 - LATENCY_EWMA_ALPHA) + ms * LATENCY_EWMA_ALPHA;
        }
        self.last_run_at = Some(Utc::now());
    }

    pub fn staleness_seconds(&self) -> Option<i64> {
        self.last_run_at
            .map(|at| (Utc::now() - at).num_seconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_reject_keys_foreign_to_the_variant() {
        let params = DetectorParams {
            num_trees: Some(10),
            ..Default::default()
        };
        assert!(params.validate_for(DetectorKind::Statistical).is_err());
        assert!(params.validate_for(DetectorKind::IsolationForest).is_ok());

        let params = DetectorParams {
            use_mad: Some(true),
            ..Default::default()
        };
        assert!(params.validate_for(DetectorKind::IsolationForest).is_err());
        assert!(params.validate_for(DetectorKind::Statistical).is_ok());
    }

    #[test]
    fn params_reject_unknown_json_keys() {
        let raw = serde_json::json!({ "window_size": 5, "burst_factor": 2 });
        assert!(serde_json::from_value::<DetectorParams>(raw).is_err());
    }

    #[test]
    fn anomaly_rate_is_zero_before_any_detection() {
        let counters = DetectionCounters::default();
        assert_eq!(counters.anomaly_rate(), 0.0);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            DetectorKind::Statistical,
            DetectorKind::Window,
            DetectorKind::IsolationForest,
        ] {
            assert_eq!(kind.as_str().parse::<DetectorKind>().unwrap(), kind);
        }
        assert!("percentile".parse::<DetectorKind>().is_err());
    }
}
