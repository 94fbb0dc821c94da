use std::time::Instant;

use chrono::Utc;

use crate::detect::stats::RollingWindow;
use crate::detect::{
    DetectionCounters, Detector, DetectorHealth, DetectorKind, DetectorParams, DetectorStatistics,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Anomaly, AnomalySeverity, Sample};

/// Minimum buffered samples before a window detector scores anything.
pub const MIN_WINDOW_SAMPLES: usize = 2;

/// Short reactive window variant.
///
/// Same scoring as [`super::StatisticalDetector`], but the baseline always
/// follows the window (no auto-update toggle) and scoring starts as soon as
/// two samples are buffered. `window_size` has no default; callers choose
/// the reaction window explicitly.
pub struct WindowDetector {
    data_type: String,
    threshold: f64,
    window: RollingWindow,
    counters: DetectionCounters,
}

impl WindowDetector {
    pub fn new(
        data_type: impl Into<String>,
        threshold: f64,
        params: &DetectorParams,
    ) -> EngineResult<Self> {
        params.validate_for(DetectorKind::Window)?;
        if threshold < 0.0 {
            return Err(EngineError::InvalidInput(
                "threshold must be >= 0".to_string(),
            ));
        }
        let window_size = params.window_size.ok_or_else(|| {
            EngineError::InvalidInput("window_size is required for window detectors".to_string())
        })?;
        if window_size < 2 {
            return Err(EngineError::InvalidInput(
                "window_size must be >= 2".to_string(),
            ));
        }
        Ok(Self {
            data_type: data_type.into(),
            threshold,
            window: RollingWindow::new(window_size, params.use_mad.unwrap_or(false)),
            counters: DetectionCounters::default(),
        })
    }

    fn score_to_anomaly(&self, value: f64, score: f64) -> Anomaly {
        let severity = if score > 2.0 * self.threshold {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::Warning
        };
        Anomaly {
            timestamp: Utc::now(),
            kind: self.data_type.clone(),
            severity,
            value,
            threshold: self.threshold,
            source: DetectorKind::Window.as_str().to_string(),
            message: Some(format!(
                "value {value} scored {score:.2} against threshold {}",
                self.threshold
            )),
        }
    }
}

impl Detector for WindowDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Window
    }

    fn detect(&mut self, sample: &Sample) -> EngineResult<Option<Anomaly>> {
        let started = Instant::now();
        let mut outcome = None;

        if self.window.len() >= MIN_WINDOW_SAMPLES {
            let (score, spread_ok) = self.window.score(sample.value);
            if spread_ok && score > self.threshold {
                outcome = Some(self.score_to_anomaly(sample.value, score));
            }
        }

        self.window.push(sample.value);
        self.window.recompute();
        self.counters.record(started, outcome.is_some());
        Ok(outcome)
    }

    fn is_anomaly(&self, values: &[f64]) -> EngineResult<(bool, f64)> {
        let value = *values.last().ok_or_else(|| {
            EngineError::InvalidInput("values must not be empty".to_string())
        })?;
        if self.window.len() < MIN_WINDOW_SAMPLES {
            return Ok((false, 0.0));
        }
        let (score, spread_ok) = self.window.score(value);
        Ok((spread_ok && score > self.threshold, score))
    }

    fn train(&mut self, values: &[f64]) -> EngineResult<()> {
        if values.is_empty() {
            return Err(EngineError::InvalidInput(
                "values must not be empty".to_string(),
            ));
        }
        let started = Instant::now();
        self.window.replace(values);
        self.window.recompute();
        self.counters.record_latency(started);
        Ok(())
    }

    fn configure(&mut self, params: &DetectorParams) -> EngineResult<()> {
        params.validate_for(DetectorKind::Window)?;
        if let Some(window_size) = params.window_size {
            if window_size < 2 {
                return Err(EngineError::InvalidInput(
                    "window_size must be >= 2".to_string(),
                ));
            }
            if window_size != self.window.capacity() {
                self.window.set_capacity(window_size);
            }
        }
        if let Some(use_mad) = params.use_mad {
            self.window.set_use_mad(use_mad);
            self.window.recompute();
        }
        Ok(())
    }

    fn update_threshold(&mut self, threshold: f64) -> EngineResult<()> {
        if threshold < 0.0 {
            return Err(EngineError::InvalidInput(
                "threshold must be >= 0".to_string(),
            ));
        }
        self.threshold = threshold;
        Ok(())
    }

    fn statistics(&self) -> DetectorStatistics {
        DetectorStatistics {
            mean: self.window.mean,
            std_dev: self.window.std_dev,
            median: self.window.median,
            mad: self.window.mad,
            sample_count: self.window.len(),
            total_detections: self.counters.total,
            anomalies_found: self.counters.anomalies,
            anomaly_rate: self.counters.anomaly_rate(),
            last_detection_at: self.counters.last_run_at,
            avg_response_ms: self.counters.avg_response_ms,
        }
    }

    fn health(&self) -> DetectorHealth {
        let warm = self.window.len() >= MIN_WINDOW_SAMPLES;
        DetectorHealth {
            healthy: warm,
            sample_count: self.window.len(),
            required_samples: MIN_WINDOW_SAMPLES,
            staleness_seconds: self.counters.staleness_seconds(),
            last_detection_at: self.counters.last_run_at,
            message: (!warm).then(|| {
                format!(
                    "warming up: {} of {} samples buffered",
                    self.window.len(),
                    MIN_WINDOW_SAMPLES
                )
            }),
        }
    }
}
