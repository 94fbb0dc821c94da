use std::time::Instant;

use chrono::Utc;

use crate::detect::stats::RollingWindow;
use crate::detect::{
    DetectionCounters, Detector, DetectorHealth, DetectorKind, DetectorParams, DetectorStatistics,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Anomaly, AnomalySeverity, Sample};

pub const DEFAULT_WINDOW_SIZE: usize = 300;
pub const DEFAULT_MIN_SAMPLES: usize = 10;

/// Z-score detector over a rolling window.
///
/// Each sample is scored against the baseline formed by prior samples, then
/// folded into the window (evicting the oldest). With `use_mad` the robust
/// `|value − median| / MAD` score replaces `|value − mean| / σ`.
pub struct StatisticalDetector {
    data_type: String,
    threshold: f64,
    min_samples: usize,
    auto_update: bool,
    window: RollingWindow,
    counters: DetectionCounters,
}

impl StatisticalDetector {
    pub fn new(
        data_type: impl Into<String>,
        threshold: f64,
        params: &DetectorParams,
    ) -> EngineResult<Self> {
        params.validate_for(DetectorKind::Statistical)?;
        if threshold < 0.0 {
            return Err(EngineError::InvalidInput(
                "threshold must be >= 0".to_string(),
            ));
        }
        let window_size = params.window_size.unwrap_or(DEFAULT_WINDOW_SIZE);
        if window_size < 2 {
            return Err(EngineError::InvalidInput(
                "window_size must be >= 2".to_string(),
            ));
        }
        let min_samples = params.min_samples.unwrap_or(DEFAULT_MIN_SAMPLES);
        if min_samples < 1 {
            return Err(EngineError::InvalidInput(
                "min_samples must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            data_type: data_type.into(),
            threshold,
            min_samples,
            auto_update: params.auto_update.unwrap_or(true),
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
            source: DetectorKind::Statistical.as_str().to_string(),
            message: Some(format!(
                "value {value} scored {score:.2} against threshold {}",
                self.threshold
            )),
        }
    }
}

impl Detector for StatisticalDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Statistical
    }

    fn detect(&mut self, sample: &Sample) -> EngineResult<Option<Anomaly>> {
        let started = Instant::now();
        let mut outcome = None;

        if self.window.len() >= self.min_samples {
            let (score, spread_ok) = self.window.score(sample.value);
            if spread_ok && score > self.threshold {
                outcome = Some(self.score_to_anomaly(sample.value, score));
            }
        }

        self.window.push(sample.value);
        if self.auto_update {
            self.window.recompute();
        }
        self.counters.record(started, outcome.is_some());
        Ok(outcome)
    }

    fn is_anomaly(&self, values: &[f64]) -> EngineResult<(bool, f64)> {
        let value = *values.last().ok_or_else(|| {
            EngineError::InvalidInput("values must not be empty".to_string())
        })?;
        if self.window.len() < self.min_samples {
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
        params.validate_for(DetectorKind::Statistical)?;
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
        if let Some(min_samples) = params.min_samples {
            if min_samples < 1 {
                return Err(EngineError::InvalidInput(
                    "min_samples must be >= 1".to_string(),
                ));
            }
            self.min_samples = min_samples;
        }
        if let Some(use_mad) = params.use_mad {
            self.window.set_use_mad(use_mad);
            self.window.recompute();
        }
        if let Some(auto_update) = params.auto_update {
            self.auto_update = auto_update;
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
        let warm = self.window.len() >= self.min_samples;
        DetectorHealth {
            healthy: warm,
            sample_count: self.window.len(),
            required_samples: self.min_samples,
            staleness_seconds: self.counters.staleness_seconds(),
            last_detection_at: self.counters.last_run_at,
            message: (!warm).then(|| {
                format!(
                    "warming up: {} of {} samples buffered",
                    self.window.len(),
                    self.min_samples
                )
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample(value: f64) -> Sample {
        Sample::new(value, HashMap::new())
    }

    fn trained_detector(threshold: f64) -> StatisticalDetector {
        let params = DetectorParams {
            window_size: Some(10),
            min_samples: Some(5),
            auto_update: Some(false),
            ..Default::default()
        };
        let mut detector = StatisticalDetector::new("cpu_usage", threshold, &params).unwrap();
        detector
            .train(&[10.0, 11.0, 9.0, 10.0, 10.5, 10.2, 10.8, 9.8, 10.3, 10.6])
            .unwrap();
        detector
    }

    #[test]
    fn trained_baseline_flags_warning_then_critical() {
        let mut detector = trained_detector(2.0);
        let stats = detector.statistics();
        assert!((stats.mean - 10.22).abs() < 1e-9);
        assert!((stats.std_dev - 0.5418).abs() < 1e-3);

        // z slightly above the threshold: warning
        let anomaly = detector.detect(&sample(11.5)).unwrap().expect("anomaly");
        assert_eq!(anomaly.severity, AnomalySeverity::Warning);

        // z far beyond twice the threshold: critical
        let anomaly = detector.detect(&sample(15.0)).unwrap().expect("anomaly");
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
        assert_eq!(anomaly.threshold, 2.0);
        assert_eq!(anomaly.kind, "cpu_usage");

        // near the mean: nothing
        assert!(detector.detect(&sample(10.4)).unwrap().is_none());
    }

    #[test]
    fn fewer_samples_than_min_yields_no_anomalies() {
        let params = DetectorParams {
            window_size: Some(10),
            min_samples: Some(5),
            ..Default::default()
        };
        let mut detector = StatisticalDetector::new("latency", 2.0, &params).unwrap();
        for value in [10.0, 10.0, 10.0, 1_000_000.0] {
            assert!(detector.detect(&sample(value)).unwrap().is_none());
        }
        assert_eq!(detector.statistics().total_detections, 4);
        assert_eq!(detector.statistics().anomalies_found, 0);
    }

    #[test]
    fn zero_spread_never_flags() {
        let params = DetectorParams {
            window_size: Some(10),
            min_samples: Some(2),
            ..Default::default()
        };
        let mut detector = StatisticalDetector::new("flat", 2.0, &params).unwrap();
        detector.train(&[5.0, 5.0, 5.0, 5.0]).unwrap();
        assert!(detector.detect(&sample(9_999.0)).unwrap().is_none());
    }

    #[test]
    fn zero_threshold_flags_everything_off_mean() {
        let mut detector = trained_detector(0.0);
        assert!(detector.detect(&sample(10.23)).unwrap().is_some());
    }

    #[test]
    fn training_twice_is_idempotent() {
        let values = [10.0, 11.0, 9.0, 10.0, 10.5, 10.2, 10.8, 9.8, 10.3, 10.6];
        let params = DetectorParams {
            window_size: Some(10),
            use_mad: Some(true),
            ..Default::default()
        };
        let mut detector = StatisticalDetector::new("cpu", 2.0, &params).unwrap();
        detector.train(&values).unwrap();
        let first = detector.statistics();
        detector.train(&values).unwrap();
        let second = detector.statistics();
        assert_eq!(first.mean, second.mean);
        assert_eq!(first.std_dev, second.std_dev);
        assert_eq!(first.median, second.median);
        assert_eq!(first.mad, second.mad);
    }

    #[test]
    fn threshold_update_leaves_counters_alone() {
        let mut detector = trained_detector(2.0);
        let before = detector.statistics().total_detections;
        detector.update_threshold(3.0).unwrap();
        detector.update_threshold(3.0).unwrap();
        assert_eq!(detector.statistics().total_detections, before);
        assert!(detector.update_threshold(-1.0).is_err());
    }

    #[test]
    fn empty_inputs_are_rejected() {
        let mut detector = trained_detector(2.0);
        assert!(matches!(
            detector.train(&[]),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            detector.is_anomaly(&[]),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn resizing_the_window_clears_buffered_samples() {
        let mut detector = trained_detector(2.0);
        detector
            .configure(&DetectorParams {
                window_size: Some(20),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(detector.statistics().sample_count, 0);
    }

    #[test]
    fn anomalies_never_exceed_total_detections() {
        let mut detector = trained_detector(0.0);
        for value in [1.0, 50.0, 10.0, -3.0, 10.22, 8.0] {
            let _ = detector.detect(&sample(value)).unwrap();
        }
        let stats = detector.statistics();
        assert!(stats.anomalies_found <= stats.total_detections);
        assert!(stats.anomaly_rate <= 1.0);
    }
}
