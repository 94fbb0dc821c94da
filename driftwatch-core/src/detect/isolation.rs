use std::collections::VecDeque;
use std::time::Instant;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detect::{
    DetectionCounters, Detector, DetectorHealth, DetectorKind, DetectorParams, DetectorStatistics,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Anomaly, AnomalySeverity, Sample};

pub const DEFAULT_NUM_TREES: usize = 100;
pub const DEFAULT_SAMPLE_SIZE: usize = 256;

const EULER_MASCHERONI: f64 = 0.577_215_664_901_532_9;

/// Simplified trainable isolation forest over scalar samples.
///
/// Trees are grown from random subsamples with uniform split points; the
/// anomaly score is `2^(−(E[h] − 1) / c(n))`, anchored so a point isolated
/// by the first cut of every tree scores 1. A value outside a node's
/// training range is treated as isolated by the next cut, which keeps the
/// score monotone with outlyingness for points beyond the trained span.
///
/// The detector stays silent until `sample_size` points have been collected
/// (the warm-up phase); `train` replaces the pool wholesale.
pub struct IsolationForestDetector {
    data_type: String,
    /// Score threshold in (0, 1].
    threshold: f64,
    num_trees: usize,
    sample_size: usize,
    pool: VecDeque<f64>,
    forest: Vec<IsoTree>,
    rng: StdRng,
    counters: DetectionCounters,
}

impl IsolationForestDetector {
    pub fn new(
        data_type: impl Into<String>,
        threshold: f64,
        params: &DetectorParams,
    ) -> EngineResult<Self> {
        params.validate_for(DetectorKind::IsolationForest)?;
        validate_score_threshold(threshold)?;
        let num_trees = params.num_trees.unwrap_or(DEFAULT_NUM_TREES);
        if num_trees < 1 {
            return Err(EngineError::InvalidInput(
                "num_trees must be >= 1".to_string(),
            ));
        }
        let sample_size = params.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);
        if sample_size < 1 {
            return Err(EngineError::InvalidInput(
                "sample_size must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            data_type: data_type.into(),
            threshold,
            num_trees,
            sample_size,
            pool: VecDeque::with_capacity(sample_size),
            forest: Vec::new(),
            rng: StdRng::seed_from_u64(rand::random()),
            counters: DetectionCounters::default(),
        })
    }

    fn warm(&self) -> bool {
        !self.forest.is_empty()
    }

    fn pool_capacity(&self) -> usize {
        self.sample_size.saturating_mul(4)
    }

    fn push_pool(&mut self, value: f64) {
        if self.pool.len() >= self.pool_capacity() {
            self.pool.pop_front();
        }
        self.pool.push_back(value);
    }

    fn rebuild_forest(&mut self) {
        let data: Vec<f64> = self.pool.iter().copied().collect();
        self.forest = (0..self.num_trees)
            .map(|_| {
                let subsample = subsample(&data, self.sample_size, &mut self.rng);
                IsoTree::build(subsample, &mut self.rng)
            })
            .collect();
    }

    fn score(&self, value: f64) -> f64 {
        if self.forest.is_empty() {
            return 0.0;
        }
        let mean_path: f64 = self
            .forest
            .iter()
            .map(|tree| tree.path_length(value))
            .sum::<f64>()
            / self.forest.len() as f64;
        let denom = average_path_length(self.sample_size).max(1.0);
        let exponent = (mean_path - 1.0).max(0.0) / denom;
        2f64.powf(-exponent).clamp(0.0, 1.0)
    }

    fn score_to_anomaly(&self, value: f64, score: f64) -> Anomaly {
        let critical_bound = (1.5 * self.threshold).min(1.0);
        let severity = if score > critical_bound {
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
            source: DetectorKind::IsolationForest.as_str().to_string(),
            message: Some(format!(
                "isolation score {score:.3} exceeded threshold {}",
                self.threshold
            )),
        }
    }
}

impl Detector for IsolationForestDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::IsolationForest
    }

    fn detect(&mut self, sample: &Sample) -> EngineResult<Option<Anomaly>> {
        let started = Instant::now();

        if !self.warm() {
            self.push_pool(sample.value);
            if self.pool.len() >= self.sample_size {
                self.rebuild_forest();
            }
            self.counters.record(started, false);
            return Ok(None);
        }

        let score = self.score(sample.value);
        self.push_pool(sample.value);
        let outcome = (score > self.threshold).then(|| self.score_to_anomaly(sample.value, score));
        self.counters.record(started, outcome.is_some());
        Ok(outcome)
    }

    fn is_anomaly(&self, values: &[f64]) -> EngineResult<(bool, f64)> {
        let value = *values.last().ok_or_else(|| {
            EngineError::InvalidInput("values must not be empty".to_string())
        })?;
        if !self.warm() {
            return Ok((false, 0.0));
        }
        let score = self.score(value);
        Ok((score > self.threshold, score))
    }

    fn train(&mut self, values: &[f64]) -> EngineResult<()> {
        if values.is_empty() {
            return Err(EngineError::InvalidInput(
                "values must not be empty".to_string(),
            ));
        }
        let started = Instant::now();
        self.pool.clear();
        let skip = values.len().saturating_sub(self.pool_capacity());
        self.pool.extend(values.iter().skip(skip).copied());
        if self.pool.len() >= self.sample_size {
            self.rebuild_forest();
        } else {
            // Not enough history yet: fall back to warm-up.
            self.forest.clear();
        }
        self.counters.record_latency(started);
        Ok(())
    }

    fn configure(&mut self, params: &DetectorParams) -> EngineResult<()> {
        params.validate_for(DetectorKind::IsolationForest)?;
        if let Some(num_trees) = params.num_trees {
            if num_trees < 1 {
                return Err(EngineError::InvalidInput(
                    "num_trees must be >= 1".to_string(),
                ));
            }
            self.num_trees = num_trees;
        }
        if let Some(sample_size) = params.sample_size {
            if sample_size < 1 {
                return Err(EngineError::InvalidInput(
                    "sample_size must be >= 1".to_string(),
                ));
            }
            if sample_size != self.sample_size {
                // Geometry change: restart the warm-up from scratch.
                self.sample_size = sample_size;
                self.pool.clear();
                self.forest.clear();
                return Ok(());
            }
        }
        if self.warm() {
            self.rebuild_forest();
        }
        Ok(())
    }

    fn update_threshold(&mut self, threshold: f64) -> EngineResult<()> {
        validate_score_threshold(threshold)?;
        self.threshold = threshold;
        Ok(())
    }

    fn statistics(&self) -> DetectorStatistics {
        let n = self.pool.len();
        let mean = if n > 0 {
            self.pool.iter().sum::<f64>() / n as f64
        } else {
            0.0
        };
        let std_dev = if n > 0 {
            (self.pool.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
        } else {
            0.0
        };
        DetectorStatistics {
            mean,
            std_dev,
            median: 0.0,
            mad: 0.0,
            sample_count: n,
            total_detections: self.counters.total,
            anomalies_found: self.counters.anomalies,
            anomaly_rate: self.counters.anomaly_rate(),
            last_detection_at: self.counters.last_run_at,
            avg_response_ms: self.counters.avg_response_ms,
        }
    }

    fn health(&self) -> DetectorHealth {
        DetectorHealth {
            healthy: self.warm(),
            sample_count: self.pool.len(),
            required_samples: self.sample_size,
            staleness_seconds: self.counters.staleness_seconds(),
            last_detection_at: self.counters.last_run_at,
            message: (!self.warm()).then(|| {
                format!(
                    "warming up: {} of {} samples collected",
                    self.pool.len(),
                    self.sample_size
                )
            }),
        }
    }
}

fn validate_score_threshold(threshold: f64) -> EngineResult<()> {
    if threshold <= 0.0 || threshold > 1.0 {
        return Err(EngineError::InvalidInput(
            "isolation forest threshold must be in (0, 1]".to_string(),
        ));
    }
    Ok(())
}

fn subsample(data: &[f64], amount: usize, rng: &mut StdRng) -> Vec<f64> {
    if data.len() <= amount {
        return data.to_vec();
    }
    rand::seq::index::sample(rng, data.len(), amount)
        .iter()
        .map(|i| data[i])
        .collect()
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_MASCHERONI) - 2.0 * (n - 1.0) / n
        }
    }
}

struct IsoTree {
    root: IsoNode,
}

enum IsoNode {
    Leaf {
        size: usize,
    },
    Split {
        at: f64,
        lo: f64,
        hi: f64,
        left: Box<IsoNode>,
        right: Box<IsoNode>,
    },
}

impl IsoTree {
    fn build(values: Vec<f64>, rng: &mut StdRng) -> Self {
        let max_depth = (values.len().max(2) as f64).log2().ceil() as usize;
        Self {
            root: IsoNode::grow(values, 0, max_depth, rng),
        }
    }

    fn path_length(&self, value: f64) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                IsoNode::Leaf { size } => return depth + average_path_length(*size),
                IsoNode::Split {
                    at,
                    lo,
                    hi,
                    left,
                    right,
                } => {
                    // Outside the trained span: one more cut isolates it.
                    if value < *lo || value > *hi {
                        return depth + 1.0;
                    }
                    depth += 1.0;
                    node = if value < *at { left } else { right };
                }
            }
        }
    }
}

impl IsoNode {
    fn grow(values: Vec<f64>, depth: usize, max_depth: usize, rng: &mut StdRng) -> Self {
        if values.len() <= 1 || depth >= max_depth {
            return IsoNode::Leaf {
                size: values.len(),
            };
        }
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !(hi - lo).is_normal() {
            return IsoNode::Leaf {
                size: values.len(),
            };
        }
        let at = rng.random_range(lo..hi);
        let (left, right): (Vec<f64>, Vec<f64>) = values.into_iter().partition(|v| *v < at);
        IsoNode::Split {
            at,
            lo,
            hi,
            left: Box::new(IsoNode::grow(left, depth + 1, max_depth, rng)),
            right: Box::new(IsoNode::grow(right, depth + 1, max_depth, rng)),
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

    fn forest_params(num_trees: usize, sample_size: usize) -> DetectorParams {
        DetectorParams {
            num_trees: Some(num_trees),
            sample_size: Some(sample_size),
            ..Default::default()
        }
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        for bad in [0.0, -0.5, 1.5] {
            assert!(
                IsolationForestDetector::new("net", bad, &forest_params(10, 5)).is_err(),
                "threshold {bad} should be rejected"
            );
        }
        assert!(IsolationForestDetector::new("net", 1.0, &forest_params(10, 5)).is_ok());
    }

    #[test]
    fn warm_up_emits_nothing_then_extreme_outlier_is_critical() {
        let mut detector =
            IsolationForestDetector::new("net", 0.6, &forest_params(10, 5)).unwrap();
        for value in [10.0, 11.0, 9.0, 10.5, 10.2] {
            assert!(detector.detect(&sample(value)).unwrap().is_none());
        }
        // Warm now; a value far outside the trained span isolates at the
        // first cut of every tree.
        let anomaly = detector
            .detect(&sample(100.0))
            .unwrap()
            .expect("outlier should flag");
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
        let (flagged, score) = detector.is_anomaly(&[100.0]).unwrap();
        assert!(flagged);
        assert!(score > 0.9, "score {score} should exceed 0.9");
    }

    #[test]
    fn training_below_sample_size_keeps_the_detector_cold() {
        let mut detector =
            IsolationForestDetector::new("net", 0.6, &forest_params(10, 50)).unwrap();
        detector.train(&[1.0, 2.0, 3.0]).unwrap();
        let (flagged, score) = detector.is_anomaly(&[1_000.0]).unwrap();
        assert!(!flagged);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn score_orders_outliers_above_inliers() {
        let mut detector =
            IsolationForestDetector::new("net", 1.0, &forest_params(50, 64)).unwrap();
        let baseline: Vec<f64> = (0..64).map(|i| 10.0 + (i % 7) as f64 * 0.1).collect();
        detector.train(&baseline).unwrap();
        let (_, inlier) = detector.is_anomaly(&[10.3]).unwrap();
        let (_, outlier) = detector.is_anomaly(&[80.0]).unwrap();
        assert!(
            outlier > inlier,
            "outlier {outlier} should outrank inlier {inlier}"
        );
    }

    #[test]
    fn changing_sample_size_restarts_warm_up() {
        let mut detector =
            IsolationForestDetector::new("net", 0.6, &forest_params(10, 5)).unwrap();
        detector.train(&[10.0, 11.0, 9.0, 10.5, 10.2]).unwrap();
        detector
            .configure(&forest_params(10, 8))
            .unwrap();
        let (flagged, _) = detector.is_anomaly(&[500.0]).unwrap();
        assert!(!flagged, "reconfigured detector should be cold again");
    }
}
