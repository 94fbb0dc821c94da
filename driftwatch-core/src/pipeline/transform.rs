use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::types::{MetricResult, Sample};

/// Label under which transformers carry the metric name into samples, so
/// downstream consumers can name anomaly events.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Converts a metric-result list into detector samples.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;
    fn transform(&self, results: &[MetricResult]) -> Vec<Sample>;
}

/// 1:1 passthrough.
pub struct StandardTransformer;

impl Transformer for StandardTransformer {
    fn name(&self) -> &str {
        "standard"
    }

    fn transform(&self, results: &[MetricResult]) -> Vec<Sample> {
        results
            .iter()
            .map(|result| {
                let mut labels = result.labels.clone();
                labels.insert(METRIC_NAME_LABEL.to_string(), result.name.clone());
                Sample::at(result.timestamp, result.value, labels)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Min,
    Max,
    Avg,
    Sum,
}

/// Buckets results by `timestamp / window` and folds each bucket with the
/// chosen function. Bucket labels come from the first result seen in the
/// bucket.
pub struct AggregationTransformer {
    window: Duration,
    function: AggregateFunction,
}

impl AggregationTransformer {
    pub fn new(window: Duration, function: AggregateFunction) -> EngineResult<Self> {
        if window.is_zero() {
            return Err(EngineError::InvalidInput(
                "aggregation window must be > 0".to_string(),
            ));
        }
        Ok(Self { window, function })
    }
}

impl Transformer for AggregationTransformer {
    fn name(&self) -> &str {
        "aggregation"
    }

    fn transform(&self, results: &[MetricResult]) -> Vec<Sample> {
        let window_secs = self.window.as_secs().max(1) as i64;
        let mut buckets: BTreeMap<i64, Vec<&MetricResult>> = BTreeMap::new();
        for result in results {
            let bucket = result.timestamp.timestamp().div_euclid(window_secs);
            buckets.entry(bucket).or_default().push(result);
        }

        buckets
            .into_iter()
            .filter_map(|(bucket, members)| {
                let values: Vec<f64> = members.iter().map(|m| m.value).collect();
                let value = match self.function {
                    AggregateFunction::Min => {
                        values.iter().copied().fold(f64::INFINITY, f64::min)
                    }
                    AggregateFunction::Max => {
                        values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                    }
                    AggregateFunction::Sum => values.iter().sum(),
                    AggregateFunction::Avg => {
                        values.iter().sum::<f64>() / values.len() as f64
                    }
                };
                let first = members.first()?;
                let mut labels = first.labels.clone();
                labels.insert(METRIC_NAME_LABEL.to_string(), first.name.clone());
                let timestamp = DateTime::from_timestamp(bucket * window_secs, 0)?;
                Some(Sample::at(timestamp, value, labels))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn result(offset_secs: i64, value: f64) -> MetricResult {
        MetricResult {
            name: "rps".to_string(),
            value,
            timestamp: Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap(),
            labels: HashMap::from([("job".to_string(), "api".to_string())]),
        }
    }

    #[test]
    fn standard_is_one_to_one_and_carries_the_name() {
        let results = vec![result(0, 1.0), result(1, 2.0)];
        let samples = StandardTransformer.transform(&results);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[0].labels.get(METRIC_NAME_LABEL).unwrap(), "rps");
        assert_eq!(samples[0].labels.get("job").unwrap(), "api");
    }

    #[test]
    fn aggregation_buckets_and_folds() {
        // Two buckets of 60s: [0, 30] and [70].
        let results = vec![result(0, 10.0), result(30, 20.0), result(70, 7.0)];

        let avg = AggregationTransformer::new(Duration::from_secs(60), AggregateFunction::Avg)
            .unwrap()
            .transform(&results);
        assert_eq!(avg.len(), 2);
        assert_eq!(avg[0].value, 15.0);
        assert_eq!(avg[1].value, 7.0);

        let max = AggregationTransformer::new(Duration::from_secs(60), AggregateFunction::Max)
            .unwrap()
            .transform(&results);
        assert_eq!(max[0].value, 20.0);

        let sum = AggregationTransformer::new(Duration::from_secs(60), AggregateFunction::Sum)
            .unwrap()
            .transform(&results);
        assert_eq!(sum[0].value, 30.0);

        let min = AggregationTransformer::new(Duration::from_secs(60), AggregateFunction::Min)
            .unwrap()
            .transform(&results);
        assert_eq!(min[0].value, 10.0);
    }

    #[test]
    fn zero_window_is_rejected() {
        assert!(
            AggregationTransformer::new(Duration::ZERO, AggregateFunction::Avg).is_err()
        );
    }
}
