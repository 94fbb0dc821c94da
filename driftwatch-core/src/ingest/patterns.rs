use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};
use crate::types::{LogLevel, LogStream};

/// A performance reading extracted from a log line, normalized to
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    pub value: f64,
    pub unit: String,
}

/// Aggregated view of a log window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogAnalysisReport {
    pub total_logs: usize,
    pub anomaly_count: usize,
    pub error_count: usize,
    pub anomaly_rate: f64,
    pub error_rate: f64,
    /// Hits per configured anomaly pattern.
    pub pattern_summary: HashMap<String, u64>,
    /// Hits per extracted error class.
    pub error_types: HashMap<String, u64>,
    pub performance_data: Vec<PerformanceSample>,
    /// Entries per `YYYY-MM-DDTHH` bucket.
    pub time_distribution: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
pub struct PatternAnalyzerConfig {
    /// A line is anomalous iff it matches any of these.
    pub anomaly_patterns: Vec<String>,
    /// Error class = first capture of the first matching pattern.
    pub error_class_patterns: Vec<String>,
    pub cache_capacity: usize,
}

impl Default for PatternAnalyzerConfig {
    fn default() -> Self {
        Self {
            anomaly_patterns: vec![
                r"(?i)\b(error|exception|fatal|panic|fail(?:ed|ure)?)\b".to_string(),
                r"(?i)(connection refused|connection reset|no route to host|broken pipe)"
                    .to_string(),
                r"(?i)(out of memory|oom[-\s]?kill)".to_string(),
            ],
            error_class_patterns: vec![
                r"(?i)\b(timeout|timed out)\b".to_string(),
                r"(?i)\b(connection refused|connection reset)\b".to_string(),
                r"(?i)\b(out of memory|oom)\b".to_string(),
                r"(?i)\b(permission denied|access denied)\b".to_string(),
                r"(?i)\b(5\d{2})\b".to_string(),
            ],
            cache_capacity: 1024,
        }
    }
}

/// Pattern analysis over parsed log streams.
///
/// Match outcomes are memoized per line in a bounded cache keyed by a
/// rolling hash; a random victim is evicted on overflow.
pub struct PatternAnalyzer {
    anomaly_patterns: Vec<Regex>,
    anomaly_sources: Vec<String>,
    error_class_patterns: Vec<Regex>,
    performance_pattern: Regex,
    cache: Mutex<HashMap<u64, Option<usize>>>,
    cache_capacity: usize,
}

impl PatternAnalyzer {
    pub fn new(config: PatternAnalyzerConfig) -> EngineResult<Self> {
        let anomaly_patterns = compile_all(&config.anomaly_patterns)?;
        let error_class_patterns = compile_all(&config.error_class_patterns)?;
        let performance_pattern =
            Regex::new(r"(?i)\b(?:latency|duration|time|took)\s*[:=]\s*(\d+(?:\.\d+)?)\s*(ms|s|m)\b")
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        Ok(Self {
            anomaly_patterns,
            anomaly_sources: config.anomaly_patterns,
            error_class_patterns,
            performance_pattern,
            cache: Mutex::new(HashMap::new()),
            cache_capacity: config.cache_capacity.max(1),
        })
    }

    pub fn with_defaults() -> EngineResult<Self> {
        Self::new(PatternAnalyzerConfig::default())
    }

    /// Analyze every entry of the given streams.
    pub fn analyze(&self, streams: &[LogStream]) -> LogAnalysisReport {
        let mut report = LogAnalysisReport::default();

        for stream in streams {
            for entry in &stream.entries {
                report.total_logs += 1;

                if let Some(pattern_idx) = self.match_anomaly(&entry.message) {
                    report.anomaly_count += 1;
                    *report
                        .pattern_summary
                        .entry(self.anomaly_sources[pattern_idx].clone())
                        .or_insert(0) += 1;
                }

                if entry.level == LogLevel::Error {
                    report.error_count += 1;
                    if let Some(class) = self.error_class(&entry.message) {
                        *report.error_types.entry(class).or_insert(0) += 1;
                    }
                }

                if let Some(sample) = self.performance_value(&entry.message) {
                    report.performance_data.push(sample);
                }

                let bucket = entry.timestamp.format("%Y-%m-%dT%H").to_string();
                *report.time_distribution.entry(bucket).or_insert(0) += 1;
            }
        }

        if report.total_logs > 0 {
            report.anomaly_rate = report.anomaly_count as f64 / report.total_logs as f64;
            report.error_rate = report.error_count as f64 / report.total_logs as f64;
        }
        report
    }

    /// Index of the first matching anomaly pattern, memoized per line.
    fn match_anomaly(&self, line: &str) -> Option<usize> {
        let key = rolling_hash(line);
        {
            let cache = self.cache.lock().expect("pattern cache poisoned");
            if let Some(cached) = cache.get(&key) {
                return *cached;
            }
        }

        let outcome = self
            .anomaly_patterns
            .iter()
            .position(|pattern| pattern.is_match(line));

        let mut cache = self.cache.lock().expect("pattern cache poisoned");
        if cache.len() >= self.cache_capacity && !cache.contains_key(&key) {
            let victim_idx = rand::rng().random_range(0..cache.len());
            if let Some(victim) = cache.keys().nth(victim_idx).copied() {
                cache.remove(&victim);
            }
        }
        cache.insert(key, outcome);
        outcome
    }

    fn error_class(&self, line: &str) -> Option<String> {
        for pattern in &self.error_class_patterns {
            if let Some(captures) = pattern.captures(line)
                && let Some(class) = captures.get(1)
            {
                return Some(class.as_str().to_lowercase());
            }
        }
        None
    }

    fn performance_value(&self, line: &str) -> Option<PerformanceSample> {
        let captures = self.performance_pattern.captures(line)?;
        let value: f64 = captures.get(1)?.as_str().parse().ok()?;
        let factor = match captures.get(2)?.as_str().to_lowercase().as_str() {
            "ms" => 1.0,
            "s" => 1_000.0,
            "m" => 60_000.0,
            _ => return None,
        };
        Some(PerformanceSample {
            value: value * factor,
            unit: "ms".to_string(),
        })
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn compile_all(sources: &[String]) -> EngineResult<Vec<Regex>> {
    sources
        .iter()
        .map(|source| {
            Regex::new(source)
                .map_err(|e| EngineError::InvalidInput(format!("bad pattern '{source}': {e}")))
        })
        .collect()
}

fn rolling_hash(line: &str) -> u64 {
    line.bytes()
        .fold(0u64, |hash, byte| hash.wrapping_mul(31).wrapping_add(byte as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogEntry;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap as StdHashMap;

    fn stream_of(lines: &[&str]) -> LogStream {
        let base = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();
        LogStream {
            labels: StdHashMap::new(),
            entries: lines
                .iter()
                .enumerate()
                .map(|(i, line)| LogEntry {
                    timestamp: base + chrono::Duration::minutes(i as i64),
                    message: line.to_string(),
                    level: LogLevel::derive(line),
                    labels: StdHashMap::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn report_counts_anomalies_errors_and_rates() {
        let analyzer = PatternAnalyzer::with_defaults().unwrap();
        let stream = stream_of(&[
            "INFO request served in 12ms",
            "ERROR upstream timed out",
            "connection refused by 10.0.0.7",
            "DEBUG heartbeat",
        ]);
        let report = analyzer.analyze(&[stream]);
        assert_eq!(report.total_logs, 4);
        assert_eq!(report.anomaly_count, 2);
        assert_eq!(report.error_count, 1);
        assert_eq!(report.anomaly_rate, 0.5);
        assert_eq!(report.error_rate, 0.25);
        assert_eq!(report.error_types.get("timed out"), Some(&1));
    }

    #[test]
    fn performance_values_normalize_to_milliseconds() {
        let analyzer = PatternAnalyzer::with_defaults().unwrap();
        let stream = stream_of(&[
            "request took: 250 ms",
            "slow query duration=1.5 s",
            "batch time = 2 m",
        ]);
        let report = analyzer.analyze(&[stream]);
        let values: Vec<f64> = report.performance_data.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![250.0, 1500.0, 120_000.0]);
        assert!(report.performance_data.iter().all(|p| p.unit == "ms"));
    }

    #[test]
    fn time_distribution_buckets_by_hour() {
        let analyzer = PatternAnalyzer::with_defaults().unwrap();
        let stream = stream_of(&["a", "b", "c"]);
        let report = analyzer.analyze(&[stream]);
        assert_eq!(report.time_distribution.get("2026-03-14T09"), Some(&3));
    }

    #[test]
    fn cache_stays_bounded_under_distinct_lines() {
        let analyzer = PatternAnalyzer::new(PatternAnalyzerConfig {
            cache_capacity: 8,
            ..Default::default()
        })
        .unwrap();
        let lines: Vec<String> = (0..100).map(|i| format!("line number {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        analyzer.analyze(&[stream_of(&refs)]);
        assert!(analyzer.cache_len() <= 8);
    }

    #[test]
    fn repeated_lines_hit_the_memo() {
        let analyzer = PatternAnalyzer::with_defaults().unwrap();
        let stream = stream_of(&["ERROR out of memory", "ERROR out of memory"]);
        let report = analyzer.analyze(&[stream]);
        assert_eq!(report.anomaly_count, 2);
        assert_eq!(analyzer.cache_len(), 1);
    }
}
