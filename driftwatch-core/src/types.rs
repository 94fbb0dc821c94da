use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A timestamped numeric reading with its label set.
///
/// Samples are immutable once produced by a transformer; detectors only read
/// the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Sample {
    pub fn new(value: f64, labels: HashMap<String, String>) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
            labels,
        }
    }

    pub fn at(timestamp: DateTime<Utc>, value: f64, labels: HashMap<String, String>) -> Self {
        Self {
            timestamp,
            value,
            labels,
        }
    }
}

/// One flattened point from a metric backend reply.
///
/// Matrix replies expand into one result per (labels, point).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResult {
    pub name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Log severity, derived from the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Unknown,
}

impl LogLevel {
    /// Derive a level by case-insensitive substring match. Order matters:
    /// error markers win over warning markers, and so on down.
    pub fn derive(line: &str) -> Self {
        let lower = line.to_lowercase();
        if lower.contains("error") || lower.contains("err]") || lower.contains("erro]") {
            LogLevel::Error
        } else if lower.contains("warn") || lower.contains("warning") {
            LogLevel::Warning
        } else if lower.contains("info") {
            LogLevel::Info
        } else if lower.contains("debug") {
            LogLevel::Debug
        } else {
            LogLevel::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warning",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Unknown => "unknown",
        }
    }
}

/// A single log line with its derived level and the labels of the owning
/// stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// An ordered sequence of log entries sharing one label set. Entries are
/// time-ordered ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStream {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub entries: Vec<LogEntry>,
}

/// Severity of a detected anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Warning => "warning",
            AnomalySeverity::Critical => "critical",
        }
    }
}

/// A detector-emitted event indicating a sample deviated from its baseline
/// beyond the configured threshold. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    /// Free-form data-type tag of the emitting detector.
    pub kind: String,
    pub severity: AnomalySeverity,
    /// Observed value that triggered the anomaly.
    pub value: f64,
    /// Threshold in effect at detection time.
    pub threshold: f64,
    /// Which detector variant produced this anomaly.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
