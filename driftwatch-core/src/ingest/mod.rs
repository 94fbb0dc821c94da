//! Clients for the external observability backends.
//!
//! The metric client speaks a Prometheus-style instant/range query API; the
//! log client speaks a LogQL-style range API. Both treat query strings as
//! opaque. Replies are normalized into the crate's domain types and
//! transport failures surface as [`crate::EngineError::Unavailable`] after
//! retries.

pub mod buffer;
pub mod logs;
pub mod metrics;
pub mod patterns;

pub use buffer::MetricsBuffer;
pub use logs::{LogsClient, LogsClientConfig};
pub use metrics::{BatchFailure, BatchResult, MetricsClient, MetricsClientConfig};
pub use patterns::{LogAnalysisReport, PatternAnalyzer, PatternAnalyzerConfig, PerformanceSample};
