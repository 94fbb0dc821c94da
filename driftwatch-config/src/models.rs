use std::path::PathBuf;
use std::time::Duration;

use driftwatch_core::ingest::logs::LogsClientConfig;
use driftwatch_core::ingest::metrics::MetricsClientConfig;
use driftwatch_core::pipeline::transform::AggregateFunction;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub metrics_backend: MetricsBackendConfig,
    pub logs_backend: LogsBackendConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub actions: ActionsConfig,
    pub gateway: GatewayConfig,
    pub dedup: DedupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsBackendConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub cache_ttl_secs: u64,
}

impl Default for MetricsBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
            cache_ttl_secs: 30,
        }
    }
}

impl MetricsBackendConfig {
    pub fn client_config(&self) -> MetricsClientConfig {
        MetricsClientConfig {
            base_url: self.url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsBackendConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// First poll of each query reaches this far back.
    pub lookback_secs: u64,
    pub poll_interval_secs: u64,
    pub query_limit: u32,
    pub queries: Vec<LogQueryConfig>,
}

impl Default for LogsBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3100".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 500,
            lookback_secs: 300,
            poll_interval_secs: 30,
            query_limit: 1000,
            queries: Vec::new(),
        }
    }
}

impl LogsBackendConfig {
    pub fn client_config(&self) -> LogsClientConfig {
        LogsClientConfig {
            base_url: self.url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogQueryConfig {
    pub name: String,
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/detectors.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub collectors: Vec<CollectorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub id: String,
    pub query: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub detector_id: Option<String>,
    #[serde(default)]
    pub transformer: Option<TransformerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerKind {
    Standard,
    Aggregation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub kind: TransformerKind,
    #[serde(default)]
    pub window_secs: Option<u64>,
    #[serde(default)]
    pub function: Option<AggregateFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub scripts_root: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub default_timeout_secs: u64,
    /// Register the cluster resource handler at startup.
    pub kubernetes: bool,
}

impl Default for ActionsConfig {
    fn default() -> Self {
        Self {
            scripts_root: PathBuf::from("./scripts"),
            allowed_extensions: vec![".sh".to_string(), ".py".to_string(), ".rb".to_string()],
            default_timeout_secs: 300,
            kubernetes: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub send_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 60,
            send_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30 * 60,
            reap_interval_secs: 5 * 60,
        }
    }
}
