//! Configuration models and loading for the Driftwatch engine.
//!
//! Configuration comes from an optional TOML file with environment-variable
//! overrides layered on top; every section has working defaults so a bare
//! `driftwatch-server` starts against local backends.

mod loader;
mod models;

pub use loader::{ConfigError, load};
pub use models::{
    ActionsConfig, CollectorConfig, Config, DedupConfig, GatewayConfig, LogQueryConfig,
    LogsBackendConfig, MetricsBackendConfig, ServerConfig, StoreConfig, TransformerConfig,
    TransformerKind,
};
