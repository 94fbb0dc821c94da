use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::models::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: Box<toml::de::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration: defaults, then the optional TOML file, then
/// environment overrides (`DRIFTWATCH_*`).
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source: Box::new(source),
            })?
        }
        None => Config::default(),
    };

    apply_env(&mut config);
    validate(&config)?;
    debug!(?path, "configuration loaded");
    Ok(config)
}

fn apply_env(config: &mut Config) {
    if let Ok(host) = std::env::var("DRIFTWATCH_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("DRIFTWATCH_PORT")
        && let Ok(port) = port.parse()
    {
        config.server.port = port;
    }
    if let Ok(url) = std::env::var("DRIFTWATCH_METRICS_URL") {
        config.metrics_backend.url = url;
    }
    if let Ok(url) = std::env::var("DRIFTWATCH_LOGS_URL") {
        config.logs_backend.url = url;
    }
    if let Ok(path) = std::env::var("DRIFTWATCH_STORE_PATH") {
        config.store.path = path.into();
    }
    if let Ok(root) = std::env::var("DRIFTWATCH_SCRIPTS_ROOT") {
        config.actions.scripts_root = root.into();
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::Invalid("server.port must be non-zero".into()));
    }
    if config.gateway.send_queue_capacity == 0 {
        return Err(ConfigError::Invalid(
            "gateway.send_queue_capacity must be > 0".into(),
        ));
    }
    if config.gateway.heartbeat_interval_secs == 0 || config.gateway.idle_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "gateway intervals must be > 0".into(),
        ));
    }
    if config.logs_backend.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "logs_backend.poll_interval_secs must be > 0".into(),
        ));
    }
    for collector in &config.pipeline.collectors {
        if collector.interval_secs == 0 {
            return Err(ConfigError::Invalid(format!(
                "collector '{}' has a zero interval",
                collector.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_load_without_a_file() {
        let config = load(None).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.metrics_backend.url, "http://localhost:9090");
        assert_eq!(config.dedup.ttl_secs, 1800);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 9999

[metrics_backend]
url = "http://prom.internal:9090"

[[pipeline.collectors]]
id = "cpu"
query = "avg(rate(cpu[1m]))"
interval_secs = 15
detector_id = "det-cpu"

[[logs_backend.queries]]
name = "api-errors"
query = '{{app="api"}} |= "error"'
"#
        )
        .unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.metrics_backend.url, "http://prom.internal:9090");
        assert_eq!(config.pipeline.collectors.len(), 1);
        assert_eq!(config.pipeline.collectors[0].interval_secs, 15);
        assert_eq!(config.logs_backend.queries[0].name, "api-errors");
        // Untouched sections keep defaults.
        assert_eq!(config.gateway.heartbeat_interval_secs, 30);
    }

    #[test]
    fn zero_port_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[server]\nport = 0\n").unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_collector_interval_is_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[[pipeline.collectors]]\nid = \"c\"\nquery = \"up\"\ninterval_secs = 0\n"
        )
        .unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "server = not-a-table").unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ConfigError::Parse { .. })
        ));
    }
}
