use thiserror::Error;

/// Engine-wide error type.
///
/// Variants correspond to the stable error kinds surfaced over the HTTP API;
/// the server crate maps them onto status codes.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable machine-readable kind string, used as the `error` field of API
    /// error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unavailable(_) => "unavailable",
            EngineError::Timeout(_) => "timeout",
            EngineError::Handler(_) => "handler_failed",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Human-readable detail string without the kind prefix.
    pub fn details(&self) -> &str {
        match self {
            EngineError::InvalidInput(m)
            | EngineError::NotFound(m)
            | EngineError::Conflict(m)
            | EngineError::Unavailable(m)
            | EngineError::Timeout(m)
            | EngineError::Handler(m)
            | EngineError::Internal(m) => m,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout(err.to_string())
        } else {
            EngineError::Unavailable(err.to_string())
        }
    }
}
