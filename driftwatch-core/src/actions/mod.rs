//! Remediation actions.
//!
//! An [`Action`] is a typed request (restart, scale, notify, script) with a
//! target identifier, a parameter map, and optional timeout, retry policy,
//! and dependencies. The [`orchestrator::Orchestrator`] dispatches actions
//! to registered handlers and drives dependency-ordered plans.

pub mod handlers;
pub mod orchestrator;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// The kinds of remediation this engine can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Restart,
    Scale,
    Notify,
    ExecScript,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Restart,
        ActionKind::Scale,
        ActionKind::Notify,
        ActionKind::ExecScript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Restart => "restart",
            ActionKind::Scale => "scale",
            ActionKind::Notify => "notify",
            ActionKind::ExecScript => "exec_script",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Retry policy with optional exponential backoff. A missing multiplier
/// means a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_interval_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

impl RetryPolicy {
    pub fn validate(&self) -> EngineResult<()> {
        if self.retry_interval_secs <= 0.0 {
            return Err(EngineError::InvalidInput(
                "retry_interval_secs must be > 0".to_string(),
            ));
        }
        if let Some(max) = self.max_interval_secs
            && max <= 0.0
        {
            return Err(EngineError::InvalidInput(
                "max_interval_secs must be > 0".to_string(),
            ));
        }
        if let Some(multiplier) = self.multiplier
            && multiplier <= 0.0
        {
            return Err(EngineError::InvalidInput(
                "multiplier must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep before retry number `attempt` (zero-based):
    /// `min(interval · multiplier^attempt, max_interval)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.unwrap_or(1.0);
        let raw = self.retry_interval_secs * multiplier.powi(attempt as i32);
        let capped = self.max_interval_secs.map_or(raw, |max| raw.min(max));
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Final outcome of one action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ActionResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details,
            completed_at: Utc::now(),
        }
    }
}

/// A remediation action. The target is unique within a plan and keys the
/// orchestrator's action store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub target: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Action {
    pub fn new(kind: ActionKind, target: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            kind,
            target: target.into(),
            parameters: HashMap::new(),
            timeout_secs: None,
            retry_policy: None,
            depends_on: Vec::new(),
            status: ActionStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn require_param(&self, key: &str) -> EngineResult<&str> {
        self.param(key).ok_or_else(|| {
            EngineError::InvalidInput(format!(
                "action '{}' is missing required parameter '{key}'",
                self.target
            ))
        })
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

/// Wire shape of an action submission.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type", alias = "kind")]
    pub kind: ActionKind,
    pub target: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ActionRequest {
    pub fn into_action(self) -> EngineResult<Action> {
        if self.target.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "action target must not be empty".to_string(),
            ));
        }
        if let Some(timeout) = self.timeout_secs
            && timeout <= 0.0
        {
            return Err(EngineError::InvalidInput(
                "timeout_secs must be > 0".to_string(),
            ));
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        let mut action = Action::new(self.kind, self.target);
        action.parameters = self.parameters;
        action.timeout_secs = self.timeout_secs;
        action.retry_policy = self.retry_policy;
        action.depends_on = self.depends_on;
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 3,
            retry_interval_secs: 1.0,
            max_interval_secs: Some(5.0),
            multiplier: Some(2.0),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn missing_multiplier_means_fixed_interval() {
        let policy = RetryPolicy {
            max_retries: 2,
            retry_interval_secs: 3.0,
            max_interval_secs: None,
            multiplier: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(5), Duration::from_secs(3));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let policy = RetryPolicy {
            max_retries: 1,
            retry_interval_secs: 0.0,
            max_interval_secs: None,
            multiplier: None,
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn request_validation_rejects_blank_targets() {
        let request = ActionRequest {
            kind: ActionKind::Notify,
            target: "  ".to_string(),
            parameters: HashMap::new(),
            timeout_secs: None,
            retry_policy: None,
            depends_on: Vec::new(),
        };
        assert!(request.into_action().is_err());
    }

    #[test]
    fn action_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ActionKind::ExecScript).unwrap(),
            "\"exec_script\""
        );
        let kind: ActionKind = serde_json::from_str("\"restart\"").unwrap();
        assert_eq!(kind, ActionKind::Restart);
    }
}
