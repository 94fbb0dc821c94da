use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};

use crate::actions::handlers::ActionHandler;
use crate::actions::{Action, ActionKind, ActionResult};
use crate::error::{EngineError, EngineResult};

/// Applied when the action itself carries no timeout.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ScriptHandlerConfig {
    /// Scripts must live under this directory.
    pub scripts_root: PathBuf,
    /// Allowed file extensions, with the leading dot.
    pub allowed_extensions: Vec<String>,
    pub default_timeout: Duration,
}

impl Default for ScriptHandlerConfig {
    fn default() -> Self {
        Self {
            scripts_root: PathBuf::from("./scripts"),
            allowed_extensions: vec![".sh".to_string(), ".py".to_string(), ".rb".to_string()],
            default_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

/// Runs allow-listed remediation scripts.
///
/// The interpreter is chosen by extension; the working directory is the
/// scripts root; action parameters are exported as `ACTION_PARAM_<KEY>`
/// environment variables on top of the inherited host environment. Exit
/// code zero is success, anything else is failure with the combined output
/// attached.
pub struct ScriptHandler {
    config: ScriptHandlerConfig,
}

impl ScriptHandler {
    pub fn new(config: ScriptHandlerConfig) -> Self {
        Self { config }
    }

    fn interpreter_for(&self, script: &Path) -> EngineResult<&'static str> {
        let extension = script
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        if !self.config.allowed_extensions.contains(&extension) {
            return Err(EngineError::InvalidInput(format!(
                "script extension '{extension}' is not allow-listed"
            )));
        }
        match extension.as_str() {
            ".sh" => Ok("sh"),
            ".py" => Ok("python3"),
            ".rb" => Ok("ruby"),
            other => Err(EngineError::InvalidInput(format!(
                "no interpreter for extension '{other}'"
            ))),
        }
    }

    /// Resolve the script path, rejecting anything that escapes the root.
    fn resolve(&self, script_name: &str) -> EngineResult<PathBuf> {
        let candidate = Path::new(script_name);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(EngineError::InvalidInput(format!(
                "script path '{script_name}' escapes the scripts root"
            )));
        }
        let joined = self.config.scripts_root.join(candidate);
        let resolved = joined.canonicalize().map_err(|_| {
            EngineError::NotFound(format!("script '{script_name}' not found"))
        })?;
        let root = self
            .config
            .scripts_root
            .canonicalize()
            .map_err(|e| EngineError::Internal(format!("scripts root unavailable: {e}")))?;
        if !resolved.starts_with(&root) {
            return Err(EngineError::InvalidInput(format!(
                "script path '{script_name}' escapes the scripts root"
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ActionHandler for ScriptHandler {
    fn name(&self) -> &str {
        "script"
    }

    fn can_handle(&self, kind: ActionKind) -> bool {
        matches!(kind, ActionKind::ExecScript)
    }

    async fn execute(&self, action: &Action) -> EngineResult<ActionResult> {
        let script_name = action.require_param("script_name")?;
        let script = self.resolve(script_name)?;
        let interpreter = self.interpreter_for(&script)?;

        let mut command = Command::new(interpreter);
        command
            .arg(&script)
            .current_dir(&self.config.scripts_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("ACTION_PARAM_TARGET", &action.target)
            .env("TIMESTAMP", Utc::now().to_rfc3339());
        for (key, value) in &action.parameters {
            command.env(format!("ACTION_PARAM_{}", key.to_uppercase()), value);
        }
        command.kill_on_drop(true);

        let limit = action.timeout().unwrap_or(self.config.default_timeout);
        debug!(script = %script.display(), interpreter, timeout_secs = limit.as_secs(), "running script");

        let output = match tokio::time::timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EngineError::Handler(format!(
                    "failed to launch '{script_name}': {e}"
                )));
            }
            Err(_) => {
                return Ok(ActionResult::failed(
                    format!("script timed out after {:.0}s", limit.as_secs_f64()),
                    None,
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().to_string();

        if output.status.success() {
            info!(script = %script.display(), "script succeeded");
            Ok(ActionResult {
                success: true,
                message: format!("script '{script_name}' succeeded"),
                details: (!combined.is_empty()).then_some(combined),
                completed_at: Utc::now(),
            })
        } else {
            Ok(ActionResult::failed(
                format!(
                    "script '{script_name}' exited with {}",
                    output.status.code().map_or_else(
                        || "signal".to_string(),
                        |code| format!("code {code}")
                    )
                ),
                (!combined.is_empty()).then_some(combined),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn handler(root: &Path) -> ScriptHandler {
        ScriptHandler::new(ScriptHandlerConfig {
            scripts_root: root.to_path_buf(),
            ..Default::default()
        })
    }

    fn script_action(name: &str) -> Action {
        Action::new(ActionKind::ExecScript, "run-script").with_param("script_name", name)
    }

    #[tokio::test]
    async fn successful_script_captures_output_and_env() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hello.sh"),
            "echo \"target=$ACTION_PARAM_TARGET region=$ACTION_PARAM_REGION\"\n",
        )
        .unwrap();
        let handler = handler(dir.path());

        let action = script_action("hello.sh").with_param("region", "eu-west-1");
        let result = handler.execute(&action).await.unwrap();
        assert!(result.success);
        let details = result.details.unwrap();
        assert!(details.contains("target=run-script"));
        assert!(details.contains("region=eu-west-1"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fail.sh"), "echo nope; exit 3\n").unwrap();
        let handler = handler(dir.path());

        let result = handler.execute(&script_action("fail.sh")).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("code 3"));
        assert_eq!(result.details.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        for name in ["../evil.sh", "/etc/passwd.sh"] {
            let err = handler.execute(&script_action(name)).await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn disallowed_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("evil.pl"), "print 1;\n").unwrap();
        let handler = handler(dir.path());
        let err = handler.execute(&script_action("evil.pl")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler(dir.path());
        let err = handler.execute(&script_action("ghost.sh")).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
