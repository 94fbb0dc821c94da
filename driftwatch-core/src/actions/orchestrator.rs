use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actions::handlers::ActionHandler;
use crate::actions::{Action, ActionKind, ActionResult, ActionStatus};
use crate::error::{EngineError, EngineResult};

/// Registers handlers and drives single actions and dependency plans.
///
/// The `actions` map is the single source of truth for the last result per
/// target; every execution updates it.
pub struct Orchestrator {
    handlers: RwLock<HashMap<ActionKind, Arc<dyn ActionHandler>>>,
    actions: RwLock<HashMap<String, Action>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Index the handler under every kind it can handle. Later registrations
    /// for the same kind replace earlier ones.
    pub async fn register_handler(&self, handler: Arc<dyn ActionHandler>) {
        let mut handlers = self.handlers.write().await;
        for kind in ActionKind::ALL {
            if handler.can_handle(kind) {
                if let Some(previous) = handlers.insert(kind, Arc::clone(&handler)) {
                    debug!(
                        kind = kind.as_str(),
                        replaced = previous.name(),
                        with = handler.name(),
                        "handler replaced"
                    );
                } else {
                    info!(kind = kind.as_str(), handler = handler.name(), "handler registered");
                }
            }
        }
    }

    /// Execute one action to completion, applying its timeout and retry
    /// policy. The returned action carries the final status and result; it
    /// is also stored under its target.
    pub async fn execute_action(&self, cancel: &CancellationToken, mut action: Action) -> Action {
        let handler = self.handlers.read().await.get(&action.kind).cloned();
        let Some(handler) = handler else {
            action.status = ActionStatus::Failed;
            action.result = Some(ActionResult::failed(
                format!("no handler registered for action kind '{}'", action.kind),
                None,
            ));
            action.updated_at = Utc::now();
            self.store(action.clone()).await;
            return action;
        };

        action.status = ActionStatus::Running;
        action.updated_at = Utc::now();
        self.store(action.clone()).await;

        let mut attempt: u32 = 0;
        let final_result = loop {
            match self.invoke(handler.as_ref(), &action, cancel).await {
                Invocation::Cancelled => {
                    action.status = ActionStatus::Cancelled;
                    action.result =
                        Some(ActionResult::failed("execution cancelled", None));
                    action.updated_at = Utc::now();
                    self.store(action.clone()).await;
                    return action;
                }
                Invocation::Completed(result) if result.success => break result,
                Invocation::Completed(result) => {
                    let Some(policy) = action.retry_policy.clone() else {
                        break result;
                    };
                    if attempt >= policy.max_retries {
                        break result;
                    }
                    let delay = policy.delay_for(attempt);
                    warn!(
                        target = %action.target,
                        attempt,
                        delay_secs = delay.as_secs_f64(),
                        message = %result.message,
                        "action failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            action.status = ActionStatus::Cancelled;
                            action.result =
                                Some(ActionResult::failed("execution cancelled", None));
                            action.updated_at = Utc::now();
                            self.store(action.clone()).await;
                            return action;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        };

        action.status = if final_result.success {
            ActionStatus::Succeeded
        } else {
            ActionStatus::Failed
        };
        action.result = Some(final_result);
        action.updated_at = Utc::now();
        self.store(action.clone()).await;
        action
    }

    /// Execute a dependency plan.
    ///
    /// Validation runs before anything executes: duplicate targets, unknown
    /// dependencies, and cycles all reject the whole plan. Execution follows
    /// a topological order; a failed dependency fails every transitive
    /// dependant without invoking it.
    pub async fn execute_plan(
        &self,
        cancel: &CancellationToken,
        actions: Vec<Action>,
    ) -> EngineResult<Vec<Action>> {
        if actions.is_empty() {
            return Err(EngineError::InvalidInput("plan is empty".to_string()));
        }
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, action) in actions.iter().enumerate() {
            if index.insert(action.target.as_str(), i).is_some() {
                return Err(EngineError::InvalidInput(format!(
                    "duplicate target '{}' in plan",
                    action.target
                )));
            }
        }
        for action in &actions {
            for dep in &action.depends_on {
                if !index.contains_key(dep.as_str()) {
                    return Err(EngineError::InvalidInput(format!(
                        "action '{}' depends on unknown target '{dep}'",
                        action.target
                    )));
                }
            }
        }
        let order = topological_order(&actions, &index)?;

        let mut succeeded: HashMap<String, bool> = HashMap::new();
        let mut finished: HashMap<String, Action> = HashMap::new();
        for i in order {
            let action = actions[i].clone();
            let failed_dep = action
                .depends_on
                .iter()
                .find(|dep| !succeeded.get(dep.as_str()).copied().unwrap_or(false))
                .cloned();
            let done = match failed_dep {
                Some(dep) => {
                    let mut skipped = action;
                    let detail = format!("dependency failed: {dep}");
                    skipped.status = ActionStatus::Failed;
                    skipped.result =
                        Some(ActionResult::failed(detail.clone(), Some(detail)));
                    skipped.updated_at = Utc::now();
                    self.store(skipped.clone()).await;
                    skipped
                }
                None => self.execute_action(cancel, action).await,
            };
            succeeded.insert(done.target.clone(), done.status == ActionStatus::Succeeded);
            finished.insert(done.target.clone(), done);
        }

        Ok(actions
            .iter()
            .map(|a| finished[&a.target].clone())
            .collect())
    }

    /// Last stored action for a target.
    pub async fn get_action(&self, target: &str) -> Option<Action> {
        self.actions.read().await.get(target).cloned()
    }

    /// Snapshot copy of the whole action store.
    pub async fn list_actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self.actions.read().await.values().cloned().collect();
        actions.sort_by(|a, b| a.target.cmp(&b.target));
        actions
    }

    pub async fn registered_kinds(&self) -> Vec<ActionKind> {
        let handlers = self.handlers.read().await;
        ActionKind::ALL
            .into_iter()
            .filter(|kind| handlers.contains_key(kind))
            .collect()
    }

    async fn store(&self, action: Action) {
        self.actions
            .write()
            .await
            .insert(action.target.clone(), action);
    }

    async fn invoke(
        &self,
        handler: &dyn ActionHandler,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Invocation {
        let execution = handler.execute(action);
        match action.timeout() {
            Some(limit) => {
                tokio::select! {
                    _ = cancel.cancelled() => Invocation::Cancelled,
                    outcome = tokio::time::timeout(limit, execution) => match outcome {
                        Ok(result) => Invocation::Completed(fold(result)),
                        Err(_) => Invocation::Completed(ActionResult::failed(
                            format!("timed out after {:.1}s", limit.as_secs_f64()),
                            None,
                        )),
                    },
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => Invocation::Cancelled,
                    result = execution => Invocation::Completed(fold(result)),
                }
            }
        }
    }
}

enum Invocation {
    Completed(ActionResult),
    Cancelled,
}

/// Handler errors become failed results; they are never transport errors.
fn fold(outcome: EngineResult<ActionResult>) -> ActionResult {
    match outcome {
        Ok(result) => result,
        Err(error) => ActionResult::failed("handler error", Some(error.to_string())),
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unseen,
    OnPath,
    Done,
}

/// Depth-first topological sort with a visitation stamp; an action seen
/// twice on the current path is a cycle and rejects the plan before any
/// execution.
fn topological_order(
    actions: &[Action],
    index: &HashMap<&str, usize>,
) -> EngineResult<Vec<usize>> {
    let mut marks = vec![Mark::Unseen; actions.len()];
    let mut order = Vec::with_capacity(actions.len());
    for i in 0..actions.len() {
        visit(i, actions, index, &mut marks, &mut order)?;
    }
    Ok(order)
}

fn visit(
    i: usize,
    actions: &[Action],
    index: &HashMap<&str, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) -> EngineResult<()> {
    match marks[i] {
        Mark::Done => Ok(()),
        Mark::OnPath => Err(EngineError::InvalidInput(format!(
            "dependency cycle involving '{}'",
            actions[i].target
        ))),
        Mark::Unseen => {
            marks[i] = Mark::OnPath;
            for dep in &actions[i].depends_on {
                visit(index[dep.as_str()], actions, index, marks, order)?;
            }
            marks[i] = Mark::Done;
            order.push(i);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::actions::RetryPolicy;

    /// Test handler with scripted outcomes per target.
    struct ScriptedHandler {
        kinds: Vec<ActionKind>,
        fail_targets: Vec<String>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        executed: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(kinds: Vec<ActionKind>) -> Self {
            Self {
                kinds,
                fail_targets: Vec::new(),
                calls: AtomicUsize::new(0),
                delay: None,
                executed: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn failing_on(mut self, target: &str) -> Self {
            self.fail_targets.push(target.to_string());
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    #[async_trait]
    impl ActionHandler for ScriptedHandler {
        fn name(&self) -> &str {
            "scripted"
        }

        fn can_handle(&self, kind: ActionKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn execute(&self, action: &Action) -> EngineResult<ActionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.executed.lock().unwrap().push(action.target.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_targets.contains(&action.target) {
                Ok(ActionResult::failed("scripted failure", None))
            } else {
                Ok(ActionResult::succeeded("done"))
            }
        }
    }

    fn action(kind: ActionKind, target: &str, deps: &[&str]) -> Action {
        let mut action = Action::new(kind, target);
        action.depends_on = deps.iter().map(|d| d.to_string()).collect();
        action
    }

    #[tokio::test]
    async fn missing_handler_fails_the_action() {
        let orchestrator = Orchestrator::new();
        let cancel = CancellationToken::new();
        let done = orchestrator
            .execute_action(&cancel, Action::new(ActionKind::Restart, "restart-api"))
            .await;
        assert_eq!(done.status, ActionStatus::Failed);
        assert!(done.result.unwrap().message.contains("no handler"));
    }

    #[tokio::test]
    async fn success_path_updates_the_store() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_handler(Arc::new(ScriptedHandler::new(vec![ActionKind::Notify])))
            .await;
        let cancel = CancellationToken::new();
        let done = orchestrator
            .execute_action(&cancel, Action::new(ActionKind::Notify, "notify-oncall"))
            .await;
        assert_eq!(done.status, ActionStatus::Succeeded);

        let stored = orchestrator.get_action("notify-oncall").await.unwrap();
        assert_eq!(stored.status, ActionStatus::Succeeded);
        assert_eq!(orchestrator.list_actions().await.len(), 1);
    }

    #[tokio::test]
    async fn last_registration_wins_per_kind() {
        let orchestrator = Orchestrator::new();
        let first = Arc::new(ScriptedHandler::new(vec![ActionKind::Notify]).failing_on("t"));
        let second = Arc::new(ScriptedHandler::new(vec![ActionKind::Notify]));
        orchestrator.register_handler(first.clone()).await;
        orchestrator.register_handler(second.clone()).await;

        let cancel = CancellationToken::new();
        let done = orchestrator
            .execute_action(&cancel, Action::new(ActionKind::Notify, "t"))
            .await;
        assert_eq!(done.status, ActionStatus::Succeeded);
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_runs_all_attempts() {
        let orchestrator = Orchestrator::new();
        let handler =
            Arc::new(ScriptedHandler::new(vec![ActionKind::ExecScript]).failing_on("flaky"));
        orchestrator.register_handler(handler.clone()).await;

        let mut action = Action::new(ActionKind::ExecScript, "flaky");
        action.retry_policy = Some(RetryPolicy {
            max_retries: 3,
            retry_interval_secs: 1.0,
            max_interval_secs: Some(5.0),
            multiplier: Some(2.0),
        });

        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let done = orchestrator.execute_action(&cancel, action).await;

        assert_eq!(done.status, ActionStatus::Failed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        // Sleeps of 1s, 2s and 4s between the four attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_a_failed_result() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_handler(Arc::new(
                ScriptedHandler::new(vec![ActionKind::Notify])
                    .with_delay(Duration::from_secs(60)),
            ))
            .await;
        let mut action = Action::new(ActionKind::Notify, "slow");
        action.timeout_secs = Some(1.0);
        let cancel = CancellationToken::new();
        let done = orchestrator.execute_action(&cancel, action).await;
        assert_eq!(done.status, ActionStatus::Failed);
        assert!(done.result.unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn plan_respects_dependency_order() {
        let orchestrator = Orchestrator::new();
        let handler = Arc::new(ScriptedHandler::new(vec![
            ActionKind::Restart,
            ActionKind::Notify,
        ]));
        orchestrator.register_handler(handler.clone()).await;

        let cancel = CancellationToken::new();
        let plan = vec![
            action(ActionKind::Notify, "notify-oncall", &["restart-api"]),
            action(ActionKind::Restart, "restart-api", &[]),
        ];
        let done = orchestrator.execute_plan(&cancel, plan).await.unwrap();
        assert!(done.iter().all(|a| a.status == ActionStatus::Succeeded));

        let order = handler.executed.lock().unwrap().clone();
        assert_eq!(order, vec!["restart-api", "notify-oncall"]);
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependants() {
        let orchestrator = Orchestrator::new();
        let handler = Arc::new(
            ScriptedHandler::new(vec![ActionKind::Restart, ActionKind::Notify])
                .failing_on("restart-api"),
        );
        orchestrator.register_handler(handler.clone()).await;

        let cancel = CancellationToken::new();
        let plan = vec![
            action(ActionKind::Restart, "restart-api", &[]),
            action(ActionKind::Notify, "notify-oncall", &["restart-api"]),
        ];
        let done = orchestrator.execute_plan(&cancel, plan).await.unwrap();

        assert_eq!(done[0].status, ActionStatus::Failed);
        assert_eq!(done[1].status, ActionStatus::Failed);
        assert_eq!(
            done[1].result.as_ref().unwrap().details.as_deref(),
            Some("dependency failed: restart-api")
        );
        // The dependant never reached the handler.
        let executed = handler.executed.lock().unwrap().clone();
        assert_eq!(executed, vec!["restart-api"]);
    }

    #[tokio::test]
    async fn cyclic_plan_executes_nothing() {
        let orchestrator = Orchestrator::new();
        let handler = Arc::new(ScriptedHandler::new(vec![
            ActionKind::Restart,
            ActionKind::Notify,
        ]));
        orchestrator.register_handler(handler.clone()).await;

        let cancel = CancellationToken::new();
        let plan = vec![
            action(ActionKind::Restart, "a", &["b"]),
            action(ActionKind::Notify, "b", &["a"]),
        ];
        let err = orchestrator.execute_plan(&cancel, plan).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(orchestrator.list_actions().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_rejects_the_plan() {
        let orchestrator = Orchestrator::new();
        let cancel = CancellationToken::new();
        let plan = vec![action(ActionKind::Restart, "a", &["ghost"])];
        assert!(orchestrator.execute_plan(&cancel, plan).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_aborts_the_retry_loop() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_handler(Arc::new(
                ScriptedHandler::new(vec![ActionKind::Notify])
                    .failing_on("x")
                    .with_delay(Duration::from_secs(60)),
            ))
            .await;
        let mut action = Action::new(ActionKind::Notify, "x");
        action.retry_policy = Some(RetryPolicy {
            max_retries: 100,
            retry_interval_secs: 60.0,
            max_interval_secs: None,
            multiplier: None,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let done = orchestrator.execute_action(&cancel, action).await;
        assert_eq!(done.status, ActionStatus::Cancelled);
    }
}
