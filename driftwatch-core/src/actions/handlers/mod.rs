//! Action handlers.
//!
//! A handler executes a single action kind. Handlers hold no per-invocation
//! state; each call receives only the action, so invocations never share
//! mutable state. All handlers are cancellation-aware: the orchestrator
//! drops the execution future on timeout or shutdown and every suspension
//! point honors that.

mod notify;
mod resource;
mod script;

pub use notify::NotifyHandler;
pub use resource::ResourceHandler;
pub use script::{ScriptHandler, ScriptHandlerConfig};

use async_trait::async_trait;

use crate::actions::{Action, ActionKind, ActionResult};
use crate::error::EngineResult;

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Which kinds this handler can execute.
    fn can_handle(&self, kind: ActionKind) -> bool;

    /// Execute one action. Domain failures come back as a failed
    /// [`ActionResult`]; an `Err` is reserved for invocation-level problems
    /// and is folded into a failed result by the orchestrator.
    async fn execute(&self, action: &Action) -> EngineResult<ActionResult>;
}
