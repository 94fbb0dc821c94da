use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::actions::handlers::ActionHandler;
use crate::actions::{Action, ActionKind, ActionResult};
use crate::error::{EngineError, EngineResult};

const RESTART_ANNOTATION: &str = "driftwatch.io/restarted-at";
const DEFAULT_NAMESPACE: &str = "default";

/// Restart and scale remediations against cluster workloads.
///
/// Restart bumps a pod-template annotation through a strategic merge patch
/// (deployments and stateful sets) or deletes the pod outright. Scale
/// updates the replica count through the scale subresource; pods are not
/// scalable.
pub struct ResourceHandler {
    client: Client,
}

enum ResourceKind {
    Deployment,
    StatefulSet,
    Pod,
}

impl ResourceKind {
    fn parse(raw: &str) -> EngineResult<Self> {
        match raw {
            "deployment" => Ok(ResourceKind::Deployment),
            "statefulset" => Ok(ResourceKind::StatefulSet),
            "pod" => Ok(ResourceKind::Pod),
            other => Err(EngineError::InvalidInput(format!(
                "unknown resource_type '{other}' (expected deployment, statefulset, or pod)"
            ))),
        }
    }
}

impl ResourceHandler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build from the ambient cluster configuration (kubeconfig or
    /// in-cluster service account).
    pub async fn from_env() -> EngineResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| EngineError::Unavailable(format!("cluster client unavailable: {e}")))?;
        Ok(Self::new(client))
    }

    async fn restart(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> EngineResult<ActionResult> {
        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTART_ANNOTATION: Utc::now().to_rfc3339(),
                        }
                    }
                }
            }
        });
        let params = PatchParams::default();
        match kind {
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Strategic(patch))
                    .await
                    .map_err(cluster_error)?;
            }
            ResourceKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch(name, &params, &Patch::Strategic(patch))
                    .await
                    .map_err(cluster_error)?;
            }
            ResourceKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                api.delete(name, &DeleteParams::default())
                    .await
                    .map_err(cluster_error)?;
            }
        }
        info!(%namespace, %name, "restart issued");
        Ok(ActionResult::succeeded(format!(
            "restart of {namespace}/{name} issued"
        )))
    }

    async fn scale(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> EngineResult<ActionResult> {
        let patch = json!({ "spec": { "replicas": replicas } });
        let params = PatchParams::default();
        match kind {
            ResourceKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                api.patch_scale(name, &params, &Patch::Merge(patch))
                    .await
                    .map_err(cluster_error)?;
            }
            ResourceKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                api.patch_scale(name, &params, &Patch::Merge(patch))
                    .await
                    .map_err(cluster_error)?;
            }
            ResourceKind::Pod => {
                return Err(EngineError::InvalidInput(
                    "unsupported resource: pods are not scalable".to_string(),
                ));
            }
        }
        info!(%namespace, %name, replicas, "scale issued");
        Ok(ActionResult::succeeded(format!(
            "scaled {namespace}/{name} to {replicas} replicas"
        )))
    }
}

fn cluster_error(err: kube::Error) -> EngineError {
    EngineError::Handler(format!("cluster request failed: {err}"))
}

#[async_trait]
impl ActionHandler for ResourceHandler {
    fn name(&self) -> &str {
        "resource"
    }

    fn can_handle(&self, kind: ActionKind) -> bool {
        matches!(kind, ActionKind::Restart | ActionKind::Scale)
    }

    async fn execute(&self, action: &Action) -> EngineResult<ActionResult> {
        let kind = ResourceKind::parse(action.require_param("resource_type")?)?;
        let name = action.require_param("resource_name")?;
        let namespace = action.param("namespace").unwrap_or(DEFAULT_NAMESPACE);

        match action.kind {
            ActionKind::Restart => self.restart(kind, namespace, name).await,
            ActionKind::Scale => {
                let replicas: i32 = action
                    .require_param("replicas")?
                    .parse()
                    .map_err(|_| {
                        EngineError::InvalidInput(
                            "replicas must be a non-negative integer".to_string(),
                        )
                    })?;
                if replicas < 0 {
                    return Err(EngineError::InvalidInput(
                        "replicas must be a non-negative integer".to_string(),
                    ));
                }
                self.scale(kind, namespace, name, replicas).await
            }
            other => Err(EngineError::InvalidInput(format!(
                "resource handler cannot execute '{other}' actions"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_parsing() {
        assert!(ResourceKind::parse("deployment").is_ok());
        assert!(ResourceKind::parse("statefulset").is_ok());
        assert!(ResourceKind::parse("pod").is_ok());
        assert!(ResourceKind::parse("daemonset").is_err());
    }
}
