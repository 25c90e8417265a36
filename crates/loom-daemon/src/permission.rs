use crate::plan_review::{resolve_plan_review, PlanRenderer};
use crate::session::{PermissionResult, ToolPermissionHandler, ToolUseContext};
use async_trait::async_trait;
use chrono::Utc;
use loom_core::ephemeral::{Namespace, PermissionDecision, PermissionRequest, PermissionResponse};
use loom_core::store::{DocStore, EphemeralSpace, Origin};
use loom_core::TaskStatus;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PLAN_EXIT_TOOL: &str = "ExitPlanMode";
pub const ABORTED_MESSAGE: &str = "Task was aborted";
const DENIED_MESSAGE: &str = "Permission denied by user";
const CHANGES_REQUESTED_MESSAGE: &str = "User requested changes";

/// Routes tool-permission checks to the browser through the task's
/// ephemeral permission namespaces.
pub struct PermissionTunnel {
    store: Arc<DocStore>,
    renderer: Arc<dyn PlanRenderer>,
}

impl PermissionTunnel {
    pub fn new(store: Arc<DocStore>, renderer: Arc<dyn PlanRenderer>) -> Self {
        Self { store, renderer }
    }

    /// Publishes a request and waits for the first remote response for the
    /// same tool use, or for `cancel`.
    pub async fn request(
        &self,
        task_id: &str,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
        cancel: &CancellationToken,
    ) -> PermissionResult {
        let task = self.store.task(task_id).await;
        let space = task.ephemeral();
        let key = context.tool_use_id.clone();
        let mut events = space.subscribe();

        let request = PermissionRequest {
            tool_name: tool_name.to_string(),
            input: input.clone(),
            risk_level: context.risk_level,
            reason: context.reason.clone(),
            blocked_path: context.blocked_path.clone(),
            agent_id: context.agent_id.clone(),
            created_at: Utc::now().to_rfc3339(),
        };
        if let Err(err) = space
            .set(Namespace::PermissionRequests, &key, &request, Origin::Local)
            .await
        {
            warn!(event = "permission_publish_failed", task_id = %task_id, tool_use_id = %key, error = %err);
            return PermissionResult::deny(DENIED_MESSAGE);
        }
        self.store
            .set_task_status(task_id, TaskStatus::InputRequired)
            .await;
        info!(event = "permission_requested", task_id = %task_id, tool = %tool_name, tool_use_id = %key);

        let mut pending = remote_response(space, &key).await;
        let response = loop {
            if let Some(response) = pending.take() {
                break response;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    space
                        .delete(Namespace::PermissionRequests, &key, Origin::Local)
                        .await;
                    info!(event = "permission_aborted", task_id = %task_id, tool_use_id = %key);
                    return PermissionResult::deny(ABORTED_MESSAGE);
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if event.namespace != Namespace::PermissionResponses
                            || event.key != key
                            || event.origin != Origin::Remote
                        {
                            continue;
                        }
                        let Some(value) = event.value else {
                            continue;
                        };
                        match serde_json::from_value::<PermissionResponse>(value) {
                            Ok(response) => pending = Some(response),
                            Err(err) => {
                                warn!(event = "permission_response_malformed", task_id = %task_id, tool_use_id = %key, error = %err);
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "permission_events_lagged", task_id = %task_id, skipped);
                        pending = remote_response(space, &key).await;
                    }
                    Err(RecvError::Closed) => {
                        space
                            .delete(Namespace::PermissionRequests, &key, Origin::Local)
                            .await;
                        return PermissionResult::deny(ABORTED_MESSAGE);
                    }
                }
            }
        };
        drop(events);

        space
            .delete(Namespace::PermissionRequests, &key, Origin::Local)
            .await;
        space
            .delete(Namespace::PermissionResponses, &key, Origin::Local)
            .await;
        self.store.set_task_status(task_id, TaskStatus::Working).await;
        info!(
            event = "permission_resolved",
            task_id = %task_id,
            tool_use_id = %key,
            decision = ?response.decision
        );

        let mut message = response.message.clone();
        let reviewed = matches!(
            response.decision,
            PermissionDecision::Approved | PermissionDecision::ChangesRequested
        );
        if tool_name == PLAN_EXIT_TOOL && reviewed {
            let approved = response.decision == PermissionDecision::Approved;
            if let Some(feedback) = resolve_plan_review(
                &task,
                &key,
                approved,
                message.as_deref(),
                self.renderer.as_ref(),
            )
            .await
            {
                message = Some(feedback);
            }
        }

        to_result(&response, input, context.suggestions, message)
    }
}

async fn remote_response(space: &EphemeralSpace, key: &str) -> Option<PermissionResponse> {
    match space
        .get_with_origin(Namespace::PermissionResponses, key)
        .await
    {
        Some((value, Origin::Remote)) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

fn to_result(
    response: &PermissionResponse,
    input: Value,
    suggestions: Option<Value>,
    message: Option<String>,
) -> PermissionResult {
    match response.decision {
        // Input is echoed unchanged; editing it is not supported yet.
        PermissionDecision::Approved => PermissionResult::Allow {
            updated_input: input,
            updated_permissions: if response.persist { suggestions } else { None },
        },
        PermissionDecision::ChangesRequested => PermissionResult::Deny {
            message: message.unwrap_or_else(|| CHANGES_REQUESTED_MESSAGE.to_string()),
        },
        PermissionDecision::Denied | PermissionDecision::Unknown => PermissionResult::Deny {
            message: message.unwrap_or_else(|| DENIED_MESSAGE.to_string()),
        },
    }
}

/// Permission handler bound to one run of one task.
pub struct TaskPermissionHandler {
    tunnel: Arc<PermissionTunnel>,
    task_id: String,
    cancel: CancellationToken,
}

impl TaskPermissionHandler {
    pub fn new(tunnel: Arc<PermissionTunnel>, task_id: &str, cancel: CancellationToken) -> Self {
        Self {
            tunnel,
            task_id: task_id.to_string(),
            cancel,
        }
    }
}

#[async_trait]
impl ToolPermissionHandler for TaskPermissionHandler {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
    ) -> PermissionResult {
        self.tunnel
            .request(&self.task_id, tool_name, input, context, &self.cancel)
            .await
    }
}
