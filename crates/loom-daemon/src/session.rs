//! Contract between the dispatch engine and the agent session runner.
//!
//! The runner spawns and streams the underlying coding agent; this crate only
//! decides when to start, resume, follow up or cancel it.

use async_trait::async_trait;
use loom_core::ephemeral::RiskLevel;
use loom_core::ContentBlock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("agent spawn failed: {0}")]
    Spawn(String),
    #[error("agent run failed: {0}")]
    Failed(String),
    #[error("agent run cancelled")]
    Cancelled,
    #[error("session is not accepting follow-ups")]
    NotStreaming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub prompt: Vec<ContentBlock>,
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionResult {
    pub session_id: Option<String>,
    pub status: String,
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    /// Final assistant text, when the runner does not stream it into the document.
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeDecision {
    pub resume: bool,
    pub session_id: Option<String>,
}

/// Details the agent supplies alongside a tool-permission check.
#[derive(Debug, Clone, Default)]
pub struct ToolUseContext {
    pub tool_use_id: String,
    pub suggestions: Option<Value>,
    pub risk_level: Option<RiskLevel>,
    pub reason: Option<String>,
    pub blocked_path: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "behavior", rename_all = "lowercase")]
pub enum PermissionResult {
    #[serde(rename_all = "camelCase")]
    Allow {
        updated_input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Value>,
    },
    Deny { message: String },
}

impl PermissionResult {
    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionResult::Allow { .. })
    }
}

#[async_trait]
pub trait ToolPermissionHandler: Send + Sync {
    async fn can_use_tool(
        &self,
        tool_name: &str,
        input: Value,
        context: ToolUseContext,
    ) -> PermissionResult;
}

/// Everything a run needs besides the prompt itself.
#[derive(Clone)]
pub struct RunHooks {
    pub cancel: CancellationToken,
    pub permissions: Arc<dyn ToolPermissionHandler>,
    pub stderr: StderrSink,
}

#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn create_session(
        &self,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError>;

    async fn resume_session(
        &self,
        session_id: &str,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError>;

    async fn send_follow_up(&self, content: Vec<ContentBlock>) -> Result<(), SessionError>;

    fn should_resume(&self) -> ResumeDecision;

    fn is_streaming(&self) -> bool;

    async fn close_session(&self);
}

#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub task_id: String,
    pub agent_session_id: Option<String>,
}

pub trait SessionFactory: Send + Sync {
    fn create(&self, context: SessionContext) -> Arc<dyn SessionRunner>;
}
