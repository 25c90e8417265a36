//! Payloads exchanged through the ephemeral (TTL-like) namespaces layered on
//! the replicated documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Capabilities,
    MachineStatus,
    PermissionRequests,
    PermissionResponses,
    EnhancePromptRequests,
    EnhancePromptResponses,
    WorktreeCreateRequests,
    WorktreeCreateResponses,
    WorktreeSetupEvents,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Capabilities => "capabilities",
            Namespace::MachineStatus => "machine-status",
            Namespace::PermissionRequests => "permission-requests",
            Namespace::PermissionResponses => "permission-responses",
            Namespace::EnhancePromptRequests => "enhance-prompt-requests",
            Namespace::EnhancePromptResponses => "enhance-prompt-responses",
            Namespace::WorktreeCreateRequests => "worktree-create-requests",
            Namespace::WorktreeCreateResponses => "worktree-create-responses",
            Namespace::WorktreeSetupEvents => "worktree-setup-events",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub tool_name: String,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Approved,
    Denied,
    ChangesRequested,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub decision: PermissionDecision,
    #[serde(default)]
    pub persist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PermissionResponse {
    pub fn approved() -> Self {
        Self {
            decision: PermissionDecision::Approved,
            persist: false,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeCreateRequest {
    pub request_id: String,
    pub source_path: String,
    pub branch_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorktreeStep {
    CreatingWorktree,
    CopyingFiles,
    RunningSetupScript,
    RefreshingEnvironments,
    Done,
}

impl WorktreeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorktreeStep::CreatingWorktree => "creating-worktree",
            WorktreeStep::CopyingFiles => "copying-files",
            WorktreeStep::RunningSetupScript => "running-setup-script",
            WorktreeStep::RefreshingEnvironments => "refreshing-environments",
            WorktreeStep::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeProgress {
    pub request_id: String,
    pub step: WorktreeStep,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WorktreeResponseState {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeCreateResponse {
    pub request_id: String,
    pub state: WorktreeResponseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<WorktreeStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub setup_script_started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetupScriptEvent {
    pub worktree_path: String,
    pub machine_id: String,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineActivity {
    Idle,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatusEntry {
    pub status: MachineActivity,
    pub active_tasks: usize,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineCapabilities {
    pub machine_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub environments: Vec<EnvironmentInfo>,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_worktree: bool,
}
