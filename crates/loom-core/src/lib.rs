use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub mod control_frame;
pub mod ephemeral;
pub mod relay;
pub mod store;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDocument {
    #[serde(default)]
    pub conversation: Vec<ConversationMessage>,
    #[serde(default)]
    pub meta: TaskMeta,
    #[serde(default)]
    pub diff_state: DiffState,
    #[serde(default)]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub plan_comments: BTreeMap<String, PlanComment>,
}

impl TaskDocument {
    pub fn last_message(&self) -> Option<&ConversationMessage> {
        self.conversation.last()
    }

    pub fn last_user_message(&self) -> Option<&ConversationMessage> {
        self.conversation
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
    }

    /// Content of the trailing run of user messages, oldest first.
    pub fn latest_user_content_blocks(&self) -> Vec<ContentBlock> {
        let start = self
            .conversation
            .iter()
            .rposition(|message| message.role != MessageRole::User)
            .map(|index| index + 1)
            .unwrap_or(0);
        self.conversation[start..]
            .iter()
            .flat_map(|message| message.content.iter().cloned())
            .collect()
    }

    pub fn plan_by_tool_use(&self, tool_use_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|plan| plan.tool_use_id == tool_use_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(default)]
    pub abort_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "working")]
    Working,
    #[serde(rename = "input-required")]
    InputRequired,
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "pending_review")]
    PendingReview,
    #[serde(rename = "completed")]
    Completed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Starting => "starting",
            TaskStatus::Working => "working",
            TaskStatus::InputRequired => "input-required",
            TaskStatus::Idle => "idle",
            TaskStatus::PendingReview => "pending_review",
            TaskStatus::Completed => "completed",
        }
    }

    /// A run owns the task while it is in one of these states.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Starting | TaskStatus::Working | TaskStatus::InputRequired
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "starting" => Ok(TaskStatus::Starting),
            "working" => Ok(TaskStatus::Working),
            "input-required" | "input_required" => Ok(TaskStatus::InputRequired),
            "idle" => Ok(TaskStatus::Idle),
            "pending_review" | "pending-review" => Ok(TaskStatus::PendingReview),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(default)]
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>, cwd: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
            cwd: cwd.map(str::to_string),
            model: None,
            permission_mode: None,
            reasoning_effort: None,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageSource {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffState {
    #[serde(default)]
    pub unstaged: String,
    #[serde(default)]
    pub staged: String,
    #[serde(default)]
    pub unstaged_files: Vec<ChangedFile>,
    #[serde(default)]
    pub staged_files: Vec<ChangedFile>,
    #[serde(default)]
    pub branch_diff: String,
    #[serde(default)]
    pub branch_files: Vec<ChangedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_base: Option<String>,
    #[serde(default)]
    pub last_turn_diff: String,
    #[serde(default)]
    pub last_turn_files: Vec<ChangedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unstaged_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn_updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileChangeStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
    Untracked,
}

impl FileChangeStatus {
    /// Maps a `git diff --name-status` letter.
    pub fn from_git_letter(letter: char) -> Self {
        match letter {
            'A' => FileChangeStatus::Added,
            'D' => FileChangeStatus::Deleted,
            'R' => FileChangeStatus::Renamed,
            'C' => FileChangeStatus::Copied,
            '?' => FileChangeStatus::Untracked,
            _ => FileChangeStatus::Modified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub plan_id: String,
    pub tool_use_id: String,
    #[serde(default)]
    pub markdown: String,
    /// Browser-edited document form of the plan, if the reviewer changed it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default)]
    pub review_status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_feedback: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    ChangesRequested,
}

impl Default for ReviewStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanComment {
    pub plan_id: String,
    pub range: CommentRange,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

/// Character offsets into the plan markdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentRange {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoomDocument {
    #[serde(default)]
    pub task_index: BTreeMap<String, TaskIndexEntry>,
    #[serde(default)]
    pub worktree_setup_status: BTreeMap<String, WorktreeSetupStatus>,
    #[serde(default)]
    pub user_settings: UserSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskIndexEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeSetupStatus {
    pub status: SetupScriptState,
    pub machine_id: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SetupScriptState {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default)]
    pub worktree_scripts: BTreeMap<String, String>,
}
