//! Git worktree provisioning shared by the relay and ephemeral request paths.

use crate::branch_watch::BranchWatcher;
use crate::capabilities::CapabilityPublisher;
use crate::dedup::RequestGuard;
use crate::git::{GitCapabilities, GitError};
use async_trait::async_trait;
use chrono::Utc;
use loom_core::ephemeral::{
    Namespace, SetupScriptEvent, WorktreeCreateRequest, WorktreeCreateResponse, WorktreeProgress,
    WorktreeResponseState, WorktreeStep,
};
use loom_core::store::{DocStore, Origin};
use loom_core::{SetupScriptState, WorktreeSetupStatus};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("invalid worktree request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Git(#[from] GitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeOutcome {
    pub path: PathBuf,
    pub branch: String,
    pub setup_script_started: bool,
}

/// Delivers progress and the final result back over one request path.
#[async_trait]
pub trait WorktreeResponder: Send + Sync {
    async fn progress(&self, progress: WorktreeProgress);
    async fn finish(&self, response: WorktreeCreateResponse);
}

pub struct WorktreePipeline {
    machine_id: String,
    git: Arc<dyn GitCapabilities>,
    store: Arc<DocStore>,
    capabilities: Arc<CapabilityPublisher>,
    watcher: Arc<BranchWatcher>,
}

impl WorktreePipeline {
    pub fn new(
        machine_id: &str,
        git: Arc<dyn GitCapabilities>,
        store: Arc<DocStore>,
        capabilities: Arc<CapabilityPublisher>,
        watcher: Arc<BranchWatcher>,
    ) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            git,
            store,
            capabilities,
            watcher,
        }
    }

    /// Runs a request unless the same request id is already being processed.
    pub async fn serve(
        &self,
        guard: &RequestGuard,
        request: &WorktreeCreateRequest,
        responder: &dyn WorktreeResponder,
    ) {
        let Some(_permit) = guard.try_begin(&request.request_id) else {
            debug!(event = "worktree_request_duplicate", request_id = %request.request_id);
            return;
        };
        let response = match self.create(request, responder).await {
            Ok(outcome) => WorktreeCreateResponse {
                request_id: request.request_id.clone(),
                state: WorktreeResponseState::Succeeded,
                step: Some(WorktreeStep::Done),
                worktree_path: Some(outcome.path.to_string_lossy().to_string()),
                branch_name: Some(outcome.branch),
                setup_script_started: outcome.setup_script_started,
                error: None,
            },
            Err(err) => {
                warn!(event = "worktree_create_failed", request_id = %request.request_id, error = %err);
                WorktreeCreateResponse {
                    request_id: request.request_id.clone(),
                    state: WorktreeResponseState::Failed,
                    step: None,
                    worktree_path: None,
                    branch_name: Some(request.branch_name.clone()),
                    setup_script_started: false,
                    error: Some(err.to_string()),
                }
            }
        };
        responder.finish(response).await;
    }

    pub async fn create(
        &self,
        request: &WorktreeCreateRequest,
        responder: &dyn WorktreeResponder,
    ) -> Result<WorktreeOutcome, WorktreeError> {
        let source_path = request.source_path.trim();
        let branch = request.branch_name.trim();
        if source_path.is_empty() {
            return Err(WorktreeError::InvalidRequest("missing source path".to_string()));
        }
        if branch.is_empty() {
            return Err(WorktreeError::InvalidRequest("missing branch name".to_string()));
        }
        let source = PathBuf::from(source_path);
        let path = request
            .worktree_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_worktree_path(&source, branch));
        let step = |step: WorktreeStep| WorktreeProgress {
            request_id: request.request_id.clone(),
            step,
        };

        info!(event = "worktree_create", request_id = %request.request_id, source = %source.display(), branch = %branch);
        responder.progress(step(WorktreeStep::CreatingWorktree)).await;
        self.git
            .create_worktree(&source, &path, branch, request.base_ref.as_deref())
            .await?;

        responder.progress(step(WorktreeStep::CopyingFiles)).await;
        let copied = copy_env_files(&source, &path).await;
        debug!(event = "worktree_files_copied", count = copied);

        let mut setup_script_started = false;
        if let Some(script) = self.resolve_setup_script(request).await {
            responder.progress(step(WorktreeStep::RunningSetupScript)).await;
            setup_script_started = self.launch_setup_script(&path, &script).await;
        }

        responder
            .progress(step(WorktreeStep::RefreshingEnvironments))
            .await;
        self.capabilities.add_root(&source);
        self.capabilities.publish().await;
        self.watcher.register(&path);

        responder.progress(step(WorktreeStep::Done)).await;
        Ok(WorktreeOutcome {
            path,
            branch: branch.to_string(),
            setup_script_started,
        })
    }

    async fn resolve_setup_script(&self, request: &WorktreeCreateRequest) -> Option<String> {
        if let Some(script) = request
            .setup_script
            .as_deref()
            .map(str::trim)
            .filter(|script| !script.is_empty())
        {
            return Some(script.to_string());
        }
        let source = request.source_path.trim().to_string();
        self.store
            .room()
            .read(|room| room.user_settings.worktree_scripts.get(&source).cloned())
            .await
            .map(|script| script.trim().to_string())
            .filter(|script| !script.is_empty())
    }

    /// Starts the script in its own process group so it outlives the daemon,
    /// and records its lifecycle in the room document.
    async fn launch_setup_script(&self, worktree: &Path, script: &str) -> bool {
        let key = worktree.to_string_lossy().to_string();
        let started_at = Utc::now().to_rfc3339();
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(event = "setup_script_spawn_failed", worktree = %key, error = %err);
                let status = WorktreeSetupStatus {
                    status: SetupScriptState::Failed,
                    machine_id: self.machine_id.clone(),
                    started_at: started_at.clone(),
                    completed_at: Some(started_at),
                    exit_code: None,
                    signal: None,
                    pid: None,
                };
                self.persist_setup_status(&key, status).await;
                return false;
            }
        };
        let pid = child.id();
        self.persist_setup_status(
            &key,
            WorktreeSetupStatus {
                status: SetupScriptState::Running,
                machine_id: self.machine_id.clone(),
                started_at: started_at.clone(),
                completed_at: None,
                exit_code: None,
                signal: None,
                pid,
            },
        )
        .await;
        info!(event = "setup_script_started", worktree = %key, pid = ?pid);

        let store = self.store.clone();
        let machine_id = self.machine_id.clone();
        tokio::spawn(async move {
            let (succeeded, exit_code, signal) = match child.wait().await {
                Ok(status) => (status.success(), status.code(), signal_name(&status)),
                Err(err) => {
                    warn!(event = "setup_script_wait_failed", worktree = %key, error = %err);
                    (false, None, None)
                }
            };
            let state = if succeeded {
                SetupScriptState::Succeeded
            } else {
                SetupScriptState::Failed
            };
            let status = WorktreeSetupStatus {
                status: state,
                machine_id: machine_id.clone(),
                started_at,
                completed_at: Some(Utc::now().to_rfc3339()),
                exit_code,
                signal: signal.clone(),
                pid,
            };
            let room = store.room();
            let path = key.clone();
            room.update(Origin::Local, move |room| {
                room.worktree_setup_status.insert(path, status);
            })
            .await;
            let event = SetupScriptEvent {
                worktree_path: key.clone(),
                machine_id,
                succeeded,
                exit_code,
                signal,
            };
            if let Err(err) = room
                .ephemeral()
                .set(Namespace::WorktreeSetupEvents, &key, &event, Origin::Local)
                .await
            {
                warn!(event = "setup_script_notify_failed", worktree = %key, error = %err);
            }
            info!(event = "setup_script_finished", worktree = %key, succeeded, exit_code = ?exit_code);
        });
        true
    }

    async fn persist_setup_status(&self, key: &str, status: WorktreeSetupStatus) {
        let key = key.to_string();
        self.store
            .room()
            .update(Origin::Local, move |room| {
                room.worktree_setup_status.insert(key, status);
            })
            .await;
    }
}

/// Answers through the room's ephemeral response namespace.
pub struct EphemeralResponder {
    store: Arc<DocStore>,
}

impl EphemeralResponder {
    pub fn new(store: Arc<DocStore>) -> Self {
        Self { store }
    }

    async fn write(&self, response: &WorktreeCreateResponse) {
        if let Err(err) = self
            .store
            .room()
            .ephemeral()
            .set(
                Namespace::WorktreeCreateResponses,
                &response.request_id,
                response,
                Origin::Local,
            )
            .await
        {
            warn!(event = "worktree_response_failed", request_id = %response.request_id, error = %err);
        }
    }
}

#[async_trait]
impl WorktreeResponder for EphemeralResponder {
    async fn progress(&self, progress: WorktreeProgress) {
        self.write(&WorktreeCreateResponse {
            request_id: progress.request_id,
            state: WorktreeResponseState::InProgress,
            step: Some(progress.step),
            worktree_path: None,
            branch_name: None,
            setup_script_started: false,
            error: None,
        })
        .await;
    }

    async fn finish(&self, response: WorktreeCreateResponse) {
        self.write(&response).await;
    }
}

fn default_worktree_path(source: &Path, branch: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "repo".to_string());
    let slug = branch
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' { ch } else { '-' })
        .collect::<String>();
    let parent = source.parent().unwrap_or(source);
    parent.join(format!("{name}-{slug}"))
}

/// Copies root-level `.env*` files that the new worktree lacks.
async fn copy_env_files(source: &Path, target: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(source).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(event = "worktree_copy_failed", source = %source.display(), error = %err);
            return 0;
        }
    };
    let mut copied = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(".env") {
            continue;
        }
        let is_file = entry
            .file_type()
            .await
            .map(|kind| kind.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }
        let destination = target.join(&name);
        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            continue;
        }
        match tokio::fs::copy(entry.path(), &destination).await {
            Ok(_) => copied += 1,
            Err(err) => {
                warn!(event = "worktree_copy_failed", file = %destination.display(), error = %err);
            }
        }
    }
    copied
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    status.signal().map(|signal| {
        nix::sys::signal::Signal::try_from(signal)
            .map(|signal| signal.as_str().to_string())
            .unwrap_or_else(|_| signal.to_string())
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}
