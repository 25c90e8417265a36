//! Debounced capture of working-tree and branch diffs into task documents.

use crate::config::DiffConfig;
use crate::git::{GitCapabilities, GitError, GitOutcome};
use chrono::Utc;
use loom_core::store::{DocStore, Origin};
use loom_core::ChangedFile;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    Working,
    Branch,
}

impl DiffKind {
    fn as_str(&self) -> &'static str {
        match self {
            DiffKind::Working => "working",
            DiffKind::Branch => "branch",
        }
    }
}

pub struct DiffScheduler {
    git: Arc<dyn GitCapabilities>,
    store: Arc<DocStore>,
    config: DiffConfig,
    timers: StdMutex<HashMap<(String, DiffKind), JoinHandle<()>>>,
}

/// Maps a soft git result to a value to write: expected-empty results become
/// empty values, real failures skip the field for this cycle.
fn soft_value<T: Default>(
    result: Result<GitOutcome<T>, GitError>,
    task_id: &str,
    what: &str,
) -> Option<T> {
    match result {
        Ok(outcome) => Some(outcome.unwrap_or_default()),
        Err(err) => {
            warn!(event = "diff_capture_failed", task_id = %task_id, what = %what, error = %err);
            None
        }
    }
}

impl DiffScheduler {
    pub fn new(git: Arc<dyn GitCapabilities>, store: Arc<DocStore>, config: DiffConfig) -> Arc<Self> {
        Arc::new(Self {
            git,
            store,
            config,
            timers: StdMutex::new(HashMap::new()),
        })
    }

    /// Restarts the debounce window for this task and kind.
    pub fn schedule(self: &Arc<Self>, task_id: &str, cwd: PathBuf, kind: DiffKind) {
        let window = match kind {
            DiffKind::Working => self.config.unstaged_debounce,
            DiffKind::Branch => self.config.branch_debounce,
        };
        let this = self.clone();
        let task = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            match kind {
                DiffKind::Working => this.capture_working(&task, &cwd).await,
                DiffKind::Branch => this.capture_branch(&task, &cwd).await,
            }
        });
        let Ok(mut timers) = self.timers.lock() else {
            handle.abort();
            return;
        };
        timers.retain(|_, timer| !timer.is_finished());
        if let Some(previous) = timers.insert((task_id.to_string(), kind), handle) {
            previous.abort();
        }
        debug!(event = "diff_scheduled", task_id = %task_id, kind = kind.as_str());
    }

    pub fn schedule_both(self: &Arc<Self>, task_id: &str, cwd: &Path) {
        self.schedule(task_id, cwd.to_path_buf(), DiffKind::Working);
        self.schedule(task_id, cwd.to_path_buf(), DiffKind::Branch);
    }

    /// Drops pending debounced captures for one task.
    pub fn cancel_task(&self, task_id: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.retain(|(task, _), handle| {
                if task == task_id {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .map(|timers| timers.values().filter(|handle| !handle.is_finished()).count())
            .unwrap_or(0)
    }

    pub async fn capture_working(&self, task_id: &str, cwd: &Path) {
        let (unstaged, staged, unstaged_files, staged_files) = tokio::join!(
            self.git.unstaged_diff(cwd),
            self.git.staged_diff(cwd),
            self.git.unstaged_files(cwd),
            self.git.staged_files(cwd),
        );
        let unstaged = soft_value(unstaged, task_id, "unstaged_diff");
        let staged = soft_value(staged, task_id, "staged_diff");
        let unstaged_files = soft_value(unstaged_files, task_id, "unstaged_files");
        let staged_files = soft_value(staged_files, task_id, "staged_files");
        let now = Utc::now().to_rfc3339();

        let task = self.store.task(task_id).await;
        task.update(Origin::Local, |doc| {
            let state = &mut doc.diff_state;
            if unstaged.is_some() || unstaged_files.is_some() {
                state.unstaged_updated_at = Some(now.clone());
            }
            if staged.is_some() || staged_files.is_some() {
                state.staged_updated_at = Some(now);
            }
            if let Some(diff) = unstaged {
                state.unstaged = diff;
            }
            if let Some(files) = unstaged_files {
                state.unstaged_files = files;
            }
            if let Some(diff) = staged {
                state.staged = diff;
            }
            if let Some(files) = staged_files {
                state.staged_files = files;
            }
        })
        .await;
        debug!(event = "diff_captured", task_id = %task_id, kind = "working");
    }

    pub async fn capture_branch(&self, task_id: &str, cwd: &Path) {
        let base = match self.git.default_branch(cwd).await {
            Ok(GitOutcome::Value(base)) => base,
            Ok(GitOutcome::Empty(reason)) => {
                debug!(event = "branch_diff_skipped", task_id = %task_id, reason = ?reason);
                return;
            }
            Err(err) => {
                warn!(event = "diff_capture_failed", task_id = %task_id, what = "default_branch", error = %err);
                return;
            }
        };
        let (diff, files) = tokio::join!(
            self.git.branch_diff(cwd, &base),
            self.git.branch_files(cwd, &base),
        );
        let diff = soft_value(diff, task_id, "branch_diff");
        let files = soft_value(files, task_id, "branch_files");
        if diff.is_none() && files.is_none() {
            return;
        }
        let now = Utc::now().to_rfc3339();
        let task = self.store.task(task_id).await;
        task.update(Origin::Local, |doc| {
            let state = &mut doc.diff_state;
            if let Some(diff) = diff {
                state.branch_diff = diff;
            }
            if let Some(files) = files {
                state.branch_files = files;
            }
            state.branch_base = Some(base);
            state.branch_updated_at = Some(now);
        })
        .await;
        debug!(event = "diff_captured", task_id = %task_id, kind = "branch");
    }

    /// Snapshot taken at run start for the turn diff.
    pub async fn turn_start_snapshot(&self, cwd: &Path) -> Option<String> {
        match self.git.tree_snapshot(cwd).await {
            Ok(outcome) => outcome.value(),
            Err(err) => {
                warn!(event = "turn_snapshot_failed", cwd = %cwd.display(), error = %err);
                None
            }
        }
    }

    /// Non-debounced capture run when a run settles.
    pub async fn capture_final(&self, task_id: &str, cwd: &Path, start_snapshot: Option<String>) {
        tokio::join!(
            self.capture_working(task_id, cwd),
            self.capture_branch(task_id, cwd),
            self.capture_turn(task_id, cwd, start_snapshot),
        );
    }

    async fn capture_turn(&self, task_id: &str, cwd: &Path, start_snapshot: Option<String>) {
        let end_snapshot = self.turn_start_snapshot(cwd).await;
        let (diff, files): (Option<String>, Option<Vec<ChangedFile>>) =
            match (start_snapshot, end_snapshot) {
                (Some(start), Some(end)) if start != end => {
                    let (diff, files) = tokio::join!(
                        self.git.diff_between(cwd, &start, &end),
                        self.git.files_between(cwd, &start, &end),
                    );
                    (
                        soft_value(diff, task_id, "turn_diff"),
                        soft_value(files, task_id, "turn_files"),
                    )
                }
                _ => {
                    let (diff, files) = tokio::join!(
                        self.git.unstaged_diff(cwd),
                        self.git.unstaged_files(cwd),
                    );
                    (
                        soft_value(diff, task_id, "turn_diff"),
                        soft_value(files, task_id, "turn_files"),
                    )
                }
            };
        if diff.is_none() && files.is_none() {
            return;
        }
        let now = Utc::now().to_rfc3339();
        self.store
            .task(task_id)
            .await
            .update(Origin::Local, |doc| {
                let state = &mut doc.diff_state;
                if let Some(diff) = diff {
                    state.last_turn_diff = diff;
                }
                if let Some(files) = files {
                    state.last_turn_files = files;
                }
                state.last_turn_updated_at = Some(now);
            })
            .await;
    }
}
