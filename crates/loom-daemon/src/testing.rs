use crate::git::{EmptyReason, GitCapabilities, GitError, GitOutcome, WorktreeEntry};
use async_trait::async_trait;
use loom_core::{ChangedFile, FileChangeStatus};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory git used by unit tests.
#[derive(Default)]
pub struct FakeGit {
    calls: Mutex<HashMap<String, usize>>,
    unstaged: Mutex<String>,
    default_branch: Mutex<Option<String>>,
    snapshots: Mutex<VecDeque<String>>,
    worktrees: Mutex<Vec<WorktreeEntry>>,
    fail_worktree: AtomicBool,
}

impl FakeGit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, name: &str) {
        *self
            .calls
            .lock()
            .expect("calls")
            .entry(name.to_string())
            .or_default() += 1;
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().expect("calls").get(name).copied().unwrap_or(0)
    }

    pub fn set_unstaged(&self, diff: &str) {
        *self.unstaged.lock().expect("unstaged") = diff.to_string();
    }

    pub fn set_default_branch(&self, branch: Option<&str>) {
        *self.default_branch.lock().expect("branch") = branch.map(str::to_string);
    }

    pub fn push_snapshot(&self, tree: &str) {
        self.snapshots.lock().expect("snapshots").push_back(tree.to_string());
    }

    pub fn fail_worktree_add(&self) {
        self.fail_worktree.store(true, Ordering::SeqCst);
    }

    pub fn worktree_paths(&self) -> Vec<PathBuf> {
        self.worktrees
            .lock()
            .expect("worktrees")
            .iter()
            .map(|entry| entry.path.clone())
            .collect()
    }
}

#[async_trait]
impl GitCapabilities for FakeGit {
    async fn unstaged_diff(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        self.record("unstaged_diff");
        Ok(GitOutcome::Value(self.unstaged.lock().expect("unstaged").clone()))
    }

    async fn staged_diff(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        self.record("staged_diff");
        Ok(GitOutcome::Value(String::new()))
    }

    async fn unstaged_files(&self, _cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        self.record("unstaged_files");
        Ok(GitOutcome::Value(vec![ChangedFile {
            path: "src/lib.rs".to_string(),
            status: FileChangeStatus::Modified,
        }]))
    }

    async fn staged_files(&self, _cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        self.record("staged_files");
        Ok(GitOutcome::Value(Vec::new()))
    }

    async fn default_branch(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        self.record("default_branch");
        Ok(match self.default_branch.lock().expect("branch").clone() {
            Some(branch) => GitOutcome::Value(branch),
            None => GitOutcome::Empty(EmptyReason::NoDefaultBranch),
        })
    }

    async fn branch_diff(&self, _cwd: &Path, base: &str) -> Result<GitOutcome<String>, GitError> {
        self.record("branch_diff");
        Ok(GitOutcome::Value(format!("branch vs {base}")))
    }

    async fn branch_files(
        &self,
        _cwd: &Path,
        _base: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        self.record("branch_files");
        Ok(GitOutcome::Value(Vec::new()))
    }

    async fn tree_snapshot(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        self.record("tree_snapshot");
        Ok(match self.snapshots.lock().expect("snapshots").pop_front() {
            Some(tree) => GitOutcome::Value(tree),
            None => GitOutcome::Empty(EmptyReason::NoCommits),
        })
    }

    async fn diff_between(
        &self,
        _cwd: &Path,
        from: &str,
        to: &str,
    ) -> Result<GitOutcome<String>, GitError> {
        self.record("diff_between");
        Ok(GitOutcome::Value(format!("{from}..{to}")))
    }

    async fn files_between(
        &self,
        _cwd: &Path,
        _from: &str,
        _to: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        self.record("files_between");
        Ok(GitOutcome::Value(Vec::new()))
    }

    async fn create_worktree(
        &self,
        _source: &Path,
        path: &Path,
        branch: &str,
        _base_ref: Option<&str>,
    ) -> Result<(), GitError> {
        self.record("create_worktree");
        if self.fail_worktree.load(Ordering::SeqCst) {
            return Err(GitError::Command {
                args: "worktree add".to_string(),
                stderr: format!("fatal: a branch named '{branch}' already exists"),
            });
        }
        std::fs::create_dir_all(path).map_err(|err| GitError::Io(err.to_string()))?;
        self.worktrees.lock().expect("worktrees").push(WorktreeEntry {
            path: path.to_path_buf(),
            branch: Some(branch.to_string()),
            is_main: false,
        });
        Ok(())
    }

    async fn list_worktrees(&self, repo: &Path) -> Result<GitOutcome<Vec<WorktreeEntry>>, GitError> {
        self.record("list_worktrees");
        let mut entries = vec![WorktreeEntry {
            path: repo.to_path_buf(),
            branch: Some("main".to_string()),
            is_main: true,
        }];
        entries.extend(self.worktrees.lock().expect("worktrees").iter().cloned());
        Ok(GitOutcome::Value(entries))
    }
}
