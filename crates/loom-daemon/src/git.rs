use async_trait::async_trait;
use loom_core::{ChangedFile, FileChangeStatus};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Why a git query legitimately produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    NotRepository,
    NoCommits,
    NoDefaultBranch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitOutcome<T> {
    Value(T),
    Empty(EmptyReason),
}

impl<T> GitOutcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            GitOutcome::Value(value) => Some(value),
            GitOutcome::Empty(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> GitOutcome<U> {
        match self {
            GitOutcome::Value(value) => GitOutcome::Value(f(value)),
            GitOutcome::Empty(reason) => GitOutcome::Empty(reason),
        }
    }
}

impl<T: Default> GitOutcome<T> {
    pub fn unwrap_or_default(self) -> T {
        self.value().unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found")]
    Missing,
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
    #[error("git io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub branch: Option<String>,
    pub is_main: bool,
}

/// Working-tree and repository queries used by the orchestration layer.
#[async_trait]
pub trait GitCapabilities: Send + Sync {
    async fn unstaged_diff(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError>;
    async fn staged_diff(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError>;
    async fn unstaged_files(&self, cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError>;
    async fn staged_files(&self, cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError>;
    async fn default_branch(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError>;
    async fn branch_diff(&self, cwd: &Path, base: &str) -> Result<GitOutcome<String>, GitError>;
    async fn branch_files(
        &self,
        cwd: &Path,
        base: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError>;
    /// Tree id of the full working tree, including untracked files.
    async fn tree_snapshot(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError>;
    async fn diff_between(
        &self,
        cwd: &Path,
        from: &str,
        to: &str,
    ) -> Result<GitOutcome<String>, GitError>;
    async fn files_between(
        &self,
        cwd: &Path,
        from: &str,
        to: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError>;
    async fn create_worktree(
        &self,
        source: &Path,
        path: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), GitError>;
    async fn list_worktrees(&self, repo: &Path) -> Result<GitOutcome<Vec<WorktreeEntry>>, GitError>;
}

#[derive(Debug, Clone, Default)]
pub struct ShellGit;

impl ShellGit {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug)]
enum RunError {
    NotRepo,
    Git(GitError),
}

impl From<RunError> for GitError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::NotRepo => GitError::Command {
                args: String::new(),
                stderr: "not a git repository".to_string(),
            },
            RunError::Git(err) => err,
        }
    }
}

async fn run_git(cwd: &Path, args: &[&str], envs: &[(&str, &str)]) -> Result<String, RunError> {
    let mut command = Command::new("git");
    command.args(args).current_dir(cwd);
    for (key, value) in envs {
        command.env(key, value);
    }
    let output = command.output().await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            RunError::Git(GitError::Missing)
        } else {
            RunError::Git(GitError::Io(err.to_string()))
        }
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not a git repository") {
            return Err(RunError::NotRepo);
        }
        return Err(RunError::Git(GitError::Command {
            args: args.join(" "),
            stderr,
        }));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn soft<T>(result: Result<T, RunError>) -> Result<GitOutcome<T>, GitError> {
    match result {
        Ok(value) => Ok(GitOutcome::Value(value)),
        Err(RunError::NotRepo) => Ok(GitOutcome::Empty(EmptyReason::NotRepository)),
        Err(RunError::Git(err)) => Err(err),
    }
}

async fn has_head(cwd: &Path) -> Result<bool, RunError> {
    match run_git(cwd, &["rev-parse", "--verify", "--quiet", "HEAD"], &[]).await {
        Ok(_) => Ok(true),
        Err(RunError::Git(GitError::Command { .. })) => Ok(false),
        Err(err) => Err(err),
    }
}

async fn merge_base(cwd: &Path, base: &str) -> Result<GitOutcome<String>, GitError> {
    match soft(run_git(cwd, &["merge-base", base, "HEAD"], &[]).await)? {
        GitOutcome::Value(sha) if !sha.trim().is_empty() => Ok(GitOutcome::Value(sha.trim().to_string())),
        GitOutcome::Value(_) => Ok(GitOutcome::Empty(EmptyReason::NoCommits)),
        GitOutcome::Empty(reason) => Ok(GitOutcome::Empty(reason)),
    }
}

#[async_trait]
impl GitCapabilities for ShellGit {
    async fn unstaged_diff(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        soft(run_git(cwd, &["diff", "--no-color"], &[]).await)
    }

    async fn staged_diff(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        soft(run_git(cwd, &["diff", "--cached", "--no-color"], &[]).await)
    }

    async fn unstaged_files(&self, cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        let tracked = match soft(run_git(cwd, &["diff", "--name-status"], &[]).await)? {
            GitOutcome::Value(output) => parse_name_status(&output),
            GitOutcome::Empty(reason) => return Ok(GitOutcome::Empty(reason)),
        };
        let untracked = run_git(cwd, &["ls-files", "--others", "--exclude-standard"], &[])
            .await
            .map_err(GitError::from)?;
        let mut files = tracked;
        files.extend(untracked.lines().filter(|line| !line.trim().is_empty()).map(|line| {
            ChangedFile {
                path: line.trim().to_string(),
                status: FileChangeStatus::Untracked,
            }
        }));
        Ok(GitOutcome::Value(files))
    }

    async fn staged_files(&self, cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(soft(run_git(cwd, &["diff", "--cached", "--name-status"], &[]).await)?
            .map(|output| parse_name_status(&output)))
    }

    async fn default_branch(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        match run_git(
            cwd,
            &["symbolic-ref", "--quiet", "refs/remotes/origin/HEAD"],
            &[],
        )
        .await
        {
            Ok(output) => {
                let name = output.trim().trim_start_matches("refs/remotes/").to_string();
                if !name.is_empty() {
                    return Ok(GitOutcome::Value(name));
                }
            }
            Err(RunError::NotRepo) => return Ok(GitOutcome::Empty(EmptyReason::NotRepository)),
            Err(RunError::Git(GitError::Command { .. })) => {}
            Err(RunError::Git(err)) => return Err(err),
        }
        for candidate in ["main", "master"] {
            let reference = format!("refs/heads/{candidate}");
            match run_git(cwd, &["rev-parse", "--verify", "--quiet", &reference], &[]).await {
                Ok(_) => return Ok(GitOutcome::Value(candidate.to_string())),
                Err(RunError::Git(GitError::Command { .. })) => continue,
                Err(err) => return soft(Err(err)),
            }
        }
        Ok(GitOutcome::Empty(EmptyReason::NoDefaultBranch))
    }

    async fn branch_diff(&self, cwd: &Path, base: &str) -> Result<GitOutcome<String>, GitError> {
        let sha = match merge_base(cwd, base).await? {
            GitOutcome::Value(sha) => sha,
            GitOutcome::Empty(reason) => return Ok(GitOutcome::Empty(reason)),
        };
        soft(run_git(cwd, &["diff", "--no-color", &sha], &[]).await)
    }

    async fn branch_files(
        &self,
        cwd: &Path,
        base: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        let sha = match merge_base(cwd, base).await? {
            GitOutcome::Value(sha) => sha,
            GitOutcome::Empty(reason) => return Ok(GitOutcome::Empty(reason)),
        };
        Ok(soft(run_git(cwd, &["diff", "--name-status", &sha], &[]).await)?
            .map(|output| parse_name_status(&output)))
    }

    async fn tree_snapshot(&self, cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        let head = match has_head(cwd).await {
            Ok(head) => head,
            Err(err) => return soft(Err(err)),
        };
        // A throwaway index keeps the user's staging area untouched.
        let index_path = std::env::temp_dir().join(format!("loom-index-{}", uuid::Uuid::new_v4()));
        let index = index_path.to_string_lossy().to_string();
        let envs = [("GIT_INDEX_FILE", index.as_str())];
        let result = async {
            if head {
                run_git(cwd, &["read-tree", "HEAD"], &envs).await?;
            }
            run_git(cwd, &["add", "-A"], &envs).await?;
            run_git(cwd, &["write-tree"], &envs).await
        }
        .await;
        let _ = tokio::fs::remove_file(&index_path).await;
        Ok(soft(result)?.map(|tree| tree.trim().to_string()))
    }

    async fn diff_between(
        &self,
        cwd: &Path,
        from: &str,
        to: &str,
    ) -> Result<GitOutcome<String>, GitError> {
        soft(run_git(cwd, &["diff", "--no-color", from, to], &[]).await)
    }

    async fn files_between(
        &self,
        cwd: &Path,
        from: &str,
        to: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(soft(run_git(cwd, &["diff", "--name-status", from, to], &[]).await)?
            .map(|output| parse_name_status(&output)))
    }

    async fn create_worktree(
        &self,
        source: &Path,
        path: &Path,
        branch: &str,
        base_ref: Option<&str>,
    ) -> Result<(), GitError> {
        let path = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "add", "-b", branch, path.as_str()];
        if let Some(base_ref) = base_ref {
            args.push(base_ref);
        }
        run_git(source, &args, &[]).await.map_err(GitError::from)?;
        Ok(())
    }

    async fn list_worktrees(&self, repo: &Path) -> Result<GitOutcome<Vec<WorktreeEntry>>, GitError> {
        Ok(soft(run_git(repo, &["worktree", "list", "--porcelain"], &[]).await)?
            .map(|output| parse_worktree_list(&output)))
    }
}

pub fn parse_name_status(output: &str) -> Vec<ChangedFile> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let code = parts.next()?.trim();
            let letter = code.chars().next()?;
            // Renames and copies list the old path first.
            let path = parts.last()?.trim();
            if path.is_empty() {
                return None;
            }
            Some(ChangedFile {
                path: path.to_string(),
                status: FileChangeStatus::from_git_letter(letter),
            })
        })
        .collect()
}

pub fn parse_worktree_list(output: &str) -> Vec<WorktreeEntry> {
    let mut entries: Vec<WorktreeEntry> = Vec::new();
    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            let is_main = entries.is_empty();
            entries.push(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                branch: None,
                is_main,
            });
        } else if let Some(branch) = line.strip_prefix("branch ") {
            if let Some(entry) = entries.last_mut() {
                entry.branch = Some(branch.trim().trim_start_matches("refs/heads/").to_string());
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_status_handles_renames_and_untracked() {
        let files = parse_name_status("M\tsrc/lib.rs\nR100\told.rs\tnew.rs\nA\tREADME.md\n\n");
        assert_eq!(
            files,
            vec![
                ChangedFile {
                    path: "src/lib.rs".to_string(),
                    status: FileChangeStatus::Modified
                },
                ChangedFile {
                    path: "new.rs".to_string(),
                    status: FileChangeStatus::Renamed
                },
                ChangedFile {
                    path: "README.md".to_string(),
                    status: FileChangeStatus::Added
                },
            ]
        );
    }

    #[test]
    fn worktree_porcelain_marks_first_entry_as_main() {
        let output = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo-wt\nHEAD def\ndetached\n\n";
        let entries = parse_worktree_list(output);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_main);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert!(!entries[1].is_main);
        assert!(entries[1].branch.is_none());
    }

    #[test]
    fn empty_outcome_defaults() {
        let empty: GitOutcome<Vec<ChangedFile>> = GitOutcome::Empty(EmptyReason::NotRepository);
        assert!(empty.unwrap_or_default().is_empty());
        assert_eq!(GitOutcome::Value(2).map(|v| v * 2).value(), Some(4));
    }

    #[tokio::test]
    async fn non_repository_is_empty_not_error() {
        if std::process::Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = ShellGit::new().unstaged_diff(dir.path()).await.expect("soft result");
        assert_eq!(outcome, GitOutcome::Empty(EmptyReason::NotRepository));
    }
}
