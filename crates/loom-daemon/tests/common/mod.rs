#![allow(dead_code)]

use async_trait::async_trait;
use loom_core::store::{DocStore, Origin};
use loom_core::{ChangedFile, ContentBlock, ConversationMessage, TaskIndexEntry};
use loom_daemon::config::DaemonConfig;
use loom_daemon::git::{EmptyReason, GitCapabilities, GitError, GitOutcome, WorktreeEntry};
use loom_daemon::plan_review::DefaultPlanRenderer;
use loom_daemon::pty::{PtyError, PtyEvent, SpawnOptions, TerminalProcess, TerminalSpawner};
use loom_daemon::session::{
    PermissionResult, ResumeDecision, RunHooks, SessionContext, SessionError, SessionFactory,
    SessionRequest, SessionResult, SessionRunner, ToolUseContext,
};
use loom_daemon::transport::{ChannelError, DataChannel, DisabledTransport};
use loom_daemon::{Collaborators, Daemon};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

macro_rules! wait_until {
    ($cond:expr) => {{
        let mut reached = false;
        for _ in 0..300 {
            if $cond {
                reached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(reached, "condition not reached: {}", stringify!($cond));
    }};
}

/// Git that sees no repository anywhere but can still lay out worktrees.
#[derive(Default)]
pub struct NoRepoGit;

#[async_trait]
impl GitCapabilities for NoRepoGit {
    async fn unstaged_diff(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn staged_diff(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn unstaged_files(&self, _cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn staged_files(&self, _cwd: &Path) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn default_branch(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn branch_diff(&self, _cwd: &Path, _base: &str) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn branch_files(
        &self,
        _cwd: &Path,
        _base: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn tree_snapshot(&self, _cwd: &Path) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn diff_between(
        &self,
        _cwd: &Path,
        _from: &str,
        _to: &str,
    ) -> Result<GitOutcome<String>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn files_between(
        &self,
        _cwd: &Path,
        _from: &str,
        _to: &str,
    ) -> Result<GitOutcome<Vec<ChangedFile>>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }

    async fn create_worktree(
        &self,
        _source: &Path,
        path: &Path,
        _branch: &str,
        _base_ref: Option<&str>,
    ) -> Result<(), GitError> {
        std::fs::create_dir_all(path).map_err(|err| GitError::Io(err.to_string()))
    }

    async fn list_worktrees(&self, _repo: &Path) -> Result<GitOutcome<Vec<WorktreeEntry>>, GitError> {
        Ok(GitOutcome::Empty(EmptyReason::NotRepository))
    }
}

/// What every scripted run does.
#[derive(Clone, Default)]
pub struct Script {
    /// Ask for `Bash` permission under tool use id `t1` before finishing.
    pub ask_permission: bool,
    /// Stay running until `release` fires or the run is cancelled.
    pub hold: bool,
}

#[derive(Clone, Default)]
pub struct RunLog {
    pub starts: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<SessionRequest>>>,
    pub permissions: Arc<Mutex<Vec<PermissionResult>>>,
    pub release: Arc<Notify>,
}

impl RunLog {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn permission_results(&self) -> Vec<PermissionResult> {
        self.permissions.lock().expect("permissions").clone()
    }
}

pub struct ScriptedFactory {
    pub script: Script,
    pub log: RunLog,
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, context: SessionContext) -> Arc<dyn SessionRunner> {
        Arc::new(ScriptedRunner {
            script: self.script.clone(),
            log: self.log.clone(),
            context,
        })
    }
}

pub struct ScriptedRunner {
    script: Script,
    log: RunLog,
    context: SessionContext,
}

#[async_trait]
impl SessionRunner for ScriptedRunner {
    async fn create_session(
        &self,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError> {
        self.log.starts.fetch_add(1, Ordering::SeqCst);
        self.log.requests.lock().expect("requests").push(request);

        if self.script.ask_permission {
            let result = hooks
                .permissions
                .can_use_tool(
                    "Bash",
                    json!({"command": "cargo test"}),
                    ToolUseContext {
                        tool_use_id: "t1".to_string(),
                        ..ToolUseContext::default()
                    },
                )
                .await;
            self.log.permissions.lock().expect("permissions").push(result);
        }
        if self.script.hold {
            tokio::select! {
                _ = self.log.release.notified() => {}
                _ = hooks.cancel.cancelled() => return Err(SessionError::Cancelled),
            }
        }
        Ok(SessionResult {
            session_id: Some(format!("session-{}", self.context.task_id)),
            status: "success".to_string(),
            cost_usd: Some(0.01),
            duration_ms: 5,
            reply: Some("all green".to_string()),
        })
    }

    async fn resume_session(
        &self,
        _session_id: &str,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError> {
        self.create_session(request, hooks).await
    }

    async fn send_follow_up(&self, _content: Vec<ContentBlock>) -> Result<(), SessionError> {
        Err(SessionError::NotStreaming)
    }

    fn should_resume(&self) -> ResumeDecision {
        ResumeDecision {
            resume: self.context.agent_session_id.is_some(),
            session_id: self.context.agent_session_id.clone(),
        }
    }

    fn is_streaming(&self) -> bool {
        false
    }

    async fn close_session(&self) {}
}

/// Terminal process that accepts everything and never produces output.
#[derive(Default)]
pub struct SilentPty {
    spawned: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PtyEvent>>>,
}

impl TerminalProcess for SilentPty {
    fn spawn(&self, _options: SpawnOptions) -> Result<(), PtyError> {
        if self.spawned.swap(true, Ordering::SeqCst) {
            return Err(PtyError::AlreadySpawned);
        }
        Ok(())
    }

    fn write(&self, _data: &[u8]) -> Result<(), PtyError> {
        Ok(())
    }

    fn resize(&self, _cols: u16, _rows: u16) -> Result<(), PtyError> {
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("subscribers").push(tx);
        rx
    }

    fn kill(&self) {}

    fn dispose(&self) {
        self.subscribers.lock().expect("subscribers").clear();
    }
}

pub struct SilentSpawner;

impl TerminalSpawner for SilentSpawner {
    fn create(&self) -> Arc<dyn TerminalProcess> {
        Arc::new(SilentPty::default())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicBool,
}

impl DataChannel for RecordingChannel {
    fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().expect("sent").push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub daemon: Arc<Daemon>,
    pub store: Arc<DocStore>,
    pub log: RunLog,
    pub dir: tempfile::TempDir,
}

pub async fn start(script: Script) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(DocStore::new("room-test"));
    let log = RunLog::default();
    let mut config = DaemonConfig::default();
    config.machine_id = "m1".to_string();
    config.default_cwd = dir.path().to_path_buf();
    config.ephemeral.sweep_interval = Duration::from_millis(50);

    let daemon = Daemon::start(
        config,
        Collaborators {
            store: store.clone(),
            git: Arc::new(NoRepoGit),
            sessions: Arc::new(ScriptedFactory {
                script,
                log: log.clone(),
            }),
            spawner: Arc::new(SilentSpawner),
            transport: Arc::new(DisabledTransport),
            renderer: Arc::new(DefaultPlanRenderer),
        },
    )
    .await;
    Harness {
        daemon,
        store,
        log,
        dir,
    }
}

impl Harness {
    pub fn repo(&self) -> PathBuf {
        let repo = self.dir.path().join("repo");
        std::fs::create_dir_all(&repo).expect("repo dir");
        repo
    }

    /// Applies what the browser would: a task index entry plus a user message.
    pub async fn browser_creates_task(&self, task_id: &str, text: &str) {
        let cwd = self.repo();
        self.store
            .room()
            .update(Origin::Remote, |room| {
                room.task_index.insert(
                    task_id.to_string(),
                    TaskIndexEntry {
                        title: text.to_string(),
                        ..TaskIndexEntry::default()
                    },
                );
            })
            .await;
        self.store
            .task(task_id)
            .await
            .update(Origin::Remote, |doc| {
                doc.meta.title = text.to_string();
                doc.conversation.push(ConversationMessage::user_text(
                    text,
                    Some(&cwd.to_string_lossy()),
                ));
            })
            .await;
    }
}
