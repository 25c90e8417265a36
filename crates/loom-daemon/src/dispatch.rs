//! Task dispatch: turns new user messages into agent runs and settles them.

use crate::branch_watch::BranchWatcher;
use crate::diff::DiffScheduler;
use crate::permission::{PermissionTunnel, TaskPermissionHandler};
use crate::session::{
    ResumeDecision, RunHooks, SessionContext, SessionError, SessionFactory, SessionRequest,
    SessionResult, SessionRunner, StderrSink,
};
use crate::terminal::RecentCwd;
use chrono::Utc;
use loom_core::ephemeral::{MachineActivity, MachineStatusEntry, Namespace};
use loom_core::store::{DocHandle, DocChange, DocStore, Origin};
use loom_core::{ContentBlock, ConversationMessage, MessageRole, TaskDocument, TaskStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct ActiveTask {
    run_id: u64,
    cancel: CancellationToken,
    session: Arc<dyn SessionRunner>,
    dispatched_len: usize,
    cwd: PathBuf,
    start_snapshot: Option<String>,
}

struct WatchedTask {
    cancel: CancellationToken,
    nudge: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

/// Collaborators the dispatcher drives.
pub struct DispatcherParts {
    pub machine_id: String,
    pub default_cwd: PathBuf,
    pub store: Arc<DocStore>,
    pub diffs: Arc<DiffScheduler>,
    pub sessions: Arc<dyn SessionFactory>,
    pub tunnel: Arc<PermissionTunnel>,
    pub watcher: Arc<BranchWatcher>,
}

pub struct TaskDispatcher {
    machine_id: String,
    default_cwd: PathBuf,
    store: Arc<DocStore>,
    diffs: Arc<DiffScheduler>,
    sessions: Arc<dyn SessionFactory>,
    tunnel: Arc<PermissionTunnel>,
    watcher: Arc<BranchWatcher>,
    active: Mutex<HashMap<String, ActiveTask>>,
    watched: Mutex<HashMap<String, WatchedTask>>,
    /// Conversation length at the last dispatch or follow-up, per task.
    dispatched: StdMutex<HashMap<String, usize>>,
    task_cwds: StdMutex<HashMap<String, PathBuf>>,
    recent_cwd: StdMutex<Option<PathBuf>>,
    next_run: AtomicU64,
    shutdown: CancellationToken,
}

impl TaskDispatcher {
    pub fn new(parts: DispatcherParts) -> Arc<Self> {
        Arc::new(Self {
            machine_id: parts.machine_id,
            default_cwd: parts.default_cwd,
            store: parts.store,
            diffs: parts.diffs,
            sessions: parts.sessions,
            tunnel: parts.tunnel,
            watcher: parts.watcher,
            active: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            dispatched: StdMutex::new(HashMap::new()),
            task_cwds: StdMutex::new(HashMap::new()),
            recent_cwd: StdMutex::new(None),
            next_run: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Starts following a task document. Returns false when it was already
    /// watched.
    pub async fn watch(self: &Arc<Self>, task_id: &str) -> bool {
        let mut watched = self.watched.lock().await;
        if watched.contains_key(task_id) || self.shutdown.is_cancelled() {
            return false;
        }
        let handle = self.store.task(task_id).await;
        let changes = handle.subscribe();
        let (nudge, nudges) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();
        let this = self.clone();
        let id = task_id.to_string();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            this.watch_loop(id, handle, changes, nudges, loop_cancel).await;
        });
        watched.insert(task_id.to_string(), WatchedTask { cancel, nudge, task });
        debug!(event = "task_watch_started", task_id = %task_id);
        true
    }

    pub async fn unwatch(&self, task_id: &str) {
        if let Some(watched) = self.watched.lock().await.remove(task_id) {
            watched.cancel.cancel();
        }
    }

    async fn watch_loop(
        self: Arc<Self>,
        task_id: String,
        handle: Arc<DocHandle<TaskDocument>>,
        mut changes: broadcast::Receiver<DocChange<TaskDocument>>,
        mut nudges: mpsc::UnboundedReceiver<()>,
        cancel: CancellationToken,
    ) {
        let initial = handle.snapshot().await;
        if initial.meta.status.is_in_flight() && !self.is_active(&task_id).await {
            info!(
                event = "task_status_recovered",
                task_id = %task_id,
                stale_status = %initial.meta.status
            );
            self.mark_dispatched(&task_id, initial.conversation.len());
            self.store.set_task_status(&task_id, TaskStatus::Idle).await;
        } else {
            self.handle_change(&task_id, initial).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = nudges.recv() => {
                    let doc = handle.snapshot().await;
                    self.handle_change(&task_id, doc).await;
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        if change.origin == Origin::Local {
                            continue;
                        }
                        self.handle_change(&task_id, change.doc).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "task_watch_lagged", task_id = %task_id, skipped = skipped);
                        let doc = handle.snapshot().await;
                        self.handle_change(&task_id, doc).await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(event = "task_watch_stopped", task_id = %task_id);
    }

    /// Reacts to one delivered state of a task document.
    pub async fn handle_change(self: &Arc<Self>, task_id: &str, doc: TaskDocument) {
        if doc.meta.abort_requested {
            self.abort(task_id).await;
            return;
        }

        let len = doc.conversation.len();
        let last_is_user = doc
            .last_message()
            .map(|message| message.role == MessageRole::User)
            .unwrap_or(false);

        let follow_up = {
            let mut active = self.active.lock().await;
            match active.get_mut(task_id) {
                Some(run) => {
                    if last_is_user && len > run.dispatched_len && run.session.is_streaming() {
                        let content = new_user_content(&doc, run.dispatched_len);
                        run.dispatched_len = len;
                        Some((run.session.clone(), content))
                    } else {
                        return;
                    }
                }
                None => None,
            }
        };
        if let Some((session, content)) = follow_up {
            self.mark_dispatched(task_id, len);
            info!(event = "task_follow_up", task_id = %task_id, blocks = content.len());
            if let Err(err) = session.send_follow_up(content).await {
                warn!(event = "task_follow_up_failed", task_id = %task_id, error = %err);
            }
            return;
        }

        if doc.meta.status.is_in_flight() || !last_is_user {
            return;
        }
        if len <= self.dispatched_len(task_id) {
            return;
        }
        self.dispatch(task_id, &doc).await;
    }

    async fn abort(&self, task_id: &str) {
        let cancel = self
            .active
            .lock()
            .await
            .get(task_id)
            .map(|run| run.cancel.clone());
        match cancel {
            Some(cancel) => {
                info!(event = "task_abort_requested", task_id = %task_id);
                cancel.cancel();
            }
            None => debug!(event = "task_abort_without_run", task_id = %task_id),
        }
        self.store
            .task(task_id)
            .await
            .update(Origin::Local, |doc| doc.meta.abort_requested = false)
            .await;
    }

    async fn dispatch(self: &Arc<Self>, task_id: &str, doc: &TaskDocument) {
        let Some(last_user) = doc.last_user_message() else {
            return;
        };
        let cwd = last_user
            .cwd
            .as_deref()
            .filter(|cwd| !cwd.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_cwd.clone());
        let request = SessionRequest {
            prompt: doc.latest_user_content_blocks(),
            cwd: cwd.clone(),
            model: last_user.model.clone(),
            permission_mode: last_user.permission_mode.clone(),
            reasoning_effort: last_user.reasoning_effort.clone(),
        };
        let len = doc.conversation.len();
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let session = self.sessions.create(SessionContext {
            task_id: task_id.to_string(),
            agent_session_id: doc.meta.agent_session_id.clone(),
        });

        {
            let mut active = self.active.lock().await;
            if active.contains_key(task_id) {
                return;
            }
            active.insert(
                task_id.to_string(),
                ActiveTask {
                    run_id,
                    cancel: cancel.clone(),
                    session: session.clone(),
                    dispatched_len: len,
                    cwd: cwd.clone(),
                    start_snapshot: None,
                },
            );
        }
        self.mark_dispatched(task_id, len);
        self.remember_cwd(task_id, &cwd);

        self.store
            .task(task_id)
            .await
            .update(Origin::Local, |doc| doc.meta.last_error = None)
            .await;
        self.store.set_task_status(task_id, TaskStatus::Starting).await;
        self.broadcast_machine_status().await;
        info!(
            event = "task_dispatched",
            task_id = %task_id,
            run_id = run_id,
            cwd = %cwd.display()
        );

        let snapshot = self.diffs.turn_start_snapshot(&cwd).await;
        if let Some(run) = self.active.lock().await.get_mut(task_id) {
            if run.run_id == run_id {
                run.start_snapshot = snapshot;
            }
        }
        self.watcher.register(&cwd);

        let this = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let outcome = this.run_session(&task_id, session, request, cancel).await;
            this.settle(&task_id, run_id, outcome).await;
        });
    }

    async fn run_session(
        &self,
        task_id: &str,
        session: Arc<dyn SessionRunner>,
        request: SessionRequest,
        cancel: CancellationToken,
    ) -> Result<SessionResult, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.store.set_task_status(task_id, TaskStatus::Working).await;
        let hooks = RunHooks {
            cancel: cancel.clone(),
            permissions: Arc::new(TaskPermissionHandler::new(
                self.tunnel.clone(),
                task_id,
                cancel.clone(),
            )),
            stderr: stderr_sink(task_id),
        };
        match session.should_resume() {
            ResumeDecision {
                resume: true,
                session_id: Some(session_id),
            } => {
                info!(event = "session_resume", task_id = %task_id, session_id = %session_id);
                session.resume_session(&session_id, request, hooks).await
            }
            _ => session.create_session(request, hooks).await,
        }
    }

    /// Cleans up after a run. Safe to call more than once for the same run.
    pub async fn settle(
        self: &Arc<Self>,
        task_id: &str,
        run_id: u64,
        outcome: Result<SessionResult, SessionError>,
    ) {
        let run = self
            .active
            .lock()
            .await
            .get(task_id)
            .filter(|run| run.run_id == run_id)
            .map(|run| {
                (
                    run.cwd.clone(),
                    run.start_snapshot.clone(),
                    run.cancel.clone(),
                    run.session.clone(),
                )
            });
        let Some((cwd, start_snapshot, cancel, session)) = run else {
            // A newer run owns whatever entries are pending now.
            if !self.is_active(task_id).await {
                self.clear_permission_entries(task_id).await;
            }
            debug!(event = "task_settle_repeat", task_id = %task_id, run_id = run_id);
            return;
        };

        self.record_outcome(task_id, outcome).await;
        self.diffs.cancel_task(task_id);
        self.diffs.capture_final(task_id, &cwd, start_snapshot).await;
        cancel.cancel();
        session.close_session().await;
        self.clear_permission_entries(task_id).await;
        self.store.set_task_status(task_id, TaskStatus::Idle).await;
        {
            let mut active = self.active.lock().await;
            if active.get(task_id).map(|run| run.run_id) == Some(run_id) {
                active.remove(task_id);
            }
        }
        self.broadcast_machine_status().await;
        info!(event = "task_settled", task_id = %task_id, run_id = run_id);

        // Messages that arrived while the run could not take follow-ups.
        if let Some(watched) = self.watched.lock().await.get(task_id) {
            let _ = watched.nudge.send(());
        }
    }

    async fn record_outcome(&self, task_id: &str, outcome: Result<SessionResult, SessionError>) {
        let task = self.store.task(task_id).await;
        match outcome {
            Ok(result) => {
                info!(
                    event = "task_run_finished",
                    task_id = %task_id,
                    status = %result.status,
                    duration_ms = result.duration_ms
                );
                task.update(Origin::Local, |doc| {
                    if let Some(session_id) = result.session_id {
                        doc.meta.agent_session_id = Some(session_id);
                    }
                    if let Some(reply) = result.reply {
                        doc.conversation.push(ConversationMessage {
                            id: uuid::Uuid::new_v4().to_string(),
                            role: MessageRole::Assistant,
                            content: vec![ContentBlock::Text { text: reply }],
                            cwd: None,
                            model: None,
                            permission_mode: None,
                            reasoning_effort: None,
                            created_at: Some(Utc::now().to_rfc3339()),
                        });
                    }
                    doc.meta.last_error = None;
                })
                .await;
            }
            Err(SessionError::Cancelled) => {
                info!(event = "task_run_cancelled", task_id = %task_id);
            }
            Err(err) => {
                warn!(event = "task_run_failed", task_id = %task_id, error = %err);
                let message = err.to_string();
                task.update(Origin::Local, |doc| doc.meta.last_error = Some(message))
                    .await;
            }
        }
    }

    async fn clear_permission_entries(&self, task_id: &str) {
        let Some(task) = self.store.existing_task(task_id).await else {
            return;
        };
        let space = task.ephemeral();
        for namespace in [Namespace::PermissionRequests, Namespace::PermissionResponses] {
            for key in space.keys(namespace).await {
                space.delete(namespace, &key, Origin::Local).await;
            }
        }
    }

    async fn broadcast_machine_status(&self) {
        let active_tasks = self.active.lock().await.len();
        let entry = MachineStatusEntry {
            status: if active_tasks == 0 {
                MachineActivity::Idle
            } else {
                MachineActivity::Busy
            },
            active_tasks,
            updated_at: Utc::now().to_rfc3339(),
        };
        if let Err(err) = self
            .store
            .room()
            .ephemeral()
            .set(Namespace::MachineStatus, &self.machine_id, &entry, Origin::Local)
            .await
        {
            warn!(event = "machine_status_failed", error = %err);
        }
    }

    fn mark_dispatched(&self, task_id: &str, len: usize) {
        if let Ok(mut dispatched) = self.dispatched.lock() {
            dispatched.insert(task_id.to_string(), len);
        }
    }

    fn dispatched_len(&self, task_id: &str) -> usize {
        self.dispatched
            .lock()
            .ok()
            .and_then(|dispatched| dispatched.get(task_id).copied())
            .unwrap_or(0)
    }

    fn remember_cwd(&self, task_id: &str, cwd: &Path) {
        if let Ok(mut cwds) = self.task_cwds.lock() {
            cwds.insert(task_id.to_string(), cwd.to_path_buf());
        }
        if let Ok(mut recent) = self.recent_cwd.lock() {
            *recent = Some(cwd.to_path_buf());
        }
    }

    /// Tasks whose last working directory lies under `root`.
    pub fn tasks_under(&self, root: &Path) -> Vec<(String, PathBuf)> {
        self.task_cwds
            .lock()
            .map(|cwds| {
                cwds.iter()
                    .filter(|(_, cwd)| cwd.starts_with(root))
                    .map(|(task, cwd)| (task.clone(), cwd.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.active.lock().await.contains_key(task_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Id of the current run for a task.
    pub async fn run_id(&self, task_id: &str) -> Option<u64> {
        self.active.lock().await.get(task_id).map(|run| run.run_id)
    }

    pub async fn watched_count(&self) -> usize {
        self.watched.lock().await.len()
    }

    /// Cancels every run and watch loop, then waits up to `grace` for the
    /// runs to settle.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let deadline = Instant::now() + grace;
        while self.active_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.active_count().await;
        if remaining > 0 {
            warn!(event = "dispatch_shutdown_incomplete", active = remaining);
        }
        let watched = self
            .watched
            .lock()
            .await
            .drain()
            .map(|(_, watched)| watched.task)
            .collect::<Vec<_>>();
        for task in watched {
            let _ = task.await;
        }
        info!(event = "dispatch_stopped");
    }
}

impl RecentCwd for TaskDispatcher {
    fn recent_cwd(&self) -> Option<PathBuf> {
        self.recent_cwd.lock().ok().and_then(|recent| recent.clone())
    }
}

fn new_user_content(doc: &TaskDocument, from: usize) -> Vec<ContentBlock> {
    doc.conversation
        .iter()
        .skip(from)
        .filter(|message| message.role == MessageRole::User)
        .flat_map(|message| message.content.iter().cloned())
        .collect()
}

fn stderr_sink(task_id: &str) -> StderrSink {
    let task_id = task_id.to_string();
    Arc::new(move |line: &str| {
        debug!(event = "agent_stderr", task_id = %task_id, line = %line);
    })
}
