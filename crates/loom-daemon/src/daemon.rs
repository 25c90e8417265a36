//! Wires the orchestrator together and owns its background loops.

use crate::branch_watch::BranchWatcher;
use crate::capabilities::CapabilityPublisher;
use crate::config::DaemonConfig;
use crate::dedup::RequestGuard;
use crate::diff::DiffScheduler;
use crate::dispatch::{DispatcherParts, TaskDispatcher};
use crate::git::GitCapabilities;
use crate::permission::PermissionTunnel;
use crate::plan_review::PlanRenderer;
use crate::pty::TerminalSpawner;
use crate::relay::{RelayClient, RelayError};
use crate::session::SessionFactory;
use crate::terminal::{RecentCwd, TerminalBridge};
use crate::transport::{ChannelEvent, DataChannel, PeerTransport};
use crate::worktree::{EphemeralResponder, WorktreePipeline};
use loom_core::ephemeral::{
    Namespace, WorktreeCreateRequest, WorktreeCreateResponse, WorktreeResponseState,
};
use loom_core::store::{DocStore, EphemeralEvent, Origin};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RUN_SETTLE_GRACE: Duration = Duration::from_secs(5);

/// External implementations the daemon is assembled from.
pub struct Collaborators {
    pub store: Arc<DocStore>,
    pub git: Arc<dyn GitCapabilities>,
    pub sessions: Arc<dyn SessionFactory>,
    pub spawner: Arc<dyn TerminalSpawner>,
    pub transport: Arc<dyn PeerTransport>,
    pub renderer: Arc<dyn PlanRenderer>,
}

pub struct Daemon {
    store: Arc<DocStore>,
    dispatcher: Arc<TaskDispatcher>,
    diffs: Arc<DiffScheduler>,
    terminals: Arc<TerminalBridge>,
    transport: Arc<dyn PeerTransport>,
    watcher: Arc<BranchWatcher>,
    pipeline: Arc<WorktreePipeline>,
    guard: RequestGuard,
    timers: CancellationToken,
    listeners: CancellationToken,
    relay_shutdown: watch::Sender<bool>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl Daemon {
    pub async fn start(config: DaemonConfig, parts: Collaborators) -> Arc<Self> {
        let Collaborators {
            store,
            git,
            sessions,
            spawner,
            transport,
            renderer,
        } = parts;

        let (watcher, changed_roots) = BranchWatcher::start();
        let watcher = Arc::new(watcher);
        let diffs = DiffScheduler::new(git.clone(), store.clone(), config.diff.clone());
        let tunnel = Arc::new(PermissionTunnel::new(store.clone(), renderer));
        let dispatcher = TaskDispatcher::new(DispatcherParts {
            machine_id: config.machine_id.clone(),
            default_cwd: config.default_cwd.clone(),
            store: store.clone(),
            diffs: diffs.clone(),
            sessions,
            tunnel,
            watcher: watcher.clone(),
        });
        let recent: Arc<dyn RecentCwd> = dispatcher.clone();
        let terminals = Arc::new(TerminalBridge::new(
            config.terminal.clone(),
            config.default_cwd.clone(),
            spawner,
            recent,
        ));
        let capabilities = Arc::new(CapabilityPublisher::new(
            &config.machine_id,
            git.clone(),
            store.clone(),
            config.repo_roots.clone(),
        ));
        let pipeline = Arc::new(WorktreePipeline::new(
            &config.machine_id,
            git,
            store.clone(),
            capabilities.clone(),
            watcher.clone(),
        ));
        let (relay_shutdown, relay_rx) = watch::channel(false);

        let daemon = Arc::new(Self {
            store: store.clone(),
            dispatcher,
            diffs,
            terminals,
            transport: transport.clone(),
            watcher: watcher.clone(),
            pipeline: pipeline.clone(),
            guard: RequestGuard::new(),
            timers: CancellationToken::new(),
            listeners: CancellationToken::new(),
            relay_shutdown,
            background: StdMutex::new(Vec::new()),
        });

        for root in &config.repo_roots {
            watcher.register(root);
        }
        capabilities.publish().await;

        let mut handles = vec![
            tokio::spawn(daemon.clone().room_loop()),
            tokio::spawn(daemon.clone().worktree_request_loop()),
            tokio::spawn(daemon.clone().sweep_loop(config.clone())),
            tokio::spawn(daemon.clone().branch_pump(changed_roots)),
        ];

        if config.relay_url.is_some() {
            let relay = Arc::new(RelayClient::new(
                config.relay_url.clone(),
                config.relay_token.clone(),
                &config.machine_id,
                transport,
                pipeline,
                daemon.guard.clone(),
                capabilities,
            ));
            handles.push(tokio::spawn(async move {
                match relay.run(relay_rx).await {
                    Ok(()) => debug!(event = "relay_stopped"),
                    Err(RelayError::MissingCredentials) => {
                        warn!(event = "relay_disabled", reason = "missing credentials");
                    }
                    Err(err) => warn!(event = "relay_disabled", reason = %err),
                }
            }));
        }

        if let Ok(mut background) = daemon.background.lock() {
            background.extend(handles);
        }
        info!(
            event = "daemon_started",
            machine_id = %config.machine_id,
            cwd = %config.default_cwd.display(),
            relay = config.relay_url.is_some()
        );
        daemon
    }

    pub fn store(&self) -> Arc<DocStore> {
        self.store.clone()
    }

    pub fn dispatcher(&self) -> Arc<TaskDispatcher> {
        self.dispatcher.clone()
    }

    /// Hands a negotiated terminal channel to the terminal bridge.
    pub async fn attach_terminal(
        &self,
        machine_id: &str,
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        self.terminals.attach(machine_id, channel, events).await;
    }

    pub async fn terminal_count(&self) -> usize {
        self.terminals.session_count().await
    }

    /// Stops runs first and network last so no write lands on a
    /// disconnected document.
    pub async fn shutdown(&self) {
        info!(event = "daemon_stopping");
        self.dispatcher.shutdown(RUN_SETTLE_GRACE).await;
        self.diffs.cancel_all();
        self.timers.cancel();
        self.terminals.dispose_all().await;
        let _ = self.relay_shutdown.send(true);
        self.transport.close_all().await;
        self.listeners.cancel();
        self.watcher.stop();

        let handles = self
            .background
            .lock()
            .map(|mut background| background.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        info!(event = "daemon_stopped");
    }

    async fn watch_indexed_tasks(&self) {
        let ids = self
            .store
            .room()
            .read(|room| room.task_index.keys().cloned().collect::<Vec<_>>())
            .await;
        for id in ids {
            if self.dispatcher.watch(&id).await {
                info!(event = "task_discovered", task_id = %id);
            }
        }
    }

    async fn room_loop(self: Arc<Self>) {
        let room = self.store.room();
        let mut changes = room.subscribe();
        self.watch_indexed_tasks().await;
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(_) | Err(RecvError::Lagged(_)) => self.watch_indexed_tasks().await,
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn worktree_request_loop(self: Arc<Self>) {
        let room = self.store.room();
        let mut events = room.ephemeral().subscribe();
        for key in room.ephemeral().keys(Namespace::WorktreeCreateRequests).await {
            if let Some((value, Origin::Remote)) = room
                .ephemeral()
                .get_with_origin(Namespace::WorktreeCreateRequests, &key)
                .await
            {
                self.accept_worktree_request(&key, value).await;
            }
        }
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => break,
                event = events.recv() => match event {
                    Ok(EphemeralEvent {
                        namespace: Namespace::WorktreeCreateRequests,
                        key,
                        value: Some(value),
                        origin: Origin::Remote,
                    }) => self.accept_worktree_request(&key, value).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "worktree_listener_lagged", skipped = skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    async fn accept_worktree_request(&self, key: &str, value: serde_json::Value) {
        let request: WorktreeCreateRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(err) => {
                warn!(event = "worktree_request_malformed", key = %key, error = %err);
                return;
            }
        };
        let answered = self
            .store
            .room()
            .ephemeral()
            .get_as::<WorktreeCreateResponse>(Namespace::WorktreeCreateResponses, &request.request_id)
            .await
            .ok()
            .flatten()
            .map(|response| response.state != WorktreeResponseState::InProgress)
            .unwrap_or(false);
        if answered {
            debug!(event = "worktree_request_answered", request_id = %request.request_id);
            return;
        }
        let pipeline = self.pipeline.clone();
        let guard = self.guard.clone();
        let responder = EphemeralResponder::new(self.store.clone());
        tokio::spawn(async move {
            pipeline.serve(&guard, &request, &responder).await;
        });
    }

    async fn sweep_loop(self: Arc<Self>, config: DaemonConfig) {
        let ephemeral = config.ephemeral;
        let mut ticker = tokio::time::interval(ephemeral.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.timers.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = self
                        .store
                        .sweep_ephemeral(|namespace| ephemeral.ttl_for(namespace))
                        .await;
                    if swept > 0 {
                        debug!(event = "ephemeral_swept", entries = swept);
                    }
                }
            }
        }
    }

    async fn branch_pump(self: Arc<Self>, mut roots: mpsc::UnboundedReceiver<PathBuf>) {
        loop {
            tokio::select! {
                _ = self.listeners.cancelled() => break,
                root = roots.recv() => {
                    let Some(root) = root else {
                        break;
                    };
                    for (task_id, cwd) in self.dispatcher.tasks_under(&root) {
                        self.diffs.schedule_both(&task_id, &cwd);
                    }
                }
            }
        }
    }
}
