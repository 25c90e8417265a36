//! Couples one PTY to one browser data channel per remote machine.

use crate::config::TerminalConfig;
use crate::pty::{PtyEvent, SpawnOptions, TerminalProcess, TerminalSpawner};
use crate::transport::{ChannelEvent, DataChannel};
use loom_core::control_frame::{decode_inbound, ControlFrame, InboundFrame};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of the working directory used when the browser never announces one.
pub trait RecentCwd: Send + Sync {
    fn recent_cwd(&self) -> Option<PathBuf>;
}

struct SessionHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;

pub struct TerminalBridge {
    config: TerminalConfig,
    default_cwd: PathBuf,
    spawner: Arc<dyn TerminalSpawner>,
    recent: Arc<dyn RecentCwd>,
    sessions: SessionMap,
    next_generation: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Disposed,
    ChannelClosed,
    PtyExited,
    OpenTimeout,
    OutputOverflow,
    SpawnFailed,
}

impl EndReason {
    fn as_str(&self) -> &'static str {
        match self {
            EndReason::Disposed => "disposed",
            EndReason::ChannelClosed => "channel_closed",
            EndReason::PtyExited => "pty_exited",
            EndReason::OpenTimeout => "open_timeout",
            EndReason::OutputOverflow => "output_overflow",
            EndReason::SpawnFailed => "spawn_failed",
        }
    }
}

impl TerminalBridge {
    pub fn new(
        config: TerminalConfig,
        default_cwd: PathBuf,
        spawner: Arc<dyn TerminalSpawner>,
        recent: Arc<dyn RecentCwd>,
    ) -> Self {
        Self {
            config,
            default_cwd,
            spawner,
            recent,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Starts a session for a freshly negotiated terminal channel, replacing
    /// any session that machine already had.
    pub async fn attach(
        &self,
        machine_id: &str,
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        self.dispose(machine_id).await;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let session = TerminalSession {
            machine_id: machine_id.to_string(),
            config: self.config.clone(),
            pty: self.spawner.create(),
            channel,
            open: false,
            spawned: false,
            pending_output: Vec::new(),
            pending_input: Vec::new(),
            size: (self.config.default_cols, self.config.default_rows),
            recent: self.recent.clone(),
            default_cwd: self.default_cwd.clone(),
        };

        let mut sessions = self.sessions.lock().await;
        let map = self.sessions.clone();
        let key = machine_id.to_string();
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            session.run(events, run_cancel).await;
            let mut sessions = map.lock().await;
            if sessions
                .get(&key)
                .map(|handle| handle.generation == generation)
                .unwrap_or(false)
            {
                sessions.remove(&key);
            }
        });
        let replaced = sessions.insert(
            machine_id.to_string(),
            SessionHandle {
                generation,
                cancel,
                task,
            },
        );
        if let Some(replaced) = replaced {
            debug!(event = "terminal_session_replaced", machine_id = %machine_id, generation = replaced.generation);
            replaced.cancel.cancel();
        }
        info!(event = "terminal_attached", machine_id = %machine_id, generation);
    }

    pub async fn dispose(&self, machine_id: &str) {
        let handle = self.sessions.lock().await.remove(machine_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.task.await;
        }
    }

    pub async fn dispose_all(&self) {
        let handles = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        for handle in &handles {
            handle.cancel.cancel();
        }
        for handle in handles {
            let _ = handle.task.await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

struct TerminalSession {
    machine_id: String,
    config: TerminalConfig,
    pty: Arc<dyn TerminalProcess>,
    channel: Arc<dyn DataChannel>,
    open: bool,
    spawned: bool,
    pending_output: Vec<u8>,
    pending_input: Vec<Vec<u8>>,
    size: (u16, u16),
    recent: Arc<dyn RecentCwd>,
    default_cwd: PathBuf,
}

impl TerminalSession {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        let mut pty_events = self.pty.subscribe();
        let open_deadline = tokio::time::sleep(self.config.open_timeout);
        let cwd_deadline = tokio::time::sleep(self.config.cwd_timeout);
        tokio::pin!(open_deadline);
        tokio::pin!(cwd_deadline);

        if self.channel.is_open() {
            self.open = true;
        }

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break EndReason::Disposed,
                event = events.recv() => {
                    match event {
                        None | Some(ChannelEvent::Close) => break EndReason::ChannelClosed,
                        Some(ChannelEvent::Open) => self.on_open(),
                        Some(ChannelEvent::Message(bytes)) => {
                            if let Some(reason) = self.on_message(&bytes) {
                                break reason;
                            }
                        }
                    }
                }
                event = pty_events.recv(), if self.spawned => {
                    match event {
                        Some(PtyEvent::Data(bytes)) => {
                            if let Some(reason) = self.on_output(bytes) {
                                break reason;
                            }
                        }
                        Some(PtyEvent::Exit(exit)) => {
                            debug!(event = "terminal_pty_exit", machine_id = %self.machine_id, code = ?exit.code);
                            break EndReason::PtyExited;
                        }
                        None => break EndReason::PtyExited,
                    }
                }
                _ = &mut open_deadline, if !self.open => break EndReason::OpenTimeout,
                _ = &mut cwd_deadline, if !self.spawned => {
                    let fallback_cwd = self
                        .recent
                        .recent_cwd()
                        .unwrap_or_else(|| self.default_cwd.clone());
                    debug!(event = "terminal_cwd_fallback", machine_id = %self.machine_id, cwd = %fallback_cwd.display());
                    if let Some(reason) = self.spawn_at(fallback_cwd) {
                        break reason;
                    }
                }
            }
        };

        self.pty.dispose();
        self.channel.close();
        self.pending_output.clear();
        self.pending_input.clear();
        info!(event = "terminal_closed", machine_id = %self.machine_id, reason = reason.as_str());
    }

    fn on_open(&mut self) {
        self.open = true;
        if !self.pending_output.is_empty() {
            let pending = std::mem::take(&mut self.pending_output);
            let _ = self.channel.send(&pending);
        }
    }

    fn on_message(&mut self, bytes: &[u8]) -> Option<EndReason> {
        match decode_inbound(bytes) {
            Ok(InboundFrame::Control(ControlFrame::Cwd { path })) => {
                if self.spawned {
                    debug!(event = "terminal_cwd_ignored", machine_id = %self.machine_id);
                    return None;
                }
                self.spawn_at(PathBuf::from(path))
            }
            Ok(InboundFrame::Control(ControlFrame::Resize { cols, rows })) => {
                self.size = (cols, rows);
                if self.spawned {
                    if let Err(err) = self.pty.resize(cols, rows) {
                        debug!(event = "terminal_resize_failed", machine_id = %self.machine_id, error = %err);
                    }
                }
                None
            }
            Ok(InboundFrame::Input(data)) => {
                if self.spawned {
                    if let Err(err) = self.pty.write(data) {
                        debug!(event = "terminal_write_failed", machine_id = %self.machine_id, error = %err);
                    }
                } else {
                    self.pending_input.push(data.to_vec());
                }
                None
            }
            Err(err) => {
                warn!(event = "terminal_control_malformed", machine_id = %self.machine_id, error = %err);
                None
            }
        }
    }

    fn on_output(&mut self, bytes: Vec<u8>) -> Option<EndReason> {
        if self.open {
            let _ = self.channel.send(&bytes);
            return None;
        }
        if self.pending_output.len() + bytes.len() > self.config.max_pending_output_bytes {
            warn!(
                event = "terminal_output_overflow",
                machine_id = %self.machine_id,
                buffered = self.pending_output.len(),
                max = self.config.max_pending_output_bytes
            );
            return Some(EndReason::OutputOverflow);
        }
        self.pending_output.extend_from_slice(&bytes);
        None
    }

    fn spawn_at(&mut self, cwd: PathBuf) -> Option<EndReason> {
        let options = SpawnOptions {
            shell: self.config.shell.clone(),
            cwd,
            cols: self.size.0,
            rows: self.size.1,
            env: Vec::new(),
        };
        if let Err(err) = self.pty.spawn(options) {
            warn!(event = "terminal_spawn_failed", machine_id = %self.machine_id, error = %err);
            return Some(EndReason::SpawnFailed);
        }
        self.spawned = true;
        for data in std::mem::take(&mut self.pending_input) {
            if let Err(err) = self.pty.write(&data) {
                debug!(event = "terminal_write_failed", machine_id = %self.machine_id, error = %err);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{PtyError, PtyExit};
    use crate::transport::ChannelError;
    use loom_core::control_frame::encode_control;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakePty {
        initial_output: Vec<Vec<u8>>,
        spawned_at: StdMutex<Option<SpawnOptions>>,
        writes: StdMutex<Vec<u8>>,
        subscribers: StdMutex<Vec<mpsc::UnboundedSender<PtyEvent>>>,
        disposed: AtomicUsize,
    }

    impl FakePty {
        fn emit(&self, event: PtyEvent) {
            for tx in self.subscribers.lock().expect("subs").iter() {
                let _ = tx.send(event.clone());
            }
        }
    }

    impl TerminalProcess for FakePty {
        fn spawn(&self, options: SpawnOptions) -> Result<(), PtyError> {
            let mut spawned = self.spawned_at.lock().expect("spawned");
            if spawned.is_some() {
                return Err(PtyError::AlreadySpawned);
            }
            *spawned = Some(options);
            drop(spawned);
            for chunk in &self.initial_output {
                self.emit(PtyEvent::Data(chunk.clone()));
            }
            Ok(())
        }

        fn write(&self, data: &[u8]) -> Result<(), PtyError> {
            if self.spawned_at.lock().expect("spawned").is_none() {
                return Err(PtyError::NotRunning);
            }
            self.writes.lock().expect("writes").extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<(), PtyError> {
            Ok(())
        }

        fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.subscribers.lock().expect("subs").push(tx);
            rx
        }

        fn kill(&self) {}

        fn dispose(&self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            self.subscribers.lock().expect("subs").clear();
        }
    }

    struct FakeSpawner {
        ptys: StdMutex<Vec<Arc<FakePty>>>,
        initial_output: Vec<Vec<u8>>,
    }

    impl FakeSpawner {
        fn new(initial_output: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                ptys: StdMutex::new(Vec::new()),
                initial_output,
            })
        }

        fn pty(&self, index: usize) -> Arc<FakePty> {
            self.ptys.lock().expect("ptys")[index].clone()
        }
    }

    impl TerminalSpawner for FakeSpawner {
        fn create(&self) -> Arc<dyn TerminalProcess> {
            let pty = Arc::new(FakePty {
                initial_output: self.initial_output.clone(),
                ..FakePty::default()
            });
            self.ptys.lock().expect("ptys").push(pty.clone());
            pty
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        sent: StdMutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl DataChannel for FakeChannel {
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
            false
        }
    }

    struct NoRecent;

    impl RecentCwd for NoRecent {
        fn recent_cwd(&self) -> Option<PathBuf> {
            None
        }
    }

    #[derive(Default)]
    struct SharedRecent(StdMutex<Option<PathBuf>>);

    impl RecentCwd for SharedRecent {
        fn recent_cwd(&self) -> Option<PathBuf> {
            self.0.lock().expect("recent").clone()
        }
    }

    fn bridge(spawner: Arc<FakeSpawner>, config: TerminalConfig) -> TerminalBridge {
        TerminalBridge::new(config, PathBuf::from("/daemon"), spawner, Arc::new(NoRecent))
    }

    fn cwd_frame(path: &str) -> Vec<u8> {
        encode_control(&ControlFrame::Cwd {
            path: path.to_string(),
        })
        .expect("encode")
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn output_before_open_is_flushed_once_in_order() {
        let first = vec![b'a'; 120];
        let second = vec![b'b'; 80];
        let spawner = FakeSpawner::new(vec![first.clone(), second.clone()]);
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        tx.send(ChannelEvent::Message(cwd_frame("/repo"))).expect("send");
        settle().await;
        assert!(channel.sent.lock().expect("sent").is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(ChannelEvent::Open).expect("send");
        settle().await;

        let sent = channel.sent.lock().expect("sent").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 200);
        assert_eq!(sent[0], [first, second].concat());
        let spawned = spawner.pty(0).spawned_at.lock().expect("spawned").clone();
        assert_eq!(spawned.map(|o| o.cwd), Some(PathBuf::from("/repo")));
    }

    #[tokio::test(start_paused = true)]
    async fn input_is_replayed_after_fallback_spawn() {
        let spawner = FakeSpawner::new(Vec::new());
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        tx.send(ChannelEvent::Open).expect("send");
        tx.send(ChannelEvent::Message(b"ls\r".to_vec())).expect("send");
        tx.send(ChannelEvent::Message(b"pwd\r".to_vec())).expect("send");
        settle().await;
        assert!(spawner.pty(0).writes.lock().expect("writes").is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        let pty = spawner.pty(0);
        assert_eq!(pty.writes.lock().expect("writes").as_slice(), b"ls\rpwd\r");
        let spawned = pty.spawned_at.lock().expect("spawned").clone();
        assert_eq!(spawned.map(|o| o.cwd), Some(PathBuf::from("/daemon")));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_cwd_is_read_when_the_timeout_fires() {
        let spawner = FakeSpawner::new(Vec::new());
        let recent = Arc::new(SharedRecent::default());
        let bridge = TerminalBridge::new(
            TerminalConfig::default(),
            PathBuf::from("/daemon"),
            spawner.clone(),
            recent.clone(),
        );
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        tx.send(ChannelEvent::Open).expect("send");
        settle().await;
        // A task starts in its worktree while the browser stays silent.
        *recent.0.lock().expect("recent") = Some(PathBuf::from("/repo/worktree"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;

        let spawned = spawner.pty(0).spawned_at.lock().expect("spawned").clone();
        assert_eq!(spawned.map(|o| o.cwd), Some(PathBuf::from("/repo/worktree")));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_before_open_disposes_session_once() {
        let spawner = FakeSpawner::new(vec![vec![0u8; 64], vec![1u8; 64]]);
        let config = TerminalConfig {
            max_pending_output_bytes: 100,
            ..TerminalConfig::default()
        };
        let bridge = bridge(spawner.clone(), config);
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        tx.send(ChannelEvent::Message(cwd_frame("/repo"))).expect("send");
        settle().await;

        assert_eq!(spawner.pty(0).disposed.load(Ordering::SeqCst), 1);
        assert!(channel.closed.load(Ordering::SeqCst));
        assert!(channel.sent.lock().expect("sent").is_empty());
        assert_eq!(bridge.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_channel_from_same_machine_replaces_session() {
        let spawner = FakeSpawner::new(Vec::new());
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let first = Arc::new(FakeChannel::default());
        let (_tx1, rx1) = mpsc::unbounded_channel();
        bridge.attach("m1", first.clone(), rx1).await;

        let second = Arc::new(FakeChannel::default());
        let (_tx2, rx2) = mpsc::unbounded_channel();
        bridge.attach("m1", second.clone(), rx2).await;

        assert!(first.closed.load(Ordering::SeqCst));
        assert_eq!(spawner.pty(0).disposed.load(Ordering::SeqCst), 1);
        assert!(!second.closed.load(Ordering::SeqCst));
        assert_eq!(bridge.session_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attaches_leave_one_live_session() {
        let spawner = FakeSpawner::new(Vec::new());
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let first = Arc::new(FakeChannel::default());
        let second = Arc::new(FakeChannel::default());
        let (_tx1, rx1) = mpsc::unbounded_channel();
        let (_tx2, rx2) = mpsc::unbounded_channel();

        tokio::join!(
            bridge.attach("m1", first.clone(), rx1),
            bridge.attach("m1", second.clone(), rx2),
        );
        settle().await;

        assert_eq!(bridge.session_count().await, 1);
        let closed = [&first, &second]
            .iter()
            .filter(|channel| channel.closed.load(Ordering::SeqCst))
            .count();
        assert_eq!(closed, 1);
        let disposed: usize = (0..2)
            .map(|index| spawner.pty(index).disposed.load(Ordering::SeqCst))
            .sum();
        assert_eq!(disposed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_control_frame_is_dropped_and_pty_exit_closes_channel() {
        let spawner = FakeSpawner::new(Vec::new());
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let channel = Arc::new(FakeChannel::default());
        let (tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        let mut bad = loom_core::control_frame::CONTROL_PREFIX.to_vec();
        bad.extend_from_slice(b"{not json");
        tx.send(ChannelEvent::Open).expect("send");
        tx.send(ChannelEvent::Message(bad)).expect("send");
        tx.send(ChannelEvent::Message(cwd_frame("/repo"))).expect("send");
        settle().await;
        assert!(!channel.closed.load(Ordering::SeqCst));

        spawner.pty(0).emit(PtyEvent::Exit(PtyExit::default()));
        settle().await;
        assert!(channel.closed.load(Ordering::SeqCst));
        assert_eq!(bridge.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_that_never_opens_times_out() {
        let spawner = FakeSpawner::new(Vec::new());
        let bridge = bridge(spawner.clone(), TerminalConfig::default());
        let channel = Arc::new(FakeChannel::default());
        let (_tx, rx) = mpsc::unbounded_channel();

        bridge.attach("m1", channel.clone(), rx).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        settle().await;

        assert!(channel.closed.load(Ordering::SeqCst));
        assert_eq!(bridge.session_count().await, 0);
    }
}
