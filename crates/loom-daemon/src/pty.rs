use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::env;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    Exit(PtyExit),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PtyExit {
    pub code: Option<u32>,
    pub signal: Option<String>,
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty already spawned")]
    AlreadySpawned,
    #[error("pty not running")]
    NotRunning,
    #[error("pty spawn failed: {0}")]
    Spawn(String),
    #[error("pty io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: Option<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
}

/// One interactive terminal process.
pub trait TerminalProcess: Send + Sync {
    fn spawn(&self, options: SpawnOptions) -> Result<(), PtyError>;
    fn write(&self, data: &[u8]) -> Result<(), PtyError>;
    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;
    /// Every subscriber receives all data and the exit event.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent>;
    fn kill(&self);
    fn dispose(&self);
}

pub trait TerminalSpawner: Send + Sync {
    fn create(&self) -> Arc<dyn TerminalProcess>;
}

#[derive(Debug, Clone)]
pub struct NativePtySpawner {
    kill_grace: Duration,
}

impl NativePtySpawner {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }
}

impl TerminalSpawner for NativePtySpawner {
    fn create(&self) -> Arc<dyn TerminalProcess> {
        Arc::new(PtySupervisor::new(self.kill_grace))
    }
}

type Subscribers = Arc<StdMutex<Vec<mpsc::UnboundedSender<PtyEvent>>>>;

struct RunningPty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

pub struct PtySupervisor {
    kill_grace: Duration,
    spawned: AtomicBool,
    running: StdMutex<Option<RunningPty>>,
    subscribers: Subscribers,
}

impl PtySupervisor {
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            kill_grace,
            spawned: AtomicBool::new(false),
            running: StdMutex::new(None),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    fn with_running<R>(
        &self,
        f: impl FnOnce(&mut RunningPty) -> Result<R, PtyError>,
    ) -> Result<R, PtyError> {
        let mut guard = self
            .running
            .lock()
            .map_err(|_| PtyError::Io("pty state poisoned".to_string()))?;
        match guard.as_mut() {
            Some(running) if !running.exited.load(Ordering::SeqCst) => f(running),
            _ => Err(PtyError::NotRunning),
        }
    }
}

fn broadcast(subscribers: &Subscribers, event: PtyEvent) {
    if let Ok(mut subscribers) = subscribers.lock() {
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

fn default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

impl TerminalProcess for PtySupervisor {
    fn spawn(&self, options: SpawnOptions) -> Result<(), PtyError> {
        if self.spawned.swap(true, Ordering::SeqCst) {
            return Err(PtyError::AlreadySpawned);
        }
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| PtyError::Spawn(err.to_string()))?;

        let shell = options.shell.unwrap_or_else(default_shell);
        let mut builder = CommandBuilder::new(&shell);
        builder.cwd(&options.cwd);
        builder.env("TERM", "xterm-256color");
        builder.env("COLORTERM", "truecolor");
        for (key, value) in &options.env {
            builder.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(builder)
            .map_err(|err| PtyError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| PtyError::Spawn(err.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|err| PtyError::Spawn(err.to_string()))?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let exited = Arc::new(AtomicBool::new(false));
        debug!(event = "pty_spawned", shell = %shell, cwd = %options.cwd.display(), pid = ?pid);

        let subscribers = self.subscribers.clone();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; 8192];
            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(_) => break,
                };
                broadcast(&subscribers, PtyEvent::Data(buffer[..read].to_vec()));
            }
        });

        let subscribers = self.subscribers.clone();
        let exited_flag = exited.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            exited_flag.store(true, Ordering::SeqCst);
            // Let buffered output drain before reporting exit.
            let _ = tokio::time::timeout(Duration::from_millis(500), reader_task).await;
            let exit = match status {
                Ok(Ok(status)) => exit_from_status(&status),
                Ok(Err(err)) => {
                    warn!(event = "pty_wait_failed", error = %err);
                    PtyExit::default()
                }
                Err(err) => {
                    warn!(event = "pty_wait_failed", error = %err);
                    PtyExit::default()
                }
            };
            broadcast(&subscribers, PtyEvent::Exit(exit));
        });

        let mut running = self
            .running
            .lock()
            .map_err(|_| PtyError::Io("pty state poisoned".to_string()))?;
        *running = Some(RunningPty {
            master: pair.master,
            writer,
            killer,
            pid,
            exited,
        });
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.with_running(|running| {
            running
                .writer
                .write_all(data)
                .and_then(|_| running.writer.flush())
                .map_err(|err| PtyError::Io(err.to_string()))
        })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.with_running(|running| {
            running
                .master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|err| PtyError::Io(err.to_string()))
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    fn kill(&self) {
        let Ok(guard) = self.running.lock() else {
            return;
        };
        let Some(running) = guard.as_ref() else {
            return;
        };
        if running.exited.load(Ordering::SeqCst) {
            return;
        }
        let mut killer = running.killer.clone_killer();
        let exited = running.exited.clone();
        let pid = running.pid;
        if !send_signal(pid, Escalation::Terminate) {
            let _ = killer.kill();
            return;
        }
        let grace = self.kill_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if !exited.load(Ordering::SeqCst) {
                debug!(event = "pty_force_kill", pid = ?pid);
                if !send_signal(pid, Escalation::Kill) {
                    let _ = killer.kill();
                }
            }
        });
    }

    fn dispose(&self) {
        self.kill();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
        if let Ok(mut running) = self.running.lock() {
            running.take();
        }
    }
}

/// portable-pty reports a signal death only through its display form.
fn exit_from_status(status: &portable_pty::ExitStatus) -> PtyExit {
    let signal = if status.success() {
        None
    } else {
        status
            .to_string()
            .strip_prefix("Terminated by ")
            .map(str::to_string)
    };
    PtyExit {
        code: Some(status.exit_code()),
        signal,
    }
}

#[derive(Debug, Clone, Copy)]
enum Escalation {
    Terminate,
    Kill,
}

/// Signals the shell's process group, then the shell itself. The shell leads
/// its own session, so the group id equals its pid.
#[cfg(unix)]
fn send_signal(pid: Option<u32>, escalation: Escalation) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    let signal = match escalation {
        Escalation::Terminate => Signal::SIGTERM,
        Escalation::Kill => Signal::SIGKILL,
    };
    let pid = Pid::from_raw(pid);
    let group = killpg(pid, signal).is_ok();
    kill(pid, signal).is_ok() || group
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _escalation: Escalation) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options(cwd: PathBuf) -> SpawnOptions {
        SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            cwd,
            cols: 80,
            rows: 24,
            env: Vec::new(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_and_resize_fail_before_spawn() {
        let pty = PtySupervisor::new(Duration::from_millis(100));
        assert!(matches!(pty.write(b"ls\n"), Err(PtyError::NotRunning)));
        assert!(matches!(pty.resize(100, 30), Err(PtyError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_spawn_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pty = PtySupervisor::new(Duration::from_millis(100));
        pty.spawn(options(dir.path().to_path_buf())).expect("spawn");
        assert!(matches!(
            pty.spawn(options(dir.path().to_path_buf())),
            Err(PtyError::AlreadySpawned)
        ));
        pty.dispose();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_output_and_reports_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pty = PtySupervisor::new(Duration::from_millis(100));
        let mut events = pty.subscribe();
        pty.spawn(options(dir.path().to_path_buf())).expect("spawn");
        pty.write(b"echo loom-ready; exit 3\n").expect("write");

        let mut output = Vec::new();
        let exit = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                match event {
                    PtyEvent::Data(bytes) => output.extend(bytes),
                    PtyEvent::Exit(exit) => return Some(exit),
                }
            }
            None
        })
        .await
        .expect("exit in time")
        .expect("exit event");

        assert!(String::from_utf8_lossy(&output).contains("loom-ready"));
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
    }

    async fn next_exit(events: &mut mpsc::UnboundedReceiver<PtyEvent>, within: Duration) -> Option<PtyExit> {
        tokio::time::timeout(within, async {
            while let Some(event) = events.recv().await {
                if let PtyEvent::Exit(exit) = event {
                    return Some(exit);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_escalates_when_the_shell_ignores_terminate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pty = PtySupervisor::new(Duration::from_millis(300));
        let mut events = pty.subscribe();
        pty.spawn(options(dir.path().to_path_buf())).expect("spawn");
        pty.write(b"trap '' TERM HUP; printf 'loom-%s\\n' armed\n").expect("write");

        let armed = tokio::time::timeout(Duration::from_secs(10), async {
            let mut output = Vec::new();
            while let Some(event) = events.recv().await {
                if let PtyEvent::Data(bytes) = event {
                    output.extend(bytes);
                    if String::from_utf8_lossy(&output).contains("loom-armed") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .expect("trap installed in time");
        assert!(armed);

        pty.kill();
        let exit = next_exit(&mut events, Duration::from_secs(5))
            .await
            .expect("forced exit");
        assert!(exit.signal.is_some());
        assert!(matches!(pty.write(b"ls\n"), Err(PtyError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_after_exit_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pty = PtySupervisor::new(Duration::from_millis(100));
        let mut events = pty.subscribe();
        pty.spawn(options(dir.path().to_path_buf())).expect("spawn");
        pty.write(b"exit 0\n").expect("write");
        let exit = next_exit(&mut events, Duration::from_secs(10))
            .await
            .expect("exit");
        assert_eq!(exit.code, Some(0));

        pty.kill();
        pty.dispose();
        assert!(matches!(pty.resize(90, 30), Err(PtyError::NotRunning)));
    }
}
