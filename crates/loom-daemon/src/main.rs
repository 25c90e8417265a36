use anyhow::{Context, Result};
use clap::Parser;
use loom_core::store::DocStore;
use loom_daemon::command_session::{CommandSessionFactory, AGENT_CMD_ENV};
use loom_daemon::git::ShellGit;
use loom_daemon::plan_review::DefaultPlanRenderer;
use loom_daemon::pty::NativePtySpawner;
use loom_daemon::transport::DisabledTransport;
use loom_daemon::{Collaborators, Daemon, DaemonConfig};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "loomd")]
struct Args {
    #[arg(long, default_value = "")]
    machine_id: String,
    #[arg(long)]
    relay_url: Option<String>,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long)]
    cwd: Option<PathBuf>,
    #[arg(long = "repo-root")]
    repo_roots: Vec<PathBuf>,
    #[arg(long, env = "LOOM_AGENT_CMD", default_value = "")]
    agent_cmd: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let _log_guard = init_logging(&config);

    anyhow::ensure!(
        !args.agent_cmd.trim().is_empty(),
        "{AGENT_CMD_ENV} or --agent-cmd must name the agent command"
    );
    let sessions = CommandSessionFactory::new(args.agent_cmd.trim());

    let store = Arc::new(DocStore::new(format!("room-{}", config.machine_id)));
    let daemon = Daemon::start(
        config.clone(),
        Collaborators {
            store,
            git: Arc::new(ShellGit::new()),
            sessions: Arc::new(sessions),
            spawner: Arc::new(NativePtySpawner::new(config.terminal.kill_grace)),
            transport: Arc::new(DisabledTransport),
            renderer: Arc::new(DefaultPlanRenderer),
        },
    )
    .await;

    wait_for_shutdown().await;
    info!(event = "shutdown_signal", machine_id = %config.machine_id);
    daemon.shutdown().await;
    Ok(())
}

fn load_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::from_env();
    if !args.machine_id.trim().is_empty() {
        config.machine_id = args.machine_id.trim().to_string();
    }
    if let Some(url) = &args.relay_url {
        config.relay_url = Some(Url::parse(url).with_context(|| format!("invalid relay url {url}"))?);
    }
    if !args.log_dir.trim().is_empty() {
        config.log_dir = args.log_dir.trim().to_string();
    }
    if let Some(cwd) = &args.cwd {
        config.default_cwd = cwd.clone();
    }
    for root in &args.repo_roots {
        if !config.repo_roots.contains(root) {
            config.repo_roots.push(root.clone());
        }
    }
    Ok(config)
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging(config: &DaemonConfig) -> Option<LogGuard> {
    let level = if let Ok(level) = std::env::var("LOOM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.machine_id) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    // Without a log file, stdout is the only sink left.
    let stdout_enabled = config.log_stdout || file.is_none();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, machine_id: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("loomd-{}.log", sanitize_component(machine_id)));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
