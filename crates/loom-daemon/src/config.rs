use loom_core::ephemeral::Namespace;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug)]
pub struct TerminalConfig {
    pub open_timeout: Duration,
    pub cwd_timeout: Duration,
    pub max_pending_output_bytes: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub shell: Option<String>,
    pub kill_grace: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(10),
            cwd_timeout: Duration::from_secs(2),
            max_pending_output_bytes: 1024 * 1024,
            default_cols: 80,
            default_rows: 24,
            shell: None,
            kill_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiffConfig {
    pub unstaged_debounce: Duration,
    pub branch_debounce: Duration,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            unstaged_debounce: Duration::from_millis(500),
            branch_debounce: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EphemeralConfig {
    pub entry_ttl: Duration,
    pub setup_event_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for EphemeralConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(300),
            setup_event_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl EphemeralConfig {
    pub fn ttl_for(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::WorktreeSetupEvents => self.setup_event_ttl,
            _ => self.entry_ttl,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub machine_id: String,
    pub default_cwd: PathBuf,
    pub repo_roots: Vec<PathBuf>,
    pub relay_url: Option<Url>,
    pub relay_token: Option<String>,
    pub log_dir: String,
    pub log_stdout: bool,
    pub terminal: TerminalConfig,
    pub diff: DiffConfig,
    pub ephemeral: EphemeralConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
            default_cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            repo_roots: Vec::new(),
            relay_url: None,
            relay_token: None,
            log_dir: String::new(),
            log_stdout: false,
            terminal: TerminalConfig::default(),
            diff: DiffConfig::default(),
            ephemeral: EphemeralConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_value("LOOM_MACHINE_ID") {
            config.machine_id = value;
        }
        if let Some(value) = env_value("LOOM_DEFAULT_CWD") {
            config.default_cwd = PathBuf::from(value);
        }
        if let Some(value) = env_value("LOOM_REPO_ROOTS") {
            config.repo_roots = env::split_paths(&value).collect();
        }
        config.relay_url = env_value("LOOM_RELAY_URL").and_then(|value| Url::parse(&value).ok());
        config.relay_token = env_value("LOOM_RELAY_TOKEN");
        config.log_dir = env_value("LOOM_LOG_DIR").unwrap_or_else(|| ".loom/logs".to_string());
        config.log_stdout = env_value("LOOM_LOG_STDOUT")
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(false);
        if let Some(value) = env_value("LOOM_SHELL") {
            config.terminal.shell = Some(value);
        }
        if let Some(ms) = env_millis("LOOM_TERMINAL_CWD_TIMEOUT_MS") {
            config.terminal.cwd_timeout = ms;
        }
        if let Some(ms) = env_millis("LOOM_TERMINAL_OPEN_TIMEOUT_MS") {
            config.terminal.open_timeout = ms;
        }
        if let Some(ms) = env_millis("LOOM_DIFF_DEBOUNCE_MS") {
            config.diff.unstaged_debounce = ms;
        }
        if let Some(ms) = env_millis("LOOM_BRANCH_DIFF_DEBOUNCE_MS") {
            config.diff.branch_debounce = ms;
        }
        config
    }
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "off" | "OFF" => Some(false),
        _ => None,
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_value(key)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn default_machine_id() -> String {
    if let Some(host) = env_value("HOSTNAME") {
        return host;
    }
    format!("pid-{}", std::process::id())
}
