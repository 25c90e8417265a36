//! Session runner backed by an external agent command.
//!
//! The command runs through `sh -c` in the task's working directory. The
//! prompt, cwd and session id are passed through `LOOM_*` environment
//! variables; stdout becomes the reply and stderr lines go to the sink.

use crate::session::{
    ResumeDecision, RunHooks, SessionContext, SessionError, SessionFactory, SessionRequest,
    SessionResult, SessionRunner,
};
use async_trait::async_trait;
use loom_core::ContentBlock;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

pub const AGENT_CMD_ENV: &str = "LOOM_AGENT_CMD";

#[derive(Debug, Clone)]
pub struct CommandSessionFactory {
    command: String,
}

impl CommandSessionFactory {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl SessionFactory for CommandSessionFactory {
    fn create(&self, context: SessionContext) -> Arc<dyn SessionRunner> {
        Arc::new(CommandSession {
            command: self.command.clone(),
            context,
        })
    }
}

pub struct CommandSession {
    command: String,
    context: SessionContext,
}

impl CommandSession {
    async fn run(
        &self,
        session_id: String,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError> {
        let started = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&request.cwd)
            .env("LOOM_TASK_ID", &self.context.task_id)
            .env("LOOM_SESSION_ID", &session_id)
            .env("LOOM_PROMPT", prompt_text(&request.prompt))
            .env("LOOM_CWD", &request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &request.model {
            cmd.env("LOOM_MODEL", model);
        }
        if let Some(mode) = &request.permission_mode {
            cmd.env("LOOM_PERMISSION_MODE", mode);
        }
        if let Some(effort) = &request.reasoning_effort {
            cmd.env("LOOM_REASONING_EFFORT", effort);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| SessionError::Spawn(err.to_string()))?;
        info!(
            event = "agent_command_started",
            task_id = %self.context.task_id,
            session_id = %session_id,
            pid = child.id().unwrap_or(0)
        );

        let stderr_task = child.stderr.take().map(|stderr| {
            let sink = hooks.stderr.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink(&line);
                }
            })
        });
        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stdout.read_to_string(&mut buf).await;
                buf
            })
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|err| SessionError::Failed(err.to_string()))?,
            _ = hooks.cancel.cancelled() => {
                let _ = child.kill().await;
                debug!(event = "agent_command_cancelled", task_id = %self.context.task_id);
                return Err(SessionError::Cancelled);
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            return Err(SessionError::Failed(format!("agent command exited with {status}")));
        }
        let reply = stdout.trim();
        Ok(SessionResult {
            session_id: Some(session_id),
            status: "success".to_string(),
            cost_usd: None,
            duration_ms: started.elapsed().as_millis() as u64,
            reply: (!reply.is_empty()).then(|| reply.to_string()),
        })
    }
}

#[async_trait]
impl SessionRunner for CommandSession {
    async fn create_session(
        &self,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError> {
        self.run(uuid::Uuid::new_v4().to_string(), request, hooks).await
    }

    async fn resume_session(
        &self,
        session_id: &str,
        request: SessionRequest,
        hooks: RunHooks,
    ) -> Result<SessionResult, SessionError> {
        self.run(session_id.to_string(), request, hooks).await
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

fn prompt_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { .. } => "[image]".to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::{PermissionResult, ToolPermissionHandler, ToolUseContext};
    use serde_json::Value;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    struct AllowAll;

    #[async_trait]
    impl ToolPermissionHandler for AllowAll {
        async fn can_use_tool(&self, _tool: &str, input: Value, _ctx: ToolUseContext) -> PermissionResult {
            PermissionResult::Allow {
                updated_input: input,
                updated_permissions: None,
            }
        }
    }

    fn request(dir: &std::path::Path, text: &str) -> SessionRequest {
        SessionRequest {
            prompt: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            cwd: dir.to_path_buf(),
            model: None,
            permission_mode: None,
            reasoning_effort: None,
        }
    }

    fn hooks(cancel: CancellationToken, lines: Arc<Mutex<Vec<String>>>) -> RunHooks {
        RunHooks {
            cancel,
            permissions: Arc::new(AllowAll),
            stderr: Arc::new(move |line: &str| lines.lock().expect("lines").push(line.to_string())),
        }
    }

    #[tokio::test]
    async fn reply_comes_from_stdout_and_stderr_reaches_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let factory = CommandSessionFactory::new("echo warming up >&2; printf 'done: %s' \"$LOOM_PROMPT\"");
        let session = factory.create(SessionContext {
            task_id: "t1".to_string(),
            agent_session_id: None,
        });
        let lines = Arc::new(Mutex::new(Vec::new()));
        let result = session
            .create_session(request(dir.path(), "fix bug"), hooks(CancellationToken::new(), lines.clone()))
            .await
            .expect("run");
        assert_eq!(result.reply.as_deref(), Some("done: fix bug"));
        assert!(result.session_id.is_some());
        assert_eq!(*lines.lock().expect("lines"), vec!["warming up".to_string()]);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = CommandSessionFactory::new("exit 4").create(SessionContext::default());
        let result = session
            .create_session(request(dir.path(), "x"), hooks(CancellationToken::new(), Arc::default()))
            .await;
        assert!(matches!(result, Err(SessionError::Failed(_))));
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = CommandSessionFactory::new("sleep 30").create(SessionContext::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = session
            .create_session(request(dir.path(), "x"), hooks(cancel, Arc::default()))
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[test]
    fn resume_follows_the_stored_session_id() {
        let session = CommandSessionFactory::new("true").create(SessionContext {
            task_id: "t1".to_string(),
            agent_session_id: Some("s-9".to_string()),
        });
        assert_eq!(
            session.should_resume(),
            ResumeDecision {
                resume: true,
                session_id: Some("s-9".to_string()),
            }
        );
    }
}
