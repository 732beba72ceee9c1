//! One spawned agent subprocess bound to one conversation.

use crate::{
    BridgeEvent, EventHub, EventReceiver, EventTranslator, InputMode, InvocationArgs, Manifest,
    PendingTool, ResumeToken, SharedEventObserver,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Suspended,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session serves the conversation directly or a background run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Foreground,
    Subagent { run_id: String },
}

/// Fulfils selected tool invocations on the bridge side instead of inside the
/// agent's own sandbox. Results are written back to line-protocol agents.
pub trait ToolDelegate: Send + Sync {
    fn handles(&self, tool_name: &str) -> bool;
    fn invoke(&self, tool_name: &str, input: &Value) -> Result<Value, String>;
}

#[derive(Clone)]
pub struct SessionSettings {
    pub working_dir: PathBuf,
    pub termination_grace: Duration,
    pub preview_chars: usize,
    pub tool_delegate: Option<Arc<dyn ToolDelegate>>,
}

impl SessionSettings {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            termination_grace: Duration::from_secs(5),
            preview_chars: 500,
            tool_delegate: None,
        }
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    pub fn with_tool_delegate(mut self, delegate: Arc<dyn ToolDelegate>) -> Self {
        self.tool_delegate = Some(delegate);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub model: Option<String>,
    pub plan_mode: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionIdentity {
    pub conversation_id: String,
    pub created_at_ms: u64,
}

/// Cheaply cloneable handle; clones observe and control the same subprocess.
#[derive(Clone)]
pub struct AgentSession {
    shared: Arc<SessionShared>,
}

struct SessionShared {
    identity: SessionIdentity,
    kind: SessionKind,
    manifest: Arc<Manifest>,
    settings: SessionSettings,
    events: EventHub<BridgeEvent>,
    runtime: Mutex<SessionRuntime>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    running: watch::Sender<bool>,
}

struct SessionRuntime {
    state: SessionState,
    last_activity_ms: u64,
    resume_token: Option<ResumeToken>,
    translator: EventTranslator,
    owns_process: bool,
    terminated: bool,
    pid: Option<u32>,
    kill_tx: Option<mpsc::UnboundedSender<()>>,
    grace_timer: Option<JoinHandle<()>>,
}

impl AgentSession {
    pub fn new(
        conversation_id: impl Into<String>,
        manifest: Arc<Manifest>,
        kind: SessionKind,
        settings: SessionSettings,
    ) -> Self {
        let now = current_unix_ms();
        let translator =
            EventTranslator::new(manifest.name.clone(), manifest.dialect, settings.preview_chars);
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(SessionShared {
                identity: SessionIdentity {
                    conversation_id: conversation_id.into(),
                    created_at_ms: now,
                },
                kind,
                manifest,
                settings,
                events: EventHub::new(),
                runtime: Mutex::new(SessionRuntime {
                    state: SessionState::Suspended,
                    last_activity_ms: now,
                    resume_token: None,
                    translator,
                    owns_process: false,
                    terminated: false,
                    pid: None,
                    kill_tx: None,
                    grace_timer: None,
                }),
                stdin: tokio::sync::Mutex::new(None),
                running,
            }),
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.shared.identity
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.identity.conversation_id
    }

    pub fn engine(&self) -> &str {
        &self.shared.manifest.name
    }

    pub fn kind(&self) -> &SessionKind {
        &self.shared.kind
    }

    pub fn is_subagent(&self) -> bool {
        matches!(self.shared.kind, SessionKind::Subagent { .. })
    }

    pub fn state(&self) -> SessionState {
        self.lock_runtime().state
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.lock_runtime().last_activity_ms
    }

    pub fn resume_token(&self) -> Option<ResumeToken> {
        self.lock_runtime().resume_token.clone()
    }

    pub fn pending_tools(&self) -> HashMap<String, PendingTool> {
        self.lock_runtime().translator.pending_tools().clone()
    }

    pub fn last_text(&self) -> String {
        self.lock_runtime().translator.last_text().to_string()
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.borrow()
    }

    pub fn same_session(&self, other: &AgentSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Subscribers registered before [`AgentSession::run`] see every event.
    pub fn subscribe(&self) -> EventReceiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    pub fn observe(&self, observer: SharedEventObserver<BridgeEvent>) {
        self.shared.events.observe(observer);
    }

    /// Spawns the agent and starts streaming its stdout. Spawn failures are
    /// reported as an `error` event; calling this while a subprocess is still
    /// owned only logs a warning. Returns whether a subprocess was spawned.
    pub async fn run(&self, prompt: &str, resume: Option<&ResumeToken>, options: RunOptions) -> bool {
        if self.lock_runtime().owns_process {
            warn!(
                conversation_id = %self.conversation_id(),
                engine = %self.engine(),
                "run requested while the session already owns a subprocess"
            );
            return false;
        }

        let manifest = Arc::clone(&self.shared.manifest);
        let settings = &self.shared.settings;
        let resume = resume.filter(|token| token.engine == manifest.name);
        let args = manifest.build_args(&InvocationArgs {
            prompt,
            working_dir: Some(settings.working_dir.as_path()),
            resume,
            model: options.model.as_deref(),
            plan_mode: options.plan_mode,
        });

        let mut command = Command::new(&manifest.executable);
        command
            .args(&args)
            .envs(&manifest.env)
            .current_dir(&settings.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match manifest.input_mode {
                InputMode::Argument => Stdio::null(),
                InputMode::Stdin | InputMode::LineProtocol => Stdio::piped(),
            })
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(engine = %manifest.name, %error, "failed to spawn agent");
                self.shared.events.emit(BridgeEvent::error(format!(
                    "failed to spawn agent '{}': {error}",
                    manifest.name
                )));
                return false;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        {
            let mut runtime = self.lock_runtime();
            runtime.owns_process = true;
            runtime.terminated = false;
            runtime.pid = child.id();
            runtime.kill_tx = Some(kill_tx);
            runtime.state = SessionState::Active;
            runtime.last_activity_ms = current_unix_ms();
            runtime.resume_token = resume.cloned();
            runtime.translator =
                EventTranslator::new(manifest.name.clone(), manifest.dialect, settings.preview_chars)
                    .with_resume_token(resume.cloned());
        }
        self.shared.running.send_replace(true);
        info!(
            conversation_id = %self.conversation_id(),
            engine = %manifest.name,
            pid = ?child.id(),
            resumed = resume.is_some(),
            "spawned agent"
        );

        if let Some(stderr) = stderr {
            tokio::spawn(drain_stderr(manifest.name.clone(), stderr));
        }
        let session = self.clone();
        tokio::spawn(async move { session.supervise(child, stdout, kill_rx).await });

        // Stdout and stderr readers must be live before the first stdin write.
        if let Some(stdin) = stdin {
            self.deliver_prompt(stdin, manifest.input_mode, prompt).await;
        }
        true
    }

    /// Sends SIGTERM and escalates to a forceful kill once the grace window
    /// elapses. No-op when no subprocess is owned or termination is underway.
    pub fn terminate(&self) {
        let mut runtime = self.lock_runtime();
        if !runtime.owns_process || runtime.terminated {
            return;
        }
        runtime.terminated = true;
        runtime.state = SessionState::Suspended;

        let kill_tx = runtime.kill_tx.clone();
        if runtime.pid.is_some_and(send_graceful_signal) {
            let grace = self.shared.settings.termination_grace;
            let engine = self.engine().to_string();
            runtime.grace_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Some(kill_tx) = kill_tx {
                    info!(%engine, grace_ms = grace.as_millis() as u64, "agent ignored SIGTERM, killing");
                    let _ = kill_tx.send(());
                }
            }));
        } else if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        info!(conversation_id = %self.conversation_id(), engine = %self.engine(), "terminating agent");
    }

    /// Resolves once the owned subprocess (if any) has exited.
    pub async fn wait_for_exit(&self) {
        let mut running = self.shared.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    async fn deliver_prompt(&self, mut stdin: ChildStdin, mode: InputMode, prompt: &str) {
        match mode {
            InputMode::Argument => {}
            InputMode::Stdin => {
                let engine = self.engine().to_string();
                let payload = prompt.as_bytes().to_vec();
                tokio::spawn(async move {
                    if let Err(error) = write_and_close(&mut stdin, &payload).await {
                        warn!(%engine, %error, "failed writing prompt to agent stdin");
                    }
                });
            }
            InputMode::LineProtocol => {
                let message = json!({
                    "type": "user",
                    "message": {
                        "role": "user",
                        "content": [{ "type": "text", "text": prompt }],
                    },
                });
                *self.shared.stdin.lock().await = Some(stdin);
                self.write_stdin_line(&message).await;
            }
        }
    }

    async fn write_stdin_line(&self, message: &Value) {
        let mut guard = self.shared.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            debug!(engine = %self.engine(), "agent stdin is closed, dropping message");
            return;
        };
        let mut line = message.to_string();
        line.push('\n');
        let written = match stdin.write_all(line.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(error) => Err(error),
        };
        if let Err(error) = written {
            warn!(engine = %self.engine(), %error, "failed writing to agent stdin");
            guard.take();
        }
    }

    async fn close_stdin(&self) {
        if let Some(mut stdin) = self.shared.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    async fn supervise(
        self,
        mut child: Child,
        stdout: Option<ChildStdout>,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
    ) {
        if let Some(stdout) = stdout {
            let mut segments = BufReader::new(stdout).split(b'\n');
            loop {
                tokio::select! {
                    segment = segments.next_segment() => match segment {
                        Ok(Some(bytes)) => self.handle_line(&String::from_utf8_lossy(&bytes)).await,
                        Ok(None) => break,
                        Err(error) => {
                            debug!(engine = %self.engine(), %error, "agent stdout read failed");
                            break;
                        }
                    },
                    Some(()) = kill_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            }
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    let _ = child.start_kill();
                }
            }
        };
        self.finish(status).await;
    }

    async fn handle_line(&self, line: &str) {
        let events = {
            let mut runtime = self.lock_runtime();
            runtime.last_activity_ms = current_unix_ms();
            let events = runtime.translator.translate_line(line);
            if events
                .iter()
                .any(|event| matches!(event, BridgeEvent::Started { .. } | BridgeEvent::Completed { .. }))
            {
                runtime.resume_token = runtime.translator.resume_token().cloned();
            }
            events
        };

        for event in events {
            self.shared.events.emit(event.clone());
            match event {
                BridgeEvent::ToolStart {
                    tool_id,
                    name,
                    input,
                } => self.delegate_tool(&tool_id, &name, &input).await,
                BridgeEvent::Completed { .. } => self.close_stdin().await,
                _ => {}
            }
        }
    }

    async fn delegate_tool(&self, tool_id: &str, name: &str, input: &Value) {
        let Some(delegate) = self.shared.settings.tool_delegate.as_ref() else {
            return;
        };
        if !delegate.handles(name) {
            return;
        }
        let (content, is_error) = match delegate.invoke(name, input) {
            Ok(value) => (value, false),
            Err(error) => (Value::String(error), true),
        };
        debug!(engine = %self.engine(), tool_id, tool = name, is_error, "delegated tool call");
        self.write_stdin_line(&json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": tool_id,
                    "content": content,
                    "is_error": is_error,
                }],
            },
        }))
        .await;
    }

    async fn finish(&self, status: std::io::Result<ExitStatus>) {
        self.shared.stdin.lock().await.take();
        let (failure, grace_timer) = {
            let mut runtime = self.lock_runtime();
            runtime.owns_process = false;
            runtime.pid = None;
            runtime.kill_tx = None;
            runtime.last_activity_ms = current_unix_ms();
            let grace_timer = runtime.grace_timer.take();
            let failure = if runtime.terminated {
                None
            } else {
                runtime.state = SessionState::Completed;
                if runtime.translator.is_completed() {
                    None
                } else {
                    Some(match &status {
                        Ok(status) => format!(
                            "agent '{}' exited before completing ({status})",
                            self.engine()
                        ),
                        Err(error) => format!("failed waiting for agent '{}': {error}", self.engine()),
                    })
                }
            };
            (failure, grace_timer)
        };
        if let Some(timer) = grace_timer {
            timer.abort();
        }
        if let Some(message) = failure {
            self.shared.events.emit(BridgeEvent::error(message));
        }
        info!(
            conversation_id = %self.conversation_id(),
            engine = %self.engine(),
            status = ?status.as_ref().ok(),
            "agent exited"
        );
        self.shared.running.send_replace(false);
    }

    fn lock_runtime(&self) -> MutexGuard<'_, SessionRuntime> {
        self.shared
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn write_and_close(stdin: &mut ChildStdin, payload: &[u8]) -> std::io::Result<()> {
    stdin.write_all(payload).await?;
    stdin.shutdown().await
}

async fn drain_stderr(engine: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%engine, line = %line, "agent stderr");
    }
}

#[cfg(unix)]
fn send_graceful_signal(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_graceful_signal(_pid: u32) -> bool {
    false
}

pub(crate) fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
