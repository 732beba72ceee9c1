//! The orchestration context that ties sessions, lanes, subagents and spec
//! mode together for a conversation transport.

use crate::config::{LANE_MAIN, LANE_SUBAGENT};
use crate::{
    AgentSession, BridgeConfig, BridgeError, BridgeEvent, CommandQueue, ConversationEvent,
    EventHub, EventReceiver, FsRegistryPersistence, LaneTicket, ManifestRegistry, QueuedMessage,
    RegistryPersistence, ResumeToken, RunOptions, SessionKind, SessionSettings, SessionState,
    SessionStore, SharedEventObserver, SpawnRequest, SpecIntent, SpecModeState, SpecModeStore,
    SubagentRegistry, SubagentRunRecord, SubagentStatus, ToolDelegate, TruncationMode,
    detect_intent, truncate_chars,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

const INJECTED_RESULT_MAX_CHARS: usize = 4_000;
const RESTART_INTERRUPTED: &str = "bridge restarted before the run finished";

/// Outcome of one agent turn, collected from its event stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub conversation_id: String,
    pub engine: String,
    pub session_id: Option<String>,
    pub answer: String,
    pub is_error: bool,
    pub cost_usd: Option<f64>,
    pub plan: Option<String>,
    pub error: Option<String>,
    pub interrupted: bool,
    pub injected_runs: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    /// The conversation was busy; the message waits at this 1-based position.
    Queued { position: usize },
    Turn(TurnSummary),
    SpecCancelled,
}

/// Handle for a scheduled subagent run.
pub struct SubagentTicket {
    pub run_id: String,
    completion: LaneTicket<()>,
}

#[derive(Clone, Default)]
pub struct BridgeOptions {
    pub tool_delegate: Option<Arc<dyn ToolDelegate>>,
    pub persistence: Option<Arc<dyn RegistryPersistence>>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: BridgeConfig,
    manifests: ManifestRegistry,
    sessions: SessionStore,
    lanes: CommandQueue,
    subagents: SubagentRegistry,
    spec_mode: SpecModeStore,
    events: EventHub<ConversationEvent>,
    tool_delegate: Option<Arc<dyn ToolDelegate>>,
    persistence: Option<Arc<dyn RegistryPersistence>>,
    model_overrides: Mutex<HashMap<String, String>>,
    draining: Mutex<HashSet<String>>,
}

struct PreparedTurn {
    conversation_id: String,
    engine: String,
    prompt: String,
    options: RunOptions,
    session: AgentSession,
    plans_for_spec: bool,
}

enum Prepared {
    Turn(PreparedTurn),
    SpecCancelled,
}

impl Bridge {
    pub fn new(config: BridgeConfig, manifests: ManifestRegistry) -> Result<Self, BridgeError> {
        let persistence = config
            .subagents
            .state_path
            .clone()
            .map(|path| Arc::new(FsRegistryPersistence::new(path)) as Arc<dyn RegistryPersistence>);
        Self::with_options(
            config,
            manifests,
            BridgeOptions {
                tool_delegate: None,
                persistence,
            },
        )
    }

    pub fn with_options(
        config: BridgeConfig,
        manifests: ManifestRegistry,
        options: BridgeOptions,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        if manifests.is_empty() {
            warn!("bridge started without any usable agent manifests");
        }
        let lanes = CommandQueue::with_limits(&config.lanes);
        let subagents =
            SubagentRegistry::new(config.subagents.max_concurrent, config.subagents.retention_ms);
        info!(
            engines = ?manifests.names(),
            default_engine = %config.default_engine,
            "bridge initialized"
        );
        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                manifests,
                sessions: SessionStore::new(),
                lanes,
                subagents,
                spec_mode: SpecModeStore::new(),
                events: EventHub::new(),
                tool_delegate: options.tool_delegate,
                persistence: options.persistence,
                model_overrides: Mutex::new(HashMap::new()),
                draining: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn manifests(&self) -> &ManifestRegistry {
        &self.inner.manifests
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn lanes(&self) -> &CommandQueue {
        &self.inner.lanes
    }

    pub fn subagents(&self) -> &SubagentRegistry {
        &self.inner.subagents
    }

    pub fn spec_mode(&self) -> &SpecModeStore {
        &self.inner.spec_mode
    }

    /// Every event of every conversation, tagged with its origin.
    pub fn subscribe(&self) -> EventReceiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    pub fn observe(&self, observer: SharedEventObserver<ConversationEvent>) {
        self.inner.events.observe(observer);
    }

    /// Engine the conversation is bound to, falling back to the default.
    pub fn active_engine(&self, conversation_id: &str) -> String {
        self.inner
            .sessions
            .active_cli(conversation_id)
            .unwrap_or_else(|| self.inner.config.default_engine.clone())
    }

    pub fn set_model_override(&self, conversation_id: &str, model: Option<String>) {
        let mut overrides = self.lock_models();
        match model {
            Some(model) => overrides.insert(conversation_id.to_string(), model),
            None => overrides.remove(conversation_id),
        };
    }

    pub async fn submit(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<SubmitOutcome, BridgeError> {
        self.submit_message(conversation_id, QueuedMessage::new(text))
            .await
    }

    /// Runs the message now when the conversation is idle, otherwise queues it
    /// behind the in-flight turn. Queued messages drain in arrival order.
    pub async fn submit_message(
        &self,
        conversation_id: &str,
        message: QueuedMessage,
    ) -> Result<SubmitOutcome, BridgeError> {
        let sessions = &self.inner.sessions;
        if sessions.is_busy(conversation_id) || sessions.queue_length(conversation_id) > 0 {
            let position = sessions.enqueue(conversation_id, message);
            debug!(conversation_id, position, "conversation busy, message queued");
            return Ok(SubmitOutcome::Queued { position });
        }

        let outcome = match self.prepare_turn(conversation_id, message)? {
            Prepared::SpecCancelled => Ok(SubmitOutcome::SpecCancelled),
            Prepared::Turn(turn) => self.execute_turn(turn).await.map(SubmitOutcome::Turn),
        };
        self.schedule_drain(conversation_id);
        outcome
    }

    /// Terminates the conversation's foreground session, if any.
    pub fn interrupt(&self, conversation_id: &str) -> bool {
        match self.inner.sessions.get(conversation_id) {
            Some(session) if !session.is_subagent() => {
                session.terminate();
                true
            }
            _ => false,
        }
    }

    pub fn switch_engine(&self, conversation_id: &str, engine: &str) -> Result<(), BridgeError> {
        if !self.inner.manifests.contains(engine) {
            return Err(BridgeError::UnknownEngine(engine.to_string()));
        }
        self.inner.sessions.set_active_cli(conversation_id, engine);
        info!(conversation_id, engine, "switched engine");
        Ok(())
    }

    /// Starts plan-first mode: the task runs as a planning turn and the
    /// resulting plan waits for an approve, cancel or refine reply.
    pub async fn enter_spec_mode(
        &self,
        conversation_id: &str,
        task: &str,
    ) -> Result<SubmitOutcome, BridgeError> {
        let engine = self.active_engine(conversation_id);
        if !self.inner.manifests.contains(&engine) {
            return Err(BridgeError::UnknownEngine(engine));
        }
        self.inner
            .spec_mode
            .set_spec_mode(conversation_id, SpecModeState::new(task, engine));
        self.submit(conversation_id, task).await
    }

    pub fn exit_spec_mode(&self, conversation_id: &str) -> bool {
        self.inner.spec_mode.clear_spec_mode(conversation_id).is_some()
    }

    /// Schedules a background run on the subagent lane. The run never makes
    /// the conversation busy.
    pub fn spawn_subagent(
        &self,
        conversation_id: &str,
        request: SpawnRequest,
    ) -> Result<SubagentTicket, BridgeError> {
        let foreground_engine = self.active_engine(conversation_id);
        let engine = request.engine.unwrap_or_else(|| foreground_engine.clone());
        let manifest = self
            .inner
            .manifests
            .get(&engine)
            .ok_or_else(|| BridgeError::UnknownEngine(engine.clone()))?;
        if !self.inner.subagents.can_spawn(conversation_id) {
            return Err(BridgeError::SubagentLimit {
                conversation_id: conversation_id.to_string(),
                limit: self.inner.subagents.max_concurrent(),
            });
        }

        let parent_session_id = request
            .parent_session_id
            .unwrap_or_else(|| self.parent_key(conversation_id, &foreground_engine));
        let record = self.inner.subagents.spawn(
            conversation_id,
            &request.task,
            &engine,
            request.label,
            Some(parent_session_id),
        );
        let run_id = record.run_id.clone();
        let session = AgentSession::new(
            conversation_id,
            manifest,
            SessionKind::Subagent {
                run_id: run_id.clone(),
            },
            self.session_settings(),
        );
        session.observe(self.forwarder(&session));
        self.inner.sessions.set_subagent(&run_id, session.clone());

        let bridge = self.clone();
        let options = RunOptions {
            model: self.model_override(conversation_id),
            plan_mode: false,
        };
        let task = request.task;
        let lane_run_id = run_id.clone();
        let completion = self.inner.lanes.enqueue(LANE_SUBAGENT, async move {
            bridge.run_subagent(&lane_run_id, session, &task, options).await;
        });
        info!(conversation_id, run_id = %run_id, engine = %engine, "subagent scheduled");
        Ok(SubagentTicket { run_id, completion })
    }

    /// Blocks until the run finishes or `timeout` elapses (`None` waits for the
    /// configured reply timeout). Returns `Ok(None)` on timeout.
    pub async fn wait_for_subagent(
        &self,
        ticket: SubagentTicket,
        timeout: Option<Duration>,
    ) -> Result<Option<SubagentRunRecord>, BridgeError> {
        let timeout = timeout
            .unwrap_or_else(|| Duration::from_millis(self.inner.config.subagents.reply_timeout_ms));
        match tokio::time::timeout(timeout, ticket.completion).await {
            Ok(outcome) => {
                outcome?;
                Ok(self.inner.subagents.get(&ticket.run_id))
            }
            Err(_) => {
                debug!(run_id = %ticket.run_id, "timed out waiting for subagent");
                Ok(None)
            }
        }
    }

    pub fn stop_subagent(&self, run_id: &str) -> Result<bool, BridgeError> {
        if self.inner.subagents.get(run_id).is_none() {
            return Err(BridgeError::UnknownRun(run_id.to_string()));
        }
        let stopped = self.inner.subagents.stop(run_id);
        if let Some(session) = self.inner.sessions.get_subagent(run_id) {
            session.terminate();
        }
        Ok(stopped)
    }

    pub fn stop_all_subagents(&self, conversation_id: &str) -> usize {
        let stopped = self.inner.subagents.stop_all(conversation_id);
        for session in self.inner.sessions.subagent_sessions(conversation_id) {
            session.terminate();
        }
        if stopped > 0 {
            info!(conversation_id, stopped, "stopped subagents");
        }
        stopped
    }

    /// Returns `false` when no persistence backend is configured.
    pub async fn save_subagents(&self) -> Result<bool, BridgeError> {
        let Some(persistence) = self.inner.persistence.as_ref() else {
            return Ok(false);
        };
        let snapshot = self.inner.subagents.to_json()?;
        persistence.save(&snapshot).await?;
        Ok(true)
    }

    /// Replaces the registry with the saved snapshot. Runs that were still
    /// queued or running when it was taken are marked as errors.
    pub async fn restore_subagents(&self) -> Result<usize, BridgeError> {
        let Some(persistence) = self.inner.persistence.as_ref() else {
            return Ok(0);
        };
        let Some(raw) = persistence.load().await? else {
            return Ok(0);
        };
        let restored = self.inner.subagents.from_json(&raw)?;
        let orphaned: Vec<_> = self
            .inner
            .subagents
            .all()
            .into_iter()
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.run_id)
            .collect();
        for run_id in &orphaned {
            self.inner.subagents.mark_error(run_id, RESTART_INTERRUPTED);
        }
        info!(restored, orphaned = orphaned.len(), "subagent registry restored");
        Ok(restored)
    }

    fn prepare_turn(
        &self,
        conversation_id: &str,
        message: QueuedMessage,
    ) -> Result<Prepared, BridgeError> {
        let text = with_attachments(&message);
        let (engine, prompt, plan_mode) = match self.inner.spec_mode.get_spec_mode(conversation_id) {
            Some(state) if state.active => match state.pending_plan {
                None if message.text != state.task => match detect_intent(&message.text) {
                    SpecIntent::Cancel => {
                        self.inner.spec_mode.clear_spec_mode(conversation_id);
                        info!(conversation_id, "spec mode cancelled");
                        return Ok(Prepared::SpecCancelled);
                    }
                    SpecIntent::Approve | SpecIntent::Refine => {
                        (state.engine, planning_prompt(&state.task, &text), true)
                    }
                },
                None => (state.engine, text, true),
                Some(plan) => match detect_intent(&message.text) {
                    SpecIntent::Approve => {
                        self.inner.spec_mode.clear_spec_mode(conversation_id);
                        info!(conversation_id, "plan approved");
                        (state.engine, execution_prompt(&state.task, &plan), false)
                    }
                    SpecIntent::Cancel => {
                        self.inner.spec_mode.clear_spec_mode(conversation_id);
                        info!(conversation_id, "spec mode cancelled");
                        return Ok(Prepared::SpecCancelled);
                    }
                    SpecIntent::Refine => {
                        (state.engine, refinement_prompt(&state.task, &plan, &text), true)
                    }
                },
            },
            _ => (self.active_engine(conversation_id), text, false),
        };

        let manifest = self
            .inner
            .manifests
            .get(&engine)
            .ok_or_else(|| BridgeError::UnknownEngine(engine.clone()))?;
        let session = AgentSession::new(
            conversation_id,
            manifest,
            SessionKind::Foreground,
            self.session_settings(),
        );
        session.observe(self.forwarder(&session));
        self.inner.sessions.set(conversation_id, session.clone());

        Ok(Prepared::Turn(PreparedTurn {
            conversation_id: conversation_id.to_string(),
            engine,
            prompt,
            options: RunOptions {
                model: self.model_override(conversation_id),
                plan_mode,
            },
            session,
            plans_for_spec: plan_mode,
        }))
    }

    async fn execute_turn(&self, turn: PreparedTurn) -> Result<TurnSummary, BridgeError> {
        let PreparedTurn {
            conversation_id,
            engine,
            prompt,
            options,
            session,
            plans_for_spec,
        } = turn;

        let resume = self.inner.sessions.resume_token(&conversation_id, &engine);
        let pending = self.pending_results(&conversation_id, &engine, resume.as_ref());
        let mut injected_runs: Vec<String> = pending.iter().map(|run| run.run_id.clone()).collect();
        let prompt = if pending.is_empty() {
            prompt
        } else {
            debug!(conversation_id = %conversation_id, count = pending.len(), "injecting subagent results");
            inject_results(&pending, &prompt)
        };

        let lane_session = session.clone();
        let inner = Arc::clone(&self.inner);
        let lane_injected = injected_runs.clone();
        let ticket = self.inner.lanes.enqueue(LANE_MAIN, async move {
            let mut events = lane_session.subscribe();
            let spawned = lane_session.run(&prompt, resume.as_ref(), options).await;
            // Results stay pending until an agent process has taken the prompt.
            if spawned && !lane_injected.is_empty() {
                inner.subagents.mark_results_injected(&lane_injected);
            }
            lane_session.wait_for_exit().await;
            let mut collected = Vec::new();
            while let Ok(event) = events.try_recv() {
                collected.push(event);
            }
            (spawned, collected)
        });
        let outcome = ticket.await;
        self.inner
            .sessions
            .delete_if_same(&conversation_id, &session);
        let (spawned, events) = outcome?;
        if !spawned {
            injected_runs.clear();
        }

        let mut summary = summarize(&conversation_id, &engine, &session, &events);
        summary.injected_runs = injected_runs;
        if plans_for_spec {
            let plan = summary.plan.clone().or_else(|| {
                (!summary.is_error && !summary.answer.trim().is_empty())
                    .then(|| summary.answer.clone())
            });
            if let Some(plan) = plan {
                if self.inner.spec_mode.set_pending_plan(&conversation_id, plan) {
                    debug!(conversation_id = %conversation_id, "plan awaiting approval");
                }
            }
        }
        Ok(summary)
    }

    async fn run_subagent(
        &self,
        run_id: &str,
        session: AgentSession,
        task: &str,
        options: RunOptions,
    ) {
        let subagents = &self.inner.subagents;
        if !subagents.mark_running(run_id, None) {
            debug!(run_id, "subagent no longer queued, skipping");
            self.inner.sessions.delete_subagent(run_id);
            return;
        }

        let mut events = session.subscribe();
        session.run(task, None, options).await;
        // A stop that landed while the process was spawning found nothing to terminate.
        if subagents
            .get(run_id)
            .is_some_and(|run| run.status == SubagentStatus::Stopped)
        {
            session.terminate();
        }
        session.wait_for_exit().await;
        let mut collected = Vec::new();
        while let Ok(event) = events.try_recv() {
            collected.push(event);
        }
        self.inner.sessions.delete_subagent(run_id);

        let summary = summarize(session.conversation_id(), session.engine(), &session, &collected);
        let finished = if summary.interrupted {
            false
        } else if summary.is_error {
            let message = if summary.answer.is_empty() {
                summary
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent reported an error".to_string())
            } else {
                summary.answer.clone()
            };
            subagents.mark_error(run_id, message)
        } else {
            subagents.mark_completed(run_id, summary.answer.clone())
        };
        let status = subagents.get(run_id).map(|run| run.status);
        info!(run_id, status = ?status, recorded = finished, "subagent finished");

        if let Err(error) = self.save_subagents().await {
            warn!(%error, "failed to persist subagent registry");
        }
    }

    fn schedule_drain(&self, conversation_id: &str) {
        if self.inner.sessions.queue_length(conversation_id) == 0 {
            return;
        }
        if !self.lock_draining().insert(conversation_id.to_string()) {
            return;
        }
        let bridge = self.clone();
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move { bridge.drain_queue(conversation_id).await });
    }

    async fn drain_queue(self, conversation_id: String) {
        loop {
            let message = {
                let mut draining = self.lock_draining();
                let next = if self.inner.sessions.is_busy(&conversation_id) {
                    None
                } else {
                    self.inner.sessions.dequeue(&conversation_id)
                };
                match next {
                    Some(message) => message,
                    None => {
                        draining.remove(&conversation_id);
                        return;
                    }
                }
            };
            debug!(conversation_id = %conversation_id, "running queued message");
            let result = match self.prepare_turn(&conversation_id, message) {
                Ok(Prepared::Turn(turn)) => self.execute_turn(turn).await.map(|_| ()),
                Ok(Prepared::SpecCancelled) => Ok(()),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(conversation_id = %conversation_id, %error, "queued turn failed");
                self.inner.events.emit(ConversationEvent {
                    conversation_id: conversation_id.clone(),
                    engine: self.active_engine(&conversation_id),
                    subagent_run_id: None,
                    event: BridgeEvent::error(error.to_string()),
                });
            }
        }
    }

    fn pending_results(
        &self,
        conversation_id: &str,
        engine: &str,
        resume: Option<&ResumeToken>,
    ) -> Vec<SubagentRunRecord> {
        let mut keys = vec![conversation_id.to_string()];
        if let Some(token) = resume.filter(|token| token.engine == engine) {
            keys.insert(0, token.session_id.clone());
        }
        let mut pending = Vec::new();
        for key in keys {
            for run in self.inner.subagents.get_pending_results(conversation_id, &key) {
                if !pending.iter().any(|seen: &SubagentRunRecord| seen.run_id == run.run_id) {
                    pending.push(run);
                }
            }
        }
        pending
    }

    /// The id subagent results are addressed to: the foreground engine
    /// session when one exists, otherwise the conversation itself.
    fn parent_key(&self, conversation_id: &str, engine: &str) -> String {
        self.inner
            .sessions
            .resume_token(conversation_id, engine)
            .map(|token| token.session_id)
            .unwrap_or_else(|| conversation_id.to_string())
    }

    fn session_settings(&self) -> SessionSettings {
        let config = &self.inner.config;
        let mut settings = SessionSettings::new(config.working_dir.clone())
            .with_termination_grace(config.termination_grace());
        settings.preview_chars = config.tool_preview_chars;
        if let Some(delegate) = self.inner.tool_delegate.as_ref() {
            settings = settings.with_tool_delegate(Arc::clone(delegate));
        }
        settings
    }

    /// Republishes a session's events on the bridge hub and keeps the stored
    /// resume token current for foreground sessions.
    fn forwarder(&self, session: &AgentSession) -> SharedEventObserver<BridgeEvent> {
        let inner: Weak<BridgeInner> = Arc::downgrade(&self.inner);
        let conversation_id = session.conversation_id().to_string();
        let engine = session.engine().to_string();
        let run_id = match session.kind() {
            SessionKind::Subagent { run_id } => Some(run_id.clone()),
            SessionKind::Foreground => None,
        };
        Arc::new(move |event: &BridgeEvent| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match (event, run_id.as_deref()) {
                (BridgeEvent::Started { session_id, .. }, None) => {
                    inner.sessions.set_resume_token(
                        &conversation_id,
                        ResumeToken::new(engine.clone(), session_id.clone()),
                    );
                }
                (
                    BridgeEvent::Completed {
                        resume_token: Some(token),
                        ..
                    },
                    None,
                ) => inner.sessions.set_resume_token(&conversation_id, token.clone()),
                (BridgeEvent::Started { session_id, .. }, Some(run_id)) => {
                    inner.subagents.attach_child_session(run_id, session_id);
                }
                _ => {}
            }
            inner.events.emit(ConversationEvent {
                conversation_id: conversation_id.clone(),
                engine: engine.clone(),
                subagent_run_id: run_id.clone(),
                event: event.clone(),
            });
        })
    }

    fn model_override(&self, conversation_id: &str) -> Option<String> {
        self.lock_models().get(conversation_id).cloned()
    }

    fn lock_models(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .model_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_draining(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner
            .draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn summarize(
    conversation_id: &str,
    engine: &str,
    session: &AgentSession,
    events: &[BridgeEvent],
) -> TurnSummary {
    let mut summary = TurnSummary {
        conversation_id: conversation_id.to_string(),
        engine: engine.to_string(),
        session_id: None,
        answer: String::new(),
        is_error: false,
        cost_usd: None,
        plan: None,
        error: None,
        interrupted: false,
        injected_runs: Vec::new(),
    };
    let mut completed = false;
    for event in events {
        match event {
            BridgeEvent::Started { session_id, .. } => {
                summary.session_id = Some(session_id.clone());
            }
            BridgeEvent::Completed {
                session_id,
                answer,
                is_error,
                cost_usd,
                ..
            } => {
                completed = true;
                if session_id.is_some() {
                    summary.session_id = session_id.clone();
                }
                summary.answer = answer.clone();
                summary.is_error = *is_error;
                summary.cost_usd = *cost_usd;
            }
            BridgeEvent::PlanProposed { plan, .. } => summary.plan = Some(plan.clone()),
            BridgeEvent::Error { message } => summary.error = Some(message.clone()),
            _ => {}
        }
    }
    if !completed {
        summary.answer = session.last_text();
        if summary.error.is_some() {
            summary.is_error = true;
        } else if session.state() == SessionState::Suspended {
            summary.interrupted = true;
        } else {
            summary.is_error = true;
            summary.error = Some(format!("agent '{engine}' produced no result"));
        }
    }
    summary
}

fn with_attachments(message: &QueuedMessage) -> String {
    if message.attachments.is_empty() {
        return message.text.clone();
    }
    let mut text = message.text.clone();
    text.push_str("\n\nAttachments:");
    for attachment in &message.attachments {
        text.push_str("\n- ");
        text.push_str(attachment);
    }
    text
}

fn inject_results(runs: &[SubagentRunRecord], prompt: &str) -> String {
    let mut text = String::from("Background task results:\n");
    for run in runs {
        let body = match run.status {
            SubagentStatus::Error => run.error.as_deref().unwrap_or("failed without output"),
            _ => run.result.as_deref().unwrap_or(""),
        };
        text.push_str(&format!(
            "\n### {} [{}]\nTask: {}\n{}\n",
            run.display_name(),
            run.status,
            run.task,
            truncate_chars(body, INJECTED_RESULT_MAX_CHARS, TruncationMode::HeadTail)
        ));
    }
    text.push_str("\n---\n\n");
    text.push_str(prompt);
    text
}

fn execution_prompt(task: &str, plan: &str) -> String {
    format!("Implement the approved plan.\n\nTask:\n{task}\n\nPlan:\n{plan}")
}

fn planning_prompt(task: &str, message: &str) -> String {
    format!("Plan the task before making changes.\n\nTask:\n{task}\n\nFollow-up:\n{message}")
}

fn refinement_prompt(task: &str, plan: &str, feedback: &str) -> String {
    format!(
        "Revise the plan based on the feedback.\n\nTask:\n{task}\n\nCurrent plan:\n{plan}\n\nFeedback:\n{feedback}"
    )
}
