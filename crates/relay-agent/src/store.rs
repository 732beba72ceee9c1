use crate::{AgentSession, ResumeToken};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A message that arrived while its conversation's foreground session was busy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub received_at_ms: u64,
}

impl QueuedMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            received_at_ms: crate::session::current_unix_ms(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    sessions: HashMap<String, AgentSession>,
    subagent_sessions: HashMap<String, AgentSession>,
    resume_tokens: HashMap<(String, String), ResumeToken>,
    active_cli: HashMap<String, String>,
    queues: HashMap<String, VecDeque<QueuedMessage>>,
}

/// Bookkeeping for live sessions, resume tokens and per-conversation inbound
/// queues. It never touches processes.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<StoreState>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str) -> Option<AgentSession> {
        self.lock().sessions.get(conversation_id).cloned()
    }

    pub fn set(&self, conversation_id: &str, session: AgentSession) {
        self.lock()
            .sessions
            .insert(conversation_id.to_string(), session);
    }

    pub fn delete(&self, conversation_id: &str) -> Option<AgentSession> {
        self.lock().sessions.remove(conversation_id)
    }

    /// Removes the entry only when it still refers to `session`, so a late
    /// cleanup never evicts a newer session for the same conversation.
    pub fn delete_if_same(&self, conversation_id: &str, session: &AgentSession) -> bool {
        let mut state = self.lock();
        let matches = state
            .sessions
            .get(conversation_id)
            .is_some_and(|current| current.same_session(session));
        if matches {
            state.sessions.remove(conversation_id);
        }
        matches
    }

    pub fn set_subagent(&self, run_id: &str, session: AgentSession) {
        self.lock()
            .subagent_sessions
            .insert(run_id.to_string(), session);
    }

    pub fn get_subagent(&self, run_id: &str) -> Option<AgentSession> {
        self.lock().subagent_sessions.get(run_id).cloned()
    }

    pub fn delete_subagent(&self, run_id: &str) -> Option<AgentSession> {
        self.lock().subagent_sessions.remove(run_id)
    }

    pub fn subagent_sessions(&self, conversation_id: &str) -> Vec<AgentSession> {
        self.lock()
            .subagent_sessions
            .values()
            .filter(|session| session.conversation_id() == conversation_id)
            .cloned()
            .collect()
    }

    pub fn resume_token(&self, conversation_id: &str, engine: &str) -> Option<ResumeToken> {
        self.lock()
            .resume_tokens
            .get(&(conversation_id.to_string(), engine.to_string()))
            .cloned()
    }

    pub fn set_resume_token(&self, conversation_id: &str, token: ResumeToken) {
        self.lock()
            .resume_tokens
            .insert((conversation_id.to_string(), token.engine.clone()), token);
    }

    pub fn clear_resume_token(&self, conversation_id: &str, engine: &str) -> Option<ResumeToken> {
        self.lock()
            .resume_tokens
            .remove(&(conversation_id.to_string(), engine.to_string()))
    }

    pub fn active_cli(&self, conversation_id: &str) -> Option<String> {
        self.lock().active_cli.get(conversation_id).cloned()
    }

    pub fn set_active_cli(&self, conversation_id: &str, engine: &str) {
        self.lock()
            .active_cli
            .insert(conversation_id.to_string(), engine.to_string());
    }

    /// True iff a non-subagent session is registered for the conversation.
    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.lock()
            .sessions
            .get(conversation_id)
            .is_some_and(|session| !session.is_subagent())
    }

    /// Appends to the conversation's FIFO and returns the new queue length.
    pub fn enqueue(&self, conversation_id: &str, message: QueuedMessage) -> usize {
        let mut state = self.lock();
        let queue = state.queues.entry(conversation_id.to_string()).or_default();
        queue.push_back(message);
        queue.len()
    }

    pub fn dequeue(&self, conversation_id: &str) -> Option<QueuedMessage> {
        let mut state = self.lock();
        let queue = state.queues.get_mut(conversation_id)?;
        let message = queue.pop_front();
        if queue.is_empty() {
            state.queues.remove(conversation_id);
        }
        message
    }

    pub fn queue_length(&self, conversation_id: &str) -> usize {
        self.lock()
            .queues
            .get(conversation_id)
            .map_or(0, VecDeque::len)
    }

    pub fn clear_queue(&self, conversation_id: &str) -> usize {
        self.lock()
            .queues
            .remove(conversation_id)
            .map_or(0, |queue| queue.len())
    }

    pub fn queued_conversations(&self) -> usize {
        self.lock().queues.len()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
