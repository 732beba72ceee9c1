use crate::session::current_unix_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

const APPROVE_PHRASES: &[&str] = &[
    "yes",
    "y",
    "ok",
    "okay",
    "approve",
    "approved",
    "lgtm",
    "go",
    "go ahead",
    "proceed",
    "ship it",
    "looks good",
    "do it",
];

const CANCEL_PHRASES: &[&str] = &[
    "no",
    "n",
    "cancel",
    "stop",
    "abort",
    "nevermind",
    "never mind",
    "exit",
    "quit",
];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecModeState {
    pub active: bool,
    pub task: String,
    pub engine: String,
    #[serde(default)]
    pub pending_plan: Option<String>,
    pub created_at_ms: u64,
}

impl SpecModeState {
    pub fn new(task: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            active: true,
            task: task.into(),
            engine: engine.into(),
            pending_plan: None,
            created_at_ms: current_unix_ms(),
        }
    }

    pub fn awaiting_approval(&self) -> bool {
        self.active && self.pending_plan.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecIntent {
    Approve,
    Cancel,
    Refine,
}

/// Classifies a reply to a proposed plan. Only whole-string matches approve
/// or cancel; everything else, including "yes please", is feedback.
pub fn detect_intent(text: &str) -> SpecIntent {
    let normalized = text.trim().to_lowercase();
    if APPROVE_PHRASES.contains(&normalized.as_str()) {
        SpecIntent::Approve
    } else if CANCEL_PHRASES.contains(&normalized.as_str()) {
        SpecIntent::Cancel
    } else {
        SpecIntent::Refine
    }
}

#[derive(Default)]
pub struct SpecModeStore {
    states: Mutex<HashMap<String, SpecModeState>>,
}

impl SpecModeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_spec_mode(&self, conversation_id: &str, state: SpecModeState) {
        self.lock().insert(conversation_id.to_string(), state);
    }

    pub fn get_spec_mode(&self, conversation_id: &str) -> Option<SpecModeState> {
        self.lock().get(conversation_id).cloned()
    }

    pub fn clear_spec_mode(&self, conversation_id: &str) -> Option<SpecModeState> {
        self.lock().remove(conversation_id)
    }

    pub fn is_in_spec_mode(&self, conversation_id: &str) -> bool {
        self.lock()
            .get(conversation_id)
            .is_some_and(|state| state.active)
    }

    /// Silently ignored when the conversation is not in spec mode.
    pub fn set_pending_plan(&self, conversation_id: &str, plan: impl Into<String>) -> bool {
        match self.lock().get_mut(conversation_id) {
            Some(state) => {
                state.pending_plan = Some(plan.into());
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SpecModeState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
