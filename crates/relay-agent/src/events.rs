use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

/// Engine-issued identifier that lets a later invocation continue the same
/// underlying agent conversation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: String,
    pub session_id: String,
}

impl ResumeToken {
    pub fn new(engine: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            session_id: session_id.into(),
        }
    }
}

/// Unified, engine-agnostic event vocabulary produced by translation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Started {
        engine: String,
        session_id: String,
        model: Option<String>,
    },
    ToolStart {
        tool_id: String,
        name: String,
        input: Value,
    },
    ToolEnd {
        tool_id: String,
        name: String,
        preview: String,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    Text {
        chunk: String,
        text: String,
    },
    Completed {
        session_id: Option<String>,
        resume_token: Option<ResumeToken>,
        answer: String,
        is_error: bool,
        cost_usd: Option<f64>,
    },
    Error {
        message: String,
    },
    PlanProposed {
        tool_id: String,
        plan: String,
    },
}

impl BridgeEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Thinking { .. } => "thinking",
            Self::Text { .. } => "text",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::PlanProposed { .. } => "plan_proposed",
        }
    }
}

/// A bridge event tagged with the conversation that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub conversation_id: String,
    pub engine: String,
    pub subagent_run_id: Option<String>,
    pub event: BridgeEvent,
}

pub trait EventObserver<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

impl<E, F> EventObserver<E> for F
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        self(event);
    }
}

pub type SharedEventObserver<E> = Arc<dyn EventObserver<E>>;
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

/// Push-based fan-out of one ordered event sequence.
///
/// Every subscriber receives every event in emission order; a closed receiver
/// is pruned on the next emit without affecting the others.
pub struct EventHub<E> {
    inner: Mutex<HubState<E>>,
}

struct HubState<E> {
    observers: Vec<SharedEventObserver<E>>,
    senders: Vec<mpsc::UnboundedSender<E>>,
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HubState {
                observers: Vec::new(),
                senders: Vec::new(),
            }),
        }
    }
}

impl<E: Clone> EventHub<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().senders.push(tx);
        rx
    }

    pub fn observe(&self, observer: SharedEventObserver<E>) {
        self.lock().observers.push(observer);
    }

    pub fn subscriber_count(&self) -> usize {
        let state = self.lock();
        state.observers.len() + state.senders.iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn emit(&self, event: E) {
        let observers = {
            let mut state = self.lock();
            state.senders.retain(|tx| tx.send(event.clone()).is_ok());
            state.observers.clone()
        };
        for observer in observers {
            observer.on_event(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
