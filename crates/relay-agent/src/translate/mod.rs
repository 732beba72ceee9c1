//! Translation of engine-specific stdout vocabularies into [`BridgeEvent`]s.
//!
//! Each dialect deserializes a line into its own raw sum type and lowers it
//! onto the small set of [`EventTranslator`] callbacks below. Supporting a new
//! engine means adding a raw module and a match arm in
//! [`EventTranslator::translate_value`]; the unified event type never changes.

mod claude;
mod droid;

pub use claude::ClaudeRawEvent;
pub use droid::DroidRawEvent;

use crate::{BridgeEvent, EventDialect, ResumeToken, tool_output_preview};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Tool names that end a planning phase and carry the proposed plan.
pub const PLAN_EXIT_TOOLS: &[&str] = &["ExitPlanMode", "ExitSpecMode"];

#[derive(Clone, Debug, PartialEq)]
pub struct PendingTool {
    pub name: String,
    pub input: Value,
}

/// Stateful per-session translator.
#[derive(Debug)]
pub struct EventTranslator {
    engine: String,
    dialect: EventDialect,
    preview_chars: usize,
    resume_token: Option<ResumeToken>,
    pending_tools: HashMap<String, PendingTool>,
    accumulated_text: String,
    completed: bool,
}

impl EventTranslator {
    pub fn new(engine: impl Into<String>, dialect: EventDialect, preview_chars: usize) -> Self {
        Self {
            engine: engine.into(),
            dialect,
            preview_chars,
            resume_token: None,
            pending_tools: HashMap::new(),
            accumulated_text: String::new(),
            completed: false,
        }
    }

    /// Seeds the token so a completion without its own session id still
    /// reports the conversation being resumed.
    pub fn with_resume_token(mut self, token: Option<ResumeToken>) -> Self {
        self.resume_token = token;
        self
    }

    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.resume_token.as_ref()
    }

    pub fn pending_tools(&self) -> &HashMap<String, PendingTool> {
        &self.pending_tools
    }

    pub fn last_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Translates one stdout line. Blank lines, non-JSON diagnostics and
    /// unrecognized shapes yield no events.
    pub fn translate_line(&mut self, line: &str) -> Vec<BridgeEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.translate_value(value),
            Err(error) => {
                debug!(engine = %self.engine, %error, line = trimmed, "ignoring non-JSON agent output");
                Vec::new()
            }
        }
    }

    pub fn translate_value(&mut self, value: Value) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        match self.dialect {
            EventDialect::Claude => match serde_json::from_value::<ClaudeRawEvent>(value) {
                Ok(raw) => claude::lower(self, raw, &mut events),
                Err(error) => debug!(engine = %self.engine, %error, "ignoring unrecognized claude event"),
            },
            EventDialect::Droid => match serde_json::from_value::<DroidRawEvent>(value) {
                Ok(raw) => droid::lower(self, raw, &mut events),
                Err(error) => debug!(engine = %self.engine, %error, "ignoring unrecognized droid event"),
            },
        }
        events
    }

    pub(crate) fn on_init(
        &mut self,
        session_id: String,
        model: Option<String>,
        events: &mut Vec<BridgeEvent>,
    ) {
        self.resume_token = Some(ResumeToken::new(self.engine.clone(), session_id.clone()));
        events.push(BridgeEvent::Started {
            engine: self.engine.clone(),
            session_id,
            model,
        });
    }

    pub(crate) fn on_text(&mut self, chunk: String, events: &mut Vec<BridgeEvent>) {
        if chunk.is_empty() {
            return;
        }
        self.accumulated_text = merge_text(&self.accumulated_text, &chunk);
        events.push(BridgeEvent::Text {
            chunk,
            text: self.accumulated_text.clone(),
        });
    }

    pub(crate) fn on_thinking(&mut self, text: String, events: &mut Vec<BridgeEvent>) {
        if !text.is_empty() {
            events.push(BridgeEvent::Thinking { text });
        }
    }

    pub(crate) fn on_tool_call(
        &mut self,
        tool_id: String,
        name: String,
        input: Value,
        events: &mut Vec<BridgeEvent>,
    ) {
        let plan = if PLAN_EXIT_TOOLS.contains(&name.as_str()) {
            input
                .get("plan")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };

        self.pending_tools.insert(
            tool_id.clone(),
            PendingTool {
                name: name.clone(),
                input: input.clone(),
            },
        );
        events.push(BridgeEvent::ToolStart {
            tool_id: tool_id.clone(),
            name,
            input,
        });
        if let Some(plan) = plan {
            events.push(BridgeEvent::PlanProposed { tool_id, plan });
        }
    }

    pub(crate) fn on_tool_result(
        &mut self,
        tool_id: &str,
        output: &Value,
        is_error: bool,
        events: &mut Vec<BridgeEvent>,
    ) {
        let Some(pending) = self.pending_tools.remove(tool_id) else {
            debug!(engine = %self.engine, tool_id, "tool result without a matching tool call");
            return;
        };
        events.push(BridgeEvent::ToolEnd {
            tool_id: tool_id.to_string(),
            name: pending.name,
            preview: tool_output_preview(output, self.preview_chars),
            is_error,
        });
    }

    pub(crate) fn on_completion(
        &mut self,
        answer: Option<String>,
        session_id: Option<String>,
        is_error: bool,
        cost_usd: Option<f64>,
        events: &mut Vec<BridgeEvent>,
    ) {
        if self.completed {
            debug!(engine = %self.engine, "ignoring duplicate completion event");
            return;
        }
        self.completed = true;

        if let Some(session_id) = session_id.as_ref() {
            let known = self
                .resume_token
                .as_ref()
                .is_some_and(|token| &token.session_id == session_id);
            if !known {
                self.resume_token = Some(ResumeToken::new(self.engine.clone(), session_id.clone()));
            }
        }

        let answer = answer
            .filter(|answer| !answer.trim().is_empty())
            .unwrap_or_else(|| self.accumulated_text.clone());
        events.push(BridgeEvent::Completed {
            session_id: self
                .resume_token
                .as_ref()
                .map(|token| token.session_id.clone()),
            resume_token: self.resume_token.clone(),
            answer,
            is_error,
            cost_usd,
        });
    }

    pub(crate) fn on_error(&mut self, message: String, events: &mut Vec<BridgeEvent>) {
        events.push(BridgeEvent::Error { message });
    }
}

/// Merges a new assistant text chunk into the accumulated text.
///
/// Cumulative re-sends replace the previous text, stale shorter re-sends keep
/// the previous text, and anything else is treated as a delta.
pub fn merge_text(previous: &str, chunk: &str) -> String {
    if chunk.starts_with(previous) {
        chunk.to_string()
    } else if previous.starts_with(chunk) {
        previous.to_string()
    } else {
        format!("{previous}{chunk}")
    }
}
