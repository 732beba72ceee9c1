use super::EventTranslator;
use crate::BridgeEvent;
use serde::Deserialize;
use serde_json::Value;

/// Raw `stream-json` vocabulary of Droid-style agents.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DroidRawEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Message {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Reasoning {
        #[serde(default)]
        text: Option<String>,
    },
    ToolCall {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        parameters: Value,
    },
    ToolResult {
        id: String,
        #[serde(rename = "isError", default)]
        is_error: bool,
        #[serde(default)]
        value: Value,
    },
    Completion {
        #[serde(rename = "finalText", default)]
        final_text: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

pub(super) fn lower(
    translator: &mut EventTranslator,
    raw: DroidRawEvent,
    events: &mut Vec<BridgeEvent>,
) {
    match raw {
        DroidRawEvent::System {
            subtype,
            session_id,
            model,
        } => {
            if let (Some("init"), Some(session_id)) = (subtype.as_deref(), session_id) {
                translator.on_init(session_id, model, events);
            }
        }
        DroidRawEvent::Message { role, text } => {
            if role.as_deref() == Some("assistant") {
                if let Some(text) = text {
                    translator.on_text(text, events);
                }
            }
        }
        DroidRawEvent::Reasoning { text } => {
            if let Some(text) = text {
                translator.on_thinking(text, events);
            }
        }
        DroidRawEvent::ToolCall {
            id,
            tool_name,
            parameters,
        } => translator.on_tool_call(id, tool_name, parameters, events),
        DroidRawEvent::ToolResult {
            id,
            is_error,
            value,
        } => translator.on_tool_result(&id, &value, is_error, events),
        DroidRawEvent::Completion {
            final_text,
            session_id,
        } => translator.on_completion(final_text, session_id, false, None, events),
        DroidRawEvent::Error { message } => translator.on_error(
            message.unwrap_or_else(|| "agent reported an error".to_string()),
            events,
        ),
        DroidRawEvent::Unknown => {}
    }
}
