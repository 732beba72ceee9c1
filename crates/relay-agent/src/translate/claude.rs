use super::EventTranslator;
use crate::BridgeEvent;
use serde::Deserialize;
use serde_json::Value;

/// Raw `stream-json` vocabulary of Claude-style agents.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeRawEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        message: ClaudeMessage,
    },
    User {
        message: ClaudeMessage,
    },
    Result {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClaudeMessage {
    #[serde(default)]
    pub content: ClaudeContent,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeBlock>),
}

impl Default for ClaudeContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

pub(super) fn lower(
    translator: &mut EventTranslator,
    raw: ClaudeRawEvent,
    events: &mut Vec<BridgeEvent>,
) {
    match raw {
        ClaudeRawEvent::System {
            subtype,
            session_id,
            model,
        } => {
            if let (Some("init"), Some(session_id)) = (subtype.as_deref(), session_id) {
                translator.on_init(session_id, model, events);
            }
        }
        ClaudeRawEvent::Assistant { message } => match message.content {
            ClaudeContent::Text(text) => translator.on_text(text, events),
            ClaudeContent::Blocks(blocks) => {
                for block in blocks {
                    match block {
                        ClaudeBlock::Text { text } => translator.on_text(text, events),
                        ClaudeBlock::Thinking { thinking } => {
                            translator.on_thinking(thinking, events)
                        }
                        ClaudeBlock::ToolUse { id, name, input } => {
                            translator.on_tool_call(id, name, input, events)
                        }
                        ClaudeBlock::ToolResult { .. } | ClaudeBlock::Other => {}
                    }
                }
            }
        },
        ClaudeRawEvent::User { message } => {
            if let ClaudeContent::Blocks(blocks) = message.content {
                for block in blocks {
                    if let ClaudeBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        translator.on_tool_result(&tool_use_id, &content, is_error, events);
                    }
                }
            }
        }
        ClaudeRawEvent::Result {
            session_id,
            result,
            is_error,
            total_cost_usd,
        } => translator.on_completion(result, session_id, is_error, total_cost_usd, events),
        ClaudeRawEvent::Unknown => {}
    }
}
