//! Production event → protocol message conversion.
//!
//! Conversion is a pure function of the event and the connection's [`SessionState`];
//! the state is touched only to mint and look up node ids. Messages come out in the
//! exact order the client must apply them, and nothing is buffered across events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::errors::StreamError;
use relay_core::events::ProductionEvent;
use relay_core::ids::{NodeId, ToolCallId};
use relay_core::protocol::{ProtocolMessage, ToolOutcome};

use crate::session_state::SessionState;

/// Name used when a tool result arrives for an invocation that never started.
const UNKNOWN_TOOL: &str = "unknown";

/// How much tool activity the client sees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    #[default]
    Full,
    /// Successful tool calls are hidden; failed ones are still shown as an open/close pair.
    /// Ids are assigned exactly as in `Full`, so text block boundaries do not change.
    Minimal,
}

impl std::str::FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "minimal" => Ok(Self::Minimal),
            other => Err(format!("unknown verbosity: {other}")),
        }
    }
}

/// Output of converting one event.
#[derive(Debug, Default)]
pub struct Conversion {
    pub messages: Vec<ProtocolMessage>,
    /// Upstream inconsistency that was repaired while converting.
    pub recovered: Option<StreamError>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EventConverter {
    verbosity: Verbosity,
}

impl EventConverter {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    pub fn convert(&self, event: ProductionEvent, state: &mut SessionState) -> Conversion {
        match event {
            ProductionEvent::TextFragment { text } => {
                let (id, create) = state.open_or_get_text_block_id();
                Conversion {
                    messages: vec![ProtocolMessage::Append { id, text, create }],
                    recovered: None,
                }
            }
            ProductionEvent::ToolInvocationStart {
                instance,
                name,
                input,
            } => {
                let id = state.assign_tool_id(&instance);
                let messages = match self.verbosity {
                    Verbosity::Full => vec![ProtocolMessage::ToolOpen {
                        id,
                        tool: name,
                        input,
                    }],
                    Verbosity::Minimal => {
                        state.hold_tool_input(&instance, input);
                        Vec::new()
                    }
                };
                Conversion {
                    messages,
                    recovered: None,
                }
            }
            ProductionEvent::ToolInvocationEnd {
                instance,
                name,
                output,
                outcome,
            } => self.convert_tool_end(state, &instance, name, output, outcome),
            ProductionEvent::TurnComplete { stats } => Conversion {
                messages: vec![ProtocolMessage::Complete { stats }],
                recovered: None,
            },
        }
    }

    fn convert_tool_end(
        &self,
        state: &mut SessionState,
        instance: &ToolCallId,
        name: String,
        output: String,
        outcome: ToolOutcome,
    ) -> Conversion {
        let tool = if name.is_empty() {
            UNKNOWN_TOOL.to_string()
        } else {
            name
        };

        match state.resolve_tool_id(instance) {
            Ok(id) => {
                let input = state.take_tool_input(instance).unwrap_or(Value::Null);
                state.release_tool_id(instance);
                let messages = match self.verbosity {
                    Verbosity::Full => vec![close(id, output, outcome)],
                    // The open was suppressed; surface failures as a complete pair.
                    Verbosity::Minimal if outcome.is_error() => {
                        vec![open(id.clone(), tool, input), close(id, output, outcome)]
                    }
                    Verbosity::Minimal => Vec::new(),
                };
                Conversion {
                    messages,
                    recovered: None,
                }
            }
            Err(err) => {
                tracing::warn!(
                    tool_call_id = %instance,
                    tool = %tool,
                    "Tool result without matching start; synthesizing open/close pair"
                );
                let id = state.assign_tool_id(instance);
                state.release_tool_id(instance);
                let messages = if self.verbosity == Verbosity::Minimal && !outcome.is_error() {
                    Vec::new()
                } else {
                    vec![open(id.clone(), tool, Value::Null), close(id, output, outcome)]
                };
                Conversion {
                    messages,
                    recovered: Some(err),
                }
            }
        }
    }
}

fn open(id: NodeId, tool: String, input: Value) -> ProtocolMessage {
    ProtocolMessage::ToolOpen { id, tool, input }
}

fn close(id: NodeId, output: String, outcome: ToolOutcome) -> ProtocolMessage {
    ProtocolMessage::ToolClose {
        id,
        output,
        outcome,
    }
}

/// Convert with full verbosity, discarding recovery details.
pub fn convert(event: ProductionEvent, state: &mut SessionState) -> Vec<ProtocolMessage> {
    EventConverter::default().convert(event, state).messages
}
