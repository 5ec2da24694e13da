//! Production events emitted by an agent runtime during a turn.
//!
//! [`ProductionEvent`] is the closed set the converter understands. Runtimes that
//! speak a looser JSON dialect go through [`UpstreamEvent`] first; nothing past
//! that boundary sees the upstream shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StreamError;
use crate::ids::ToolCallId;
use crate::protocol::{ToolOutcome, TurnStats};

/// One event from the agent runtime, in production order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductionEvent {
    TextFragment {
        text: String,
    },
    ToolInvocationStart {
        instance: ToolCallId,
        name: String,
        input: Value,
    },
    ToolInvocationEnd {
        instance: ToolCallId,
        name: String,
        output: String,
        outcome: ToolOutcome,
    },
    TurnComplete {
        stats: TurnStats,
    },
}

impl ProductionEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextFragment { text: text.into() }
    }

    pub fn tool_start(instance: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolInvocationStart {
            instance: ToolCallId::from_raw(instance),
            name: name.into(),
            input,
        }
    }

    pub fn tool_end(
        instance: impl Into<String>,
        name: impl Into<String>,
        output: impl Into<String>,
        outcome: ToolOutcome,
    ) -> Self {
        Self::ToolInvocationEnd {
            instance: ToolCallId::from_raw(instance),
            name: name.into(),
            output: output.into(),
            outcome,
        }
    }

    pub fn complete(stats: TurnStats) -> Self {
        Self::TurnComplete { stats }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextFragment { .. } => "text_fragment",
            Self::ToolInvocationStart { .. } => "tool_invocation_start",
            Self::ToolInvocationEnd { .. } => "tool_invocation_end",
            Self::TurnComplete { .. } => "turn_complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. })
    }
}

/// Loosely-typed event as emitted by external runtimes (JSONL logs, SDK callbacks).
///
/// Field names vary between runtimes, so most fields carry aliases and are optional.
/// Use `ProductionEvent::try_from` to validate.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpstreamEvent {
    #[serde(alias = "text_delta", alias = "text")]
    TextFragment {
        #[serde(alias = "delta")]
        text: Option<String>,
    },
    #[serde(alias = "tool_start", alias = "tool_use")]
    ToolInvocationStart {
        #[serde(alias = "tool_call_id", alias = "id")]
        instance: Option<String>,
        #[serde(alias = "tool_name", alias = "tool")]
        name: Option<String>,
        #[serde(default)]
        input: Value,
    },
    #[serde(alias = "tool_end", alias = "tool_result")]
    ToolInvocationEnd {
        #[serde(alias = "tool_call_id", alias = "tool_use_id", alias = "id")]
        instance: Option<String>,
        #[serde(alias = "tool_name", alias = "tool")]
        name: Option<String>,
        #[serde(default, alias = "result", alias = "content")]
        output: Value,
        #[serde(default)]
        is_error: Option<bool>,
        #[serde(default)]
        outcome: Option<ToolOutcome>,
    },
    #[serde(alias = "turn_end", alias = "done")]
    TurnComplete {
        #[serde(default)]
        duration_ms: u64,
        #[serde(default, alias = "total_cost_usd")]
        cost: f64,
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        usage: Option<UpstreamUsage>,
    },
}

/// Nested usage block some runtimes report instead of flat token counts.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl UpstreamEvent {
    /// Parse one JSON value into an upstream event.
    pub fn from_value(value: Value) -> Result<Self, StreamError> {
        serde_json::from_value(value).map_err(|e| StreamError::MalformedEvent(e.to_string()))
    }
}

impl TryFrom<UpstreamEvent> for ProductionEvent {
    type Error = StreamError;

    fn try_from(event: UpstreamEvent) -> Result<Self, Self::Error> {
        match event {
            UpstreamEvent::TextFragment { text } => {
                let text = text.ok_or_else(|| missing("text_fragment", "text"))?;
                Ok(Self::TextFragment { text })
            }
            UpstreamEvent::ToolInvocationStart {
                instance,
                name,
                input,
            } => Ok(Self::ToolInvocationStart {
                instance: ToolCallId::from_raw(
                    instance.ok_or_else(|| missing("tool_invocation_start", "instance"))?,
                ),
                name: name.ok_or_else(|| missing("tool_invocation_start", "name"))?,
                input,
            }),
            UpstreamEvent::ToolInvocationEnd {
                instance,
                name,
                output,
                is_error,
                outcome,
            } => {
                let outcome = outcome
                    .or_else(|| is_error.map(|e| ToolOutcome::from_success(!e)))
                    .unwrap_or_default();
                Ok(Self::ToolInvocationEnd {
                    instance: ToolCallId::from_raw(
                        instance.ok_or_else(|| missing("tool_invocation_end", "instance"))?,
                    ),
                    // Results often omit the name; it only matters when the start was never seen.
                    name: name.unwrap_or_default(),
                    output: output_to_string(output),
                    outcome,
                })
            }
            UpstreamEvent::TurnComplete {
                duration_ms,
                cost,
                input_tokens,
                output_tokens,
                usage,
            } => {
                let usage = usage.unwrap_or_default();
                Ok(Self::TurnComplete {
                    stats: TurnStats {
                        duration_ms,
                        cost,
                        input_tokens: input_tokens.max(usage.input_tokens),
                        output_tokens: output_tokens.max(usage.output_tokens),
                    },
                })
            }
        }
    }
}

fn missing(event: &str, field: &str) -> StreamError {
    StreamError::MalformedEvent(format!("{event} without {field}"))
}

fn output_to_string(output: Value) -> String {
    match output {
        Value::Null => String::new(),
        Value::String(s) => s,
        // Content-block arrays: join the text parts.
        Value::Array(items) if items.iter().all(|i| i.get("text").is_some()) => items
            .iter()
            .filter_map(|i| i.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
