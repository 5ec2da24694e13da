//! Wire protocol between the server and a remote renderer.
//!
//! Every outbound [`ProtocolMessage`] is one JSON object in one text frame.
//! Clients apply messages strictly in arrival order.

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Result of a tool invocation as shown to the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    #[default]
    Ok,
    Error,
}

impl ToolOutcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Ok
        } else {
            Self::Error
        }
    }

    pub fn is_error(self) -> bool {
        self == Self::Error
    }
}

/// Aggregate figures for one finished turn. Passed through from the producer untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStats {
    pub duration_ms: u64,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Machine-readable reason carried by an `error` message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Outbound queue stayed full; the turn was aborted.
    Overloaded,
    /// The event source failed mid-turn.
    ProducerError,
    /// A turn is already running on this connection.
    Busy,
    /// An inbound frame could not be understood.
    BadRequest,
}

impl ErrorCode {
    /// `busy` and `bad_request` answer a client frame; they leave any running turn alone.
    pub fn ends_turn(self) -> bool {
        matches!(self, Self::Overloaded | Self::ProducerError)
    }
}

/// Server → client message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    Append {
        id: NodeId,
        text: String,
        /// Set on the first append of a text block so the client allocates a node.
        #[serde(default, skip_serializing_if = "is_false")]
        create: bool,
    },
    ToolOpen {
        id: NodeId,
        tool: String,
        input: serde_json::Value,
    },
    ToolClose {
        id: NodeId,
        output: String,
        outcome: ToolOutcome,
    },
    Complete {
        stats: TurnStats,
    },
    Interrupted,
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ProtocolMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Node addressed by this message, if any.
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Append { id, .. } | Self::ToolOpen { id, .. } | Self::ToolClose { id, .. } => {
                Some(id)
            }
            Self::Complete { .. } | Self::Interrupted | Self::Error { .. } => None,
        }
    }

    /// Whether this message ends the current turn.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Complete { .. } | Self::Interrupted => true,
            Self::Error { code, .. } => code.ends_turn(),
            Self::Append { .. } | Self::ToolOpen { .. } | Self::ToolClose { .. } => false,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::ToolOpen { .. } => "tool_open",
            Self::ToolClose { .. } => "tool_close",
            Self::Complete { .. } => "complete",
            Self::Interrupted => "interrupted",
            Self::Error { .. } => "error",
        }
    }
}

/// Client → server message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    UserMessage { content: String },
    Interrupt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::NodeKind;
    use serde_json::json;

    #[test]
    fn append_with_create_serializes_flag() {
        let msg = ProtocolMessage::Append {
            id: NodeId::new(1, NodeKind::Text, 1),
            text: "Hi ".into(),
            create: true,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"type": "append", "id": "1-text-1", "text": "Hi ", "create": true})
        );
    }

    #[test]
    fn append_without_create_omits_flag() {
        let msg = ProtocolMessage::Append {
            id: NodeId::new(1, NodeKind::Text, 1),
            text: "there".into(),
            create: false,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("create").is_none());
    }

    #[test]
    fn append_without_create_parses_as_false() {
        let msg: ProtocolMessage =
            serde_json::from_str(r#"{"type":"append","id":"1-text-1","text":"x"}"#).unwrap();
        assert!(matches!(msg, ProtocolMessage::Append { create: false, .. }));
    }

    #[test]
    fn tool_close_shape() {
        let msg = ProtocolMessage::ToolClose {
            id: NodeId::new(2, NodeKind::Tool, 1),
            output: "done".into(),
            outcome: ToolOutcome::Error,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "tool_close");
        assert_eq!(v["outcome"], "error");
        assert_eq!(v["id"], "2-tool-1");
    }

    #[test]
    fn complete_shape() {
        let msg = ProtocolMessage::Complete {
            stats: TurnStats {
                duration_ms: 1200,
                cost: 0.01,
                input_tokens: 10,
                output_tokens: 20,
            },
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "complete");
        assert_eq!(v["stats"]["duration_ms"], 1200);
        assert_eq!(v["stats"]["input_tokens"], 10);
        assert_eq!(v["stats"]["output_tokens"], 20);
    }

    #[test]
    fn interrupted_is_bare() {
        let json = serde_json::to_string(&ProtocolMessage::Interrupted).unwrap();
        assert_eq!(json, r#"{"type":"interrupted"}"#);
    }

    #[test]
    fn error_shape() {
        let v = serde_json::to_value(ProtocolMessage::error(ErrorCode::Overloaded, "slow")).unwrap();
        assert_eq!(v, json!({"type": "error", "code": "overloaded", "message": "slow"}));
    }

    #[test]
    fn terminal_classification() {
        assert!(ProtocolMessage::Interrupted.is_terminal());
        assert!(ProtocolMessage::Complete { stats: TurnStats::default() }.is_terminal());
        assert!(ProtocolMessage::error(ErrorCode::ProducerError, "x").is_terminal());
        assert!(ProtocolMessage::error(ErrorCode::Overloaded, "x").is_terminal());
        assert!(!ProtocolMessage::error(ErrorCode::Busy, "x").is_terminal());
        assert!(!ProtocolMessage::error(ErrorCode::BadRequest, "x").is_terminal());
        let append = ProtocolMessage::Append {
            id: NodeId::from_raw("1-text-1"),
            text: String::new(),
            create: false,
        };
        assert!(!append.is_terminal());
        assert_eq!(append.node_id().map(NodeId::as_str), Some("1-text-1"));
    }

    #[test]
    fn parse_client_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"user_message","content":"hello"}"#).unwrap();
        assert_eq!(msg, ClientMessage::UserMessage { content: "hello".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"interrupt"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Interrupt);
    }

    #[test]
    fn unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"resume"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"user_message"}"#).is_err());
    }

    #[test]
    fn outcome_from_success() {
        assert_eq!(ToolOutcome::from_success(true), ToolOutcome::Ok);
        assert!(ToolOutcome::from_success(false).is_error());
    }
}
