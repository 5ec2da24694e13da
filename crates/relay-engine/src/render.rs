//! Reference implementation of the client-side node contract.
//!
//! Each node moves `absent → open → (mutated)* → finalized`. Concrete renderers
//! (terminal, browser) sit on top of [`RenderModel`] and only decide how nodes look.
//! The server uses it in tests to check that emitted streams are well formed.

use std::collections::HashMap;

use serde_json::Value;

use relay_core::ids::NodeId;
use relay_core::protocol::{ErrorCode, ProtocolMessage, ToolOutcome, TurnStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Open,
    Finalized,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeContent {
    Text {
        text: String,
    },
    Tool {
        tool: String,
        input: Value,
        output: Option<String>,
        outcome: Option<ToolOutcome>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub content: NodeContent,
    pub state: NodeState,
}

impl Node {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            NodeContent::Text { text } => Some(text),
            NodeContent::Tool { .. } => None,
        }
    }
}

/// How the last turn ended.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEnd {
    Completed(TurnStats),
    Interrupted,
    Failed { code: ErrorCode, message: String },
}

/// A message the renderer had to ignore because it broke the node contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContractViolation {
    MutatedFinalized(NodeId),
    AppendToTool(NodeId),
    CloseOnText(NodeId),
}

#[derive(Debug, Default)]
pub struct RenderModel {
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    turn_nodes: Vec<NodeId>,
    last_turn_end: Option<TurnEnd>,
    violations: Vec<ContractViolation>,
}

impl RenderModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message. Returns the number of nodes finalized by it.
    pub fn apply(&mut self, msg: &ProtocolMessage) -> usize {
        match msg {
            ProtocolMessage::Append { id, text, .. } => {
                self.append(id, text);
                0
            }
            ProtocolMessage::ToolOpen { id, tool, input } => {
                self.tool_open(id, tool, input);
                0
            }
            ProtocolMessage::ToolClose {
                id,
                output,
                outcome,
            } => {
                self.tool_close(id, output, *outcome);
                0
            }
            ProtocolMessage::Complete { stats } => self.end_turn(TurnEnd::Completed(stats.clone())),
            ProtocolMessage::Interrupted => self.end_turn(TurnEnd::Interrupted),
            ProtocolMessage::Error { code, message } if code.ends_turn() => {
                self.end_turn(TurnEnd::Failed {
                    code: *code,
                    message: message.clone(),
                })
            }
            // Rejections of a client frame do not touch the turn in progress.
            ProtocolMessage::Error { .. } => 0,
        }
    }

    fn append(&mut self, id: &NodeId, text: &str) {
        match self.nodes.get_mut(id) {
            None => self.insert(Node {
                id: id.clone(),
                content: NodeContent::Text { text: text.to_string() },
                state: NodeState::Open,
            }),
            Some(node) if node.state == NodeState::Finalized => {
                self.violations.push(ContractViolation::MutatedFinalized(id.clone()));
            }
            Some(Node {
                content: NodeContent::Text { text: existing },
                ..
            }) => existing.push_str(text),
            Some(_) => self.violations.push(ContractViolation::AppendToTool(id.clone())),
        }
    }

    fn tool_open(&mut self, id: &NodeId, tool: &str, input: &Value) {
        let content = NodeContent::Tool {
            tool: tool.to_string(),
            input: input.clone(),
            output: None,
            outcome: None,
        };
        match self.nodes.get_mut(id) {
            None => self.insert(Node {
                id: id.clone(),
                content,
                state: NodeState::Open,
            }),
            Some(node) if node.state == NodeState::Finalized => {
                self.violations.push(ContractViolation::MutatedFinalized(id.clone()));
            }
            Some(node) => node.content = content,
        }
    }

    fn tool_close(&mut self, id: &NodeId, output: &str, outcome: ToolOutcome) {
        match self.nodes.get_mut(id) {
            // Never drop a result: create the node if the open was missed.
            None => self.insert(Node {
                id: id.clone(),
                content: NodeContent::Tool {
                    tool: String::new(),
                    input: Value::Null,
                    output: Some(output.to_string()),
                    outcome: Some(outcome),
                },
                state: NodeState::Open,
            }),
            Some(node) if node.state == NodeState::Finalized => {
                self.violations.push(ContractViolation::MutatedFinalized(id.clone()));
            }
            Some(Node {
                content:
                    NodeContent::Tool {
                        output: slot,
                        outcome: result,
                        ..
                    },
                ..
            }) => {
                *slot = Some(output.to_string());
                *result = Some(outcome);
            }
            Some(_) => self.violations.push(ContractViolation::CloseOnText(id.clone())),
        }
    }

    fn insert(&mut self, node: Node) {
        self.order.push(node.id.clone());
        self.turn_nodes.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    fn end_turn(&mut self, end: TurnEnd) -> usize {
        let mut finalized = 0;
        for id in self.turn_nodes.drain(..) {
            if let Some(node) = self.nodes.get_mut(&id) {
                if node.state == NodeState::Open {
                    node.state = NodeState::Finalized;
                    finalized += 1;
                }
            }
        }
        self.last_turn_end = Some(end);
        finalized
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.state == NodeState::Open)
            .count()
    }

    pub fn last_turn_end(&self) -> Option<&TurnEnd> {
        self.last_turn_end.as_ref()
    }

    pub fn violations(&self) -> &[ContractViolation] {
        &self.violations
    }

    /// Plain-text rendering of every node, one block per node.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for node in self.nodes() {
            match &node.content {
                NodeContent::Text { text } => out.push_str(text),
                NodeContent::Tool {
                    tool,
                    output,
                    outcome,
                    ..
                } => {
                    let name = if tool.is_empty() { "tool" } else { tool };
                    let status = match outcome {
                        Some(ToolOutcome::Ok) => "ok",
                        Some(ToolOutcome::Error) => "error",
                        None => "unfinished",
                    };
                    out.push_str(&format!("[{name}: {status}]"));
                    if let Some(first) = output.as_deref().and_then(|o| o.lines().next()) {
                        out.push(' ');
                        out.push_str(first);
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::convert;
    use crate::session_state::SessionState;
    use relay_core::events::ProductionEvent;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::from_raw(s)
    }

    fn append(s: &str, text: &str, create: bool) -> ProtocolMessage {
        ProtocolMessage::Append {
            id: id(s),
            text: text.into(),
            create,
        }
    }

    #[test]
    fn append_creates_then_concatenates() {
        let mut model = RenderModel::new();
        model.apply(&append("1-text-1", "Hi ", true));
        model.apply(&append("1-text-1", "there", false));

        let node = model.node(&id("1-text-1")).unwrap();
        assert_eq!(node.text(), Some("Hi there"));
        assert_eq!(node.state, NodeState::Open);
    }

    #[test]
    fn complete_finalizes_each_node_once() {
        let mut model = RenderModel::new();
        model.apply(&append("1-text-1", "a", true));
        model.apply(&ProtocolMessage::ToolOpen {
            id: id("1-tool-1"),
            tool: "bash".into(),
            input: json!({}),
        });
        let finalized = model.apply(&ProtocolMessage::Complete {
            stats: TurnStats::default(),
        });
        assert_eq!(finalized, 2);
        assert_eq!(model.open_count(), 0);
        assert!(matches!(model.last_turn_end(), Some(TurnEnd::Completed(_))));

        // A second terminal message has nothing left to finalize.
        assert_eq!(model.apply(&ProtocolMessage::Interrupted), 0);
    }

    #[test]
    fn finalized_nodes_are_immutable() {
        let mut model = RenderModel::new();
        model.apply(&append("1-text-1", "a", true));
        model.apply(&ProtocolMessage::Interrupted);
        model.apply(&append("1-text-1", "b", false));

        assert_eq!(model.node(&id("1-text-1")).unwrap().text(), Some("a"));
        assert_eq!(
            model.violations(),
            &[ContractViolation::MutatedFinalized(id("1-text-1"))]
        );
    }

    #[test]
    fn tool_close_resolves_open_tool() {
        let mut model = RenderModel::new();
        model.apply(&ProtocolMessage::ToolOpen {
            id: id("1-tool-1"),
            tool: "bash".into(),
            input: json!({"command": "ls"}),
        });
        model.apply(&ProtocolMessage::ToolClose {
            id: id("1-tool-1"),
            output: "file.txt".into(),
            outcome: ToolOutcome::Ok,
        });

        let node = model.node(&id("1-tool-1")).unwrap();
        assert_eq!(node.state, NodeState::Open);
        match &node.content {
            NodeContent::Tool { tool, output, .. } => {
                assert_eq!(tool, "bash");
                assert_eq!(output.as_deref(), Some("file.txt"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_close_for_unseen_id_creates_node() {
        let mut model = RenderModel::new();
        model.apply(&ProtocolMessage::ToolClose {
            id: id("1-tool-9"),
            output: "orphan".into(),
            outcome: ToolOutcome::Error,
        });
        let node = model.node(&id("1-tool-9")).unwrap();
        assert!(matches!(
            node.content,
            NodeContent::Tool {
                outcome: Some(ToolOutcome::Error),
                ..
            }
        ));
        assert!(model.violations().is_empty());
    }

    #[test]
    fn append_to_tool_is_a_violation() {
        let mut model = RenderModel::new();
        model.apply(&ProtocolMessage::ToolOpen {
            id: id("1-tool-1"),
            tool: "bash".into(),
            input: Value::Null,
        });
        model.apply(&append("1-tool-1", "x", false));
        assert_eq!(model.violations(), &[ContractViolation::AppendToTool(id("1-tool-1"))]);
    }

    #[test]
    fn error_ends_turn() {
        let mut model = RenderModel::new();
        model.apply(&append("1-text-1", "partial", true));
        model.apply(&ProtocolMessage::error(ErrorCode::ProducerError, "boom"));
        assert_eq!(model.open_count(), 0);
        assert!(matches!(
            model.last_turn_end(),
            Some(TurnEnd::Failed { code: ErrorCode::ProducerError, .. })
        ));
    }

    #[test]
    fn busy_error_leaves_turn_open() {
        let mut model = RenderModel::new();
        model.apply(&append("1-text-1", "still ", true));
        assert_eq!(model.apply(&ProtocolMessage::error(ErrorCode::Busy, "busy")), 0);
        model.apply(&append("1-text-1", "going", false));
        assert_eq!(model.open_count(), 1);
        assert!(model.last_turn_end().is_none());
        assert!(model.violations().is_empty());
    }

    #[test]
    fn converted_turns_render_cleanly() {
        let mut state = SessionState::new();
        let mut model = RenderModel::new();

        for prompt in ["first", "second"] {
            state.begin_turn();
            let events = vec![
                ProductionEvent::text(format!("{prompt} ")),
                ProductionEvent::tool_start("t1", "bash", Value::Null),
                ProductionEvent::tool_end("t1", "bash", "ok\nmore", ToolOutcome::Ok),
                ProductionEvent::text("done"),
                ProductionEvent::complete(TurnStats::default()),
            ];
            for event in events {
                for msg in convert(event, &mut state) {
                    model.apply(&msg);
                }
            }
        }

        assert!(model.violations().is_empty());
        assert_eq!(model.len(), 6);
        assert_eq!(model.open_count(), 0);
        assert_eq!(
            model.transcript(),
            "first \n[bash: ok] ok\ndone\nsecond \n[bash: ok] ok\ndone\n"
        );
    }
}
