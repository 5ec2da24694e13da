//! Per-connection identity registry.
//!
//! `SessionState` is the only place node ids are minted. It is plain data owned by
//! one connection's pipeline and never shared between connections.

use std::collections::HashMap;

use serde_json::Value;

use relay_core::errors::StreamError;
use relay_core::ids::{NodeId, NodeKind, ToolCallId};

#[derive(Debug, Default)]
pub struct SessionState {
    message_seq: u64,
    text_seq: u32,
    tool_seq: u32,
    open_text: Option<NodeId>,
    tools: HashMap<ToolCallId, NodeId>,
    /// Inputs of tool opens that were not emitted, kept until the tool ends.
    held_inputs: HashMap<ToolCallId, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new turn. Call exactly once per turn, before converting its first event.
    pub fn begin_turn(&mut self) -> u64 {
        self.message_seq += 1;
        self.text_seq = 0;
        self.tool_seq = 0;
        self.open_text = None;
        self.tools.clear();
        self.held_inputs.clear();
        self.message_seq
    }

    /// Current turn number; 0 before the first `begin_turn`.
    pub fn message_seq(&self) -> u64 {
        self.message_seq
    }

    /// Return the open text block id, minting a new one if none is open.
    /// The flag is `true` when the id was just created.
    pub fn open_or_get_text_block_id(&mut self) -> (NodeId, bool) {
        if let Some(id) = &self.open_text {
            return (id.clone(), false);
        }
        self.text_seq += 1;
        let id = NodeId::new(self.message_seq, NodeKind::Text, self.text_seq);
        self.open_text = Some(id.clone());
        (id, true)
    }

    pub fn close_text_block(&mut self) {
        self.open_text = None;
    }

    /// Mint a tool node id for `key`. Closes any open text block first: tool activity
    /// always interrupts text streaming.
    pub fn assign_tool_id(&mut self, key: &ToolCallId) -> NodeId {
        self.close_text_block();
        self.tool_seq += 1;
        let id = NodeId::new(self.message_seq, NodeKind::Tool, self.tool_seq);
        if let Some(previous) = self.tools.insert(key.clone(), id.clone()) {
            tracing::warn!(
                tool_call_id = %key,
                previous = %previous,
                id = %id,
                "Tool instance started twice; rebinding to new node"
            );
        }
        id
    }

    pub fn resolve_tool_id(&self, key: &ToolCallId) -> Result<NodeId, StreamError> {
        self.tools
            .get(key)
            .cloned()
            .ok_or_else(|| StreamError::UnknownToolInstance(key.clone()))
    }

    /// Forget a tool instance once its close has been emitted, so it cannot close twice.
    pub fn release_tool_id(&mut self, key: &ToolCallId) -> Option<NodeId> {
        self.held_inputs.remove(key);
        self.tools.remove(key)
    }

    /// Keep the input of a tool whose open was not sent, in case its end needs it.
    pub fn hold_tool_input(&mut self, key: &ToolCallId, input: Value) {
        self.held_inputs.insert(key.clone(), input);
    }

    pub fn take_tool_input(&mut self, key: &ToolCallId) -> Option<Value> {
        self.held_inputs.remove(key)
    }

    /// Tool instances opened this turn and not yet closed.
    pub fn pending_tools(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ToolCallId {
        ToolCallId::from_raw(s)
    }

    #[test]
    fn held_input_is_taken_once_and_cleared_per_turn() {
        let mut state = SessionState::new();
        state.begin_turn();
        state.assign_tool_id(&key("a"));
        state.hold_tool_input(&key("a"), serde_json::json!({"path": "x"}));
        assert_eq!(
            state.take_tool_input(&key("a")),
            Some(serde_json::json!({"path": "x"}))
        );
        assert_eq!(state.take_tool_input(&key("a")), None);

        state.hold_tool_input(&key("b"), Value::Bool(true));
        state.begin_turn();
        assert_eq!(state.take_tool_input(&key("b")), None);
    }

    #[test]
    fn fresh_state_has_no_turn() {
        let state = SessionState::new();
        assert_eq!(state.message_seq(), 0);
        assert_eq!(state.pending_tools(), 0);
    }

    #[test]
    fn begin_turn_increments_message_seq() {
        let mut state = SessionState::new();
        assert_eq!(state.begin_turn(), 1);
        assert_eq!(state.begin_turn(), 2);
        assert_eq!(state.message_seq(), 2);
    }

    #[test]
    fn text_block_is_reused_while_open() {
        let mut state = SessionState::new();
        state.begin_turn();
        let (a, created) = state.open_or_get_text_block_id();
        assert!(created);
        assert_eq!(a.as_str(), "1-text-1");

        let (b, created) = state.open_or_get_text_block_id();
        assert!(!created);
        assert_eq!(a, b);
    }

    #[test]
    fn closed_text_block_gets_new_id() {
        let mut state = SessionState::new();
        state.begin_turn();
        let (a, _) = state.open_or_get_text_block_id();
        state.close_text_block();

        let (b, created) = state.open_or_get_text_block_id();
        assert!(created);
        assert_ne!(a, b);
        assert_eq!(b.as_str(), "1-text-2");
    }

    #[test]
    fn close_text_block_is_idempotent() {
        let mut state = SessionState::new();
        state.begin_turn();
        state.close_text_block();
        state.close_text_block();
        let (id, created) = state.open_or_get_text_block_id();
        assert!(created);
        assert_eq!(id.as_str(), "1-text-1");
    }

    #[test]
    fn assign_tool_closes_text_block() {
        let mut state = SessionState::new();
        state.begin_turn();
        state.open_or_get_text_block_id();

        let id = state.assign_tool_id(&key("t1"));
        assert_eq!(id.as_str(), "1-tool-1");
        let (text, created) = state.open_or_get_text_block_id();
        assert!(created);
        assert_eq!(text.as_str(), "1-text-2");
    }

    #[test]
    fn tool_ids_are_sequential_and_resolvable() {
        let mut state = SessionState::new();
        state.begin_turn();
        let a = state.assign_tool_id(&key("t1"));
        let b = state.assign_tool_id(&key("t2"));
        assert_eq!(a.as_str(), "1-tool-1");
        assert_eq!(b.as_str(), "1-tool-2");
        assert_eq!(state.resolve_tool_id(&key("t1")).unwrap(), a);
        assert_eq!(state.resolve_tool_id(&key("t2")).unwrap(), b);
        assert_eq!(state.pending_tools(), 2);
    }

    #[test]
    fn resolve_unknown_tool_is_an_error() {
        let state = SessionState::new();
        let err = state.resolve_tool_id(&key("ghost")).unwrap_err();
        assert!(matches!(err, StreamError::UnknownToolInstance(ref k) if k.as_str() == "ghost"));
    }

    #[test]
    fn release_makes_tool_unknown() {
        let mut state = SessionState::new();
        state.begin_turn();
        let id = state.assign_tool_id(&key("t1"));
        assert_eq!(state.release_tool_id(&key("t1")), Some(id));
        assert!(state.resolve_tool_id(&key("t1")).is_err());
        assert_eq!(state.release_tool_id(&key("t1")), None);
    }

    #[test]
    fn begin_turn_resets_local_counters_and_registry() {
        let mut state = SessionState::new();
        state.begin_turn();
        state.open_or_get_text_block_id();
        state.assign_tool_id(&key("t1"));
        state.open_or_get_text_block_id();

        state.begin_turn();
        assert!(state.resolve_tool_id(&key("t1")).is_err());

        let (text, created) = state.open_or_get_text_block_id();
        assert!(created);
        assert_eq!(text.as_str(), "2-text-1");
        assert_eq!(state.assign_tool_id(&key("t1")).as_str(), "2-tool-1");
    }

    #[test]
    fn ids_unique_across_turns() {
        let mut state = SessionState::new();
        let mut seen = std::collections::HashSet::new();
        for turn in 0..5 {
            state.begin_turn();
            for i in 0..3 {
                let (text, _) = state.open_or_get_text_block_id();
                assert!(seen.insert(text));
                let tool = state.assign_tool_id(&key(&format!("t{turn}-{i}")));
                assert!(seen.insert(tool));
            }
        }
        assert_eq!(seen.len(), 30);
    }
}
