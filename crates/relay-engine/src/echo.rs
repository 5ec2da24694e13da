//! Stand-in agent runtime used by `relay serve` when no real runtime is attached.
//!
//! Streams the prompt back word by word around a fake `echo` tool call, which is
//! enough to exercise every message type end to end.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use relay_core::errors::StreamError;
use relay_core::events::ProductionEvent;
use relay_core::protocol::{ToolOutcome, TurnStats};
use relay_core::source::{EventSource, EventSourceFactory, EventStream};

use crate::scripted::{run_steps, ScriptStep};

pub struct EchoSource {
    word_delay: Duration,
    turn: u64,
}

impl EchoSource {
    pub fn new(word_delay: Duration) -> Self {
        Self {
            word_delay,
            turn: 0,
        }
    }

    fn plan(&self, prompt: &str) -> Vec<ScriptStep> {
        let words: Vec<&str> = prompt.split_whitespace().collect();
        let mut steps = Vec::with_capacity(words.len() * 2 + 8);

        let emit_text = |steps: &mut Vec<ScriptStep>, text: String| {
            steps.push(ScriptStep::Pause(self.word_delay));
            steps.push(ScriptStep::Emit(ProductionEvent::text(text)));
        };

        emit_text(&mut steps, "Echoing: ".to_string());
        for (i, word) in words.iter().enumerate() {
            let sep = if i + 1 < words.len() { " " } else { "" };
            emit_text(&mut steps, format!("{word}{sep}"));
        }

        let instance = format!("echo_{}", self.turn);
        steps.push(ScriptStep::Emit(ProductionEvent::tool_start(
            instance.clone(),
            "echo",
            json!({ "text": prompt }),
        )));
        steps.push(ScriptStep::Pause(self.word_delay));
        let outcome = ToolOutcome::from_success(!prompt.trim().is_empty());
        let output = if outcome.is_error() {
            "nothing to echo".to_string()
        } else {
            prompt.to_uppercase()
        };
        steps.push(ScriptStep::Emit(ProductionEvent::tool_end(
            instance, "echo", output, outcome,
        )));
        emit_text(&mut steps, "Done.".to_string());

        let pauses = steps
            .iter()
            .filter(|s| matches!(s, ScriptStep::Pause(_)))
            .count() as u32;
        steps.push(ScriptStep::Emit(ProductionEvent::complete(TurnStats {
            duration_ms: (self.word_delay * pauses).as_millis() as u64,
            cost: 0.0,
            input_tokens: words.len() as u64,
            output_tokens: words.len() as u64 + 2,
        })));
        steps
    }
}

#[async_trait]
impl EventSource for EchoSource {
    fn name(&self) -> &str {
        "echo"
    }

    async fn start_turn(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream, StreamError> {
        self.turn += 1;
        Ok(run_steps(self.plan(prompt), cancel))
    }
}

#[derive(Clone, Debug)]
pub struct EchoFactory {
    word_delay: Duration,
}

impl EchoFactory {
    pub fn new(word_delay: Duration) -> Self {
        Self { word_delay }
    }
}

impl EventSourceFactory for EchoFactory {
    fn create(&self) -> Box<dyn EventSource> {
        Box::new(EchoSource::new(self.word_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::convert;
    use crate::render::RenderModel;
    use crate::session_state::SessionState;
    use tokio_stream::StreamExt;

    async fn run_turn(source: &mut EchoSource, prompt: &str) -> Vec<ProductionEvent> {
        source
            .start_turn(prompt, CancellationToken::new())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn echo_round_trip_renders() {
        let mut source = EchoSource::new(Duration::from_millis(5));
        let events = run_turn(&mut source, "hello world").await;
        assert!(events.last().unwrap().is_terminal());

        let mut state = SessionState::new();
        state.begin_turn();
        let mut model = RenderModel::new();
        for event in events {
            for msg in convert(event, &mut state) {
                model.apply(&msg);
            }
        }
        assert_eq!(
            model.transcript(),
            "Echoing: hello world\n[echo: ok] HELLO WORLD\nDone.\n"
        );
        assert!(model.violations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blank_prompt_reports_tool_error() {
        let mut source = EchoSource::new(Duration::ZERO);
        let events = run_turn(&mut source, "   ").await;
        assert!(events.iter().any(|e| matches!(
            e,
            ProductionEvent::ToolInvocationEnd { outcome: ToolOutcome::Error, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_instances_differ_per_turn() {
        let mut source = EchoSource::new(Duration::ZERO);
        let first = run_turn(&mut source, "a").await;
        let second = run_turn(&mut source, "b").await;
        let instance = |events: &[ProductionEvent]| {
            events.iter().find_map(|e| match e {
                ProductionEvent::ToolInvocationStart { instance, .. } => Some(instance.clone()),
                _ => None,
            })
        };
        assert_ne!(instance(&first[..]), instance(&second[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_echo() {
        let mut source = EchoSource::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let mut stream = source
            .start_turn("one two three", cancel.clone())
            .await
            .unwrap();
        assert!(stream.next().await.is_some());
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
