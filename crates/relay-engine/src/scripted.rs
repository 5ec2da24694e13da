use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use relay_core::errors::StreamError;
use relay_core::events::ProductionEvent;
use relay_core::protocol::TurnStats;
use relay_core::source::{EventSource, EventSourceFactory, EventStream};

/// One step of a scripted turn.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Emit(ProductionEvent),
    Pause(Duration),
    /// Yield a producer error and end the stream.
    Fail(String),
    /// Produce nothing until the turn is cancelled.
    AwaitCancel,
}

/// Pre-programmed turns for deterministic runs without an agent runtime.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    Steps(Vec<ScriptStep>),
    /// `start_turn` itself fails.
    Reject(String),
}

impl ScriptedTurn {
    /// Emit `events` back to back.
    pub fn events(events: Vec<ProductionEvent>) -> Self {
        Self::Steps(events.into_iter().map(ScriptStep::Emit).collect())
    }

    /// Stream `text` one fragment at a time, then complete.
    pub fn text(fragments: &[&str]) -> Self {
        let mut steps: Vec<ScriptStep> = fragments
            .iter()
            .map(|f| ScriptStep::Emit(ProductionEvent::text(*f)))
            .collect();
        steps.push(ScriptStep::Emit(ProductionEvent::complete(TurnStats::default())));
        Self::Steps(steps)
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        match self {
            Self::Steps(steps) => Self::Steps(
                steps
                    .into_iter()
                    .flat_map(|s| [ScriptStep::Pause(delay), s])
                    .collect(),
            ),
            reject => reject,
        }
    }
}

/// Event source that replays scripted turns in order.
pub struct ScriptedSource {
    turns: VecDeque<ScriptedTurn>,
}

impl ScriptedSource {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: turns.into(),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start_turn(
        &mut self,
        _prompt: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream, StreamError> {
        match self.turns.pop_front() {
            Some(ScriptedTurn::Steps(steps)) => Ok(run_steps(steps, cancel)),
            Some(ScriptedTurn::Reject(reason)) => Err(StreamError::Producer(reason)),
            None => Err(StreamError::Producer(
                "scripted source has no turns left".into(),
            )),
        }
    }
}

/// Hands every connection its own copy of the same script.
#[derive(Clone, Debug)]
pub struct ScriptedFactory {
    turns: Vec<ScriptedTurn>,
}

impl ScriptedFactory {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self { turns }
    }
}

impl EventSourceFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn EventSource> {
        Box::new(ScriptedSource::new(self.turns.clone()))
    }
}

/// Drive `steps` on a background task. The task stops as soon as the turn is cancelled
/// or the returned stream is dropped.
pub fn run_steps(steps: Vec<ScriptStep>, cancel: CancellationToken) -> EventStream {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        for step in steps {
            if cancel.is_cancelled() {
                break;
            }
            match step {
                ScriptStep::Emit(event) => {
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                ScriptStep::Pause(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                ScriptStep::Fail(reason) => {
                    let _ = tx.send(Err(StreamError::Producer(reason))).await;
                    break;
                }
                ScriptStep::AwaitCancel => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tx.closed() => {}
                    }
                    break;
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}
