//! Per-connection turn pipeline: drain the event source, convert, send.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use relay_core::errors::StreamError;
use relay_core::ids::ConnectionId;
use relay_core::protocol::{ErrorCode, ProtocolMessage, TurnStats};
use relay_core::source::{EventSource, EventStream};
use relay_engine::{EventConverter, SessionState, Verbosity};
use relay_telemetry::{names, MetricsRecorder};

use crate::outbound::Outbound;
use crate::turn_slot::TurnSlot;

/// How long an interrupted source gets to end its stream before it is dropped.
const INTERRUPT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How a turn ended. Every variant maps to exactly one terminal message.
#[derive(Debug)]
pub enum TurnOutcome {
    Completed(TurnStats),
    Interrupted,
    /// Overload or producer failure; the connection stays open.
    Aborted(StreamError),
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Interrupted => "interrupted",
            Self::Aborted(e) => e.error_kind(),
        }
    }

    pub fn terminal_message(&self) -> ProtocolMessage {
        match self {
            Self::Completed(stats) => ProtocolMessage::Complete {
                stats: stats.clone(),
            },
            Self::Interrupted => ProtocolMessage::Interrupted,
            Self::Aborted(e) => e
                .to_message()
                .unwrap_or_else(|| ProtocolMessage::error(ErrorCode::ProducerError, e.to_string())),
        }
    }

    fn metric(&self) -> &'static str {
        match self {
            Self::Completed(_) => names::TURNS_COMPLETED,
            Self::Interrupted => names::TURNS_INTERRUPTED,
            Self::Aborted(StreamError::Overloaded { .. }) => names::TURNS_OVERLOADED,
            Self::Aborted(_) => names::TURNS_FAILED,
        }
    }
}

/// Owns everything one connection needs to run turns. Never shared between connections.
pub struct SessionManager {
    connection_id: ConnectionId,
    source: Box<dyn EventSource>,
    state: SessionState,
    converter: EventConverter,
    outbound: Outbound,
    slot: Arc<TurnSlot>,
    metrics: Arc<MetricsRecorder>,
}

impl SessionManager {
    pub fn new(
        connection_id: ConnectionId,
        source: Box<dyn EventSource>,
        verbosity: Verbosity,
        outbound: Outbound,
        slot: Arc<TurnSlot>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            connection_id,
            source,
            state: SessionState::new(),
            converter: EventConverter::new(verbosity),
            outbound,
            slot,
            metrics,
        }
    }

    /// Run one turn to its terminal message.
    ///
    /// The turn slot is released before the terminal message is queued, so a client may send
    /// its next prompt as soon as it sees the turn end. Returns `Err` only for transport
    /// failures, after which the connection must close.
    #[instrument(skip_all, fields(connection_id = %self.connection_id, source = self.source.name(), turn))]
    pub async fn run_turn(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, StreamError> {
        let turn = self.state.begin_turn();
        let _ = tracing::Span::current().record("turn", turn);
        self.metrics.counter_inc(names::TURNS_STARTED, 1);
        let started = Instant::now();
        debug!(prompt_len = prompt.len(), "turn started");

        let outcome = match self.drive(prompt, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.slot.finish();
                return Err(self.transport_failed(e));
            }
        };
        if matches!(outcome, TurnOutcome::Aborted(_)) {
            cancel.cancel();
        }
        self.slot.finish();

        let terminal = outcome.terminal_message();
        if let Err(e) = self.outbound.send_terminal(&terminal).await {
            return Err(self.transport_failed(e));
        }
        self.metrics.counter_inc(names::MESSAGES_SENT, 1);

        let duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.counter_inc(outcome.metric(), 1);
        self.metrics
            .histogram_observe(names::TURN_DURATION_MS, duration_ms as f64);
        match &outcome {
            TurnOutcome::Aborted(e) => {
                warn!(outcome = outcome.as_str(), error = %e, duration_ms, "turn aborted");
            }
            _ => info!(outcome = outcome.as_str(), duration_ms, "turn finished"),
        }
        Ok(outcome)
    }

    async fn drive(
        &mut self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, StreamError> {
        let mut stream = match self.source.start_turn(prompt, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => return abort_or_fail(e),
        };

        loop {
            let Some(next) = (tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            }) else {
                discard_remaining(stream).await;
                return Ok(TurnOutcome::Interrupted);
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) if e.is_fatal() || e.aborts_turn() => return abort_or_fail(e),
                Some(Err(e)) => {
                    warn!(error = %e, kind = e.error_kind(), "skipping unusable event");
                    continue;
                }
                None => {
                    return Ok(TurnOutcome::Aborted(StreamError::Producer(
                        "event stream ended before the turn completed".into(),
                    )))
                }
            };

            trace!(event = event.event_type(), "converting event");
            let conversion = self.converter.convert(event, &mut self.state);
            if let Some(StreamError::UnknownToolInstance(_)) = conversion.recovered {
                self.metrics.counter_inc(names::TOOL_PAIRS_SYNTHESIZED, 1);
            }

            for msg in conversion.messages {
                if let ProtocolMessage::Complete { stats } = msg {
                    let open_tools = self.state.pending_tools();
                    if open_tools > 0 {
                        warn!(open_tools, "turn completed with tool calls that never ended");
                    }
                    return Ok(TurnOutcome::Completed(stats));
                }
                trace!(id = ?msg.node_id(), kind = msg.message_type(), "queueing message");
                if let Err(e) = self.outbound.send(&msg).await {
                    return abort_or_fail(e);
                }
                self.metrics.counter_inc(names::MESSAGES_SENT, 1);
            }
        }
    }

    fn transport_failed(&self, e: StreamError) -> StreamError {
        self.metrics.counter_inc(names::TRANSPORT_ERRORS, 1);
        warn!(error = %e, "transport failed mid-turn");
        e
    }
}

fn abort_or_fail(e: StreamError) -> Result<TurnOutcome, StreamError> {
    if e.is_fatal() {
        Err(e)
    } else {
        Ok(TurnOutcome::Aborted(e))
    }
}

/// Swallow whatever the source still yields after an interrupt.
async fn discard_remaining(mut stream: EventStream) {
    let drained = tokio::time::timeout(INTERRUPT_DRAIN_TIMEOUT, async move {
        let mut discarded = 0usize;
        while stream.next().await.is_some() {
            discarded += 1;
        }
        discarded
    })
    .await;
    match drained {
        Ok(discarded) => debug!(discarded, "event source wound down after interrupt"),
        Err(_) => warn!(
            timeout = ?INTERRUPT_DRAIN_TIMEOUT,
            "event source ignored interrupt; dropping stream"
        ),
    }
}
