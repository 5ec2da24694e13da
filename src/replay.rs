//! `relay replay`: run a recorded upstream event log through the protocol pipeline.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde_json::Value;

use relay_core::errors::StreamError;
use relay_core::events::{ProductionEvent, UpstreamEvent};
use relay_core::protocol::{ErrorCode, ProtocolMessage};
use relay_engine::{EventConverter, RenderModel, SessionState, Verbosity};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub skipped: usize,
    pub turns: u64,
    pub messages: usize,
    pub violations: usize,
}

/// Read JSONL upstream events from `input`, write every protocol message as one JSON line
/// (unless `transcript_only`), then the rendered transcript.
///
/// Unparseable lines are logged and skipped. A log that stops mid-turn ends that turn with a
/// `producer_error`, the same as a source stream that ends early.
pub fn run(
    input: impl BufRead,
    out: &mut impl Write,
    verbosity: Verbosity,
    transcript_only: bool,
) -> Result<ReplaySummary> {
    let converter = EventConverter::new(verbosity);
    let mut state = SessionState::new();
    let mut model = RenderModel::new();
    let mut summary = ReplaySummary::default();
    let mut in_turn = false;

    for (index, line) in input.lines().enumerate() {
        let line = line.context("failed to read event log")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = match parse_line(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping event");
                summary.skipped += 1;
                continue;
            }
        };
        summary.events += 1;

        if !in_turn {
            summary.turns = state.begin_turn();
            in_turn = true;
        }
        if event.is_terminal() {
            in_turn = false;
        }
        let conversion = converter.convert(event, &mut state);
        for msg in conversion.messages {
            summary.messages += 1;
            emit(&msg, &mut *out, &mut model, transcript_only)?;
        }
    }

    if in_turn {
        tracing::warn!(turn = summary.turns, "event log ended mid-turn");
        let msg = ProtocolMessage::error(
            ErrorCode::ProducerError,
            "event log ended before the turn completed",
        );
        summary.messages += 1;
        emit(&msg, &mut *out, &mut model, transcript_only)?;
    }

    if !transcript_only {
        writeln!(out, "---")?;
    }
    write!(out, "{}", model.transcript())?;
    out.flush()?;

    summary.violations = model.violations().len();
    for violation in model.violations() {
        tracing::warn!(?violation, "render contract violation");
    }
    Ok(summary)
}

fn emit(
    msg: &ProtocolMessage,
    out: &mut impl Write,
    model: &mut RenderModel,
    transcript_only: bool,
) -> Result<()> {
    if !transcript_only {
        serde_json::to_writer(&mut *out, msg)?;
        writeln!(out)?;
    }
    model.apply(msg);
    Ok(())
}

fn parse_line(line: &str) -> Result<ProductionEvent, StreamError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| StreamError::MalformedEvent(e.to_string()))?;
    ProductionEvent::try_from(UpstreamEvent::from_value(value)?)
}
