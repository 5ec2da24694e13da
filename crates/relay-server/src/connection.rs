//! One WebSocket connection: socket reader, socket writer and the session task.
//!
//! The reader decodes client frames and claims or cancels turns. The session task owns the
//! event source and `SessionState` and runs turns one at a time. The writer drains the
//! outbound queue to the socket and sends heartbeat pings. Any side failing cancels the
//! connection token, which winds down the other two.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::errors::StreamError;
use relay_core::protocol::{ClientMessage, ErrorCode, ProtocolMessage};
use relay_telemetry::{names, MetricsRecorder};

use crate::outbound::Outbound;
use crate::registry::ConnectionInfo;
use crate::server::AppState;
use crate::session::SessionManager;
use crate::turn_slot::TurnSlot;

type TurnRequest = (String, CancellationToken);

/// Serve a socket until either side goes away.
#[instrument(skip_all, fields(connection_id = %info.id))]
pub async fn handle_ws_connection(socket: WebSocket, info: Arc<ConnectionInfo>, state: AppState) {
    let config = Arc::clone(&state.config);
    let metrics = Arc::clone(&state.metrics);
    metrics.counter_inc(names::CONNECTIONS_TOTAL, 1);
    metrics.gauge_add(names::CONNECTIONS_ACTIVE, 1);

    let conn_token = state.shutdown.child_token();
    let (outbound, out_rx) = Outbound::channel(
        config.max_send_queue,
        config.overload_grace(),
        config.send_timeout(),
    );

    let slot = Arc::new(TurnSlot::new());
    let source = state.factory.create();
    info!(source = source.name(), verbosity = ?config.verbosity, "client connected");
    let session = SessionManager::new(
        info.id.clone(),
        source,
        config.verbosity,
        outbound.clone(),
        Arc::clone(&slot),
        Arc::clone(&metrics),
    );
    let (turn_tx, turn_rx) = mpsc::channel::<TurnRequest>(1);
    let (ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(run_writer(
        ws_tx,
        out_rx,
        Arc::clone(&info),
        WriterTimings {
            heartbeat: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            send_timeout: config.send_timeout(),
        },
        Arc::clone(&metrics),
        conn_token.clone(),
    ));
    let session_task = tokio::spawn(run_session(
        session,
        turn_rx,
        Arc::clone(&info),
        conn_token.clone(),
    ));

    loop {
        let frame = tokio::select! {
            () = conn_token.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                break;
            }
            None => break,
        };

        let text = match msg {
            Message::Text(ref t) => t.as_str(),
            Message::Binary(ref data) => match std::str::from_utf8(data) {
                Ok(s) => s,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF8 binary frame");
                    if reject(&outbound, ErrorCode::BadRequest, "binary frames must be UTF-8 JSON")
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            },
            Message::Pong(_) => {
                info.record_pong();
                continue;
            }
            // axum answers pings itself
            Message::Ping(_) => continue,
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        };

        if let Err(e) = handle_client_frame(text, &slot, &conn_token, &turn_tx, &outbound).await {
            debug!(error = %e, "stopping reader");
            break;
        }
    }

    conn_token.cancel();
    drop(turn_tx);
    let _ = session_task.await;
    let _ = writer.await;

    state.registry.unregister(&info.id);
    metrics.gauge_add(names::CONNECTIONS_ACTIVE, -1);
    info!(turns = info.turns(), "client disconnected");
}

async fn handle_client_frame(
    text: &str,
    slot: &TurnSlot,
    conn_token: &CancellationToken,
    turn_tx: &mpsc::Sender<TurnRequest>,
    outbound: &Outbound,
) -> Result<(), StreamError> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::UserMessage { content }) => {
            let Some(token) = slot.try_begin(conn_token) else {
                debug!("prompt rejected while a turn is running");
                return reject(
                    outbound,
                    ErrorCode::Busy,
                    "a turn is already running on this connection",
                );
            };
            if turn_tx.send((content, token)).await.is_err() {
                slot.finish();
                return Err(StreamError::Transport("session task stopped".into()));
            }
            Ok(())
        }
        Ok(ClientMessage::Interrupt) => {
            if slot.interrupt() {
                debug!("interrupt requested");
            } else if slot.is_active() {
                debug!("turn already interrupted, ignoring");
            } else {
                debug!("interrupt with no running turn, ignoring");
            }
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, len = text.len(), "unparseable client frame");
            reject(outbound, ErrorCode::BadRequest, format!("invalid message: {e}"))
        }
    }
}

/// Answer a client frame with an `error`. Dropped if the outbound queue is full.
fn reject(
    outbound: &Outbound,
    code: ErrorCode,
    message: impl Into<String>,
) -> Result<(), StreamError> {
    if !outbound.try_reply(&ProtocolMessage::error(code, message))? {
        warn!(?code, "outbound queue full, dropping rejection");
    }
    Ok(())
}

async fn run_session(
    mut session: SessionManager,
    mut turns: mpsc::Receiver<TurnRequest>,
    info: Arc<ConnectionInfo>,
    conn_token: CancellationToken,
) {
    while let Some((prompt, cancel)) = turns.recv().await {
        info.record_turn();
        if let Err(e) = session.run_turn(&prompt, cancel).await {
            debug!(error = %e, "closing connection after transport failure");
            conn_token.cancel();
            break;
        }
    }
    // Dropping the session drops the event source and its state.
}

struct WriterTimings {
    heartbeat: Duration,
    heartbeat_timeout: Duration,
    send_timeout: Duration,
}

async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    info: Arc<ConnectionInfo>,
    timings: WriterTimings,
    metrics: Arc<MetricsRecorder>,
    conn_token: CancellationToken,
) {
    let mut ping_interval = tokio::time::interval(timings.heartbeat);
    // consume the immediate first tick
    ping_interval.tick().await;

    loop {
        let frame = tokio::select! {
            () = conn_token.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(text) => Message::Text(Arc::unwrap_or_clone(text).into()),
                None => break,
            },
            _ = ping_interval.tick() => {
                if info.last_pong_elapsed() > timings.heartbeat_timeout {
                    warn!(timeout = ?timings.heartbeat_timeout, "client unresponsive, disconnecting");
                    break;
                }
                Message::Ping(Vec::new().into())
            }
        };

        match tokio::time::timeout(timings.send_timeout, ws_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "socket write failed");
                metrics.counter_inc(names::TRANSPORT_ERRORS, 1);
                break;
            }
            Err(_) => {
                warn!(timeout = ?timings.send_timeout, "socket write timed out");
                metrics.counter_inc(names::TRANSPORT_ERRORS, 1);
                break;
            }
        }
    }

    conn_token.cancel();
    let _ = tokio::time::timeout(timings.send_timeout, ws_tx.close()).await;
}
