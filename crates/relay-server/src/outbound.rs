//! Bounded per-connection outbound queue.
//!
//! The session pipeline is the only producer; the socket writer task is the only consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use relay_core::errors::StreamError;
use relay_core::protocol::ProtocolMessage;

#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Arc<String>>,
    capacity: usize,
    overload_grace: Duration,
    terminal_timeout: Duration,
}

impl Outbound {
    /// Create the queue and the receiver the socket writer drains.
    pub fn channel(
        capacity: usize,
        overload_grace: Duration,
        terminal_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Arc<String>>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                capacity,
                overload_grace,
                terminal_timeout,
            },
            rx,
        )
    }

    /// Queue a message produced mid-turn.
    ///
    /// Waits at most the overload grace period for room; past that the turn is overloaded.
    pub async fn send(&self, msg: &ProtocolMessage) -> Result<(), StreamError> {
        let payload = encode(msg)?;
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(closed()),
            Err(TrySendError::Full(payload)) => {
                match tokio::time::timeout(self.overload_grace, self.tx.send(payload)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(closed()),
                    Err(_) => Err(StreamError::Overloaded {
                        capacity: self.capacity,
                        waited: self.overload_grace,
                    }),
                }
            }
        }
    }

    /// Queue a message that ends a turn.
    ///
    /// These are never dropped for overload; if no room frees up within the terminal timeout
    /// the writer is considered stuck and the connection is lost.
    pub async fn send_terminal(&self, msg: &ProtocolMessage) -> Result<(), StreamError> {
        let payload = encode(msg)?;
        match tokio::time::timeout(self.terminal_timeout, self.tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(closed()),
            Err(_) => Err(StreamError::Transport(format!(
                "outbound queue stalled for {:?}",
                self.terminal_timeout
            ))),
        }
    }
}

impl Outbound {
    /// Queue a reply to a client frame without waiting.
    ///
    /// Returns `Ok(false)` if the queue is full and the reply was dropped; the socket reader
    /// must keep reading so an `interrupt` can still get through.
    pub fn try_reply(&self, msg: &ProtocolMessage) -> Result<bool, StreamError> {
        match self.tx.try_send(encode(msg)?) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(closed()),
        }
    }
}

fn encode(msg: &ProtocolMessage) -> Result<Arc<String>, StreamError> {
    serde_json::to_string(msg)
        .map(Arc::new)
        .map_err(|e| StreamError::Transport(format!("failed to encode {}: {e}", msg.message_type())))
}

fn closed() -> StreamError {
    StreamError::Transport("connection closed".into())
}
