use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Tracks the one turn a connection may run at a time.
///
/// The socket reader claims the slot when a prompt arrives and the session task releases it
/// just before the turn's terminal message is queued, so `busy` and `interrupt` are decided
/// without waiting on the pipeline.
#[derive(Default)]
pub struct TurnSlot {
    current: Mutex<Option<CancellationToken>>,
}

impl TurnSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Returns the turn's token, or `None` if a turn is already running.
    pub fn try_begin(&self, parent: &CancellationToken) -> Option<CancellationToken> {
        let mut current = self.current.lock();
        if current.is_some() {
            return None;
        }
        let token = parent.child_token();
        *current = Some(token.clone());
        Some(token)
    }

    /// Cancel the running turn. Returns `false` if there was nothing to interrupt.
    pub fn interrupt(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn finish(&self) {
        *self.current.lock() = None;
    }

    pub fn is_active(&self) -> bool {
        self.current.lock().is_some()
    }
}
