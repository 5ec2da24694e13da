use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use relay_core::ids::ConnectionId;

/// Liveness bookkeeping for one socket. Holds no protocol state.
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    last_pong: Mutex<Instant>,
    turns: AtomicU64,
}

impl ConnectionInfo {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            last_pong: Mutex::new(Instant::now()),
            turns: AtomicU64::new(0),
        }
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    pub fn record_turn(&self) {
        self.turns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turns(&self) -> u64 {
        self.turns.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id.to_string(),
            connected_at: self.connected_at.to_rfc3339(),
            turns: self.turns(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConnectionSummary {
    pub id: String,
    pub connected_at: String,
    pub turns: u64,
}

/// Process-wide set of live connections, used for counts and liveness only.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionInfo>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Arc<ConnectionInfo> {
        let info = Arc::new(ConnectionInfo::new(ConnectionId::new()));
        self.connections.insert(info.id.clone(), Arc::clone(&info));
        info
    }

    pub fn unregister(&self, id: &ConnectionId) -> bool {
        self.connections.remove(id).is_some()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Live connections, oldest first.
    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut all: Vec<ConnectionSummary> = self
            .connections
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        all.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        all
    }
}
