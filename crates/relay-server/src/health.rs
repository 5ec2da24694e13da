//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

use relay_telemetry::{MetricsRecorder, MetricsSnapshot};

use crate::registry::{ConnectionRegistry, ConnectionSummary};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections, oldest first.
    pub clients: Vec<ConnectionSummary>,
    pub metrics: MetricsSnapshot,
}

pub fn health_check(
    start_time: Instant,
    registry: &ConnectionRegistry,
    metrics: &MetricsRecorder,
) -> HealthResponse {
    let clients = registry.summaries();
    HealthResponse {
        status: "ok".into(),
        connections: clients.len(),
        uptime_secs: start_time.elapsed().as_secs(),
        clients,
        metrics: metrics.snapshot(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_telemetry::names;
    use std::time::Duration;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), &ConnectionRegistry::new(), &MetricsRecorder::new());
        assert_eq!(resp.status, "ok");
        assert!(resp.clients.is_empty());
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(Duration::from_secs(60))
            .unwrap();
        let resp = health_check(start, &ConnectionRegistry::new(), &MetricsRecorder::new());
        assert!(resp.uptime_secs >= 59);
    }

    #[test]
    fn serialization_includes_metrics() {
        let metrics = MetricsRecorder::new();
        metrics.counter_inc(names::TURNS_COMPLETED, 3);
        let registry = ConnectionRegistry::new();
        let first = registry.register();
        first.record_turn();
        registry.register();
        let json = serde_json::to_value(health_check(Instant::now(), &registry, &metrics)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 2);
        assert_eq!(json["clients"].as_array().unwrap().len(), 2);
        let listed = json["clients"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == first.id.to_string())
            .unwrap();
        assert_eq!(listed["turns"], 1);
        assert!(json["uptime_secs"].is_number());
        assert_eq!(json["metrics"]["counters"]["turns_completed"], 3);
    }
}
