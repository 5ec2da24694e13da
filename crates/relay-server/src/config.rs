//! Server configuration.

use std::time::Duration;

use relay_engine::Verbosity;
use relay_telemetry::LogFormat;
use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Capacity of each connection's outbound queue, in messages.
    pub max_send_queue: usize,
    /// How long a turn may wait for outbound queue space before it is aborted as overloaded.
    pub overload_grace_ms: u64,
    /// Deadline for a single socket write; a slower write marks the connection dead.
    pub send_timeout_ms: u64,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close the connection after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Tool message verbosity for new connections.
    pub verbosity: Verbosity,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9091,
            max_send_queue: 256,
            overload_grace_ms: 250,
            send_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 1024 * 1024,
            verbosity: Verbosity::Full,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn overload_grace(&self) -> Duration {
        Duration::from_millis(self.overload_grace_ms)
    }

    // Timers are floored at one unit; a zero period panics `tokio::time::interval`.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs.max(1))
    }
}

/// Logging options read alongside the server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

/// Options for the built-in echo event source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub word_delay_ms: u64,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self { word_delay_ms: 40 }
    }
}

impl SourceSettings {
    pub fn word_delay(&self) -> Duration {
        Duration::from_millis(self.word_delay_ms)
    }
}

/// Everything loaded from `~/.relay/settings.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub server: ServerConfig,
    pub logging: LoggingSettings,
    pub source: SourceSettings,
}
