//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RelaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `RELAY_*` environment variable overrides (highest priority)
//! 4. Reset out-of-range values to their defaults
//!
//! Command-line flags are applied by the binary after loading.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::config::{RelaySettings, ServerConfig};

const MAX_SEND_QUEUE: usize = 1_000_000;

/// Errors that can occur when loading or parsing settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Resolve the default settings path (`~/.relay/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".relay").join("settings.json")
}

/// Load settings from `path` (or the default path) with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings> {
    let default_path = settings_path();
    let path = path.unwrap_or(&default_path);
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    enforce_limits(&mut settings);
    Ok(settings)
}

/// Reset values the server cannot run with to their defaults, with a warning.
///
/// Zero timers would panic the heartbeat interval or time out every write.
pub fn enforce_limits(settings: &mut RelaySettings) {
    let defaults = ServerConfig::default();
    let server = &mut settings.server;

    if !(1..=MAX_SEND_QUEUE).contains(&server.max_send_queue) {
        reset("server.max_send_queue", &mut server.max_send_queue, defaults.max_send_queue);
    }
    if server.send_timeout_ms == 0 {
        reset("server.send_timeout_ms", &mut server.send_timeout_ms, defaults.send_timeout_ms);
    }
    if server.heartbeat_interval_secs == 0 {
        reset(
            "server.heartbeat_interval_secs",
            &mut server.heartbeat_interval_secs,
            defaults.heartbeat_interval_secs,
        );
    }
    if server.heartbeat_timeout_secs == 0 {
        reset(
            "server.heartbeat_timeout_secs",
            &mut server.heartbeat_timeout_secs,
            defaults.heartbeat_timeout_secs,
        );
    }
}

fn reset<T: std::fmt::Display + Copy>(key: &str, value: &mut T, default: T) {
    tracing::warn!(key, value = %value, default = %default, "setting out of range, using default");
    *value = default;
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `RELAY_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut RelaySettings, env: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("RELAY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = parsed(&read, "RELAY_PORT", |s| s.parse::<u16>().ok()) {
        settings.server.port = v;
    }
    if let Some(v) = parsed(&read, "RELAY_MAX_SEND_QUEUE", |s| {
        s.parse::<usize>().ok().filter(|n| (1..=MAX_SEND_QUEUE).contains(n))
    }) {
        settings.server.max_send_queue = v;
    }
    if let Some(v) = parsed(&read, "RELAY_OVERLOAD_GRACE_MS", |s| s.parse::<u64>().ok()) {
        settings.server.overload_grace_ms = v;
    }
    if let Some(v) = parsed(&read, "RELAY_SEND_TIMEOUT_MS", |s| {
        s.parse::<u64>().ok().filter(|n| *n >= 1)
    }) {
        settings.server.send_timeout_ms = v;
    }
    if let Some(v) = parsed(&read, "RELAY_HEARTBEAT_INTERVAL", |s| {
        s.parse::<u64>().ok().filter(|n| *n >= 1)
    }) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = parsed(&read, "RELAY_VERBOSITY", |s| s.parse().ok()) {
        settings.server.verbosity = v;
    }
    if let Some(v) = read("RELAY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = parsed(&read, "RELAY_LOG_FORMAT", |s| s.parse().ok()) {
        settings.logging.format = v;
    }
    if let Some(v) = parsed(&read, "RELAY_WORD_DELAY_MS", |s| s.parse::<u64>().ok()) {
        settings.source.word_delay_ms = v;
    }
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = read(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}
