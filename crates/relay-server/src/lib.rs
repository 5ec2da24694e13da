//! WebSocket transport for the relay protocol: one event source and one session per
//! connection, a bounded outbound queue, and a `/health` endpoint.

pub mod config;
pub mod connection;
pub mod health;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod session;
pub mod settings;
pub mod turn_slot;

pub use config::{LoggingSettings, RelaySettings, ServerConfig, SourceSettings};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{SessionManager, TurnOutcome};
pub use settings::{load_settings, SettingsError};
