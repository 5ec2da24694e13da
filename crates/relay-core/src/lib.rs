//! Shared types for the relay streaming protocol: production events, wire messages,
//! identifiers, errors and the event-source boundary.

pub mod errors;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod source;

pub use errors::StreamError;
pub use events::{ProductionEvent, UpstreamEvent};
pub use ids::{ConnectionId, NodeId, NodeKind, ToolCallId};
pub use protocol::{ClientMessage, ErrorCode, ProtocolMessage, ToolOutcome, TurnStats};
pub use source::{EventSource, EventSourceFactory, EventStream};
