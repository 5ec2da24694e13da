//! Connection-local protocol logic: id assignment, event conversion, the reference
//! renderer, and event sources that need no external runtime.

pub mod converter;
pub mod echo;
pub mod render;
pub mod scripted;
pub mod session_state;

pub use converter::{convert, Conversion, EventConverter, Verbosity};
pub use echo::{EchoFactory, EchoSource};
pub use render::{ContractViolation, Node, NodeContent, NodeState, RenderModel, TurnEnd};
pub use scripted::{ScriptStep, ScriptedFactory, ScriptedSource, ScriptedTurn};
pub use session_state::SessionState;
