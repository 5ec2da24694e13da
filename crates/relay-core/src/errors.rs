use std::time::Duration;

use crate::ids::ToolCallId;
use crate::protocol::{ErrorCode, ProtocolMessage};

/// Error taxonomy for the streaming pipeline.
///
/// Conversion anomalies are recovered locally; producer and overload errors end the turn;
/// only transport errors end the connection.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StreamError {
    // Recovered inside the converter
    #[error("unknown tool instance: {0}")]
    UnknownToolInstance(ToolCallId),
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    // Turn-fatal
    #[error("outbound queue full ({capacity} pending) for {waited:?}")]
    Overloaded { capacity: usize, waited: Duration },
    #[error("producer error: {0}")]
    Producer(String),

    // Connection-fatal
    #[error("transport error: {0}")]
    Transport(String),
}

impl StreamError {
    /// Whether the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Whether the error ends the current turn without ending the connection.
    pub fn aborts_turn(&self) -> bool {
        matches!(self, Self::Overloaded { .. } | Self::Producer(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownToolInstance(_) => "unknown_tool_instance",
            Self::MalformedEvent(_) => "malformed_event",
            Self::Overloaded { .. } => "overloaded",
            Self::Producer(_) => "producer_error",
            Self::Transport(_) => "transport_error",
        }
    }

    /// Wire code for errors that reach the client.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Overloaded { .. } => Some(ErrorCode::Overloaded),
            Self::Producer(_) => Some(ErrorCode::ProducerError),
            Self::MalformedEvent(_) => Some(ErrorCode::BadRequest),
            Self::UnknownToolInstance(_) | Self::Transport(_) => None,
        }
    }

    /// Terminal message to send for this error, if the client should see one.
    pub fn to_message(&self) -> Option<ProtocolMessage> {
        self.error_code()
            .map(|code| ProtocolMessage::error(code, self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_is_fatal() {
        assert!(StreamError::Transport("closed".into()).is_fatal());
        assert!(!StreamError::Producer("boom".into()).is_fatal());
        assert!(!StreamError::UnknownToolInstance(ToolCallId::new()).is_fatal());
        assert!(!StreamError::Overloaded {
            capacity: 4,
            waited: Duration::from_millis(10)
        }
        .is_fatal());
    }

    #[test]
    fn turn_aborting_errors() {
        assert!(StreamError::Producer("x".into()).aborts_turn());
        assert!(StreamError::Overloaded {
            capacity: 1,
            waited: Duration::ZERO
        }
        .aborts_turn());
        assert!(!StreamError::Transport("x".into()).aborts_turn());
        assert!(!StreamError::MalformedEvent("x".into()).aborts_turn());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(StreamError::Producer("x".into()).error_kind(), "producer_error");
        assert_eq!(StreamError::Transport("x".into()).error_kind(), "transport_error");
        assert_eq!(
            StreamError::UnknownToolInstance(ToolCallId::from_raw("t1")).error_kind(),
            "unknown_tool_instance"
        );
    }

    #[test]
    fn overloaded_maps_to_error_message() {
        let err = StreamError::Overloaded {
            capacity: 8,
            waited: Duration::from_millis(250),
        };
        match err.to_message() {
            Some(ProtocolMessage::Error { code, message }) => {
                assert_eq!(code, ErrorCode::Overloaded);
                assert!(message.contains("8 pending"), "got: {message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn transport_error_has_no_client_message() {
        assert!(StreamError::Transport("gone".into()).to_message().is_none());
    }
}
