use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::errors::StreamError;
use crate::events::ProductionEvent;

/// Ordered events for one turn. Ends after `TurnComplete`, after an error item,
/// or early once the turn's cancellation token fires.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProductionEvent, StreamError>> + Send>>;

/// The agent runtime as seen by a connection. One instance per connection, never shared.
#[async_trait]
pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Start a turn for `prompt`. The source must stop producing promptly once `cancel` fires.
    async fn start_turn(
        &mut self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<EventStream, StreamError>;
}

/// Builds a fresh [`EventSource`] for every accepted connection.
pub trait EventSourceFactory: Send + Sync {
    fn create(&self) -> Box<dyn EventSource>;
}

impl<F> EventSourceFactory for F
where
    F: Fn() -> Box<dyn EventSource> + Send + Sync,
{
    fn create(&self) -> Box<dyn EventSource> {
        self()
    }
}
